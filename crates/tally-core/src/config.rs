//! 엔진 설정 구조체.
//!
//! 커서 페이지 크기, 보존 기간, Daily 롤업, 세션 화이트리스트, 내보내기 producer 정보 등
//! 런타임 설정을 정의한다. [`crate::config_manager::ConfigManager`]가 JSON 파일로 로드/저장한다.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// 최상위 엔진 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// 스트리밍 커서 설정
    #[serde(default)]
    pub cursor: CursorConfig,
    /// 보존/만료 설정
    #[serde(default)]
    pub retention: RetentionConfig,
    /// 상세 내보내기 설정
    #[serde(default)]
    pub export: ExportConfig,
    /// Daily 롤업 활성화 여부
    #[serde(default = "default_true")]
    pub daily_heartbeat_enabled: bool,
    /// 세션 리포트에 병합할 Daily 누적기 메트릭 이름 목록
    #[serde(default)]
    pub session_daily_metrics: Vec<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            cursor: CursorConfig::default(),
            retention: RetentionConfig::default(),
            export: ExportConfig::default(),
            daily_heartbeat_enabled: true,
            session_daily_metrics: Vec::new(),
        }
    }
}

impl MetricsConfig {
    /// 설정값 검증
    pub fn validate(&self) -> Result<(), crate::error::CoreError> {
        if self.cursor.page_size == 0 {
            return Err(crate::error::CoreError::validation(
                "cursor.page_size",
                "0보다 커야 합니다",
            ));
        }
        if self.cursor.buffer_size < self.cursor.page_size {
            return Err(crate::error::CoreError::validation(
                "cursor.buffer_size",
                "page_size 이상이어야 합니다",
            ));
        }
        if self.retention.daily_span_ms <= 0 {
            return Err(crate::error::CoreError::validation(
                "retention.daily_span_ms",
                "0보다 커야 합니다",
            ));
        }
        Ok(())
    }
}

// ============================================================
// 커서 설정
// ============================================================

/// 스트리밍 커서 설정: 페이지 단위 조회와 버퍼 상한
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorConfig {
    /// 한 번에 조회하는 행 수
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// 메모리에 보유 가능한 최대 행 수
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_page_size() -> usize {
    250
}

fn default_buffer_size() -> usize {
    500
}

// ============================================================
// 보존 설정
// ============================================================

/// 보존/만료 설정 (모두 밀리초)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// carry-over 값이 다음 리포트로 이월되는 최대 나이
    #[serde(default = "default_three_days_ms")]
    pub carry_over_max_age_ms: i64,
    /// Daily 누적기 값 보존 기간
    #[serde(default = "default_three_days_ms")]
    pub accumulator_retention_ms: i64,
    /// 메타데이터 없는 리포트 삭제 기준 나이
    #[serde(default = "default_three_days_ms")]
    pub orphan_report_expiry_ms: i64,
    /// 종료되지 않은 세션 강제 만료 나이
    #[serde(default = "default_one_day_ms")]
    pub session_expiry_ms: i64,
    /// Daily 리포트 생성에 필요한 Hourly 리포트 합산 구간
    #[serde(default = "default_one_day_ms")]
    pub daily_span_ms: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            carry_over_max_age_ms: default_three_days_ms(),
            accumulator_retention_ms: default_three_days_ms(),
            orphan_report_expiry_ms: default_three_days_ms(),
            session_expiry_ms: default_one_day_ms(),
            daily_span_ms: default_one_day_ms(),
        }
    }
}

fn default_three_days_ms() -> i64 {
    Duration::days(3).num_milliseconds()
}

fn default_one_day_ms() -> i64 {
    Duration::days(1).num_milliseconds()
}

// ============================================================
// 내보내기 설정
// ============================================================

/// 상세 시계열 내보내기 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// 내보내기 스키마 버전
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// producer 식별자
    #[serde(default = "default_producer_id")]
    pub producer_id: String,
    /// producer 버전
    #[serde(default = "default_producer_version")]
    pub producer_version: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            producer_id: default_producer_id(),
            producer_version: default_producer_version(),
        }
    }
}

fn default_schema_version() -> u32 {
    1
}

fn default_producer_id() -> String {
    "tally".to_string()
}

fn default_producer_version() -> String {
    "1".to_string()
}

fn default_true() -> bool {
    true
}
