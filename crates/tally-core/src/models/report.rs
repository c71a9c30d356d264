//! 리포트 출력 모델.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::metric::ReportKind;

/// 집계 결과 맵 (키 → JSON 원시값, 키 순서 정렬)
pub type MetricMap = BTreeMap<String, serde_json::Value>;

/// 리포트 포맷 버전
pub const REPORT_VERSION: u32 = 1;

/// 집계가 끝난 리포트 하나
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    pub version: u32,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub kind: ReportKind,
    /// 세션 이름 (세션 리포트만)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub metrics: MetricMap,
    pub internal_metrics: MetricMap,
    /// 리포트 생성 시점의 소프트웨어 버전
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
}

impl MetricReport {
    /// `[at, at]` 구간의 빈 리포트
    pub fn empty(kind: ReportKind, at_ms: i64, software_version: Option<String>) -> Self {
        Self {
            version: REPORT_VERSION,
            start_time_ms: at_ms,
            end_time_ms: at_ms,
            kind,
            name: None,
            metrics: MetricMap::new(),
            internal_metrics: MetricMap::new(),
            software_version,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_time_ms - self.start_time_ms
    }
}

/// `collect` 한 번의 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomReport {
    pub hourly: MetricReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily: Option<MetricReport>,
    #[serde(default)]
    pub sessions: Vec<MetricReport>,
    /// Hourly 리포트의 상세 내보내기 파일 경로
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<PathBuf>,
}
