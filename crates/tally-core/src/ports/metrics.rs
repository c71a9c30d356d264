//! 커스텀 메트릭 포트.
//!
//! 구현: `tally-storage` crate (rusqlite)

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::CoreError;
use crate::models::derived::{DerivedAggregation, DerivedAggregationFn, DerivedInput};
use crate::models::metric::MetricSample;
use crate::models::report::CustomReport;

/// `collect` 호출 파라미터
#[derive(Clone)]
pub struct CollectRequest {
    /// 수집 기준 시각 (epoch 밀리초)
    pub now_ms: i64,
    /// Hourly 리포트를 Daily로 롤업할지 여부
    pub daily_enabled: bool,
    /// 리포트마다 호출되는 파생 집계 훅
    pub derived: Option<Arc<DerivedAggregationFn>>,
    /// 세션 리포트에 병합할 Daily 누적기 메트릭 이름
    pub session_daily_metrics: Vec<String>,
    /// Hourly 상세 내보내기 파일을 생성할 디렉토리
    pub export_dir: Option<PathBuf>,
    /// 열린 세션을 모두 `now`에 종료
    pub force_end_all_reports: bool,
}

impl CollectRequest {
    /// 기본값(Daily 활성화, 훅/내보내기 없음)으로 요청 생성
    pub fn at(now_ms: i64) -> Self {
        Self {
            now_ms,
            daily_enabled: true,
            derived: None,
            session_daily_metrics: Vec::new(),
            export_dir: None,
            force_end_all_reports: false,
        }
    }

    pub fn daily(mut self, enabled: bool) -> Self {
        self.daily_enabled = enabled;
        self
    }

    pub fn with_derived<F>(mut self, hook: F) -> Self
    where
        F: Fn(&DerivedInput<'_>) -> Vec<DerivedAggregation> + Send + Sync + 'static,
    {
        let hook: Arc<DerivedAggregationFn> = Arc::new(hook);
        self.derived = Some(hook);
        self
    }

    pub fn with_session_daily_metrics(mut self, names: Vec<String>) -> Self {
        self.session_daily_metrics = names;
        self
    }

    pub fn with_export_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.export_dir = Some(dir.into());
        self
    }

    pub fn force_end_all(mut self) -> Self {
        self.force_end_all_reports = true;
        self
    }
}

impl std::fmt::Debug for CollectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectRequest")
            .field("now_ms", &self.now_ms)
            .field("daily_enabled", &self.daily_enabled)
            .field("derived", &self.derived.is_some())
            .field("session_daily_metrics", &self.session_daily_metrics)
            .field("export_dir", &self.export_dir)
            .field("force_end_all_reports", &self.force_end_all_reports)
            .finish()
    }
}

/// 커스텀 메트릭 엔진 포트
///
/// 샘플 적재, 세션 관리, 리포트 생성을 단일 writer 트랜잭션으로 수행한다.
#[async_trait]
pub trait CustomMetrics: Send + Sync {
    /// 샘플 적재. 값이 중복으로 무시되면 `None`.
    async fn add(&self, sample: &MetricSample) -> Result<Option<i64>, CoreError>;

    /// 세션 시작 (이미 열려 있으면 그대로 둔다)
    async fn start_session(&self, name: &str, timestamp_ms: i64) -> Result<(), CoreError>;

    /// 열린 Hourly 누적기의 최신 값으로 채워진 세션 시작
    async fn start_session_seeded(
        &self,
        name: &str,
        timestamp_ms: i64,
        latest_metric_keys: &[String],
    ) -> Result<(), CoreError>;

    /// 세션 종료 (열린 세션이 없으면 아무것도 하지 않는다)
    async fn finish_session(&self, name: &str, timestamp_ms: i64) -> Result<(), CoreError>;

    /// 열린 Hourly 누적기의 시작 시각
    async fn started_heartbeat(&self) -> Result<Option<i64>, CoreError>;

    /// 열린 Hourly 누적기가 다른 소프트웨어 버전으로 시작되었는지 여부
    async fn software_version_changed(&self, current_version: &str) -> Result<bool, CoreError>;

    /// 리포트 생성 파이프라인 실행
    async fn collect(&self, request: CollectRequest) -> Result<CustomReport, CoreError>;
}
