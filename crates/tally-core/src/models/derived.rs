//! 파생 집계 모델.
//!
//! 1차 집계가 끝난 리포트 맵을 입력으로 추가 메트릭을 합성하는 훅과 그 결과.

use serde::{Deserialize, Serialize};

use super::metric::{DataKind, MetricKind, ReportKind, SampleValue};
use super::report::MetricMap;

/// 파생 집계 결과 하나 (저장되지 않음)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedAggregation {
    pub event_name: String,
    pub metric_kind: MetricKind,
    pub data_kind: DataKind,
    pub internal: bool,
    /// 내보내기 rollup에 기록되는 시각
    pub timestamp_ms: i64,
    pub value: SampleValue,
}

impl DerivedAggregation {
    /// 숫자 파생 메트릭 생성
    pub fn number(
        event_name: impl Into<String>,
        value: f64,
        metric_kind: MetricKind,
        timestamp_ms: i64,
        internal: bool,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            metric_kind,
            data_kind: DataKind::Double,
            internal,
            timestamp_ms,
            value: SampleValue::Number(value),
        }
    }
}

/// 파생 훅 입력: 리포트 하나의 구간과 1차 집계 맵
#[derive(Debug, Clone, Copy)]
pub struct DerivedInput<'a> {
    pub kind: ReportKind,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub metrics: &'a MetricMap,
    pub internal_metrics: &'a MetricMap,
}

/// 리포트마다 한 번 호출되는 파생 집계 훅
pub type DerivedAggregationFn = dyn Fn(&DerivedInput<'_>) -> Vec<DerivedAggregation> + Send + Sync;

/// 파생 결과를 `internal` 플래그에 따라 두 맵에 병합
pub fn merge_derived(
    derived: &[DerivedAggregation],
    metrics: &mut MetricMap,
    internal_metrics: &mut MetricMap,
) {
    for aggregation in derived {
        let target = if aggregation.internal {
            &mut *internal_metrics
        } else {
            &mut *metrics
        };
        target.insert(
            aggregation.event_name.clone(),
            aggregation.value.to_metric_json(),
        );
    }
}
