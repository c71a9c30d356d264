//! 메트릭 그룹 집계.
//!
//! 메트릭 하나(단일 리포트면 메타데이터 하나, Daily 병합이면 같은 이름의 메타데이터 여러 개)를
//! 구간 안에서 집계해 리포트 맵에 기록한다.

use rusqlite::Connection;
use tally_core::aggregation::{ValueAggregator, Window};
use tally_core::config::CursorConfig;
use tally_core::error::CoreError;
use tally_core::models::metric::{Aggregation, NumericAgg, ReportKind};
use tally_core::models::report::{MetricMap, MetricReport};
use tracing::debug;

use super::cursor::{ValueCursor, ValueRange};
use super::metadata::{MetadataRow, MetadataSpec};
use super::values;

/// 집계 단위: 메트릭 이름 하나와 그 값을 가진 메타데이터 id 목록
#[derive(Debug, Clone)]
pub(super) struct MetricGroup {
    pub spec: MetadataSpec,
    pub metadata_ids: Vec<i64>,
}

impl From<&MetadataRow> for MetricGroup {
    fn from(row: &MetadataRow) -> Self {
        Self {
            spec: row.spec.clone(),
            metadata_ids: vec![row.id],
        }
    }
}

/// 리포트 하나 집계
pub(super) fn build_report(
    conn: &Connection,
    cursor: &CursorConfig,
    kind: ReportKind,
    name: Option<String>,
    window: Window,
    groups: &[MetricGroup],
    software_version: Option<String>,
) -> Result<MetricReport, CoreError> {
    let mut report = MetricReport::empty(kind, window.start_ms, software_version);
    report.end_time_ms = window.end_ms;
    report.name = name;

    for group in groups {
        let target = if group.spec.internal {
            &mut report.internal_metrics
        } else {
            &mut report.metrics
        };
        aggregate_metric(conn, cursor, group, window, target)?;
    }

    Ok(report)
}

/// 메트릭 하나의 요청된 집계를 모두 계산
pub(super) fn aggregate_metric(
    conn: &Connection,
    cursor: &CursorConfig,
    group: &MetricGroup,
    window: Window,
    out: &mut MetricMap,
) -> Result<(), CoreError> {
    let key = group.spec.event_name.as_str();
    let aggregations = &group.spec.aggregations;

    if aggregations.iter().any(Aggregation::is_scalar) {
        let results = values::numeric_aggregates(conn, &group.metadata_ids, window)?;
        for aggregation in aggregations {
            let Aggregation::Numeric(numeric) = aggregation else {
                continue;
            };
            let (suffix, value) = match numeric {
                NumericAgg::Count => ("count", Some(serde_json::Value::from(results.count))),
                NumericAgg::Sum => ("sum", results.sum.map(serde_json::Value::from)),
                NumericAgg::Min => ("min", results.min.map(serde_json::Value::from)),
                NumericAgg::Max => ("max", results.max.map(serde_json::Value::from)),
                NumericAgg::Mean => ("mean", results.mean.map(serde_json::Value::from)),
                _ => continue,
            };
            if let Some(value) = value {
                out.insert(format!("{key}.{suffix}"), value);
            }
        }
    }

    if aggregations.iter().any(Aggregation::is_latest) {
        // carry-over 값은 원래 시각을 유지하므로 하한을 두지 않는다
        let since = if group.spec.carry_over {
            None
        } else {
            Some(window.start_ms)
        };
        match values::latest(conn, &group.metadata_ids, since, window.end_ms)? {
            Some(latest) => {
                out.insert(format!("{key}.latest"), latest.value.to_metric_json());
            }
            None => debug!("최신 값 없음, 생략: {key}"),
        }
    }

    if !aggregations.iter().any(Aggregation::is_streaming) {
        return Ok(());
    }
    let mut aggregators = ValueAggregator::for_metric(key, aggregations);

    let seed = values::latest(conn, &group.metadata_ids, None, window.start_ms)?;
    if let Some(seed) = seed {
        let seed = seed.timed();
        for aggregator in aggregators.iter_mut() {
            aggregator.accept(window, &seed);
        }
    }

    let range = ValueRange {
        after_ms: Some(window.start_ms),
        until_ms: window.end_ms,
        owner_bound: true,
    };
    for row in ValueCursor::new(conn, group.metadata_ids.clone(), range, cursor) {
        let value = row?.timed();
        for aggregator in aggregators.iter_mut() {
            aggregator.accept(window, &value);
        }
    }

    for aggregator in aggregators {
        aggregator.finish(window, out);
    }
    Ok(())
}
