//! 메트릭 메타데이터 레지스트리.
//!
//! (report_id, event_name)마다 하나. 속성이 바뀌면 같은 id로 덮어써서
//! 기존 값이 계속 연결되도록 한다.

use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use tally_core::error::CoreError;
use tally_core::models::metric::{Aggregation, DataKind, MetricKind, MetricSample};
use tracing::debug;

use super::conversion_error;

const METADATA_COLUMNS: &str =
    "id, report_id, event_name, metric_kind, data_kind, carry_over, aggregations, internal";

/// 메타데이터 속성 (id, report_id 제외)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataSpec {
    pub event_name: String,
    pub metric_kind: MetricKind,
    pub data_kind: DataKind,
    pub carry_over: bool,
    pub aggregations: Vec<Aggregation>,
    pub internal: bool,
}

impl From<&MetricSample> for MetadataSpec {
    fn from(sample: &MetricSample) -> Self {
        Self {
            event_name: sample.event_name.clone(),
            metric_kind: sample.metric_kind,
            data_kind: sample.data_kind,
            carry_over: sample.carry_over,
            aggregations: sample.aggregations.clone(),
            internal: sample.internal,
        }
    }
}

/// 메타데이터 행
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataRow {
    pub id: i64,
    pub report_id: i64,
    #[serde(flatten)]
    pub spec: MetadataSpec,
}

fn metadata_from_row(row: &Row<'_>) -> rusqlite::Result<MetadataRow> {
    let metric_kind: String = row.get(3)?;
    let data_kind: String = row.get(4)?;
    let aggregations: String = row.get(6)?;

    Ok(MetadataRow {
        id: row.get(0)?,
        report_id: row.get(1)?,
        spec: MetadataSpec {
            event_name: row.get(2)?,
            metric_kind: MetricKind::parse(&metric_kind).map_err(|e| conversion_error(3, e))?,
            data_kind: DataKind::parse(&data_kind).map_err(|e| conversion_error(4, e))?,
            carry_over: row.get(5)?,
            aggregations: serde_json::from_str(&aggregations)
                .map_err(|e| conversion_error(6, CoreError::Serialization(e)))?,
            internal: row.get(7)?,
        },
    })
}

/// (report_id, event_name)로 조회
pub(super) fn find(
    conn: &Connection,
    report_id: i64,
    event_name: &str,
) -> Result<Option<MetadataRow>, CoreError> {
    conn.query_row(
        &format!(
            "SELECT {METADATA_COLUMNS} FROM metric_metadata WHERE report_id = ?1 AND event_name = ?2"
        ),
        rusqlite::params![report_id, event_name],
        metadata_from_row,
    )
    .optional()
    .map_err(|e| CoreError::Storage(format!("메타데이터 조회 실패: {e}")))
}

/// 메타데이터 upsert. 속성이 같으면 기존 id, 다르면 같은 id로 갱신, 없으면 삽입.
pub(super) fn upsert(conn: &Connection, report_id: i64, spec: &MetadataSpec) -> Result<i64, CoreError> {
    let aggregations = serde_json::to_string(&spec.aggregations)?;

    match find(conn, report_id, &spec.event_name)? {
        Some(existing) if existing.spec == *spec => Ok(existing.id),
        Some(existing) => {
            conn.execute(
                "UPDATE metric_metadata
                 SET metric_kind = ?1, data_kind = ?2, carry_over = ?3, aggregations = ?4, internal = ?5
                 WHERE id = ?6",
                rusqlite::params![
                    spec.metric_kind.as_str(),
                    spec.data_kind.as_str(),
                    spec.carry_over,
                    aggregations,
                    spec.internal,
                    existing.id,
                ],
            )
            .map_err(|e| CoreError::Storage(format!("메타데이터 갱신 실패: {e}")))?;

            debug!(
                "메타데이터 갱신: id={}, event={}",
                existing.id, spec.event_name
            );
            Ok(existing.id)
        }
        None => {
            conn.execute(
                "INSERT INTO metric_metadata
                 (report_id, event_name, metric_kind, data_kind, carry_over, aggregations, internal)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    report_id,
                    spec.event_name,
                    spec.metric_kind.as_str(),
                    spec.data_kind.as_str(),
                    spec.carry_over,
                    aggregations,
                    spec.internal,
                ],
            )
            .map_err(|e| CoreError::Storage(format!("메타데이터 저장 실패: {e}")))?;

            Ok(conn.last_insert_rowid())
        }
    }
}

/// 리포트의 메타데이터 전체 (id 오름차순)
pub(super) fn for_report(conn: &Connection, report_id: i64) -> Result<Vec<MetadataRow>, CoreError> {
    query_list(
        conn,
        &format!("SELECT {METADATA_COLUMNS} FROM metric_metadata WHERE report_id = ?1 ORDER BY id"),
        report_id,
    )
}

/// 리포트의 carry-over 메타데이터
pub(super) fn carry_over_for_report(
    conn: &Connection,
    report_id: i64,
) -> Result<Vec<MetadataRow>, CoreError> {
    query_list(
        conn,
        &format!(
            "SELECT {METADATA_COLUMNS} FROM metric_metadata
             WHERE report_id = ?1 AND carry_over = 1 ORDER BY id"
        ),
        report_id,
    )
}

fn query_list(conn: &Connection, sql: &str, report_id: i64) -> Result<Vec<MetadataRow>, CoreError> {
    let mut stmt = conn
        .prepare_cached(sql)
        .map_err(|e| CoreError::Storage(format!("쿼리 준비 실패: {e}")))?;

    let rows = stmt
        .query_map([report_id], metadata_from_row)
        .map_err(|e| CoreError::Storage(format!("메타데이터 조회 실패: {e}")))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| CoreError::Storage(format!("메타데이터 행 변환 실패: {e}")))
}

/// 값이 하나도 없는 메타데이터 삭제
pub(super) fn delete_orphaned(conn: &Connection) -> Result<usize, CoreError> {
    conn.execute(
        "DELETE FROM metric_metadata
         WHERE NOT EXISTS (SELECT 1 FROM metric_values v WHERE v.metadata_id = metric_metadata.id)",
        [],
    )
    .map_err(|e| CoreError::Storage(format!("고아 메타데이터 삭제 실패: {e}")))
}

pub(super) fn all(conn: &Connection) -> Result<Vec<MetadataRow>, CoreError> {
    let mut stmt = conn
        .prepare(&format!("SELECT {METADATA_COLUMNS} FROM metric_metadata ORDER BY id"))
        .map_err(|e| CoreError::Storage(format!("쿼리 준비 실패: {e}")))?;

    let rows = stmt
        .query_map([], metadata_from_row)
        .map_err(|e| CoreError::Storage(format!("메타데이터 조회 실패: {e}")))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| CoreError::Storage(format!("메타데이터 행 변환 실패: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration;
    use crate::sqlite::{reports, values};
    use tally_core::models::metric::{NumericAgg, ReportKind, SampleValue};

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migration::run_migrations(&conn).unwrap();
        conn
    }

    fn spec(name: &str) -> MetadataSpec {
        MetadataSpec::from(
            &MetricSample::number(name, 0, 1.0)
                .with_aggregations(vec![Aggregation::Numeric(NumericAgg::Sum)]),
        )
    }

    #[test]
    fn upsert_reuses_identical_metadata() {
        let conn = conn();
        let report = reports::start_or_get_open(&conn, ReportKind::Hourly, None, 0, None).unwrap();

        let a = upsert(&conn, report, &spec("m")).unwrap();
        let b = upsert(&conn, report, &spec("m")).unwrap();
        assert_eq!(a, b);
        assert_eq!(all(&conn).unwrap().len(), 1);
    }

    #[test]
    fn upsert_replaces_in_place_keeping_values() {
        let conn = conn();
        let report = reports::start_or_get_open(&conn, ReportKind::Hourly, None, 0, None).unwrap();

        let id = upsert(&conn, report, &spec("m")).unwrap();
        values::insert(&conn, id, 1, 5, &SampleValue::Number(2.0)).unwrap();

        let mut changed = spec("m");
        changed.carry_over = true;
        changed.aggregations.push(Aggregation::Numeric(NumericAgg::Max));
        let same_id = upsert(&conn, report, &changed).unwrap();

        assert_eq!(id, same_id);
        let stored = find(&conn, report, "m").unwrap().unwrap();
        assert_eq!(stored.spec, changed);
        assert_eq!(values::all(&conn).unwrap()[0].metadata_id, id);
        assert_eq!(carry_over_for_report(&conn, report).unwrap().len(), 1);
    }

    #[test]
    fn orphaned_metadata_is_removed() {
        let conn = conn();
        let report = reports::start_or_get_open(&conn, ReportKind::Hourly, None, 0, None).unwrap();

        let kept = upsert(&conn, report, &spec("kept")).unwrap();
        upsert(&conn, report, &spec("orphan")).unwrap();
        values::insert(&conn, kept, 1, 5, &SampleValue::Number(2.0)).unwrap();

        assert_eq!(delete_orphaned(&conn).unwrap(), 1);
        assert_eq!(delete_orphaned(&conn).unwrap(), 0);
        let remaining = for_report(&conn, report).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].spec.event_name, "kept");
    }
}
