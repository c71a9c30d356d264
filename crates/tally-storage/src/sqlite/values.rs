//! 메트릭 값 저장과 범위 조회.

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use tally_core::aggregation::{TimedValue, Window};
use tally_core::error::CoreError;
use tally_core::models::metric::SampleValue;
use tracing::{debug, warn};

use super::placeholders;

pub(super) const VALUE_COLUMNS: &str =
    "v.id, v.metadata_id, v.version, v.timestamp_ms, v.string_val, v.number_val, v.bool_val";

/// 값 행
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueRow {
    pub id: i64,
    pub metadata_id: i64,
    pub version: u32,
    pub timestamp_ms: i64,
    pub value: SampleValue,
}

impl ValueRow {
    pub fn timed(&self) -> TimedValue {
        TimedValue::new(self.timestamp_ms, self.value.clone())
    }
}

/// `VALUE_COLUMNS` 순서의 행을 변환. 값 컬럼이 모두 NULL이면 `None`.
pub(super) fn value_from_row(row: &Row<'_>) -> rusqlite::Result<Option<ValueRow>> {
    let string_val: Option<String> = row.get(4)?;
    let number_val: Option<f64> = row.get(5)?;
    let bool_val: Option<bool> = row.get(6)?;

    let value = match (bool_val, number_val, string_val) {
        (Some(b), _, _) => SampleValue::Bool(b),
        (None, Some(n), _) => SampleValue::Number(n),
        (None, None, Some(s)) => SampleValue::String(s),
        (None, None, None) => return Ok(None),
    };

    Ok(Some(ValueRow {
        id: row.get(0)?,
        metadata_id: row.get(1)?,
        version: row.get(2)?,
        timestamp_ms: row.get(3)?,
        value,
    }))
}

/// 값 삽입. 제약 조건에 걸려 무시되면 중복으로 보고 `None`.
pub(super) fn insert(
    conn: &Connection,
    metadata_id: i64,
    version: u32,
    timestamp_ms: i64,
    value: &SampleValue,
) -> Result<Option<i64>, CoreError> {
    let (string_val, number_val, bool_val) = match value {
        SampleValue::String(s) => (Some(s.as_str()), None, None),
        SampleValue::Number(n) => (None, Some(*n), None),
        SampleValue::Bool(b) => (None, None, Some(*b)),
    };

    let inserted = conn
        .prepare_cached(
            "INSERT OR IGNORE INTO metric_values
             (metadata_id, version, timestamp_ms, string_val, number_val, bool_val)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .and_then(|mut stmt| {
            stmt.execute(rusqlite::params![
                metadata_id,
                version,
                timestamp_ms,
                string_val,
                number_val,
                bool_val,
            ])
        })
        .map_err(|e| CoreError::Storage(format!("값 저장 실패: {e}")))?;

    if inserted == 0 {
        warn!("중복 값 무시: metadata_id={metadata_id}, t={timestamp_ms}");
        return Ok(None);
    }
    Ok(Some(conn.last_insert_rowid()))
}

/// 범위 스칼라 집계 결과
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(super) struct NumericAggregates {
    pub count: i64,
    pub sum: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
}

/// `[start, end]` 구간 숫자 값의 MIN/MAX/SUM/AVG/COUNT
///
/// 값은 소속 리포트 시작 이후여야 한다 (이월된 사본 제외).
pub(super) fn numeric_aggregates(
    conn: &Connection,
    metadata_ids: &[i64],
    window: Window,
) -> Result<NumericAggregates, CoreError> {
    if metadata_ids.is_empty() {
        return Ok(NumericAggregates::default());
    }

    let sql = format!(
        "SELECT MIN(v.number_val), MAX(v.number_val), SUM(v.number_val), AVG(v.number_val), COUNT(v.number_val)
         FROM metric_values v
         JOIN metric_metadata m ON m.id = v.metadata_id
         JOIN reports r ON r.id = m.report_id
         WHERE v.metadata_id IN ({})
           AND v.timestamp_ms >= ? AND v.timestamp_ms <= ?
           AND v.timestamp_ms >= r.start_time_ms",
        placeholders(metadata_ids.len())
    );

    let mut params: Vec<Value> = metadata_ids.iter().map(|id| Value::Integer(*id)).collect();
    params.push(Value::Integer(window.start_ms));
    params.push(Value::Integer(window.end_ms));

    conn.query_row(&sql, rusqlite::params_from_iter(params), |row| {
        Ok(NumericAggregates {
            min: row.get(0)?,
            max: row.get(1)?,
            sum: row.get(2)?,
            mean: row.get(3)?,
            count: row.get(4)?,
        })
    })
    .map_err(|e| CoreError::Storage(format!("숫자 집계 실패: {e}")))
}

/// `until` 이하에서 가장 최근 값. `since`가 있으면 그 이상만.
pub(super) fn latest(
    conn: &Connection,
    metadata_ids: &[i64],
    since_ms: Option<i64>,
    until_ms: i64,
) -> Result<Option<ValueRow>, CoreError> {
    if metadata_ids.is_empty() {
        return Ok(None);
    }

    let mut sql = format!(
        "SELECT {VALUE_COLUMNS} FROM metric_values v
         WHERE v.metadata_id IN ({}) AND v.timestamp_ms <= ?",
        placeholders(metadata_ids.len())
    );
    let mut params: Vec<Value> = metadata_ids.iter().map(|id| Value::Integer(*id)).collect();
    params.push(Value::Integer(until_ms));

    if let Some(since) = since_ms {
        sql.push_str(" AND v.timestamp_ms >= ?");
        params.push(Value::Integer(since));
    }
    sql.push_str(" ORDER BY v.timestamp_ms DESC, v.id DESC LIMIT 1");

    let row = conn
        .query_row(&sql, rusqlite::params_from_iter(params), value_from_row)
        .optional()
        .map_err(|e| CoreError::Storage(format!("최신 값 조회 실패: {e}")))?;

    Ok(row.flatten())
}

/// 리포트 소속 값 중 `cutoff`보다 이전 시각의 값 삭제
pub(super) fn delete_for_report_until(
    conn: &Connection,
    report_id: i64,
    cutoff_ms: i64,
) -> Result<usize, CoreError> {
    let deleted = conn
        .execute(
            "DELETE FROM metric_values
             WHERE timestamp_ms < ?2
               AND metadata_id IN (SELECT id FROM metric_metadata WHERE report_id = ?1)",
            rusqlite::params![report_id, cutoff_ms],
        )
        .map_err(|e| CoreError::Storage(format!("오래된 값 삭제 실패: {e}")))?;

    debug!("리포트 {report_id}의 오래된 값 {deleted}개 삭제 (t < {cutoff_ms})");
    Ok(deleted)
}

pub(super) fn all(conn: &Connection) -> Result<Vec<ValueRow>, CoreError> {
    let mut stmt = conn
        .prepare(&format!("SELECT {VALUE_COLUMNS} FROM metric_values v ORDER BY v.id"))
        .map_err(|e| CoreError::Storage(format!("쿼리 준비 실패: {e}")))?;

    let rows = stmt
        .query_map([], value_from_row)
        .map_err(|e| CoreError::Storage(format!("값 조회 실패: {e}")))?;

    let mut values = Vec::new();
    for row in rows {
        if let Some(value) =
            row.map_err(|e| CoreError::Storage(format!("값 행 변환 실패: {e}")))?
        {
            values.push(value);
        }
    }
    Ok(values)
}
