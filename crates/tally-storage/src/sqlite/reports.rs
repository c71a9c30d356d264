//! 리포트 수명주기.
//!
//! (kind[,name])마다 열린 리포트(`end_time_ms IS NULL`)는 최대 하나다.
//! 모든 함수는 호출 측 트랜잭션 안에서 실행된다.

use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use tally_core::error::CoreError;
use tally_core::models::metric::ReportKind;
use tracing::{debug, info};

use super::conversion_error;

const REPORT_COLUMNS: &str = "id, kind, name, start_time_ms, end_time_ms, software_version";

/// 리포트 행
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub id: i64,
    pub kind: ReportKind,
    pub name: Option<String>,
    pub start_time_ms: i64,
    pub end_time_ms: Option<i64>,
    pub software_version: Option<String>,
}

fn report_from_row(row: &Row<'_>) -> rusqlite::Result<ReportRow> {
    let kind: String = row.get(1)?;
    Ok(ReportRow {
        id: row.get(0)?,
        kind: ReportKind::parse(&kind).map_err(|e| conversion_error(1, e))?,
        name: row.get(2)?,
        start_time_ms: row.get(3)?,
        end_time_ms: row.get(4)?,
        software_version: row.get(5)?,
    })
}

/// 열린 리포트 조회
pub(super) fn find_open(
    conn: &Connection,
    kind: ReportKind,
    name: Option<&str>,
) -> Result<Option<ReportRow>, CoreError> {
    let result = match name {
        Some(name) => conn
            .query_row(
                &format!(
                    "SELECT {REPORT_COLUMNS} FROM reports
                     WHERE kind = ?1 AND name = ?2 AND end_time_ms IS NULL
                     ORDER BY id LIMIT 1"
                ),
                rusqlite::params![kind.as_str(), name],
                report_from_row,
            )
            .optional(),
        None => conn
            .query_row(
                &format!(
                    "SELECT {REPORT_COLUMNS} FROM reports
                     WHERE kind = ?1 AND name IS NULL AND end_time_ms IS NULL
                     ORDER BY id LIMIT 1"
                ),
                rusqlite::params![kind.as_str()],
                report_from_row,
            )
            .optional(),
    };

    result.map_err(|e| CoreError::Storage(format!("열린 리포트 조회 실패: {e}")))
}

/// 열린 리포트 id 반환, 없으면 `timestamp_ms`에 시작하는 리포트 생성
pub(super) fn start_or_get_open(
    conn: &Connection,
    kind: ReportKind,
    name: Option<&str>,
    timestamp_ms: i64,
    software_version: Option<&str>,
) -> Result<i64, CoreError> {
    if let Some(report) = find_open(conn, kind, name)? {
        return Ok(report.id);
    }

    conn.execute(
        "INSERT INTO reports (kind, name, start_time_ms, software_version) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![kind.as_str(), name, timestamp_ms, software_version],
    )
    .map_err(|e| CoreError::Storage(format!("리포트 생성 실패: {e}")))?;

    let id = conn.last_insert_rowid();
    debug!(
        "리포트 시작: id={id}, kind={}, name={:?}, start={timestamp_ms}",
        kind.as_str(),
        name
    );
    Ok(id)
}

/// 열린 리포트 종료. 종료된 리포트가 없으면 `false`.
pub(super) fn finish(
    conn: &Connection,
    kind: ReportKind,
    name: Option<&str>,
    timestamp_ms: i64,
) -> Result<bool, CoreError> {
    let Some(report) = find_open(conn, kind, name)? else {
        debug!("종료할 열린 리포트 없음: kind={}, name={:?}", kind.as_str(), name);
        return Ok(false);
    };

    set_end(conn, report.id, timestamp_ms)?;
    Ok(true)
}

pub(super) fn set_end(conn: &Connection, report_id: i64, end_time_ms: i64) -> Result<(), CoreError> {
    conn.execute(
        "UPDATE reports SET end_time_ms = ?1 WHERE id = ?2",
        rusqlite::params![end_time_ms, report_id],
    )
    .map_err(|e| CoreError::Storage(format!("리포트 종료 실패: {e}")))?;
    Ok(())
}

/// 나이가 `max_age_ms`를 넘는 열린 세션 강제 종료 (end = now)
pub(super) fn expire_stale_sessions(
    conn: &Connection,
    now_ms: i64,
    max_age_ms: i64,
) -> Result<usize, CoreError> {
    let expired = conn
        .execute(
            "UPDATE reports SET end_time_ms = ?1
             WHERE kind = ?2 AND end_time_ms IS NULL AND ?1 - start_time_ms > ?3",
            rusqlite::params![now_ms, ReportKind::Session.as_str(), max_age_ms],
        )
        .map_err(|e| CoreError::Storage(format!("세션 만료 실패: {e}")))?;

    if expired > 0 {
        info!("오래된 세션 {expired}개 강제 종료");
    }
    Ok(expired)
}

/// 열린 세션 전부 종료
pub(super) fn finish_all_sessions(conn: &Connection, now_ms: i64) -> Result<usize, CoreError> {
    let finished = conn
        .execute(
            "UPDATE reports SET end_time_ms = ?1 WHERE kind = ?2 AND end_time_ms IS NULL",
            rusqlite::params![now_ms, ReportKind::Session.as_str()],
        )
        .map_err(|e| CoreError::Storage(format!("세션 일괄 종료 실패: {e}")))?;

    if finished > 0 {
        info!("열린 세션 {finished}개 일괄 종료");
    }
    Ok(finished)
}

/// 종료된 리포트 목록 (시작 시각 오름차순)
pub(super) fn ended(conn: &Connection, kind: ReportKind) -> Result<Vec<ReportRow>, CoreError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {REPORT_COLUMNS} FROM reports
             WHERE kind = ?1 AND end_time_ms IS NOT NULL
             ORDER BY start_time_ms, id"
        ))
        .map_err(|e| CoreError::Storage(format!("쿼리 준비 실패: {e}")))?;

    let rows = stmt
        .query_map([kind.as_str()], report_from_row)
        .map_err(|e| CoreError::Storage(format!("종료된 리포트 조회 실패: {e}")))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| CoreError::Storage(format!("리포트 행 변환 실패: {e}")))
}

/// 시각 `t`를 구간에 포함하는 세션 id 목록
///
/// 열린 세션은 `start <= t`, 종료된 세션은 `start <= t <= end`.
pub(super) fn sessions_containing(conn: &Connection, timestamp_ms: i64) -> Result<Vec<i64>, CoreError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT id FROM reports
             WHERE kind = ?1 AND start_time_ms <= ?2
               AND (end_time_ms IS NULL OR ?2 <= end_time_ms)
             ORDER BY id",
        )
        .map_err(|e| CoreError::Storage(format!("쿼리 준비 실패: {e}")))?;

    let rows = stmt
        .query_map(
            rusqlite::params![ReportKind::Session.as_str(), timestamp_ms],
            |row| row.get::<_, i64>(0),
        )
        .map_err(|e| CoreError::Storage(format!("세션 조회 실패: {e}")))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| CoreError::Storage(format!("세션 행 변환 실패: {e}")))
}

/// 리포트와 소속 메타데이터/값 삭제 (값 → 메타데이터 → 리포트 순)
pub(super) fn delete_cascade(conn: &Connection, report_id: i64) -> Result<(), CoreError> {
    let values = conn
        .execute(
            "DELETE FROM metric_values WHERE metadata_id IN
                (SELECT id FROM metric_metadata WHERE report_id = ?1)",
            [report_id],
        )
        .map_err(|e| CoreError::Storage(format!("값 삭제 실패: {e}")))?;

    let metadata = conn
        .execute("DELETE FROM metric_metadata WHERE report_id = ?1", [report_id])
        .map_err(|e| CoreError::Storage(format!("메타데이터 삭제 실패: {e}")))?;

    conn.execute("DELETE FROM reports WHERE id = ?1", [report_id])
        .map_err(|e| CoreError::Storage(format!("리포트 삭제 실패: {e}")))?;

    debug!("리포트 삭제: id={report_id}, 메타데이터 {metadata}개, 값 {values}개");
    Ok(())
}

/// 메타데이터가 없고 `start < older_than`인 리포트 삭제
pub(super) fn delete_orphaned(conn: &Connection, older_than_ms: i64) -> Result<usize, CoreError> {
    conn.execute(
        "DELETE FROM reports
         WHERE NOT EXISTS (SELECT 1 FROM metric_metadata m WHERE m.report_id = reports.id)
           AND start_time_ms < ?1",
        [older_than_ms],
    )
    .map_err(|e| CoreError::Storage(format!("고아 리포트 삭제 실패: {e}")))
}

pub(super) fn all(conn: &Connection) -> Result<Vec<ReportRow>, CoreError> {
    let mut stmt = conn
        .prepare(&format!("SELECT {REPORT_COLUMNS} FROM reports ORDER BY id"))
        .map_err(|e| CoreError::Storage(format!("쿼리 준비 실패: {e}")))?;

    let rows = stmt
        .query_map([], report_from_row)
        .map_err(|e| CoreError::Storage(format!("리포트 조회 실패: {e}")))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| CoreError::Storage(format!("리포트 행 변환 실패: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migration::run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn single_open_report_per_bucket() {
        let conn = conn();

        let a = start_or_get_open(&conn, ReportKind::Hourly, None, 10, None).unwrap();
        let b = start_or_get_open(&conn, ReportKind::Hourly, None, 20, None).unwrap();
        assert_eq!(a, b);

        let s1 = start_or_get_open(&conn, ReportKind::Session, Some("A"), 10, None).unwrap();
        let s2 = start_or_get_open(&conn, ReportKind::Session, Some("B"), 10, None).unwrap();
        assert_ne!(s1, s2);
        assert_ne!(s1, a);

        let report = find_open(&conn, ReportKind::Hourly, None).unwrap().unwrap();
        assert_eq!(report.start_time_ms, 10);
    }

    #[test]
    fn finish_without_open_report_is_noop() {
        let conn = conn();
        assert!(!finish(&conn, ReportKind::Session, Some("missing"), 5).unwrap());

        start_or_get_open(&conn, ReportKind::Session, Some("A"), 1, None).unwrap();
        assert!(finish(&conn, ReportKind::Session, Some("A"), 5).unwrap());
        assert!(find_open(&conn, ReportKind::Session, Some("A")).unwrap().is_none());

        let ended = ended(&conn, ReportKind::Session).unwrap();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].end_time_ms, Some(5));
    }

    #[test]
    fn stale_sessions_expire_past_max_age() {
        let conn = conn();
        start_or_get_open(&conn, ReportKind::Session, Some("old"), 0, None).unwrap();
        start_or_get_open(&conn, ReportKind::Session, Some("young"), 1, None).unwrap();

        // 정확히 max_age인 세션은 유지
        assert_eq!(expire_stale_sessions(&conn, 101, 101).unwrap(), 0);

        let expired = expire_stale_sessions(&conn, 101, 100).unwrap();
        assert_eq!(expired, 1);
        assert!(find_open(&conn, ReportKind::Session, Some("old")).unwrap().is_none());
        assert!(find_open(&conn, ReportKind::Session, Some("young")).unwrap().is_some());
    }

    #[test]
    fn session_window_membership() {
        let conn = conn();
        let open = start_or_get_open(&conn, ReportKind::Session, Some("open"), 10, None).unwrap();
        let closed = start_or_get_open(&conn, ReportKind::Session, Some("closed"), 10, None).unwrap();
        finish(&conn, ReportKind::Session, Some("closed"), 20).unwrap();

        assert!(sessions_containing(&conn, 5).unwrap().is_empty());
        assert_eq!(sessions_containing(&conn, 10).unwrap(), vec![open, closed]);
        assert_eq!(sessions_containing(&conn, 20).unwrap(), vec![open, closed]);
        assert_eq!(sessions_containing(&conn, 21).unwrap(), vec![open]);
    }

    #[test]
    fn orphaned_reports_respect_age() {
        let conn = conn();
        start_or_get_open(&conn, ReportKind::Hourly, None, 0, None).unwrap();
        start_or_get_open(&conn, ReportKind::Daily, None, 50, None).unwrap();

        assert_eq!(delete_orphaned(&conn, 10).unwrap(), 1);
        assert_eq!(all(&conn).unwrap().len(), 1);

        // 이미 삭제된 리포트 재삭제도 에러 없음
        delete_cascade(&conn, 999).unwrap();
    }
}
