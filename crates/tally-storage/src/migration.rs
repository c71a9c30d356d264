//! 스키마 마이그레이션.
//!
//! 버전 기반 SQLite 스키마 관리.

use rusqlite::Connection;
use tracing::{debug, info};

/// 현재 스키마 버전
const CURRENT_VERSION: u32 = 2;

/// 스키마 마이그레이션 실행
pub fn run_migrations(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current = get_version(conn)?;
    info!("현재 스키마 버전: {current}, 목표: {CURRENT_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }

    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// 현재 스키마 버전 조회
fn get_version(conn: &Connection) -> Result<u32, rusqlite::Error> {
    let result: Result<u32, _> = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    );
    result.or(Ok(0))
}

/// V1: reports + metric_metadata + metric_values 테이블 생성
fn migrate_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    debug!("마이그레이션 V1 실행: reports + metric_metadata + metric_values 테이블");

    conn.execute_batch(
        "
        -- 리포트 (열린 리포트는 end_time_ms IS NULL)
        CREATE TABLE IF NOT EXISTS reports (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            name TEXT,
            start_time_ms INTEGER NOT NULL,
            end_time_ms INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_reports_kind_end ON reports(kind, end_time_ms);

        -- 리포트별 메트릭 메타데이터
        CREATE TABLE IF NOT EXISTS metric_metadata (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            report_id INTEGER NOT NULL REFERENCES reports(id),
            event_name TEXT NOT NULL,
            metric_kind TEXT NOT NULL,
            data_kind TEXT NOT NULL,
            carry_over INTEGER NOT NULL DEFAULT 0,
            aggregations TEXT NOT NULL,
            internal INTEGER NOT NULL DEFAULT 0,
            UNIQUE (report_id, event_name)
        );

        -- 메트릭 값 (string/number/bool 중 정확히 하나)
        CREATE TABLE IF NOT EXISTS metric_values (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            metadata_id INTEGER NOT NULL REFERENCES metric_metadata(id),
            version INTEGER NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            string_val TEXT,
            number_val REAL,
            bool_val INTEGER,
            CHECK ((string_val IS NOT NULL) + (number_val IS NOT NULL) + (bool_val IS NOT NULL) = 1)
        );

        CREATE INDEX IF NOT EXISTS idx_metric_values_metadata ON metric_values(metadata_id);

        -- 버전 기록
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;

    info!("마이그레이션 V1 완료");
    Ok(())
}

/// V2: reports.software_version 컬럼 + 조회용 복합 인덱스
fn migrate_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    debug!("마이그레이션 V2 실행: reports.software_version 컬럼 추가");

    conn.execute_batch(
        "
        ALTER TABLE reports ADD COLUMN software_version TEXT;

        CREATE INDEX IF NOT EXISTS idx_reports_kind_name ON reports(kind, name);
        CREATE INDEX IF NOT EXISTS idx_metric_values_metadata_time
            ON metric_values(metadata_id, timestamp_ms);

        -- 버전 기록
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )?;

    info!("마이그레이션 V2 완료");
    Ok(())
}
