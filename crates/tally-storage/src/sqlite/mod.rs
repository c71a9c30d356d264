//! SQLite 저장소 어댑터.
//!
//! `CustomMetrics` 포트 구현.
//!
//! # 모듈 구조
//! - `reports`: 리포트 수명주기 (열린 리포트 조회/생성, 종료, 세션 만료, 고아 리포트 삭제)
//! - `metadata`: 리포트별 메트릭 메타데이터 upsert, carry-over 조회, 고아 메타데이터 삭제
//! - `values`: 값 적재, 범위 스칼라 집계, 최신 값 조회
//! - `cursor`: 페이지 단위 값 스트리밍 커서
//! - `aggregate`: 메트릭 그룹 → 리포트 맵 집계
//! - `collect`: 적재/세션/리포트 생성 파이프라인 (CustomMetrics 포트)

mod aggregate;
mod collect;
mod cursor;
mod metadata;
mod reports;
mod values;

pub use metadata::{MetadataRow, MetadataSpec};
pub use reports::ReportRow;
pub use values::ValueRow;

use rusqlite::{Connection, Transaction};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use tally_core::config::MetricsConfig;
use tally_core::error::CoreError;
use tracing::info;

use crate::migration;

/// SQLite 메트릭 저장소: `CustomMetrics` 포트 구현
pub struct SqliteMetricsStore {
    pub(super) conn: Mutex<Connection>,
    pub(super) config: MetricsConfig,
    pub(super) software_version: Option<String>,
}

impl SqliteMetricsStore {
    /// 파일 기반 SQLite 저장소 생성
    pub fn open(path: &Path, config: MetricsConfig) -> Result<Self, CoreError> {
        config.validate()?;

        let conn = Connection::open(path)
            .map_err(|e| CoreError::Storage(format!("SQLite 열기 실패: {e}")))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )
        .map_err(|e| CoreError::Storage(format!("PRAGMA 설정 실패: {e}")))?;

        migration::run_migrations(&conn)
            .map_err(|e| CoreError::Storage(format!("마이그레이션 실패: {e}")))?;

        info!("SQLite 메트릭 저장소 초기화: {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            config,
            software_version: None,
        })
    }

    /// 인메모리 SQLite 저장소 생성 (테스트용)
    pub fn open_in_memory(config: MetricsConfig) -> Result<Self, CoreError> {
        config.validate()?;

        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::Storage(format!("인메모리 SQLite 생성 실패: {e}")))?;

        migration::run_migrations(&conn)
            .map_err(|e| CoreError::Storage(format!("마이그레이션 실패: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            config,
            software_version: None,
        })
    }

    /// 새로 생성되는 리포트에 기록할 소프트웨어 버전 지정
    pub fn with_software_version(mut self, version: impl Into<String>) -> Self {
        self.software_version = Some(version.into());
        self
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// 단일 트랜잭션 안에서 실행. 에러 시 트랜잭션은 drop되어 롤백된다.
    pub(super) fn with_transaction<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, CoreError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| CoreError::Internal(format!("잠금 획득 실패: {e}")))?;

        let tx = conn
            .transaction()
            .map_err(|e| CoreError::Storage(format!("트랜잭션 시작 실패: {e}")))?;

        let result = f(&tx)?;

        tx.commit()
            .map_err(|e| CoreError::Storage(format!("트랜잭션 커밋 실패: {e}")))?;

        Ok(result)
    }

    /// 세 릴레이션 전체 덤프 (디버그/검증용)
    pub fn dump(&self) -> Result<DbDump, CoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CoreError::Internal(format!("잠금 획득 실패: {e}")))?;

        Ok(DbDump {
            reports: reports::all(&conn)?,
            metadata: metadata::all(&conn)?,
            values: values::all(&conn)?,
        })
    }
}

/// 저장소 전체 덤프
#[derive(Debug, Clone, Default, Serialize)]
pub struct DbDump {
    pub reports: Vec<ReportRow>,
    pub metadata: Vec<MetadataRow>,
    pub values: Vec<ValueRow>,
}

impl DbDump {
    pub fn is_empty(&self) -> bool {
        self.reports.is_empty() && self.metadata.is_empty() && self.values.is_empty()
    }
}

/// 행 변환 실패를 rusqlite 에러로 감싼다
pub(super) fn conversion_error(index: usize, error: CoreError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(error))
}

/// `?, ?, ?` 형태의 IN 절 placeholder
pub(super) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
