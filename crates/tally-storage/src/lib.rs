//! # tally-storage
//!
//! SQLite 메트릭 저장소 어댑터.
//! 리포트/메타데이터/값 세 릴레이션을 관리하고, 집계와 롤업 파이프라인을
//! 단일 writer 트랜잭션으로 실행한다 (`CustomMetrics` 포트 구현).
//!
//! ## 모듈
//! - `sqlite`: 저장소 (CustomMetrics 구현)
//! - `export`: 상세 시계열 내보내기 스트리밍 writer
//! - `migration`: 스키마 마이그레이션

pub mod export;
pub mod migration;
pub mod sqlite;
