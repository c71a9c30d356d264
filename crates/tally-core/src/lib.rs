//! # tally-core
//!
//! Tally 메트릭 엔진의 도메인 모델, 포트(trait) 정의, 스트리밍 집계기, 에러 타입.
//! 저장소 어댑터와 CLI가 공유하는 핵심 타입과 인터페이스를 제공한다.
//!
//! ## 구조
//!
//! - [`models`]: 리포트/메트릭/내보내기 데이터 구조체 (serde Serialize/Deserialize)
//! - [`ports`]: Hexagonal Architecture 포트 인터페이스 (async_trait)
//! - [`aggregation`]: 상태 지속 시간, 값 하락 스트리밍 집계기
//! - [`error`]: 핵심 에러 타입 (thiserror)
//! - [`config`]: 엔진 설정 구조체
//! - [`config_manager`]: 설정 파일 관리 (로드/저장)

pub mod aggregation;
pub mod config;
pub mod config_manager;
pub mod error;
pub mod models;
pub mod ports;
