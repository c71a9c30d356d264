//! Tally 도메인 모델.
//!
//! 수집 샘플, 리포트 출력, 파생 집계, 상세 내보내기 트리 구조체를 정의한다.
//! 모든 모델은 `serde` Serialize/Deserialize를 구현한다.

pub mod derived;
pub mod export;
pub mod metric;
pub mod report;
