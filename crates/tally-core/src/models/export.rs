//! 상세 시계열 내보내기 트리.
//!
//! 저장소 어댑터는 이 구조를 스트리밍으로 기록하고, 소비자는 한 번에 역직렬화한다.

use serde::{Deserialize, Serialize};

/// 내보내기 파일 전체
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportTree {
    pub schema_version: u32,
    /// 리포트 시작 시각 (epoch 밀리초)
    pub start_time: i64,
    pub duration_ms: i64,
    pub report_type: String,
    pub producer: Producer,
    pub rollups: Vec<Rollup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Producer {
    pub version: String,
    pub id: String,
}

/// 메트릭 하나의 전체 시계열
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollup {
    pub metadata: RollupMetadata,
    pub data: Vec<DataPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupMetadata {
    pub string_key: String,
    pub metric_type: String,
    pub data_type: String,
    pub internal: bool,
}

/// 시계열 점 하나. `t`는 리포트 시작 시각 이상으로 보정된다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub t: i64,
    pub value: serde_json::Value,
}
