//! 메트릭 샘플 및 분류 모델.
//!
//! - 리포트 종류 (Hourly / Daily / Session)
//! - 메트릭/데이터 종류
//! - 집계 종류 (숫자 집계, 상태 집계)
//! - 수집 샘플

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// 세션 이름 최대 길이
pub const SESSION_NAME_MAX_LEN: usize = 64;

/// 세션 이름으로 쓸 수 없는 예약어 (대소문자 무시)
const RESERVED_SESSION_NAMES: [&str; 2] = ["heartbeat", "daily-heartbeat"];

/// 리포트 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportKind {
    /// 시간 단위 heartbeat 누적기
    #[serde(rename = "Heartbeat")]
    Hourly,
    /// Hourly 24시간 롤업 (및 장기 누적기)
    #[serde(rename = "Daily-Heartbeat")]
    Daily,
    /// 명시적으로 시작/종료되는 이름 있는 세션
    #[serde(rename = "Session")]
    Session,
}

impl ReportKind {
    /// 저장소에 기록되는 문자열
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "Heartbeat",
            Self::Daily => "Daily-Heartbeat",
            Self::Session => "Session",
        }
    }

    /// 저장소 문자열에서 변환
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "Heartbeat" => Ok(Self::Hourly),
            "Daily-Heartbeat" => Ok(Self::Daily),
            "Session" => Ok(Self::Session),
            other => Err(CoreError::validation(
                "report_kind",
                format!("알 수 없는 리포트 종류: {other}"),
            )),
        }
    }
}

/// 메트릭 종류
///
/// 분포(distribution) 메트릭은 `Gauge`, 상태 추적기는 `Property`로 기록한다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Property,
    Event,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Property => "property",
            Self::Event => "event",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "counter" => Ok(Self::Counter),
            "gauge" => Ok(Self::Gauge),
            "property" => Ok(Self::Property),
            "event" => Ok(Self::Event),
            other => Err(CoreError::validation(
                "metric_kind",
                format!("알 수 없는 메트릭 종류: {other}"),
            )),
        }
    }
}

/// 값 데이터 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Double,
    String,
    Boolean,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Double => "double",
            Self::String => "string",
            Self::Boolean => "boolean",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "double" => Ok(Self::Double),
            "string" => Ok(Self::String),
            "boolean" => Ok(Self::Boolean),
            other => Err(CoreError::validation(
                "data_kind",
                format!("알 수 없는 데이터 종류: {other}"),
            )),
        }
    }
}

/// 숫자 집계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NumericAgg {
    Count,
    Sum,
    Min,
    Max,
    Mean,
    LatestValue,
    /// 연속 값 사이 감소량의 절대값 합 (카운터 리셋 감지)
    ValueDrop,
    /// 시간 가중 지수 이동 평균
    MovingAverage,
    /// dBm 값을 mW로 환산해 평균한 뒤 다시 dBm으로 돌린 이동 평균
    MovingAverageDbm,
}

/// 상태 집계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateAgg {
    LatestValue,
    /// 상태별 시간당 체류 초
    TimePerHour,
    /// 상태별 총 체류 초 + 평균 시프트 길이
    TimeTotals,
}

/// 메트릭에 요청된 집계 하나
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Numeric(NumericAgg),
    State(StateAgg),
}

impl Aggregation {
    /// LATEST_VALUE 계열 여부 (숫자/상태 모두 `.latest` 키를 만든다)
    pub fn is_latest(&self) -> bool {
        matches!(
            self,
            Self::Numeric(NumericAgg::LatestValue) | Self::State(StateAgg::LatestValue)
        )
    }

    /// 범위 스칼라 쿼리로 계산되는 집계 여부
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Self::Numeric(
                NumericAgg::Count
                    | NumericAgg::Sum
                    | NumericAgg::Min
                    | NumericAgg::Max
                    | NumericAgg::Mean
            )
        )
    }

    /// 시간순 스트리밍 스캔이 필요한 집계 여부
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Self::Numeric(
                NumericAgg::ValueDrop | NumericAgg::MovingAverage | NumericAgg::MovingAverageDbm
            ) | Self::State(StateAgg::TimePerHour | StateAgg::TimeTotals)
        )
    }
}

/// 샘플 값: 문자열, 숫자, 불리언 중 정확히 하나
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl SampleValue {
    /// 값에 대응하는 데이터 종류
    pub fn data_kind(&self) -> DataKind {
        match self {
            Self::Bool(_) => DataKind::Boolean,
            Self::Number(_) => DataKind::Double,
            Self::String(_) => DataKind::String,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// 리포트 메트릭 맵에 기록되는 값 (불리언은 "1"/"0" 문자열)
    pub fn to_metric_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::String(bool_label(*b).to_string()),
            Self::Number(n) => serde_json::Value::from(*n),
            Self::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// 상세 내보내기에 기록되는 원본 값
    pub fn to_export_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Value::from(*n),
            Self::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// 상태 집계 키에 쓰이는 상태 이름. 표현할 수 없는 숫자(NaN 등)는 `None`.
    pub fn state_label(&self) -> Option<String> {
        match self {
            Self::Bool(b) => Some(bool_label(*b).to_string()),
            Self::Number(n) => format_number(*n),
            Self::String(s) => Some(s.clone()),
        }
    }
}

fn bool_label(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// 정수로 표현 가능한 값은 소수점 없이, 그 외는 JSON 숫자 표기
fn format_number(value: f64) -> Option<String> {
    if !value.is_finite() {
        return None;
    }
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return Some(format!("{}", value as i64));
    }
    serde_json::Number::from_f64(value).map(|n| n.to_string())
}

/// 수집 샘플
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// 메트릭 이름 (리포트 내 고유)
    pub event_name: String,
    /// 소속 누적기 종류
    pub report_kind: ReportKind,
    /// `ReportKind::Session`일 때 세션 이름
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    /// 샘플 시각 (epoch 밀리초)
    pub timestamp_ms: i64,
    pub metric_kind: MetricKind,
    pub data_kind: DataKind,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
    /// 다음 리포트로 최신 값을 이월할지 여부
    #[serde(default)]
    pub carry_over: bool,
    /// 내부 메트릭 여부 (`internal_metrics` 맵에 기록)
    #[serde(default)]
    pub internal: bool,
    pub value: SampleValue,
    #[serde(default = "default_sample_version")]
    pub version: u32,
}

fn default_sample_version() -> u32 {
    1
}

impl MetricSample {
    /// Hourly 누적기에 기록되는 샘플 생성
    pub fn new(event_name: impl Into<String>, timestamp_ms: i64, value: SampleValue) -> Self {
        let data_kind = value.data_kind();
        let metric_kind = match data_kind {
            DataKind::Double => MetricKind::Gauge,
            DataKind::String | DataKind::Boolean => MetricKind::Property,
        };
        Self {
            event_name: event_name.into(),
            report_kind: ReportKind::Hourly,
            session_name: None,
            timestamp_ms,
            metric_kind,
            data_kind,
            aggregations: Vec::new(),
            carry_over: false,
            internal: false,
            value,
            version: default_sample_version(),
        }
    }

    pub fn number(event_name: impl Into<String>, timestamp_ms: i64, value: f64) -> Self {
        Self::new(event_name, timestamp_ms, SampleValue::Number(value))
    }

    pub fn string(
        event_name: impl Into<String>,
        timestamp_ms: i64,
        value: impl Into<String>,
    ) -> Self {
        Self::new(event_name, timestamp_ms, SampleValue::String(value.into()))
    }

    pub fn boolean(event_name: impl Into<String>, timestamp_ms: i64, value: bool) -> Self {
        Self::new(event_name, timestamp_ms, SampleValue::Bool(value))
    }

    /// 이름 있는 세션에 기록
    pub fn in_session(mut self, name: impl Into<String>) -> Self {
        self.report_kind = ReportKind::Session;
        self.session_name = Some(name.into());
        self
    }

    /// Daily 누적기에 기록
    pub fn in_daily(mut self) -> Self {
        self.report_kind = ReportKind::Daily;
        self.session_name = None;
        self
    }

    pub fn with_kind(mut self, metric_kind: MetricKind) -> Self {
        self.metric_kind = metric_kind;
        self
    }

    pub fn with_aggregations(mut self, aggregations: Vec<Aggregation>) -> Self {
        self.aggregations = aggregations;
        self
    }

    pub fn carry_over(mut self) -> Self {
        self.carry_over = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// 샘플 일관성 검증
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.event_name.is_empty() {
            return Err(CoreError::validation("event_name", "비어 있을 수 없습니다"));
        }
        if self.value.data_kind() != self.data_kind {
            return Err(CoreError::validation(
                "value",
                format!(
                    "데이터 종류 불일치: 선언={}, 값={}",
                    self.data_kind.as_str(),
                    self.value.data_kind().as_str()
                ),
            ));
        }
        match (self.report_kind, &self.session_name) {
            (ReportKind::Session, Some(name)) => validate_session_name(name),
            (ReportKind::Session, None) => Err(CoreError::validation(
                "session_name",
                "세션 샘플에는 세션 이름이 필요합니다",
            )),
            (_, Some(_)) => Err(CoreError::validation(
                "session_name",
                "세션이 아닌 샘플에는 세션 이름을 지정할 수 없습니다",
            )),
            (_, None) => Ok(()),
        }
    }
}

/// 세션 이름 검증: `[a-zA-Z0-9-_.]{1,64}`, 예약어 제외
pub fn validate_session_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() || name.len() > SESSION_NAME_MAX_LEN {
        return Err(CoreError::validation(
            "session_name",
            format!("길이는 1~{SESSION_NAME_MAX_LEN}자여야 합니다: {name:?}"),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(CoreError::validation(
            "session_name",
            format!("허용되지 않는 문자가 포함되어 있습니다: {name:?}"),
        ));
    }
    if RESERVED_SESSION_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
    {
        return Err(CoreError::validation(
            "session_name",
            format!("예약된 이름입니다: {name:?}"),
        ));
    }
    Ok(())
}
