//! 스트리밍 집계기.
//!
//! 시간 오름차순 값 스트림을 한 번 훑어 계산하는 집계를 정의한다.
//! 저장소 어댑터는 구간 시작 이전의 최신 값 하나(seed)를 먼저, 이어서
//! `(start, end]` 구간의 값을 순서대로 [`ValueAggregator::accept`]에 전달한다.
//!
//! # 출력 키
//! - `<key>_<state>.secs/hour`: 구간 길이를 1시간으로 환산한 상태 체류 초
//! - `<key>_<state>.total_secs`: 상태 체류 총 초 (버림)
//! - `<key>_<state>.mean_time_in_state_ms`: 0이 아닌 완료 시프트의 평균 길이
//! - `<key>_drop`: 연속 값 감소량 절대값 합
//! - `<key>_moving_avg`: 시상수가 구간 길이의 1/3인 지수 이동 평균

use std::collections::BTreeMap;

use crate::models::metric::{Aggregation, NumericAgg, SampleValue, StateAgg};
use crate::models::report::MetricMap;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// 스트림 원소 하나
#[derive(Debug, Clone, PartialEq)]
pub struct TimedValue {
    pub timestamp_ms: i64,
    pub value: SampleValue,
}

impl TimedValue {
    pub fn new(timestamp_ms: i64, value: SampleValue) -> Self {
        Self {
            timestamp_ms,
            value,
        }
    }
}

/// 집계 구간 `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl Window {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }

    /// 구간 안으로 시각 보정
    pub fn clamp(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms
            .max(self.start_ms)
            .min(self.end_ms.max(self.start_ms))
    }
}

/// 시간순 스캔이 필요한 집계기
#[derive(Debug, Clone)]
pub enum ValueAggregator {
    TimeInState(TimeInState),
    ValueDrop(ValueDrop),
    MovingAverage(MovingAverage),
}

impl ValueAggregator {
    /// 메트릭에 요청된 집계 중 스트리밍이 필요한 것에 대한 집계기 목록
    pub fn for_metric(key: &str, aggregations: &[Aggregation]) -> Vec<Self> {
        let mut aggregators = Vec::new();

        let per_hour = aggregations.contains(&Aggregation::State(StateAgg::TimePerHour));
        let totals = aggregations.contains(&Aggregation::State(StateAgg::TimeTotals));
        if per_hour || totals {
            aggregators.push(Self::TimeInState(TimeInState::new(key, per_hour, totals)));
        }

        if aggregations.contains(&Aggregation::Numeric(NumericAgg::ValueDrop)) {
            aggregators.push(Self::ValueDrop(ValueDrop::new(key)));
        }

        // 둘 다 요청되면 같은 키를 쓰므로 dBm 쪽만 계산
        if aggregations.contains(&Aggregation::Numeric(NumericAgg::MovingAverageDbm)) {
            aggregators.push(Self::MovingAverage(MovingAverage::new(key, true)));
        } else if aggregations.contains(&Aggregation::Numeric(NumericAgg::MovingAverage)) {
            aggregators.push(Self::MovingAverage(MovingAverage::new(key, false)));
        }

        aggregators
    }

    pub fn accept(&mut self, window: Window, value: &TimedValue) {
        match self {
            Self::TimeInState(agg) => agg.accept(window, value),
            Self::ValueDrop(agg) => agg.accept(value),
            Self::MovingAverage(agg) => agg.accept(window, value),
        }
    }

    pub fn finish(self, window: Window, out: &mut MetricMap) {
        match self {
            Self::TimeInState(agg) => agg.finish(window, out),
            Self::ValueDrop(agg) => agg.finish(out),
            Self::MovingAverage(agg) => agg.finish(out),
        }
    }
}

// ============================================================
// 상태 체류 시간
// ============================================================

#[derive(Debug, Clone)]
struct Shift {
    state: String,
    duration_ms: i64,
}

/// 상태별 체류 시간과 시프트(같은 상태가 이어진 구간) 길이 집계
#[derive(Debug, Clone)]
pub struct TimeInState {
    key: String,
    per_hour: bool,
    totals: bool,
    time_in_state_ms: BTreeMap<String, i64>,
    shifts: Vec<Shift>,
    pending: Option<Shift>,
    last: Option<TimedValue>,
}

impl TimeInState {
    pub fn new(key: &str, per_hour: bool, totals: bool) -> Self {
        Self {
            key: key.to_string(),
            per_hour,
            totals,
            time_in_state_ms: BTreeMap::new(),
            shifts: Vec::new(),
            pending: None,
            last: None,
        }
    }

    fn accept(&mut self, window: Window, value: &TimedValue) {
        if value.timestamp_ms > window.end_ms {
            return;
        }

        if let Some(last) = &self.last {
            if let Some(state) = last.value.state_label() {
                let elapsed = window.clamp(value.timestamp_ms) - window.clamp(last.timestamp_ms);
                *self.time_in_state_ms.entry(state.clone()).or_insert(0) += elapsed;

                // 시프트는 구간 보정 없이 실제 경과 시간으로 누적
                if let Some(next_state) = value.value.state_label() {
                    let absolute = value.timestamp_ms - last.timestamp_ms;
                    let mut current = self.pending.take().unwrap_or(Shift {
                        state,
                        duration_ms: 0,
                    });
                    current.duration_ms += absolute;

                    if next_state != current.state {
                        self.shifts.push(current);
                        self.pending = Some(Shift {
                            state: next_state,
                            duration_ms: 0,
                        });
                    } else {
                        self.pending = Some(current);
                    }
                }
            }
        }

        self.last = Some(value.clone());
    }

    /// 마지막 값의 상태에 구간 끝까지의 시간을 더한다
    fn close(&mut self, window: Window) {
        if let Some(last) = self.last.take() {
            if let Some(state) = last.value.state_label() {
                let elapsed = window.clamp(window.end_ms) - window.clamp(last.timestamp_ms);
                *self.time_in_state_ms.entry(state).or_insert(0) += elapsed;
            }
        }
    }

    fn finish(mut self, window: Window, out: &mut MetricMap) {
        self.close(window);

        // 진행 중인 시프트는 완료로 간주하지 않는다
        let duration_ms = window.duration_ms();
        for (state, time_ms) in &self.time_in_state_ms {
            if self.per_hour && *time_ms <= duration_ms {
                let secs_per_hour = if duration_ms != 0 {
                    (SECONDS_PER_HOUR * (*time_ms as f64 / duration_ms as f64)).round() as i64
                } else {
                    0
                };
                out.insert(
                    format!("{}_{}.secs/hour", self.key, state),
                    serde_json::Value::from(secs_per_hour),
                );
            }
            if self.totals {
                out.insert(
                    format!("{}_{}.total_secs", self.key, state),
                    serde_json::Value::from(time_ms / 1000),
                );
            }
        }

        if self.totals {
            let mut by_state: BTreeMap<&str, (i64, i64)> = BTreeMap::new();
            for shift in self.shifts.iter().filter(|s| s.duration_ms != 0) {
                let entry = by_state.entry(shift.state.as_str()).or_insert((0, 0));
                entry.0 += shift.duration_ms;
                entry.1 += 1;
            }
            for (state, (sum_ms, count)) in by_state {
                let mean = (sum_ms as f64 / count as f64).round() as i64;
                out.insert(
                    format!("{}_{}.mean_time_in_state_ms", self.key, state),
                    serde_json::Value::from(mean),
                );
            }
        }
    }
}

// ============================================================
// 값 하락
// ============================================================

/// 연속 숫자 값 사이 감소량 합 (카운터 리셋 감지)
#[derive(Debug, Clone)]
pub struct ValueDrop {
    key: String,
    total_drop: f64,
    last: Option<f64>,
}

impl ValueDrop {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            total_drop: 0.0,
            last: None,
        }
    }

    fn accept(&mut self, value: &TimedValue) {
        let current = value.value.as_number();
        if let (Some(last), Some(current)) = (self.last, current) {
            let delta = current - last;
            if delta < 0.0 {
                self.total_drop += delta.abs();
            }
        }
        self.last = current;
    }

    fn finish(self, out: &mut MetricMap) {
        out.insert(
            format!("{}_drop", self.key),
            serde_json::Value::from(self.total_drop),
        );
    }
}

// ============================================================
// 이동 평균
// ============================================================

/// 시간 가중 지수 이동 평균
///
/// 새 값의 가중치는 `1 - exp(-Δt / τ)`, `τ = 구간 길이 / 3`.
/// `decibel`이면 dBm 값을 mW로 바꿔 평균하고 결과를 다시 dBm으로 돌린다.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    key: String,
    decibel: bool,
    average: Option<f64>,
    last_timestamp_ms: i64,
}

impl MovingAverage {
    pub fn new(key: &str, decibel: bool) -> Self {
        Self {
            key: key.to_string(),
            decibel,
            average: None,
            last_timestamp_ms: 0,
        }
    }

    fn accept(&mut self, window: Window, value: &TimedValue) {
        let Some(number) = value.value.as_number() else {
            return;
        };
        let number = if self.decibel {
            10f64.powf(number / 10.0)
        } else {
            number
        };

        self.average = Some(match self.average {
            None => number,
            Some(average) => {
                let tau = window.duration_ms() as f64 / 3.0;
                let delta = (value.timestamp_ms - self.last_timestamp_ms) as f64;
                let alpha = if tau > 0.0 {
                    1.0 - (-delta / tau).exp()
                } else {
                    1.0
                };
                number * alpha + (1.0 - alpha) * average
            }
        });
        self.last_timestamp_ms = value.timestamp_ms;
    }

    fn finish(self, out: &mut MetricMap) {
        let Some(average) = self.average else {
            return;
        };
        let average = if self.decibel {
            10.0 * average.log10()
        } else {
            average
        };
        out.insert(
            format!("{}_moving_avg", self.key),
            serde_json::Value::from(average),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60_000;

    fn run(aggregations: &[Aggregation], window: Window, values: &[TimedValue]) -> MetricMap {
        let mut aggregators = ValueAggregator::for_metric("m", aggregations);
        for value in values {
            for aggregator in aggregators.iter_mut() {
                aggregator.accept(window, value);
            }
        }
        let mut out = MetricMap::new();
        for aggregator in aggregators {
            aggregator.finish(window, &mut out);
        }
        out
    }

    fn state_aggs() -> Vec<Aggregation> {
        vec![
            Aggregation::State(StateAgg::TimePerHour),
            Aggregation::State(StateAgg::TimeTotals),
        ]
    }

    fn boolean(t: i64, v: bool) -> TimedValue {
        TimedValue::new(t, SampleValue::Bool(v))
    }

    fn number(t: i64, v: f64) -> TimedValue {
        TimedValue::new(t, SampleValue::Number(v))
    }

    #[test]
    fn bool_states_and_shifts() {
        let window = Window::new(0, 60 * MIN);
        let values = vec![
            boolean(0, true),
            boolean(10 * MIN, false),
            boolean(15 * MIN, true),
            boolean(25 * MIN, false),
        ];

        let out = run(&state_aggs(), window, &values);

        assert_eq!(out["m_1.total_secs"], 1200);
        assert_eq!(out["m_0.total_secs"], 2400);
        assert_eq!(out["m_1.secs/hour"], 1200);
        assert_eq!(out["m_0.secs/hour"], 2400);
        assert_eq!(out["m_1.mean_time_in_state_ms"], 10 * MIN);
        // 마지막 false 시프트는 진행 중이므로 5분짜리 하나만 반영
        assert_eq!(out["m_0.mean_time_in_state_ms"], 5 * MIN);
    }

    #[test]
    fn seed_before_window_is_clamped_but_shift_is_absolute() {
        let window = Window::new(0, 30_000);
        let values = vec![
            TimedValue::new(-60_000, SampleValue::String("on".into())),
            TimedValue::new(5_000, SampleValue::String("off".into())),
        ];

        let out = run(&state_aggs(), window, &values);

        assert_eq!(out["m_on.total_secs"], 5);
        assert_eq!(out["m_off.total_secs"], 25);
        assert_eq!(out["m_on.mean_time_in_state_ms"], 65_000);
        assert!(!out.contains_key("m_off.mean_time_in_state_ms"));
    }

    #[test]
    fn new_state_at_window_end_contributes_nothing() {
        let window = Window::new(0, 3_600_000);
        let values = vec![number(0, 100.0), number(3_600_000, 50.0)];

        let out = run(
            &[Aggregation::State(StateAgg::TimeTotals)],
            window,
            &values,
        );

        assert_eq!(out["m_100.total_secs"], 3600);
        assert_eq!(out["m_50.total_secs"], 0);
        assert!(!out.contains_key("m_100.secs/hour"));
    }

    #[test]
    fn durations_sum_to_window_length() {
        let window = Window::new(1_000, 91_000);
        let values = vec![
            TimedValue::new(0, SampleValue::String("a".into())),
            TimedValue::new(7_000, SampleValue::String("b".into())),
            TimedValue::new(7_000, SampleValue::String("c".into())),
            TimedValue::new(40_500, SampleValue::String("a".into())),
            TimedValue::new(91_000, SampleValue::String("b".into())),
        ];

        let mut aggregator = TimeInState::new("m", false, true);
        for value in &values {
            aggregator.accept(window, value);
        }
        aggregator.close(window);

        let total: i64 = aggregator.time_in_state_ms.values().sum();
        assert_eq!(total, window.duration_ms());
        assert_eq!(aggregator.time_in_state_ms["a"], 56_500);
        assert_eq!(aggregator.time_in_state_ms["c"], 33_500);
    }

    #[test]
    fn value_at_window_start_counts_from_start() {
        let window = Window::new(10_000, 20_000);
        let values = vec![boolean(10_000, true), boolean(20_000, false)];

        let out = run(&state_aggs(), window, &values);

        assert_eq!(out["m_1.total_secs"], 10);
        assert_eq!(out["m_1.secs/hour"], 3600);
        assert_eq!(out["m_0.total_secs"], 0);
        assert_eq!(out["m_0.secs/hour"], 0);
    }

    #[test]
    fn values_after_window_end_are_ignored() {
        let window = Window::new(0, 10_000);
        let values = vec![boolean(0, true), boolean(15_000, false)];

        let out = run(&state_aggs(), window, &values);

        assert_eq!(out["m_1.total_secs"], 10);
        assert!(!out.contains_key("m_0.total_secs"));
    }

    #[test]
    fn zero_length_window_reports_zero_per_hour() {
        let window = Window::new(5_000, 5_000);
        let out = run(&state_aggs(), window, &[boolean(5_000, true)]);

        assert_eq!(out["m_1.secs/hour"], 0);
        assert_eq!(out["m_1.total_secs"], 0);
    }

    #[test]
    fn value_drop_sums_decreases_only() {
        let window = Window::new(0, 100);
        let values = vec![
            number(0, 10.0),
            number(10, 4.0),
            number(20, 9.0),
            TimedValue::new(30, SampleValue::String("x".into())),
            number(40, 1.0),
            number(50, 0.5),
        ];

        let out = run(&[Aggregation::Numeric(NumericAgg::ValueDrop)], window, &values);

        assert_eq!(out["m_drop"], serde_json::json!(6.5));
    }

    fn moving_avg(out: &MetricMap) -> f64 {
        out["m_moving_avg"].as_f64().unwrap()
    }

    #[test]
    fn moving_average_weights_by_elapsed_time() {
        let window = Window::new(0, 3_000);
        let values = vec![number(0, 10.0), number(1_000, 20.0)];

        let out = run(&[Aggregation::Numeric(NumericAgg::MovingAverage)], window, &values);

        // τ = 1000ms, Δt = 1000ms → alpha = 1 - e^-1
        let alpha = 1.0 - (-1.0f64).exp();
        let expected = 20.0 * alpha + 10.0 * (1.0 - alpha);
        assert!((moving_avg(&out) - expected).abs() < 1e-9);
    }

    #[test]
    fn moving_average_ignores_same_timestamp_and_non_numbers() {
        let window = Window::new(0, 3_000);
        let values = vec![
            number(0, 10.0),
            number(0, 50.0),
            TimedValue::new(500, SampleValue::String("x".into())),
        ];

        let out = run(&[Aggregation::Numeric(NumericAgg::MovingAverage)], window, &values);
        assert_eq!(moving_avg(&out), 10.0);

        let out = run(&[Aggregation::Numeric(NumericAgg::MovingAverage)], window, &[]);
        assert!(!out.contains_key("m_moving_avg"));
    }

    #[test]
    fn decibel_moving_average_averages_in_milliwatts() {
        let window = Window::new(0, 0);
        // 구간 길이 0 → 마지막 값이 그대로 남는다
        let out = run(
            &[Aggregation::Numeric(NumericAgg::MovingAverageDbm)],
            window,
            &[number(0, -30.0), number(0, -20.0)],
        );
        assert!((moving_avg(&out) - -20.0).abs() < 1e-9);

        // -30dBm(0.001mW)과 -20dBm(0.01mW)의 가중 평균은 mW 공간에서 계산된다
        let window = Window::new(0, 3_000);
        let out = run(
            &[
                Aggregation::Numeric(NumericAgg::MovingAverage),
                Aggregation::Numeric(NumericAgg::MovingAverageDbm),
            ],
            window,
            &[number(0, -30.0), number(1_000, -20.0)],
        );
        let alpha = 1.0 - (-1.0f64).exp();
        let milliwatts = 0.01 * alpha + 0.001 * (1.0 - alpha);
        assert!((moving_avg(&out) - 10.0 * milliwatts.log10()).abs() < 1e-9);
    }

    #[test]
    fn scalar_aggregations_need_no_stream() {
        let aggregators = ValueAggregator::for_metric(
            "m",
            &[
                Aggregation::Numeric(NumericAgg::Sum),
                Aggregation::Numeric(NumericAgg::LatestValue),
            ],
        );
        assert!(aggregators.is_empty());
    }
}
