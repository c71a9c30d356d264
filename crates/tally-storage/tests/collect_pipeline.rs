//! 리포트 생성 파이프라인 통합 테스트.
//!
//! 적재 → 세션 → collect(Hourly/Daily/Session) → 보존 정책 전체 흐름.

use std::fs;

use tally_core::config::MetricsConfig;
use tally_core::models::derived::{DerivedAggregation, DerivedInput};
use tally_core::models::export::ExportTree;
use tally_core::models::metric::{Aggregation, MetricKind, MetricSample, NumericAgg, StateAgg};
use tally_core::ports::metrics::{CollectRequest, CustomMetrics};
use tally_storage::sqlite::SqliteMetricsStore;
use tempfile::TempDir;

const SEC: i64 = 1_000;
const HOUR: i64 = 3_600 * SEC;
const DAY: i64 = 24 * HOUR;

fn store() -> SqliteMetricsStore {
    SqliteMetricsStore::open_in_memory(MetricsConfig::default()).unwrap()
}

fn numeric(name: &str, t: i64, v: f64) -> MetricSample {
    MetricSample::number(name, t, v).with_aggregations(vec![
        Aggregation::Numeric(NumericAgg::Count),
        Aggregation::Numeric(NumericAgg::Sum),
        Aggregation::Numeric(NumericAgg::Min),
        Aggregation::Numeric(NumericAgg::Max),
        Aggregation::Numeric(NumericAgg::Mean),
    ])
}

#[tokio::test]
async fn battery_level_new_state_at_report_end() {
    let store = store();
    let battery = |t, v| {
        MetricSample::number("battery_level", t, v)
            .with_aggregations(vec![Aggregation::State(StateAgg::TimeTotals)])
    };
    store.add(&battery(0, 100.0)).await.unwrap();
    store.add(&battery(3_600 * SEC, 50.0)).await.unwrap();

    let report = store.collect(CollectRequest::at(3_600 * SEC)).await.unwrap();

    assert_eq!(report.hourly.metrics["battery_level_100.total_secs"], 3_600);
    assert_eq!(report.hourly.metrics["battery_level_50.total_secs"], 0);
    assert_eq!(report.hourly.start_time_ms, 0);
    assert_eq!(report.hourly.end_time_ms, 3_600 * SEC);
}

#[tokio::test]
async fn session_is_reported_once_and_deleted() {
    let store = store();
    store.start_session("A", 10).await.unwrap();
    store.add(&numeric("m", 20, 1.0)).await.unwrap();
    store.finish_session("A", 30).await.unwrap();

    let report = store.collect(CollectRequest::at(30)).await.unwrap();
    assert_eq!(report.sessions.len(), 1);
    let session = &report.sessions[0];
    assert_eq!(session.name.as_deref(), Some("A"));
    assert_eq!(session.start_time_ms, 10);
    assert_eq!(session.end_time_ms, 30);
    assert_eq!(session.metrics["m.count"], 1);
    assert_eq!(session.metrics["m.sum"], 1.0);

    let again = store.collect(CollectRequest::at(30)).await.unwrap();
    assert!(again.sessions.is_empty());

    let dump = store.dump().unwrap();
    assert!(dump.reports.iter().all(|r| r.name.as_deref() != Some("A")));
}

#[tokio::test]
async fn daily_report_needs_a_full_day_of_hourly_reports() {
    let store = store();

    for hour in 0..24 {
        let start = hour * HOUR;
        store.add(&numeric("requests", start, 2.0)).await.unwrap();
        let report = store.collect(CollectRequest::at(start + HOUR)).await.unwrap();

        if hour < 23 {
            // 23시간 분량까지는 Daily 없음
            assert!(report.daily.is_none(), "hour {hour}");
        } else {
            let daily = report.daily.expect("Daily 리포트");
            assert_eq!(daily.start_time_ms, 0);
            assert_eq!(daily.end_time_ms, DAY);
            assert_eq!(daily.metrics["requests.count"], 24);
            assert_eq!(daily.metrics["requests.sum"], 48.0);
        }
    }

    // 병합된 Hourly 리포트는 모두 삭제된다
    assert!(store.dump().unwrap().is_empty());

    let next = store.collect(CollectRequest::at(DAY + HOUR)).await.unwrap();
    assert!(next.daily.is_none());
}

#[tokio::test]
async fn daily_value_drop_spans_counter_reset() {
    let store = store();

    let mut daily = None;
    for hour in 0..24 {
        let start = hour * HOUR;
        // 12시에 카운터 리셋 (120 → 5)
        let value = if hour < 12 {
            10.0 * (hour + 1) as f64
        } else {
            5.0 * (hour - 11) as f64
        };
        store
            .add(
                &MetricSample::number("packets", start, value)
                    .with_kind(MetricKind::Counter)
                    .with_aggregations(vec![Aggregation::Numeric(NumericAgg::ValueDrop)]),
            )
            .await
            .unwrap();
        daily = store.collect(CollectRequest::at(start + HOUR)).await.unwrap().daily;
    }

    let daily = daily.expect("Daily 리포트");
    assert_eq!(daily.metrics["packets_drop"], 115.0);
}

#[tokio::test]
async fn daily_metric_follows_latest_internal_flag() {
    let store = store();

    let mut daily = None;
    for hour in 0..24 {
        let start = hour * HOUR;
        let mut sample = numeric("wifi_scans", start, 1.0);
        if hour < 23 {
            sample = sample.internal();
        }
        store.add(&sample).await.unwrap();
        daily = store.collect(CollectRequest::at(start + HOUR)).await.unwrap().daily;
    }

    // 종류가 같으면 충돌이 아니며 마지막 Hourly의 메타데이터가 이긴다
    let daily = daily.expect("Daily 리포트");
    assert_eq!(daily.metrics["wifi_scans.count"], 24);
    assert!(!daily.internal_metrics.contains_key("wifi_scans.count"));
}

#[tokio::test]
async fn collect_twice_at_same_time_is_idempotent() {
    let store = store();
    store.add(&numeric("cpu", 0, 10.0)).await.unwrap();
    store.add(&numeric("cpu", 10 * SEC, 30.0)).await.unwrap();

    let first = store.collect(CollectRequest::at(HOUR)).await.unwrap();
    assert_eq!(first.hourly.metrics["cpu.mean"], 20.0);

    let second = store.collect(CollectRequest::at(HOUR)).await.unwrap();
    assert!(second.hourly.metrics.is_empty());
    assert_eq!(second.hourly.start_time_ms, HOUR);
    assert_eq!(second.hourly.end_time_ms, HOUR);
    assert!(second.daily.is_none());
}

#[tokio::test]
async fn carry_over_survives_three_days_then_lapses() {
    let store = store();
    let t0 = 5 * SEC;
    store
        .add(
            &MetricSample::string("os_version", t0, "14")
                .with_aggregations(vec![Aggregation::State(StateAgg::LatestValue)])
                .carry_over(),
        )
        .await
        .unwrap();

    let first = store.collect(CollectRequest::at(t0 + HOUR).daily(false)).await.unwrap();
    assert_eq!(first.hourly.metrics["os_version.latest"], "14");

    let second_at = t0 + HOUR + 71 * HOUR + 59 * 60 * SEC;
    let second = store.collect(CollectRequest::at(second_at).daily(false)).await.unwrap();
    assert_eq!(second.hourly.metrics["os_version.latest"], "14");
    assert_eq!(second.hourly.start_time_ms, t0 + HOUR);

    let third = store
        .collect(CollectRequest::at(second_at + HOUR).daily(false))
        .await
        .unwrap();
    assert!(!third.hourly.metrics.contains_key("os_version.latest"));
}

#[tokio::test]
async fn carried_values_do_not_count_twice() {
    let store = store();
    let sample = |t, v| {
        MetricSample::number("temperature", t, v)
            .with_aggregations(vec![
                Aggregation::Numeric(NumericAgg::Count),
                Aggregation::Numeric(NumericAgg::LatestValue),
            ])
            .carry_over()
    };
    store.add(&sample(0, 30.0)).await.unwrap();
    store.add(&sample(HOUR / 2, 31.0)).await.unwrap();

    let first = store.collect(CollectRequest::at(HOUR)).await.unwrap();
    assert_eq!(first.hourly.metrics["temperature.count"], 2);

    store.add(&sample(HOUR + 10, 32.0)).await.unwrap();
    let second = store.collect(CollectRequest::at(2 * HOUR)).await.unwrap();
    assert_eq!(second.hourly.metrics["temperature.count"], 1);
    assert_eq!(second.hourly.metrics["temperature.latest"], 32.0);
}

#[tokio::test]
async fn range_bounds_for_numeric_aggregations() {
    let store = store();
    store.add(&numeric("load", 100, 1.0)).await.unwrap();
    store.add(&numeric("load", 150, 2.0)).await.unwrap();
    store.add(&numeric("load", 200, 4.0)).await.unwrap();

    // end와 같은 시각 포함, end 이후 값 제외
    store.add(&numeric("load", 250, 100.0)).await.unwrap();
    let report = store.collect(CollectRequest::at(200)).await.unwrap();

    assert_eq!(report.hourly.metrics["load.count"], 3);
    assert_eq!(report.hourly.metrics["load.sum"], 7.0);
    assert_eq!(report.hourly.metrics["load.min"], 1.0);
    assert_eq!(report.hourly.metrics["load.max"], 4.0);
}

#[tokio::test]
async fn time_in_state_covers_the_whole_report() {
    let store = store();
    let screen = |t, on| {
        MetricSample::boolean("screen_on", t, on).with_aggregations(vec![
            Aggregation::State(StateAgg::TimePerHour),
            Aggregation::State(StateAgg::TimeTotals),
        ])
    };
    store.add(&screen(0, true)).await.unwrap();
    store.add(&screen(600 * SEC, false)).await.unwrap();
    store.add(&screen(1_800 * SEC, true)).await.unwrap();
    store.add(&screen(2_400 * SEC, true)).await.unwrap();

    let report = store.collect(CollectRequest::at(HOUR)).await.unwrap();
    let metrics = &report.hourly.metrics;

    let on = metrics["screen_on_1.total_secs"].as_i64().unwrap();
    let off = metrics["screen_on_0.total_secs"].as_i64().unwrap();
    assert_eq!((on + off) * SEC, HOUR);
    assert_eq!(on, 2_400);
    assert_eq!(metrics["screen_on_1.secs/hour"], 2_400);
    assert_eq!(metrics["screen_on_0.secs/hour"], 1_200);
    assert_eq!(metrics["screen_on_0.mean_time_in_state_ms"], 1_200_000);
}

#[tokio::test]
async fn export_matches_stored_series() {
    let temp_dir = TempDir::new().unwrap();
    let store = store();

    let level = |t, v| {
        MetricSample::number("level", t, v)
            .with_aggregations(vec![Aggregation::Numeric(NumericAgg::LatestValue)])
            .carry_over()
    };
    store.add(&level(10 * SEC, 1.0)).await.unwrap();
    store.collect(CollectRequest::at(HOUR).daily(false)).await.unwrap();

    // 새 리포트: 이월된 값(t=10s) + 새 값
    store.add(&level(HOUR + 5 * SEC, 2.0)).await.unwrap();
    store.add(&MetricSample::boolean("charging", HOUR + 6 * SEC, true)).await.unwrap();

    let request = CollectRequest::at(2 * HOUR)
        .daily(false)
        .with_export_dir(temp_dir.path())
        .with_derived(|input: &DerivedInput<'_>| {
            vec![DerivedAggregation::number(
                "metric_count",
                input.metrics.len() as f64,
                MetricKind::Gauge,
                input.end_time_ms,
                true,
            )]
        });
    let report = store.collect(request).await.unwrap();

    let path = report.export.expect("내보내기 파일");
    let tree: ExportTree = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();

    assert_eq!(tree.schema_version, 1);
    assert_eq!(tree.report_type, "Heartbeat");
    assert_eq!(tree.start_time, HOUR);
    assert_eq!(tree.duration_ms, HOUR);
    assert_eq!(tree.producer.id, "tally");

    let keys: Vec<&str> = tree
        .rollups
        .iter()
        .map(|r| r.metadata.string_key.as_str())
        .collect();
    assert_eq!(keys, vec!["level", "charging", "metric_count"]);

    let level = &tree.rollups[0];
    assert_eq!(level.metadata.metric_type, "gauge");
    assert_eq!(level.metadata.data_type, "double");
    let points: Vec<(i64, f64)> = level
        .data
        .iter()
        .map(|p| (p.t, p.value.as_f64().unwrap()))
        .collect();
    assert_eq!(points, vec![(HOUR, 1.0), (HOUR + 5 * SEC, 2.0)]);

    assert_eq!(tree.rollups[1].data[0].value, serde_json::json!(true));
    assert!(tree.rollups[2].metadata.internal);
    assert_eq!(report.hourly.internal_metrics["metric_count"], 1.0);
}

#[tokio::test]
async fn file_backed_store_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("metrics.db");

    {
        let store = SqliteMetricsStore::open(&path, MetricsConfig::default()).unwrap();
        store.start_session("boot", 0).await.unwrap();
        store.add(&numeric("uptime", 0, 5.0)).await.unwrap();
    }

    let store = SqliteMetricsStore::open(&path, MetricsConfig::default()).unwrap();
    assert_eq!(store.started_heartbeat().await.unwrap(), Some(0));

    let report = store
        .collect(CollectRequest::at(HOUR).force_end_all())
        .await
        .unwrap();
    assert_eq!(report.hourly.metrics["uptime.sum"], 5.0);
    assert_eq!(report.sessions[0].metrics["uptime.sum"], 5.0);
}
