//! # tally-cli
//!
//! Tally 메트릭 엔진 바이너리 진입점.
//! 샘플 기록, 세션 시작/종료, 리포트 수집, 저장소 덤프.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;
use std::path::PathBuf;
use tally_core::config::MetricsConfig;
use tally_core::config_manager::ConfigManager;
use tally_core::models::metric::{
    Aggregation, DataKind, MetricKind, MetricSample, NumericAgg, SampleValue, StateAgg,
};
use tally_core::ports::metrics::{CollectRequest, CustomMetrics};
use tally_storage::sqlite::SqliteMetricsStore;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Tally 온디바이스 메트릭 집계 엔진
#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// SQLite 데이터베이스 경로 (기본: 플랫폼별 데이터 디렉토리)
    #[arg(long)]
    db: Option<PathBuf>,

    /// 설정 파일 경로 (없으면 기본 설정으로 생성)
    #[arg(long)]
    config: Option<PathBuf>,

    /// 로그 레벨 (trace, debug, info, warn, error)
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,

    /// 리포트에 기록할 소프트웨어 버전
    #[arg(long)]
    software_version: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 샘플 하나 기록
    Record(RecordArgs),

    /// 세션 시작/종료
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// 리포트 수집 (CustomReport를 JSON으로 출력)
    Collect(CollectArgs),

    /// 저장소 전체 덤프 (JSON)
    Dump,

    /// 설정 변경 후 현재 설정 출력 (JSON)
    Config(ConfigArgs),
}

#[derive(clap::Args, Debug, Default)]
struct ConfigArgs {
    /// Daily 롤업 활성화 여부
    #[arg(long)]
    daily: Option<bool>,

    /// 세션에 병합할 Daily 누적기 메트릭 (반복 가능, 지정 시 목록 교체)
    #[arg(long = "session-metric")]
    session_metrics: Vec<String>,

    /// 커서 페이지 크기
    #[arg(long)]
    page_size: Option<usize>,
}

impl ConfigArgs {
    fn is_empty(&self) -> bool {
        self.daily.is_none() && self.session_metrics.is_empty() && self.page_size.is_none()
    }

    fn apply(self, config: &mut MetricsConfig) {
        if let Some(daily) = self.daily {
            config.daily_heartbeat_enabled = daily;
        }
        if !self.session_metrics.is_empty() {
            config.session_daily_metrics = self.session_metrics;
        }
        if let Some(page_size) = self.page_size {
            config.cursor.page_size = page_size;
        }
    }
}

#[derive(clap::Args, Debug)]
struct RecordArgs {
    /// 메트릭 이름
    name: String,

    /// 값 (타입은 --type으로 지정)
    value: String,

    /// 값 타입
    #[arg(long = "type", value_enum, default_value_t = ValueType::Number)]
    value_type: ValueType,

    /// 메트릭 종류 (기본: 숫자는 gauge, 그 외 property)
    #[arg(long, value_enum)]
    kind: Option<KindArg>,

    /// 집계 (반복 가능, 예: --agg SUM --agg TIME_TOTALS)
    #[arg(long = "agg")]
    aggregations: Vec<String>,

    /// 세션에 기록
    #[arg(long, conflicts_with = "daily")]
    session: Option<String>,

    /// Daily 누적기에 기록
    #[arg(long)]
    daily: bool,

    /// 최신 값을 다음 리포트로 이월
    #[arg(long)]
    carry_over: bool,

    /// 내부 메트릭으로 기록
    #[arg(long)]
    internal: bool,

    /// 샘플 시각 (epoch 밀리초, 기본: 현재)
    #[arg(long)]
    at: Option<i64>,
}

#[derive(Subcommand, Debug)]
enum SessionAction {
    /// 세션 시작
    Start {
        name: String,
        /// 열린 Hourly 리포트의 최신 값으로 초기화할 메트릭 (반복 가능)
        #[arg(long = "seed")]
        seed: Vec<String>,
        #[arg(long)]
        at: Option<i64>,
    },
    /// 세션 종료
    Finish {
        name: String,
        #[arg(long)]
        at: Option<i64>,
    },
}

#[derive(clap::Args, Debug)]
struct CollectArgs {
    /// 수집 기준 시각 (epoch 밀리초, 기본: 현재)
    #[arg(long)]
    at: Option<i64>,

    /// Daily 롤업 비활성화 (설정보다 우선)
    #[arg(long)]
    no_daily: bool,

    /// Hourly 상세 내보내기 파일을 생성할 디렉토리
    #[arg(long)]
    export_dir: Option<PathBuf>,

    /// 열린 세션을 모두 종료
    #[arg(long)]
    force_end_all: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ValueType {
    Number,
    String,
    Bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum KindArg {
    Counter,
    Gauge,
    Property,
    Event,
    /// gauge로 기록
    Distribution,
    /// property로 기록
    State,
}

impl From<KindArg> for MetricKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Counter => MetricKind::Counter,
            KindArg::Gauge | KindArg::Distribution => MetricKind::Gauge,
            KindArg::Property | KindArg::State => MetricKind::Property,
            KindArg::Event => MetricKind::Event,
        }
    }
}

/// 데이터베이스 경로 결정 (CLI 인자 또는 플랫폼별 기본 경로)
///
/// # 플랫폼별 기본 경로:
/// - macOS: `~/Library/Application Support/dev.tally.tally/metrics.db`
/// - Windows: `%APPDATA%\tally\tally\data\metrics.db`
/// - Linux: `~/.local/share/tally/metrics.db`
fn resolve_db_path(db: Option<PathBuf>) -> PathBuf {
    db.or_else(|| ProjectDirs::from("dev", "tally", "tally").map(|p| p.data_dir().join("metrics.db")))
        .unwrap_or_else(|| PathBuf::from("./metrics.db"))
}

fn resolve_config_path(config: Option<PathBuf>) -> PathBuf {
    config
        .or_else(|| {
            ProjectDirs::from("dev", "tally", "tally").map(|p| p.config_dir().join("config.json"))
        })
        .unwrap_or_else(|| PathBuf::from("./tally.json"))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn parse_value(raw: &str, value_type: ValueType) -> Result<SampleValue> {
    match value_type {
        ValueType::Number => raw
            .parse::<f64>()
            .map(SampleValue::Number)
            .with_context(|| format!("숫자 값이 아닙니다: {raw}")),
        ValueType::String => Ok(SampleValue::String(raw.to_string())),
        ValueType::Bool => match raw {
            "true" | "1" => Ok(SampleValue::Bool(true)),
            "false" | "0" => Ok(SampleValue::Bool(false)),
            other => Err(anyhow!("불리언 값이 아닙니다: {other}")),
        },
    }
}

/// 집계 이름 해석. LATEST_VALUE는 숫자면 숫자 집계, 그 외는 상태 집계로 본다.
fn parse_aggregation(raw: &str, data_kind: DataKind) -> Result<Aggregation> {
    let name = serde_json::Value::String(raw.to_ascii_uppercase());

    if data_kind == DataKind::Double {
        if let Ok(numeric) = serde_json::from_value::<NumericAgg>(name.clone()) {
            return Ok(Aggregation::Numeric(numeric));
        }
    }
    if let Ok(state) = serde_json::from_value::<StateAgg>(name.clone()) {
        return Ok(Aggregation::State(state));
    }
    serde_json::from_value::<NumericAgg>(name)
        .map(Aggregation::Numeric)
        .map_err(|_| anyhow!("알 수 없는 집계: {raw}"))
}

fn build_sample(args: RecordArgs) -> Result<MetricSample> {
    let value = parse_value(&args.value, args.value_type)?;
    let data_kind = value.data_kind();
    let aggregations = args
        .aggregations
        .iter()
        .map(|raw| parse_aggregation(raw, data_kind))
        .collect::<Result<Vec<_>>>()?;

    let mut sample = MetricSample::new(args.name, args.at.unwrap_or_else(now_ms), value)
        .with_aggregations(aggregations);
    if let Some(kind) = args.kind {
        sample = sample.with_kind(kind.into());
    }
    if let Some(session) = args.session {
        sample = sample.in_session(session);
    } else if args.daily {
        sample = sample.in_daily();
    }
    if args.carry_over {
        sample = sample.carry_over();
    }
    if args.internal {
        sample = sample.internal();
    }
    Ok(sample)
}

fn collect_request(args: CollectArgs, config: &MetricsConfig) -> CollectRequest {
    let mut request = CollectRequest::at(args.at.unwrap_or_else(now_ms))
        .daily(config.daily_heartbeat_enabled && !args.no_daily)
        .with_session_daily_metrics(config.session_daily_metrics.clone());
    if let Some(dir) = args.export_dir {
        request = request.with_export_dir(dir);
    }
    if args.force_end_all {
        request = request.force_end_all();
    }
    request
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_filter = format!(
        "tally={0},tally_core={0},tally_storage={0}",
        args.log_level
    );
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_manager = ConfigManager::with_path(resolve_config_path(args.config))?;
    debug!("설정 로드: {}", config_manager.config_path().display());

    let command = match args.command {
        Command::Config(changes) => {
            let config = if changes.is_empty() {
                config_manager.get()
            } else {
                let config = config_manager.update_with(|c| changes.apply(c))?;
                info!("설정 저장: {}", config_manager.config_path().display());
                config
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
        command => command,
    };
    let config = config_manager.get();

    let db_path = resolve_db_path(args.db);
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("데이터 디렉토리 생성 실패: {}", parent.display()))?;
        }
    }

    let mut store = SqliteMetricsStore::open(&db_path, config.clone())?;
    if let Some(version) = args.software_version {
        if store.software_version_changed(&version).await? {
            info!("소프트웨어 버전 변경 감지: {version}");
        }
        store = store.with_software_version(version);
    }

    match command {
        Command::Record(record) => {
            let sample = build_sample(record)?;
            match store.add(&sample).await? {
                Some(id) => info!("샘플 기록: {} (value_id={id})", sample.event_name),
                None => info!("중복 샘플 무시: {}", sample.event_name),
            }
        }
        Command::Session { action } => match action {
            SessionAction::Start { name, seed, at } => {
                let at = at.unwrap_or_else(now_ms);
                if seed.is_empty() {
                    store.start_session(&name, at).await?;
                } else {
                    store.start_session_seeded(&name, at, &seed).await?;
                }
                info!("세션 시작: {name}");
            }
            SessionAction::Finish { name, at } => {
                store.finish_session(&name, at.unwrap_or_else(now_ms)).await?;
                info!("세션 종료: {name}");
            }
        },
        Command::Collect(collect) => {
            let report = store.collect(collect_request(collect, &config)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Dump => {
            println!("{}", serde_json::to_string_pretty(&store.dump()?)?);
        }
        Command::Config(_) => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_record_command() {
        let args = Args::try_parse_from([
            "tally", "--db", "/tmp/m.db", "record", "screen", "on", "--type", "string", "--agg",
            "time_totals", "--agg", "LATEST_VALUE", "--carry-over", "--at", "42",
        ])
        .unwrap();

        let Command::Record(record) = args.command else {
            panic!("record 명령이어야 합니다");
        };
        let sample = build_sample(record).unwrap();
        assert_eq!(sample.timestamp_ms, 42);
        assert!(sample.carry_over);
        assert_eq!(sample.metric_kind, MetricKind::Property);
        assert_eq!(
            sample.aggregations,
            vec![
                Aggregation::State(StateAgg::TimeTotals),
                Aggregation::State(StateAgg::LatestValue),
            ]
        );
    }

    #[test]
    fn latest_value_resolves_by_data_kind() {
        assert_eq!(
            parse_aggregation("LATEST_VALUE", DataKind::Double).unwrap(),
            Aggregation::Numeric(NumericAgg::LatestValue)
        );
        assert_eq!(
            parse_aggregation("LATEST_VALUE", DataKind::Boolean).unwrap(),
            Aggregation::State(StateAgg::LatestValue)
        );
        assert!(parse_aggregation("MEDIAN", DataKind::Double).is_err());
    }

    #[test]
    fn bool_and_number_values() {
        assert_eq!(parse_value("1", ValueType::Bool).unwrap(), SampleValue::Bool(true));
        assert_eq!(parse_value("2.5", ValueType::Number).unwrap(), SampleValue::Number(2.5));
        assert!(parse_value("abc", ValueType::Number).is_err());
    }

    #[test]
    fn collect_flags_override_config() {
        let args = Args::try_parse_from(["tally", "collect", "--no-daily", "--at", "7"]).unwrap();
        let Command::Collect(collect) = args.command else {
            panic!("collect 명령이어야 합니다");
        };

        let mut config = MetricsConfig::default();
        config.session_daily_metrics = vec!["battery".to_string()];
        let request = collect_request(collect, &config);

        assert_eq!(request.now_ms, 7);
        assert!(!request.daily_enabled);
        assert_eq!(request.session_daily_metrics, vec!["battery".to_string()]);
    }

    #[test]
    fn config_set_persists_changes() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let manager = ConfigManager::with_path(temp_dir.path().join("tally.json")).unwrap();

        let args = Args::try_parse_from([
            "tally", "config", "--daily", "false", "--session-metric", "battery",
            "--session-metric", "screen",
        ])
        .unwrap();
        let Command::Config(changes) = args.command else {
            panic!("config 명령이어야 합니다");
        };
        assert!(!changes.is_empty());
        manager.update_with(|c| changes.apply(c)).unwrap();

        let reloaded = ConfigManager::with_path(temp_dir.path().join("tally.json")).unwrap();
        let config = reloaded.get();
        assert!(!config.daily_heartbeat_enabled);
        assert_eq!(config.session_daily_metrics, vec!["battery", "screen"]);
        assert_eq!(config.cursor.page_size, 250);
    }

    #[test]
    fn distribution_is_recorded_as_gauge() {
        assert_eq!(MetricKind::from(KindArg::Distribution), MetricKind::Gauge);
        assert_eq!(MetricKind::from(KindArg::State), MetricKind::Property);
    }

    #[test]
    fn session_seed_arguments() {
        let args = Args::try_parse_from([
            "tally", "session", "start", "nav", "--seed", "screen", "--seed", "battery",
        ])
        .unwrap();
        let Command::Session {
            action: SessionAction::Start { name, seed, at },
        } = args.command
        else {
            panic!("session start 명령이어야 합니다");
        };
        assert_eq!(name, "nav");
        assert_eq!(seed, vec!["screen", "battery"]);
        assert!(at.is_none());
    }
}
