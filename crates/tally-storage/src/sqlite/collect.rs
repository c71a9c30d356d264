//! 적재/세션/리포트 생성 파이프라인 (`CustomMetrics` 포트 구현).
//!
//! `collect`는 한 트랜잭션 안에서 네 단계를 실행한다.
//! 1. Hourly: 열린 Hourly 종료 → 집계 → 파생 훅 → (내보내기) → carry-over 이월
//! 2. Daily: 종료된 Hourly 묶음이 하루 이상이면 병합 집계 후 삭제
//! 3. Sessions: 오래된 세션 만료 → 종료된 세션 집계 후 삭제
//! 4. Retention: 누적기 오래된 값, 고아 메타데이터/리포트 삭제

use async_trait::async_trait;
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tally_core::aggregation::Window;
use tally_core::error::CoreError;
use tally_core::models::derived::{merge_derived, DerivedAggregation, DerivedInput};
use tally_core::models::export::{DataPoint, Producer, RollupMetadata};
use tally_core::models::metric::{validate_session_name, MetricSample, ReportKind};
use tally_core::models::report::{CustomReport, MetricReport};
use tally_core::ports::metrics::{CollectRequest, CustomMetrics};
use tracing::{debug, info, warn};

use super::aggregate::{build_report, MetricGroup};
use super::cursor::{ValueCursor, ValueRange};
use super::metadata::{self, MetadataSpec};
use super::{reports, values, SqliteMetricsStore};
use crate::export::{ExportHeader, ExportWriter};

#[async_trait]
impl CustomMetrics for SqliteMetricsStore {
    async fn add(&self, sample: &MetricSample) -> Result<Option<i64>, CoreError> {
        sample.validate()?;
        let spec = MetadataSpec::from(sample);

        self.with_transaction(|tx| {
            let report_id = reports::start_or_get_open(
                tx,
                sample.report_kind,
                sample.session_name.as_deref(),
                sample.timestamp_ms,
                self.software_version.as_deref(),
            )?;
            let metadata_id = metadata::upsert(tx, report_id, &spec)?;
            let value_id = values::insert(
                tx,
                metadata_id,
                sample.version,
                sample.timestamp_ms,
                &sample.value,
            )?;

            if sample.report_kind == ReportKind::Hourly {
                for session_id in reports::sessions_containing(tx, sample.timestamp_ms)? {
                    let session_metadata = metadata::upsert(tx, session_id, &spec)?;
                    values::insert(
                        tx,
                        session_metadata,
                        sample.version,
                        sample.timestamp_ms,
                        &sample.value,
                    )?;
                }
            }

            Ok(value_id)
        })
    }

    async fn start_session(&self, name: &str, timestamp_ms: i64) -> Result<(), CoreError> {
        validate_session_name(name)?;

        self.with_transaction(|tx| {
            reports::start_or_get_open(
                tx,
                ReportKind::Session,
                Some(name),
                timestamp_ms,
                self.software_version.as_deref(),
            )?;
            Ok(())
        })
    }

    async fn start_session_seeded(
        &self,
        name: &str,
        timestamp_ms: i64,
        latest_metric_keys: &[String],
    ) -> Result<(), CoreError> {
        validate_session_name(name)?;

        self.with_transaction(|tx| {
            if reports::find_open(tx, ReportKind::Session, Some(name))?.is_some() {
                debug!("세션 {name} 이미 열려 있음, 초기값 생략");
                return Ok(());
            }
            let session_id = reports::start_or_get_open(
                tx,
                ReportKind::Session,
                Some(name),
                timestamp_ms,
                self.software_version.as_deref(),
            )?;

            let Some(hourly) = reports::find_open(tx, ReportKind::Hourly, None)? else {
                debug!("열린 Hourly 없음, 세션 {name} 초기값 생략");
                return Ok(());
            };

            let mut seeded = 0;
            for key in latest_metric_keys {
                let Some(row) = metadata::find(tx, hourly.id, key)? else {
                    debug!("세션 초기값 메트릭 없음: {key}");
                    continue;
                };
                let Some(latest) = values::latest(tx, &[row.id], None, timestamp_ms)? else {
                    continue;
                };

                // 세션 시작 시각의 현재 상태로 기록
                let session_metadata = metadata::upsert(tx, session_id, &row.spec)?;
                if values::insert(
                    tx,
                    session_metadata,
                    latest.version,
                    timestamp_ms,
                    &latest.value,
                )?
                .is_some()
                {
                    seeded += 1;
                }
            }

            debug!("세션 {name} 시작: 초기값 {seeded}개");
            Ok(())
        })
    }

    async fn finish_session(&self, name: &str, timestamp_ms: i64) -> Result<(), CoreError> {
        validate_session_name(name)?;

        self.with_transaction(|tx| {
            reports::finish(tx, ReportKind::Session, Some(name), timestamp_ms)?;
            Ok(())
        })
    }

    async fn started_heartbeat(&self) -> Result<Option<i64>, CoreError> {
        self.with_transaction(|tx| {
            Ok(reports::find_open(tx, ReportKind::Hourly, None)?.map(|r| r.start_time_ms))
        })
    }

    async fn software_version_changed(&self, current_version: &str) -> Result<bool, CoreError> {
        self.with_transaction(|tx| {
            let changed = reports::find_open(tx, ReportKind::Hourly, None)?
                .and_then(|r| r.software_version)
                .is_some_and(|version| version != current_version);
            Ok(changed)
        })
    }

    async fn collect(&self, request: CollectRequest) -> Result<CustomReport, CoreError> {
        info!("리포트 수집 시작: now={}", request.now_ms);

        let mut written: Option<PathBuf> = None;
        let result = self.with_transaction(|tx| {
            let (hourly, export) = self.collect_hourly(tx, &request)?;
            written = export.clone();
            let daily = self.collect_daily(tx, &request)?;
            let sessions = self.collect_sessions(tx, &request)?;
            self.apply_retention(tx, request.now_ms)?;

            info!(
                "리포트 수집 완료: hourly 메트릭 {}개, daily={}, 세션 {}개",
                hourly.metrics.len() + hourly.internal_metrics.len(),
                daily.is_some(),
                sessions.len()
            );

            Ok(CustomReport {
                hourly,
                daily,
                sessions,
                export,
            })
        });

        // 롤백된 수집의 내보내기 파일은 남기지 않는다
        if let (Err(e), Some(path)) = (&result, &written) {
            warn!("리포트 수집 실패, 내보내기 파일 삭제: {e}");
            if let Err(e) = std::fs::remove_file(path) {
                warn!("내보내기 파일 삭제 실패 '{}': {e}", path.display());
            }
        }
        result
    }
}

// ============================================================
// 파이프라인 단계
// ============================================================

impl SqliteMetricsStore {
    /// 열린 Hourly 리포트 종료/집계. 종료된 리포트는 Daily 단계에서 정리한다.
    fn collect_hourly(
        &self,
        conn: &Connection,
        request: &CollectRequest,
    ) -> Result<(MetricReport, Option<PathBuf>), CoreError> {
        let now = request.now_ms;

        let Some(open) = reports::find_open(conn, ReportKind::Hourly, None)? else {
            debug!("열린 Hourly 리포트 없음, 빈 리포트 반환");
            return Ok((
                MetricReport::empty(ReportKind::Hourly, now, self.software_version.clone()),
                None,
            ));
        };

        reports::set_end(conn, open.id, now)?;
        let window = Window::new(open.start_time_ms, now);
        let groups: Vec<MetricGroup> = metadata::for_report(conn, open.id)?
            .iter()
            .map(MetricGroup::from)
            .collect();

        let mut report = build_report(
            conn,
            &self.config.cursor,
            ReportKind::Hourly,
            None,
            window,
            &groups,
            open.software_version.clone(),
        )?;
        let derived = apply_derived(request, &mut report);

        let export = match &request.export_dir {
            Some(dir) => Some(self.write_export(conn, dir, &report, &groups, &derived)?),
            None => None,
        };

        let carried = self.carry_over(conn, open.id, now)?;
        info!(
            "Hourly 리포트 종료: [{}, {now}], 메트릭 {}개, 이월 {carried}개",
            open.start_time_ms,
            groups.len()
        );

        Ok((report, export))
    }

    /// carry-over 메트릭의 최신 값을 `now`에 시작하는 새 Hourly로 이월
    fn carry_over(&self, conn: &Connection, report_id: i64, now: i64) -> Result<usize, CoreError> {
        let max_age = self.config.retention.carry_over_max_age_ms;
        let mut successor = None;
        let mut carried = 0;

        for row in metadata::carry_over_for_report(conn, report_id)? {
            let Some(latest) = values::latest(conn, &[row.id], None, now)? else {
                continue;
            };
            if now - latest.timestamp_ms > max_age {
                debug!(
                    "이월 기한 초과: {} (t={})",
                    row.spec.event_name, latest.timestamp_ms
                );
                continue;
            }

            let successor_id = match successor {
                Some(id) => id,
                None => {
                    let id = reports::start_or_get_open(
                        conn,
                        ReportKind::Hourly,
                        None,
                        now,
                        self.software_version.as_deref(),
                    )?;
                    successor = Some(id);
                    id
                }
            };

            let metadata_id = metadata::upsert(conn, successor_id, &row.spec)?;
            // 원래 시각 유지
            values::insert(
                conn,
                metadata_id,
                latest.version,
                latest.timestamp_ms,
                &latest.value,
            )?;
            carried += 1;
        }

        Ok(carried)
    }

    /// 종료된 Hourly 리포트를 Daily로 병합 (비활성화 시 즉시 삭제)
    fn collect_daily(
        &self,
        conn: &Connection,
        request: &CollectRequest,
    ) -> Result<Option<MetricReport>, CoreError> {
        let ended = reports::ended(conn, ReportKind::Hourly)?;
        if ended.is_empty() {
            return Ok(None);
        }

        if !request.daily_enabled {
            for report in &ended {
                reports::delete_cascade(conn, report.id)?;
            }
            debug!("Daily 비활성화: 종료된 Hourly {}개 삭제", ended.len());
            return Ok(None);
        }

        let start = ended.iter().map(|r| r.start_time_ms).min().unwrap_or(request.now_ms);
        let end = ended
            .iter()
            .filter_map(|r| r.end_time_ms)
            .max()
            .unwrap_or(start);

        if end - start < self.config.retention.daily_span_ms {
            debug!(
                "Daily 대기: Hourly {}개, 구간 {}ms",
                ended.len(),
                end - start
            );
            return Ok(None);
        }

        let groups = merge_metadata(conn, ended.iter().map(|r| r.id))?;
        let software_version = ended.last().and_then(|r| r.software_version.clone());
        let mut report = build_report(
            conn,
            &self.config.cursor,
            ReportKind::Daily,
            None,
            Window::new(start, end),
            &groups,
            software_version,
        )?;
        apply_derived(request, &mut report);

        for hourly in &ended {
            reports::delete_cascade(conn, hourly.id)?;
        }

        info!(
            "Daily 리포트 생성: [{start}, {end}], Hourly {}개 병합, 메트릭 {}개",
            ended.len(),
            groups.len()
        );
        Ok(Some(report))
    }

    /// 종료된 세션 집계 후 삭제
    fn collect_sessions(
        &self,
        conn: &Connection,
        request: &CollectRequest,
    ) -> Result<Vec<MetricReport>, CoreError> {
        let now = request.now_ms;

        if request.force_end_all_reports {
            reports::finish_all_sessions(conn, now)?;
        }
        reports::expire_stale_sessions(conn, now, self.config.retention.session_expiry_ms)?;

        let accumulator = if request.session_daily_metrics.is_empty() {
            None
        } else {
            reports::find_open(conn, ReportKind::Daily, None)?
        };

        let mut produced = Vec::new();
        for session in reports::ended(conn, ReportKind::Session)? {
            let end = session.end_time_ms.unwrap_or(now);
            let mut groups: Vec<MetricGroup> = metadata::for_report(conn, session.id)?
                .iter()
                .map(MetricGroup::from)
                .collect();

            if let Some(accumulator) = &accumulator {
                for name in &request.session_daily_metrics {
                    if groups.iter().any(|g| &g.spec.event_name == name) {
                        continue;
                    }
                    if let Some(row) = metadata::find(conn, accumulator.id, name)? {
                        groups.push(MetricGroup::from(&row));
                    }
                }
            }

            let mut report = build_report(
                conn,
                &self.config.cursor,
                ReportKind::Session,
                session.name.clone(),
                Window::new(session.start_time_ms, end),
                &groups,
                session.software_version.clone(),
            )?;
            apply_derived(request, &mut report);

            reports::delete_cascade(conn, session.id)?;
            debug!(
                "세션 리포트 생성: {:?} [{}, {end}]",
                session.name, session.start_time_ms
            );
            produced.push(report);
        }

        Ok(produced)
    }

    fn apply_retention(&self, conn: &Connection, now: i64) -> Result<(), CoreError> {
        let retention = &self.config.retention;

        let old_values = match reports::find_open(conn, ReportKind::Daily, None)? {
            Some(accumulator) => values::delete_for_report_until(
                conn,
                accumulator.id,
                now - retention.accumulator_retention_ms,
            )?,
            None => 0,
        };
        let orphaned_metadata = metadata::delete_orphaned(conn)?;
        let orphaned_reports =
            reports::delete_orphaned(conn, now - retention.orphan_report_expiry_ms)?;

        info!(
            "보존 정책 적용: 누적기 값 {old_values}개, 메타데이터 {orphaned_metadata}개, 리포트 {orphaned_reports}개 삭제"
        );
        Ok(())
    }

    /// Hourly 리포트의 전체 시계열 내보내기
    fn write_export(
        &self,
        conn: &Connection,
        dir: &Path,
        report: &MetricReport,
        groups: &[MetricGroup],
        derived: &[DerivedAggregation],
    ) -> Result<PathBuf, CoreError> {
        let export = &self.config.export;
        let header = ExportHeader {
            schema_version: export.schema_version,
            start_time_ms: report.start_time_ms,
            duration_ms: report.duration_ms(),
            report_type: report.kind.as_str().to_string(),
            producer: Producer {
                version: export.producer_version.clone(),
                id: export.producer_id.clone(),
            },
        };
        let mut writer = ExportWriter::create_in(dir, &header)?;

        for group in groups {
            let range = ValueRange {
                after_ms: None,
                until_ms: report.end_time_ms,
                owner_bound: false,
            };
            let points = ValueCursor::new(conn, group.metadata_ids.clone(), range, &self.config.cursor)
                .map(|row| {
                    row.map(|value| DataPoint {
                        t: value.timestamp_ms,
                        value: value.value.to_export_json(),
                    })
                });
            writer.write_rollup(&rollup_metadata(&group.spec), points)?;
        }

        for aggregation in derived {
            let metadata = RollupMetadata {
                string_key: aggregation.event_name.clone(),
                metric_type: aggregation.metric_kind.as_str().to_string(),
                data_type: aggregation.data_kind.as_str().to_string(),
                internal: aggregation.internal,
            };
            let point = DataPoint {
                t: aggregation.timestamp_ms,
                value: aggregation.value.to_export_json(),
            };
            writer.write_rollup(&metadata, [Ok(point)])?;
        }

        writer.finish()
    }
}

fn rollup_metadata(spec: &MetadataSpec) -> RollupMetadata {
    RollupMetadata {
        string_key: spec.event_name.clone(),
        metric_type: spec.metric_kind.as_str().to_string(),
        data_type: spec.data_kind.as_str().to_string(),
        internal: spec.internal,
    }
}

/// 파생 훅 실행 후 결과를 리포트 맵에 병합
fn apply_derived(request: &CollectRequest, report: &mut MetricReport) -> Vec<DerivedAggregation> {
    let Some(hook) = &request.derived else {
        return Vec::new();
    };

    let derived = hook(&DerivedInput {
        kind: report.kind,
        start_time_ms: report.start_time_ms,
        end_time_ms: report.end_time_ms,
        metrics: &report.metrics,
        internal_metrics: &report.internal_metrics,
    });
    merge_derived(&derived, &mut report.metrics, &mut report.internal_metrics);
    derived
}

/// 여러 리포트의 메타데이터를 이름별로 병합 (시작 시각 오름차순 입력)
///
/// metric/data 종류가 엇갈리는 메트릭은 건너뛰고, 그 외에는 마지막 메타데이터가 이긴다.
fn merge_metadata(
    conn: &Connection,
    report_ids: impl Iterator<Item = i64>,
) -> Result<Vec<MetricGroup>, CoreError> {
    let mut groups: BTreeMap<String, MetricGroup> = BTreeMap::new();
    let mut conflicts: BTreeSet<String> = BTreeSet::new();

    for report_id in report_ids {
        for row in metadata::for_report(conn, report_id)? {
            let name = &row.spec.event_name;
            if conflicts.contains(name) {
                continue;
            }

            let conflicting = groups.get(name).is_some_and(|group| {
                group.spec.metric_kind != row.spec.metric_kind
                    || group.spec.data_kind != row.spec.data_kind
            });
            if conflicting {
                warn!("메타데이터 종류 충돌, 메트릭 제외: {name}");
                groups.remove(name);
                conflicts.insert(name.clone());
                continue;
            }

            match groups.get_mut(name) {
                Some(group) => {
                    group.spec = row.spec.clone();
                    group.metadata_ids.push(row.id);
                }
                None => {
                    groups.insert(name.clone(), MetricGroup::from(&row));
                }
            }
        }
    }

    Ok(groups.into_values().collect())
}
