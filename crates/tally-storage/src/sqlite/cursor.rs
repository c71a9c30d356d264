//! 페이지 단위 값 스트리밍 커서.
//!
//! 시간 오름차순 `(timestamp_ms, id)` 키셋 페이지네이션으로 값을 읽는다.
//! 버퍼에 한 페이지를 더 담을 공간이 있을 때만 다음 페이지를 가져오므로
//! 메모리에 머무는 행 수는 `buffer_size`를 넘지 않는다.

use rusqlite::types::Value;
use rusqlite::Connection;
use std::collections::VecDeque;
use tally_core::config::CursorConfig;
use tally_core::error::CoreError;

use super::placeholders;
use super::values::{value_from_row, ValueRow, VALUE_COLUMNS};

/// 커서 조회 범위
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct ValueRange {
    /// 이 시각 초과 값만 (None이면 하한 없음)
    pub after_ms: Option<i64>,
    /// 이 시각 이하 값만
    pub until_ms: i64,
    /// 소속 리포트 시작 이전 값(이월된 사본) 제외
    pub owner_bound: bool,
}

pub(super) struct ValueCursor<'c> {
    conn: &'c Connection,
    metadata_ids: Vec<i64>,
    range: ValueRange,
    page_size: usize,
    buffer_size: usize,
    buffer: VecDeque<ValueRow>,
    position: Option<(i64, i64)>,
    exhausted: bool,
    fetched_pages: usize,
}

impl<'c> ValueCursor<'c> {
    pub fn new(
        conn: &'c Connection,
        metadata_ids: Vec<i64>,
        range: ValueRange,
        config: &CursorConfig,
    ) -> Self {
        let exhausted = metadata_ids.is_empty();
        Self {
            conn,
            metadata_ids,
            range,
            page_size: config.page_size.max(1),
            buffer_size: config.buffer_size.max(config.page_size.max(1)),
            buffer: VecDeque::with_capacity(config.buffer_size),
            position: None,
            exhausted,
            fetched_pages: 0,
        }
    }

    /// 지금까지 조회한 페이지 수
    pub fn fetched_pages(&self) -> usize {
        self.fetched_pages
    }

    fn has_room(&self) -> bool {
        self.buffer.len() + self.page_size <= self.buffer_size
    }

    fn fetch_page(&mut self) -> Result<(), CoreError> {
        let mut sql = format!(
            "SELECT {VALUE_COLUMNS}
             FROM metric_values v
             JOIN metric_metadata m ON m.id = v.metadata_id
             JOIN reports r ON r.id = m.report_id
             WHERE v.metadata_id IN ({}) AND v.timestamp_ms <= ?",
            placeholders(self.metadata_ids.len())
        );
        let mut params: Vec<Value> = self
            .metadata_ids
            .iter()
            .map(|id| Value::Integer(*id))
            .collect();
        params.push(Value::Integer(self.range.until_ms));

        if let Some(after) = self.range.after_ms {
            sql.push_str(" AND v.timestamp_ms > ?");
            params.push(Value::Integer(after));
        }
        if self.range.owner_bound {
            sql.push_str(" AND v.timestamp_ms >= r.start_time_ms");
        }
        if let Some((last_t, last_id)) = self.position {
            sql.push_str(" AND (v.timestamp_ms > ? OR (v.timestamp_ms = ? AND v.id > ?))");
            params.push(Value::Integer(last_t));
            params.push(Value::Integer(last_t));
            params.push(Value::Integer(last_id));
        }
        sql.push_str(" ORDER BY v.timestamp_ms ASC, v.id ASC LIMIT ?");
        params.push(Value::Integer(self.page_size as i64));

        let conn = self.conn;
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(|e| CoreError::Storage(format!("쿼리 준비 실패: {e}")))?;

        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
                let key = (row.get::<_, i64>(3)?, row.get::<_, i64>(0)?);
                Ok((key, value_from_row(row)?))
            })
            .map_err(|e| CoreError::Storage(format!("값 페이지 조회 실패: {e}")))?;

        let mut count = 0;
        for row in rows {
            let (key, value) =
                row.map_err(|e| CoreError::Storage(format!("값 행 변환 실패: {e}")))?;
            self.position = Some(key);
            count += 1;
            if let Some(value) = value {
                self.buffer.push_back(value);
            }
        }

        self.fetched_pages += 1;
        if count < self.page_size {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl Iterator for ValueCursor<'_> {
    type Item = Result<ValueRow, CoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.exhausted && (self.buffer.is_empty() || self.has_room()) {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
            if !self.has_room() {
                break;
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
