//! 상세 시계열 내보내기 writer.
//!
//! 리포트 구간의 모든 값을 rollup 단위로 파일에 흘려 쓴다. 값 전체를 메모리에
//! 올리지 않도록 JSON 골격은 직접 쓰고 각 구성 요소만 serde로 직렬화한다.
//! 완료 전까지는 `.tmp` 파일에 쓰고, `finish`에서 최종 이름으로 옮긴다.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tally_core::error::CoreError;
use tally_core::models::export::{DataPoint, Producer, RollupMetadata};
use tracing::{debug, warn};

/// 내보내기 파일 헤더
#[derive(Debug, Clone)]
pub struct ExportHeader {
    pub schema_version: u32,
    pub start_time_ms: i64,
    pub duration_ms: i64,
    pub report_type: String,
    pub producer: Producer,
}

pub struct ExportWriter {
    path: PathBuf,
    temp_path: PathBuf,
    writer: BufWriter<File>,
    start_time_ms: i64,
    rollups: usize,
    finished: bool,
}

impl ExportWriter {
    /// `dir` 아래에 무작위 이름의 내보내기 파일 생성
    pub fn create_in(dir: &Path, header: &ExportHeader) -> Result<Self, CoreError> {
        fs::create_dir_all(dir).map_err(|e| {
            CoreError::Config(format!(
                "내보내기 디렉토리 생성 실패 '{}': {e}",
                dir.display()
            ))
        })?;
        let path = dir.join(format!("{}.json", uuid::Uuid::new_v4()));
        Self::create(path, header)
    }

    pub fn create(path: impl Into<PathBuf>, header: &ExportHeader) -> Result<Self, CoreError> {
        let path = path.into();
        let temp_path = path.with_extension("json.tmp");
        let file = File::create(&temp_path)?;

        let mut writer = Self {
            path,
            temp_path,
            writer: BufWriter::new(file),
            start_time_ms: header.start_time_ms,
            rollups: 0,
            finished: false,
        };
        writer.write_header(header)?;
        Ok(writer)
    }

    fn write_header(&mut self, header: &ExportHeader) -> Result<(), CoreError> {
        write!(
            self.writer,
            "{{\"schema_version\":{},\"start_time\":{},\"duration_ms\":{},\"report_type\":",
            header.schema_version, header.start_time_ms, header.duration_ms
        )?;
        serde_json::to_writer(&mut self.writer, &header.report_type)?;
        self.writer.write_all(b",\"producer\":")?;
        serde_json::to_writer(&mut self.writer, &header.producer)?;
        self.writer.write_all(b",\"rollups\":[")?;
        Ok(())
    }

    /// rollup 하나 기록. 점이 하나도 없으면 아무것도 쓰지 않고 `false`.
    ///
    /// 리포트 시작 이전 시각(이월된 값)은 시작 시각으로 보정한다.
    pub fn write_rollup<I>(&mut self, metadata: &RollupMetadata, points: I) -> Result<bool, CoreError>
    where
        I: IntoIterator<Item = Result<DataPoint, CoreError>>,
    {
        let mut written = 0usize;
        for point in points {
            let mut point = point?;
            point.t = point.t.max(self.start_time_ms);

            if written == 0 {
                if self.rollups > 0 {
                    self.writer.write_all(b",")?;
                }
                self.writer.write_all(b"{\"metadata\":")?;
                serde_json::to_writer(&mut self.writer, metadata)?;
                self.writer.write_all(b",\"data\":[")?;
            } else {
                self.writer.write_all(b",")?;
            }
            serde_json::to_writer(&mut self.writer, &point)?;
            written += 1;
        }

        if written == 0 {
            debug!("값 없는 rollup 생략: {}", metadata.string_key);
            return Ok(false);
        }

        self.writer.write_all(b"]}")?;
        self.rollups += 1;
        Ok(true)
    }

    /// 파일을 닫고 최종 경로 반환
    pub fn finish(mut self) -> Result<PathBuf, CoreError> {
        self.writer.write_all(b"]}")?;
        self.writer.flush()?;
        fs::rename(&self.temp_path, &self.path)?;
        self.finished = true;

        debug!(
            "내보내기 완료: {} (rollup {}개)",
            self.path.display(),
            self.rollups
        );
        Ok(self.path.clone())
    }
}

impl Drop for ExportWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = fs::remove_file(&self.temp_path) {
            warn!(
                "미완료 내보내기 파일 삭제 실패 '{}': {e}",
                self.temp_path.display()
            );
        }
    }
}
