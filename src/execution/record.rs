//! Run Record Persistence
//!
//! Keeps the final [`RunResult`] of each run for later inspection.
//!
//! Records are saved to `{dir}/{run_id}.json` as pretty-printed JSON. Run
//! identifiers are percent-encoded into file stems, so every id maps to its
//! own file inside the record directory and can be recovered from it.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use super::result::RunResult;
use crate::error::RecordError;

/// Bytes escaped in record file stems. `.` is escaped so no stem is hidden
/// or walks out of the directory.
const STEM_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// Default directory for run records, relative to the working directory.
pub const DEFAULT_RECORD_DIR: &str = ".maprunner/runs";

/// Directory-backed store of run records.
#[derive(Debug, Clone)]
pub struct RunRecordStore {
    dir: PathBuf,
}

impl RunRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Saves a record, replacing any earlier record with the same run id.
    pub fn save(&self, result: &RunResult) -> Result<PathBuf, RecordError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_error(&self.dir, e))?;

        let record_file = self.record_path(&result.run_id)?;
        let json = serde_json::to_string_pretty(result)?;
        fs::write(&record_file, json).map_err(|e| io_error(&record_file, e))?;

        info!("Saved run record to {}", record_file.display());
        Ok(record_file)
    }

    /// Loads the record of `run_id`.
    pub fn load(&self, run_id: &str) -> Result<RunResult, RecordError> {
        let record_file = self.record_path(run_id)?;
        let content = fs::read_to_string(&record_file).map_err(|e| io_error(&record_file, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Run ids with a stored record, sorted.
    ///
    /// A missing directory means no records.
    pub fn list(&self) -> Result<Vec<String>, RecordError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| io_error(&self.dir, e))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match run_id_for(stem) {
                Some(run_id) => ids.push(run_id),
                None => debug!("Skipping unrecognized record file {}", path.display()),
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Deletes the record of `run_id`. Returns whether one existed.
    pub fn delete(&self, run_id: &str) -> Result<bool, RecordError> {
        let record_file = self.record_path(run_id)?;
        if !record_file.exists() {
            return Ok(false);
        }

        fs::remove_file(&record_file).map_err(|e| io_error(&record_file, e))?;
        info!("Deleted run record: {}", record_file.display());
        Ok(true)
    }

    fn record_path(&self, run_id: &str) -> Result<PathBuf, RecordError> {
        if run_id.is_empty() {
            return Err(RecordError::EmptyRunId);
        }
        Ok(self.dir.join(format!("{}.json", file_stem_for(run_id))))
    }
}

impl Default for RunRecordStore {
    fn default() -> Self {
        Self::new(DEFAULT_RECORD_DIR)
    }
}

/// Maps a run id onto a file stem.
fn file_stem_for(run_id: &str) -> String {
    utf8_percent_encode(run_id, STEM_ENCODE_SET).to_string()
}

/// Recovers the run id from a stem written by [`file_stem_for`].
fn run_id_for(stem: &str) -> Option<String> {
    let run_id = percent_decode_str(stem).decode_utf8().ok()?.into_owned();
    (!run_id.is_empty() && file_stem_for(&run_id) == stem).then_some(run_id)
}

fn io_error(path: &Path, source: std::io::Error) -> RecordError {
    RecordError::Io {
        path: path.display().to_string(),
        source,
    }
}
