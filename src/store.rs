//! The process-file store: run-directory discovery, atomic `state.json`
//! persistence, and append-only line-delimited output files.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::state::{HttpCallRecord, OutputRecord, ProcessState};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("data directory does not exist: {0}")]
    DataDirMissing(PathBuf),
    #[error("run directory not found: {0}")]
    RunDirMissing(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse state document {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Directory layout on disk:
///
/// ```text
/// <data-dir>/
///   <YYYY-MM-DD-HH-MM-SS>/
///     state.json
///     output-<YYYY-MM-DD-HH-MM-SS>.json
/// ```
pub struct ProcessFileStore {
    data_dir: PathBuf,
}

impl ProcessFileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn run_dir_path(&self, dir_name: &str) -> PathBuf {
        self.data_dir.join(dir_name)
    }

    pub fn state_path(&self, dir_name: &str) -> PathBuf {
        self.run_dir_path(dir_name).join("state.json")
    }

    pub fn output_path(&self, dir_name: &str, timestamp: &str) -> PathBuf {
        self.run_dir_path(dir_name)
            .join(format!("output-{timestamp}.json"))
    }

    pub fn http_calls_path(&self, dir_name: &str, timestamp: &str) -> PathBuf {
        self.run_dir_path(dir_name)
            .join(format!("http-calls-{timestamp}.json"))
    }

    /// The lexicographically-greatest run directory name, or `None` if no
    /// run has ever started. Fails if the data directory itself is absent
    /// (distinguishing "never run" from "misconfigured path").
    pub fn latest_run_dir(&self) -> Result<Option<String>, StoreError> {
        if !self.data_dir.exists() {
            return Err(StoreError::DataDirMissing(self.data_dir.clone()));
        }
        let mut names: Vec<String> = fs::read_dir(&self.data_dir)
            .map_err(|source| StoreError::Read {
                path: self.data_dir.clone(),
                source,
            })?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names.into_iter().next_back())
    }

    /// Creates a fresh run directory. Idempotent if the directory already
    /// exists (e.g. retried with the same timestamp within the same second).
    pub fn create_run_dir(&self, timestamp: &str) -> Result<(), StoreError> {
        let path = self.run_dir_path(timestamp);
        fs::create_dir_all(&path).map_err(|source| StoreError::Write { path, source })
    }

    pub fn read_state(&self, dir_name: &str) -> Result<ProcessState, StoreError> {
        let path = self.state_path(dir_name);
        let bytes = fs::read(&path).map_err(|source| StoreError::Read {
            path: path.clone(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse { path, source })
    }

    /// Crash-safe write: serialize, write to a sibling temp file in the same
    /// directory, then rename over `state.json` (atomic on POSIX filesystems).
    pub fn write_state(&self, dir_name: &str, state: &ProcessState) -> Result<(), StoreError> {
        let path = self.state_path(dir_name);
        let dir = path.parent().expect("state path always has a parent");
        let bytes =
            serde_json::to_vec_pretty(state).expect("ProcessState always serializes");

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;
        tmp.write_all(&bytes).map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;
        tmp.flush().map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;
        tmp.persist(&path)
            .map_err(|e| StoreError::Write {
                path: path.clone(),
                source: e.error,
            })?;
        Ok(())
    }

    /// Appends line-delimited JSON records to the invocation's output file,
    /// creating it if absent. A call with an empty slice still creates the
    /// file, recording that an invocation happened even if it produced no
    /// output.
    pub fn append_output(
        &self,
        dir_name: &str,
        timestamp: &str,
        records: &[OutputRecord],
    ) -> Result<(), StoreError> {
        let path = self.output_path(dir_name, timestamp);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;
        for record in records {
            let line = serde_json::to_string(record).expect("OutputRecord always serializes");
            writeln!(file, "{line}").map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Appends line-delimited JSON `--record-http-calls` entries, creating
    /// the file if absent. Callers only invoke this when the flag is set;
    /// unlike `append_output` there is no "ran but recorded nothing" case
    /// worth preserving, so an empty slice is a no-op.
    pub fn append_http_calls(
        &self,
        dir_name: &str,
        timestamp: &str,
        calls: &[HttpCallRecord],
    ) -> Result<(), StoreError> {
        if calls.is_empty() {
            return Ok(());
        }
        let path = self.http_calls_path(dir_name, timestamp);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;
        for call in calls {
            let line = serde_json::to_string(call).expect("HttpCallRecord always serializes");
            writeln!(file, "{line}").map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
