//! Durable append-only log of iteration records.
//!
//! One JSON object per line, each line parseable independently. Single
//! writer (this type), many readers via the in-memory cache.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::domain::error::HistoryError;
use crate::domain::models::record::IterationRecord;

/// Owner of `history.jsonl`.
pub struct IterationHistory {
    path: PathBuf,
    records: Vec<IterationRecord>,
}

impl IterationHistory {
    /// Open (or create) the log, loading every parseable record.
    ///
    /// Lines that fail to parse are skipped with a warning; a corrupt
    /// tail never halts a resume.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut records = Vec::new();
        if path.exists() {
            let reader = BufReader::new(fs::File::open(&path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<IterationRecord>(&line) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!(
                            line = line_no + 1,
                            error = %e,
                            "Skipping unparseable history record"
                        );
                    }
                }
            }
        }
        Ok(Self { path, records })
    }

    /// Append one record durably. Retries once on IO failure, then
    /// escalates; an escalated append is fatal for the loop.
    pub fn append(&mut self, record: IterationRecord) -> Result<(), HistoryError> {
        if let Some(last) = self.records.last() {
            if record.iteration_num <= last.iteration_num {
                return Err(HistoryError::Serialize(format!(
                    "iteration {} appended after {}",
                    record.iteration_num, last.iteration_num
                )));
            }
        }
        let line = serde_json::to_string(&record)
            .map_err(|e| HistoryError::Serialize(e.to_string()))?;

        let mut last_error = String::new();
        for attempt in 0..2 {
            match self.write_line(&line) {
                Ok(()) => {
                    self.records.push(record);
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %last_error,
                        "History append failed"
                    );
                }
            }
        }
        Err(HistoryError::AppendFailed {
            attempts: 2,
            last_error,
        })
    }

    fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_data()
    }

    /// The last `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<IterationRecord> {
        let start = self.records.len().saturating_sub(n);
        self.records[start..].to_vec()
    }

    /// All records, oldest first.
    pub fn iter_all(&self) -> impl Iterator<Item = &IterationRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iteration counter to resume from: one past the highest recorded.
    pub fn next_iteration_num(&self) -> u64 {
        self.records
            .iter()
            .map(|r| r.iteration_num)
            .max()
            .map_or(0, |m| m + 1)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
