//! Manifest-driven market-data gateway backed by per-key CSV matrices.
//!
//! Layout: `<data_dir>/<key>.csv`, header `date,SYM,...`, one row per
//! trading date. The manifest fixes the permitted key set at startup;
//! everything is loaded once and shared read-only with the engine and
//! every sandbox worker.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::NaiveDate;

use crate::domain::error::DataError;
use crate::domain::models::frame::Frame;
use crate::domain::ports::data_accessor::{
    DataAccessor, FieldManifest, FieldValidation,
};

/// File-backed accessor; immutable after load.
#[derive(Debug)]
pub struct CsvDataAccessor {
    manifest: FieldManifest,
    frames: HashMap<String, Frame>,
}

impl CsvDataAccessor {
    /// Load the manifest and every key's matrix file that exists.
    ///
    /// Missing files for permitted keys are tolerated at load time
    /// (forbidden keys often ship no data at all) and surface as IO
    /// errors on access.
    pub fn load(
        manifest_path: impl AsRef<Path>,
        data_dir: impl AsRef<Path>,
    ) -> Result<Self, DataError> {
        let raw = fs::read_to_string(manifest_path.as_ref())
            .map_err(|e| DataError::Io(format!("manifest: {e}")))?;
        let manifest: FieldManifest =
            serde_yaml::from_str(&raw).map_err(|e| DataError::Io(format!("manifest: {e}")))?;

        let mut frames = HashMap::new();
        for key in manifest.fields.keys() {
            let path = data_dir.as_ref().join(format!("{key}.csv"));
            if !path.exists() {
                continue;
            }
            let frame = parse_matrix_csv(key, &path)?;
            frames.insert(key.clone(), frame);
        }
        tracing::info!(
            keys = frames.len(),
            manifest = manifest.fields.len(),
            "Market data loaded"
        );
        Ok(Self { manifest, frames })
    }

    /// Build directly from preloaded frames (tests, fixtures).
    pub fn from_frames(manifest: FieldManifest, frames: HashMap<String, Frame>) -> Self {
        Self { manifest, frames }
    }
}

impl DataAccessor for CsvDataAccessor {
    fn get(&self, key: &str) -> Result<Frame, DataError> {
        if !self.manifest.contains(key) {
            return Err(DataError::UnknownField {
                field: key.to_string(),
                suggestion: self.manifest.suggest(key),
            });
        }
        self.frames
            .get(key)
            .cloned()
            .ok_or_else(|| DataError::Io(format!("no matrix loaded for '{key}'")))
    }

    fn validate_field(&self, key: &str) -> Result<FieldValidation, DataError> {
        if self.manifest.contains(key) {
            Ok(FieldValidation::Ok)
        } else if let Some(suggestion) = self.manifest.suggest(key) {
            Ok(FieldValidation::SuggestAlternative(suggestion))
        } else {
            Err(DataError::UnknownField {
                field: key.to_string(),
                suggestion: None,
            })
        }
    }

    fn manifest(&self) -> &FieldManifest {
        &self.manifest
    }
}

fn parse_matrix_csv(key: &str, path: &Path) -> Result<Frame, DataError> {
    let raw = fs::read_to_string(path).map_err(|e| DataError::Io(e.to_string()))?;
    let mut lines = raw.lines();
    let header = lines.next().ok_or_else(|| DataError::MalformedMatrix {
        field: key.to_string(),
        reason: "empty file".to_string(),
    })?;
    let symbols: Vec<String> = header
        .split(',')
        .skip(1)
        .map(|s| s.trim().to_string())
        .collect();
    if symbols.is_empty() {
        return Err(DataError::MalformedMatrix {
            field: key.to_string(),
            reason: "header has no symbols".to_string(),
        });
    }

    let mut dates = Vec::new();
    let mut rows = Vec::new();
    for (line_no, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut cells = line.split(',');
        let date_cell = cells.next().unwrap_or_default().trim();
        let date = NaiveDate::parse_from_str(date_cell, "%Y-%m-%d").map_err(|e| {
            DataError::MalformedMatrix {
                field: key.to_string(),
                reason: format!("line {}: bad date '{date_cell}': {e}", line_no + 2),
            }
        })?;
        let values: Vec<f64> = cells
            .map(|c| {
                let c = c.trim();
                if c.is_empty() {
                    Ok(f64::NAN)
                } else {
                    c.parse::<f64>().map_err(|e| DataError::MalformedMatrix {
                        field: key.to_string(),
                        reason: format!("line {}: bad value '{c}': {e}", line_no + 2),
                    })
                }
            })
            .collect::<Result<_, _>>()?;
        if values.len() != symbols.len() {
            return Err(DataError::MalformedMatrix {
                field: key.to_string(),
                reason: format!(
                    "line {}: {} values for {} symbols",
                    line_no + 2,
                    values.len(),
                    symbols.len()
                ),
            });
        }
        dates.push(date);
        rows.push(values);
    }

    Frame::from_rows(dates, symbols, rows).map_err(|e| DataError::MalformedMatrix {
        field: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_fixture(dir: &Path) {
        fs::write(
            dir.join("manifest.yaml"),
            "fields:\n  close_adj: adjusted_price\n  close_raw: raw_price\n  turnover: liquidity\n",
        )
        .unwrap();
        let data_dir = dir.join("data");
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(
            data_dir.join("close_adj.csv"),
            "date,2330,2317\n2023-01-02,450.0,100.5\n2023-01-03,455.0,99.0\n",
        )
        .unwrap();
        fs::write(
            data_dir.join("turnover.csv"),
            "date,2330,2317\n2023-01-02,9.1e9,2.2e9\n2023-01-03,8.7e9,2.1e9\n",
        )
        .unwrap();
    }

    #[test]
    fn test_load_and_get() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let accessor =
            CsvDataAccessor::load(dir.path().join("manifest.yaml"), dir.path().join("data"))
                .unwrap();
        let close = accessor.get("close_adj").unwrap();
        assert_eq!(close.n_dates(), 2);
        assert_eq!(close.symbols(), ["2330".to_string(), "2317".to_string()]);
        assert!((close.get(1, 0) - 455.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unknown_key_suggests() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let accessor =
            CsvDataAccessor::load(dir.path().join("manifest.yaml"), dir.path().join("data"))
                .unwrap();
        match accessor.validate_field("close_ad").unwrap() {
            FieldValidation::SuggestAlternative(s) => assert_eq!(s, "close_adj"),
            FieldValidation::Ok => panic!("expected a suggestion"),
        }
    }

    #[test]
    fn test_permitted_key_without_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let accessor =
            CsvDataAccessor::load(dir.path().join("manifest.yaml"), dir.path().join("data"))
                .unwrap();
        assert!(matches!(
            accessor.get("close_raw"),
            Err(DataError::Io(_))
        ));
    }

    #[test]
    fn test_ragged_row_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        fs::write(
            dir.path().join("data").join("close_adj.csv"),
            "date,2330,2317\n2023-01-02,450.0\n",
        )
        .unwrap();
        let err =
            CsvDataAccessor::load(dir.path().join("manifest.yaml"), dir.path().join("data"))
                .unwrap_err();
        assert!(matches!(err, DataError::MalformedMatrix { .. }));
    }
}
