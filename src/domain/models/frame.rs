//! Labeled (date × symbol) matrix, the currency of every factor function.
//!
//! Rows are trading dates, columns are instrument symbols, cells are f64.
//! Warmup cells produced by rolling operations are NaN; downstream
//! consumers treat NaN as "no signal".

use chrono::NaiveDate;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::domain::error::FrameError;

/// A value matrix aligned on date and symbol axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    dates: Vec<NaiveDate>,
    symbols: Vec<String>,
    #[serde(with = "matrix_serde")]
    values: DMatrix<f64>,
}

impl Frame {
    /// Build a frame from axes and a row-major value buffer.
    pub fn from_rows(
        dates: Vec<NaiveDate>,
        symbols: Vec<String>,
        rows: Vec<Vec<f64>>,
    ) -> Result<Self, FrameError> {
        if dates.is_empty() {
            return Err(FrameError::Empty("dates"));
        }
        if symbols.is_empty() {
            return Err(FrameError::Empty("symbols"));
        }
        if rows.len() != dates.len() || rows.iter().any(|r| r.len() != symbols.len()) {
            return Err(FrameError::ShapeMismatch {
                rows: dates.len(),
                cols: symbols.len(),
                got_rows: rows.len(),
                got_cols: rows.first().map_or(0, Vec::len),
            });
        }
        let values =
            DMatrix::from_fn(dates.len(), symbols.len(), |r, c| rows[r][c]);
        Ok(Self {
            dates,
            symbols,
            values,
        })
    }

    /// Build a frame around an existing matrix.
    pub fn new(
        dates: Vec<NaiveDate>,
        symbols: Vec<String>,
        values: DMatrix<f64>,
    ) -> Result<Self, FrameError> {
        if dates.is_empty() {
            return Err(FrameError::Empty("dates"));
        }
        if symbols.is_empty() {
            return Err(FrameError::Empty("symbols"));
        }
        if values.nrows() != dates.len() || values.ncols() != symbols.len() {
            return Err(FrameError::ShapeMismatch {
                rows: dates.len(),
                cols: symbols.len(),
                got_rows: values.nrows(),
                got_cols: values.ncols(),
            });
        }
        Ok(Self {
            dates,
            symbols,
            values,
        })
    }

    pub fn n_dates(&self) -> usize {
        self.dates.len()
    }

    pub fn n_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[(row, col)]
    }

    /// Whether `other` shares this frame's axes exactly.
    pub fn same_axes(&self, other: &Self) -> bool {
        self.dates == other.dates && self.symbols == other.symbols
    }

    fn check_axes(&self, other: &Self, op: &str) -> Result<(), FrameError> {
        if self.same_axes(other) {
            Ok(())
        } else {
            Err(FrameError::AxisMismatch { op: op.to_string() })
        }
    }

    /// Apply `f` to every cell.
    pub fn map<F: Fn(f64) -> f64>(&self, f: F) -> Self {
        Self {
            dates: self.dates.clone(),
            symbols: self.symbols.clone(),
            values: self.values.map(f),
        }
    }

    /// Cellwise combination of two axis-aligned frames.
    pub fn zip_with<F: Fn(f64, f64) -> f64>(
        &self,
        other: &Self,
        op: &str,
        f: F,
    ) -> Result<Self, FrameError> {
        self.check_axes(other, op)?;
        let values = DMatrix::from_fn(self.n_dates(), self.n_symbols(), |r, c| {
            f(self.values[(r, c)], other.values[(r, c)])
        });
        Ok(Self {
            dates: self.dates.clone(),
            symbols: self.symbols.clone(),
            values,
        })
    }

    /// Cellwise product, NaN-propagating. Masks compose this way.
    pub fn mask(&self, mask: &Self) -> Result<Self, FrameError> {
        self.zip_with(mask, "mask", |a, b| a * b)
    }

    /// Shift rows forward by `periods` (row t takes the value of t-periods).
    pub fn shift(&self, periods: usize) -> Self {
        let values = DMatrix::from_fn(self.n_dates(), self.n_symbols(), |r, c| {
            if r < periods {
                f64::NAN
            } else {
                self.values[(r - periods, c)]
            }
        });
        Self {
            dates: self.dates.clone(),
            symbols: self.symbols.clone(),
            values,
        }
    }

    /// Fractional change over `periods` rows.
    pub fn pct_change(&self, periods: usize) -> Self {
        let values = DMatrix::from_fn(self.n_dates(), self.n_symbols(), |r, c| {
            if r < periods {
                return f64::NAN;
            }
            let prev = self.values[(r - periods, c)];
            let cur = self.values[(r, c)];
            if prev.abs() > f64::EPSILON && prev.is_finite() && cur.is_finite() {
                cur / prev - 1.0
            } else {
                f64::NAN
            }
        });
        Self {
            dates: self.dates.clone(),
            symbols: self.symbols.clone(),
            values,
        }
    }

    fn rolling<F: Fn(&[f64]) -> f64>(&self, window: usize, f: F) -> Result<Self, FrameError> {
        if window == 0 || window > self.n_dates() {
            return Err(FrameError::WindowTooLarge {
                window,
                rows: self.n_dates(),
            });
        }
        let mut values = DMatrix::from_element(self.n_dates(), self.n_symbols(), f64::NAN);
        let mut buf = Vec::with_capacity(window);
        for c in 0..self.n_symbols() {
            for r in (window - 1)..self.n_dates() {
                buf.clear();
                for k in (r + 1 - window)..=r {
                    let v = self.values[(k, c)];
                    if v.is_finite() {
                        buf.push(v);
                    }
                }
                if !buf.is_empty() {
                    values[(r, c)] = f(&buf);
                }
            }
        }
        Ok(Self {
            dates: self.dates.clone(),
            symbols: self.symbols.clone(),
            values,
        })
    }

    /// Rolling mean over `window` rows, skipping NaN cells.
    pub fn rolling_mean(&self, window: usize) -> Result<Self, FrameError> {
        self.rolling(window, |xs| {
            xs.iter().sum::<f64>() / xs.len() as f64
        })
    }

    /// Rolling sample standard deviation over `window` rows.
    pub fn rolling_std(&self, window: usize) -> Result<Self, FrameError> {
        self.rolling(window, |xs| {
            if xs.len() < 2 {
                return f64::NAN;
            }
            let mean = xs.iter().sum::<f64>() / xs.len() as f64;
            let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>()
                / (xs.len() - 1) as f64;
            var.sqrt()
        })
    }

    /// Rolling maximum over `window` rows.
    pub fn rolling_max(&self, window: usize) -> Result<Self, FrameError> {
        self.rolling(window, |xs| xs.iter().copied().fold(f64::MIN, f64::max))
    }

    /// Per-row 1/0 mask of the `count` largest finite cells.
    pub fn top_per_row(&self, count: usize) -> Self {
        let mut values = DMatrix::from_element(self.n_dates(), self.n_symbols(), 0.0);
        let mut scored: Vec<(usize, f64)> = Vec::with_capacity(self.n_symbols());
        for r in 0..self.n_dates() {
            scored.clear();
            for c in 0..self.n_symbols() {
                let v = self.values[(r, c)];
                if v.is_finite() && v != 0.0 {
                    scored.push((c, v));
                }
            }
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            for &(c, _) in scored.iter().take(count) {
                values[(r, c)] = 1.0;
            }
        }
        Self {
            dates: self.dates.clone(),
            symbols: self.symbols.clone(),
            values,
        }
    }

    /// Normalize each row so nonzero finite cells sum to 1.
    pub fn row_normalize(&self) -> Self {
        let mut values = self.values.clone();
        for r in 0..self.n_dates() {
            let mut sum = 0.0;
            for c in 0..self.n_symbols() {
                let v = values[(r, c)];
                if v.is_finite() && v > 0.0 {
                    sum += v;
                } else {
                    values[(r, c)] = 0.0;
                }
            }
            if sum > 0.0 {
                for c in 0..self.n_symbols() {
                    values[(r, c)] /= sum;
                }
            }
        }
        Self {
            dates: self.dates.clone(),
            symbols: self.symbols.clone(),
            values,
        }
    }

    /// Restrict rows to dates within `[start, end]` (inclusive).
    ///
    /// The simulator takes no date-range parameters; callers pre-filter
    /// position rows with this before simulation.
    pub fn filter_dates(&self, start: NaiveDate, end: NaiveDate) -> Result<Self, FrameError> {
        let keep: Vec<usize> = self
            .dates
            .iter()
            .enumerate()
            .filter(|(_, d)| **d >= start && **d <= end)
            .map(|(i, _)| i)
            .collect();
        if keep.is_empty() {
            return Err(FrameError::Empty("dates in range"));
        }
        let dates = keep.iter().map(|&i| self.dates[i]).collect();
        let values = DMatrix::from_fn(keep.len(), self.n_symbols(), |r, c| {
            self.values[(keep[r], c)]
        });
        Ok(Self {
            dates,
            symbols: self.symbols.clone(),
            values,
        })
    }

    /// Count of finite nonzero cells in the given row.
    pub fn active_in_row(&self, row: usize) -> usize {
        (0..self.n_symbols())
            .filter(|&c| {
                let v = self.values[(row, c)];
                v.is_finite() && v != 0.0
            })
            .count()
    }
}

/// Row-major serde bridge for `DMatrix<f64>`.
mod matrix_serde {
    use nalgebra::DMatrix;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Raw {
        nrows: usize,
        ncols: usize,
        data: Vec<f64>,
    }

    pub fn serialize<S: Serializer>(m: &DMatrix<f64>, s: S) -> Result<S::Ok, S::Error> {
        let mut data = Vec::with_capacity(m.nrows() * m.ncols());
        for r in 0..m.nrows() {
            for c in 0..m.ncols() {
                data.push(m[(r, c)]);
            }
        }
        Raw {
            nrows: m.nrows(),
            ncols: m.ncols(),
            data,
        }
        .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DMatrix<f64>, D::Error> {
        let raw = Raw::deserialize(d)?;
        if raw.data.len() != raw.nrows * raw.ncols {
            return Err(serde::de::Error::custom("matrix payload length mismatch"));
        }
        Ok(DMatrix::from_fn(raw.nrows, raw.ncols, |r, c| {
            raw.data[r * raw.ncols + c]
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dates(n: usize) -> Vec<NaiveDate> {
        (0..n)
            .map(|i| {
                NaiveDate::from_ymd_opt(2023, 1, 2).unwrap() + chrono::Duration::days(i as i64)
            })
            .collect()
    }

    fn frame(rows: Vec<Vec<f64>>) -> Frame {
        let n = rows.len();
        Frame::from_rows(dates(n), vec!["2330".into(), "2317".into()], rows).unwrap()
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let err = Frame::from_rows(dates(2), vec!["2330".into()], vec![vec![1.0, 2.0]]);
        assert!(matches!(err, Err(FrameError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_pct_change() {
        let f = frame(vec![vec![100.0, 50.0], vec![110.0, 45.0], vec![121.0, 45.0]]);
        let chg = f.pct_change(1);
        assert!(chg.get(0, 0).is_nan());
        assert!((chg.get(1, 0) - 0.10).abs() < 1e-12);
        assert!((chg.get(2, 1) - 0.0).abs() < 1e-12);
    }

    #[test]
    fn test_rolling_mean_warmup_nan() {
        let f = frame(vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]);
        let m = f.rolling_mean(2).unwrap();
        assert!(m.get(0, 0).is_nan());
        assert!((m.get(1, 0) - 2.0).abs() < 1e-12);
        assert!((m.get(2, 1) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_rolling_window_too_large() {
        let f = frame(vec![vec![1.0, 2.0]]);
        assert!(matches!(
            f.rolling_mean(5),
            Err(FrameError::WindowTooLarge { window: 5, rows: 1 })
        ));
    }

    #[test]
    fn test_top_per_row_selects_largest() {
        let f = frame(vec![vec![3.0, 1.0], vec![1.0, 9.0]]);
        let top = f.top_per_row(1);
        assert!((top.get(0, 0) - 1.0).abs() < f64::EPSILON);
        assert!((top.get(0, 1)).abs() < f64::EPSILON);
        assert!((top.get(1, 1) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_row_normalize_sums_to_one() {
        let f = frame(vec![vec![1.0, 3.0], vec![0.0, 0.0]]);
        let w = f.row_normalize();
        assert!((w.get(0, 0) - 0.25).abs() < 1e-12);
        assert!((w.get(0, 1) - 0.75).abs() < 1e-12);
        assert!((w.get(1, 0)).abs() < f64::EPSILON);
    }

    #[test]
    fn test_filter_dates_keeps_window_rows_only() {
        let f = frame(vec![vec![1.0, 1.0], vec![2.0, 2.0], vec![3.0, 3.0]]);
        let all = f.dates().to_vec();
        let cut = f.filter_dates(all[1], all[2]).unwrap();
        assert_eq!(cut.n_dates(), 2);
        assert_eq!(cut.dates()[0], all[1]);
        // every surviving row is inside the window
        assert!(cut.dates().iter().all(|d| *d >= all[1] && *d <= all[2]));
    }

    #[test]
    fn test_mask_requires_same_axes() {
        let a = frame(vec![vec![1.0, 1.0]]);
        let b = Frame::from_rows(dates(1), vec!["1101".into(), "2330".into()], vec![vec![
            1.0, 1.0,
        ]])
        .unwrap();
        assert!(matches!(a.mask(&b), Err(FrameError::AxisMismatch { .. })));
    }

    #[test]
    fn test_serde_roundtrip() {
        let f = frame(vec![vec![1.5, 2.5], vec![3.5, 4.5]]);
        let json = serde_json::to_string(&f).unwrap();
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(f, back);
    }
}
