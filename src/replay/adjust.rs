//! Price Adjustment Factors
//!
//! Per-instrument cumulative factor series `(effective date, factor)`. A price observed
//! on date `d` is delivered as `raw * f(d) / f(latest)`, where `f(d)` is the factor of
//! the last entry effective on or before `d` and `1.0` before the first entry. Prices on
//! or after the latest effective date are therefore unchanged.

use crate::error::{PlatformError, PlatformResult};
use crate::market::raw_std_code;
use crate::replay::clock::{nanos_to_ymd, Nanos};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjFactor {
    /// `YYYYMMDD`
    pub date: u32,
    pub factor: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AdjustmentTable {
    factors: BTreeMap<String, Vec<AdjFactor>>,
}

impl AdjustmentTable {
    /// Append factors for `code`. Entries out of date order, or with a non-positive
    /// factor, are dropped with a warning. Returns how many were accepted.
    pub fn feed(&mut self, code: &str, dates: &[u32], factors: &[f64]) -> PlatformResult<usize> {
        if dates.len() != factors.len() {
            return Err(PlatformError::Config(format!(
                "adjustment factors for {}: {} dates but {} factors",
                code,
                dates.len(),
                factors.len()
            )));
        }
        let series = self.factors.entry(raw_std_code(code)).or_default();
        let mut accepted = 0;
        for (&date, &factor) in dates.iter().zip(factors) {
            if !(factor > 0.0) || !factor.is_finite() {
                warn!(code = %code, date, factor, "Dropping invalid adjustment factor");
                continue;
            }
            if let Some(last) = series.last() {
                if date <= last.date {
                    warn!(
                        code = %code,
                        previous = last.date,
                        offending = date,
                        "Dropping out-of-order adjustment factor"
                    );
                    continue;
                }
            }
            series.push(AdjFactor { date, factor });
            accepted += 1;
        }
        Ok(accepted)
    }

    pub fn has(&self, code: &str) -> bool {
        self.factors
            .get(&raw_std_code(code))
            .map_or(false, |s| !s.is_empty())
    }

    pub fn series(&self, code: &str) -> Option<&[AdjFactor]> {
        self.factors.get(&raw_std_code(code)).map(|s| s.as_slice())
    }

    /// Multiplier for a price observed at `time`, or `None` without a series.
    pub fn ratio(&self, code: &str, time: Nanos) -> Option<f64> {
        let series = self.factors.get(&raw_std_code(code))?;
        let latest = series.last()?.factor;
        let ymd = nanos_to_ymd(time);
        let idx = series.partition_point(|f| f.date <= ymd);
        let at = if idx == 0 { 1.0 } else { series[idx - 1].factor };
        Some(at / latest)
    }

    pub fn clear(&mut self) {
        self.factors.clear();
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::clock::ymdhm_to_nanos;

    #[test]
    fn test_single_split_halves_history() {
        let mut table = AdjustmentTable::default();
        table.feed("SSE.600000", &[20240110], &[2.0]).unwrap();
        let before = ymdhm_to_nanos(202401091500).unwrap();
        let on = ymdhm_to_nanos(202401100930).unwrap();
        assert_eq!(table.ratio("SSE.600000", before), Some(0.5));
        assert_eq!(table.ratio("SSE.600000", on), Some(1.0));
        // adjusted-code aliases share the raw series
        assert_eq!(table.ratio("SSE.600000Q", before), Some(0.5));
        assert_eq!(table.ratio("SSE.600036", before), None);
    }

    #[test]
    fn test_cumulative_factors() {
        let mut table = AdjustmentTable::default();
        table
            .feed("SZSE.000001", &[20230101, 20230601, 20240101], &[1.0, 1.5, 3.0])
            .unwrap();
        let t = |s| ymdhm_to_nanos(s).unwrap();
        assert_eq!(table.ratio("SZSE.000001", t(202212311500)), Some(1.0 / 3.0));
        assert_eq!(table.ratio("SZSE.000001", t(202303011500)), Some(1.0 / 3.0));
        assert_eq!(table.ratio("SZSE.000001", t(202307011500)), Some(0.5));
        assert_eq!(table.ratio("SZSE.000001", t(202402011500)), Some(1.0));
    }

    #[test]
    fn test_bad_input() {
        let mut table = AdjustmentTable::default();
        assert!(table.feed("A.1", &[1, 2], &[1.0]).is_err());
        let accepted = table
            .feed("A.1", &[20240102, 20240101, 20240103, 20240104], &[1.0, 2.0, -1.0, 2.0])
            .unwrap();
        assert_eq!(accepted, 2);
        assert_eq!(table.series("A.1").unwrap().len(), 2);
    }
}
