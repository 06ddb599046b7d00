//! External Data Loader
//!
//! Trait for sources the replay engine pulls history from when a context subscribed to
//! data that was never fed directly.

use crate::market::{Bar, BarPeriod, Tick};
use crate::replay::adjust::AdjFactor;
use crate::replay::clock::TimeRange;
use anyhow::Context as _;
use serde::de::DeserializeOwned;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Pull-based history source.
pub trait ExtDataLoader: Send + Sync {
    /// Bars of (code, period) inside `range`, ascending by time.
    fn load_bars(&self, code: &str, period: BarPeriod, range: TimeRange) -> anyhow::Result<Vec<Bar>>;

    fn load_ticks(&self, code: &str, range: TimeRange) -> anyhow::Result<Vec<Tick>>;

    /// Adjustment factors of `code`, or `None` if the source has none.
    fn load_adj_factors(&self, _code: &str) -> anyhow::Result<Option<Vec<AdjFactor>>> {
        Ok(None)
    }

    fn name(&self) -> &str {
        "ext"
    }
}

/// Parse a JSON-lines file. Blank lines are skipped.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    let file = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut out = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let item = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}", path.display(), n + 1))?;
        out.push(item);
    }
    Ok(out)
}

/// Loader over a directory of JSON-lines files:
/// `<code>_<period>.jsonl` for bars, `<code>_ticks.jsonl`, `<code>_adj.jsonl`.
///
/// Missing files load as empty.
#[derive(Debug, Clone)]
pub struct JsonlDirLoader {
    root: PathBuf,
}

impl JsonlDirLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn load_in_range<T, F>(&self, file: String, range: TimeRange, time_of: F) -> anyhow::Result<Vec<T>>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> i64,
    {
        let path = self.root.join(file);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut items: Vec<T> = read_jsonl(&path)?;
        items.retain(|i| range.contains(time_of(i)));
        Ok(items)
    }
}

impl ExtDataLoader for JsonlDirLoader {
    fn load_bars(&self, code: &str, period: BarPeriod, range: TimeRange) -> anyhow::Result<Vec<Bar>> {
        self.load_in_range(format!("{}_{}.jsonl", code, period), range, |b: &Bar| b.time)
    }

    fn load_ticks(&self, code: &str, range: TimeRange) -> anyhow::Result<Vec<Tick>> {
        self.load_in_range(format!("{}_ticks.jsonl", code), range, |t: &Tick| t.time)
    }

    fn load_adj_factors(&self, code: &str) -> anyhow::Result<Option<Vec<AdjFactor>>> {
        let path = self.root.join(format!("{}_adj.jsonl", code));
        if !path.exists() {
            return Ok(None);
        }
        read_jsonl(&path).map(Some)
    }

    fn name(&self) -> &str {
        "jsonl-dir"
    }
}
