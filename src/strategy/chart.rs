//! CTA chart registry: main kline, indicator lines and marks recorded during a run.

use crate::market::{BarPeriod, Price};
use crate::replay::clock::Nanos;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where an index is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// Overlaid on the main kline.
    Main,
    /// Separate sub-panel.
    Sub,
}

impl IndexKind {
    pub fn from_code(code: u32) -> Self {
        if code == 0 {
            IndexKind::Main
        } else {
            IndexKind::Sub
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexLine {
    pub style: u32,
    pub values: Vec<(Nanos, f64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartIndex {
    pub kind: IndexKind,
    pub lines: BTreeMap<String, IndexLine>,
    pub baselines: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartMark {
    pub time: Nanos,
    pub price: Price,
    pub icon: String,
    pub tag: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChartRegistry {
    kline: Option<(String, BarPeriod)>,
    indices: BTreeMap<String, ChartIndex>,
    marks: Vec<ChartMark>,
}

impl ChartRegistry {
    pub fn set_kline(&mut self, code: &str, period: BarPeriod) {
        self.kline = Some((code.to_string(), period));
    }

    pub fn kline(&self) -> Option<&(String, BarPeriod)> {
        self.kline.as_ref()
    }

    pub fn add_mark(&mut self, time: Nanos, price: Price, icon: &str, tag: &str) {
        self.marks.push(ChartMark {
            time,
            price,
            icon: icon.to_string(),
            tag: tag.to_string(),
        });
    }

    /// Re-registering an index keeps its existing lines.
    pub fn register_index(&mut self, name: &str, kind: IndexKind) {
        self.indices
            .entry(name.to_string())
            .and_modify(|idx| idx.kind = kind)
            .or_insert_with(|| ChartIndex {
                kind,
                lines: BTreeMap::new(),
                baselines: BTreeMap::new(),
            });
    }

    pub fn register_line(&mut self, index: &str, line: &str, style: u32) -> bool {
        let Some(idx) = self.indices.get_mut(index) else {
            return false;
        };
        idx.lines
            .entry(line.to_string())
            .or_insert_with(|| IndexLine {
                style,
                values: Vec::new(),
            })
            .style = style;
        true
    }

    pub fn add_baseline(&mut self, index: &str, line: &str, value: f64) -> bool {
        let Some(idx) = self.indices.get_mut(index) else {
            return false;
        };
        idx.baselines.insert(line.to_string(), value);
        true
    }

    /// Append a value; only registered lines accept values.
    pub fn set_value(&mut self, index: &str, line: &str, time: Nanos, value: f64) -> bool {
        let Some(l) = self
            .indices
            .get_mut(index)
            .and_then(|idx| idx.lines.get_mut(line))
        else {
            return false;
        };
        match l.values.last_mut() {
            Some(last) if last.0 == time => last.1 = value,
            _ => l.values.push((time, value)),
        }
        true
    }

    pub fn marks(&self) -> &[ChartMark] {
        &self.marks
    }

    pub fn indices(&self) -> &BTreeMap<String, ChartIndex> {
        &self.indices
    }

    pub fn clear_series(&mut self) {
        self.marks.clear();
        for idx in self.indices.values_mut() {
            for line in idx.lines.values_mut() {
                line.values.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_need_registered_line() {
        let mut chart = ChartRegistry::default();
        assert!(!chart.set_value("ma", "fast", 1, 1.0));
        chart.register_index("ma", IndexKind::Main);
        assert!(!chart.set_value("ma", "fast", 1, 1.0));
        assert!(chart.register_line("ma", "fast", 0));
        assert!(chart.set_value("ma", "fast", 1, 1.0));
        assert!(chart.set_value("ma", "fast", 1, 2.0));
        assert!(chart.set_value("ma", "fast", 2, 3.0));
        assert_eq!(chart.indices()["ma"].lines["fast"].values, vec![(1, 2.0), (2, 3.0)]);
    }
}
