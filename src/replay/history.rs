//! Historical Data Store
//!
//! Per-instrument series of bars (per period), ticks and level-2 streams fed ahead of a
//! replay. Every series is kept sorted ascending by time: a feed call that would break
//! the order has its offending entries dropped with a warning and the rest appended.
//!
//! Queries never look past a given time, which is how contexts are kept from seeing
//! the future during a replay.

use crate::error::PlatformError;
use crate::market::{Bar, BarPeriod, OrderDetail, OrderQueue, Tick, Transaction};
use crate::replay::adjust::AdjustmentTable;
use crate::replay::clock::{Nanos, TimeRange};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

/// Anything stored in a time-ordered series.
pub trait Timed {
    fn time(&self) -> Nanos;
    fn code(&self) -> &str;
}

macro_rules! impl_timed {
    ($($ty:ty),*) => {
        $(impl Timed for $ty {
            fn time(&self) -> Nanos {
                self.time
            }
            fn code(&self) -> &str {
                &self.code
            }
        })*
    };
}

impl_timed!(Bar, Tick, OrderQueue, OrderDetail, Transaction);

/// Outcome of one feed call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedReport {
    pub accepted: usize,
    pub dropped: usize,
}

/// Time-ordered series plus the feed ordinal used as the final replay tie-break.
#[derive(Debug, Clone)]
pub struct Series<T> {
    pub ordinal: u32,
    pub items: Vec<T>,
}

impl<T: Timed> Series<T> {
    fn new(ordinal: u32) -> Self {
        Self {
            ordinal,
            items: Vec::new(),
        }
    }

    fn append(&mut self, item: T) -> Result<(), PlatformError> {
        if let Some(last) = self.items.last() {
            if item.time() < last.time() {
                return Err(PlatformError::NonMonotonicFeed {
                    code: item.code().to_string(),
                    previous: last.time(),
                    offending: item.time(),
                });
            }
        }
        self.items.push(item);
        Ok(())
    }

    /// Items with `time <= until`, at most the last `count`.
    pub fn until(&self, until: Nanos, count: usize) -> &[T] {
        let end = self.items.partition_point(|i| i.time() <= until);
        &self.items[end.saturating_sub(count)..end]
    }

    /// Items inside `range`.
    pub fn within(&self, range: TimeRange) -> &[T] {
        let start = self.items.partition_point(|i| i.time() < range.start);
        let end = self.items.partition_point(|i| i.time() <= range.end);
        &self.items[start..end.max(start)]
    }
}

fn append_all<K, T>(
    map: &mut BTreeMap<K, Series<T>>,
    next_ordinal: &mut u32,
    items: Vec<T>,
    key_of: impl Fn(&T) -> K,
) -> FeedReport
where
    K: Ord,
    T: Timed,
{
    let mut report = FeedReport::default();
    for item in items {
        let series = map.entry(key_of(&item)).or_insert_with(|| {
            let s = Series::new(*next_ordinal);
            *next_ordinal += 1;
            s
        });
        match series.append(item) {
            Ok(()) => report.accepted += 1,
            Err(e) => {
                warn!(error = %e, "Dropping historical entry");
                report.dropped += 1;
            }
        }
    }
    report
}

#[derive(Debug, Default)]
pub struct HistoryStore {
    bars: BTreeMap<(String, BarPeriod), Series<Bar>>,
    ticks: BTreeMap<String, Series<Tick>>,
    ordques: BTreeMap<String, Series<OrderQueue>>,
    orddtls: BTreeMap<String, Series<OrderDetail>>,
    transes: BTreeMap<String, Series<Transaction>>,
    factors: AdjustmentTable,
    auto_transform: bool,
    next_ordinal: u32,
    /// Instruments already reported as missing factors.
    warned_missing: Mutex<HashSet<String>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Feeding
    // -------------------------------------------------------------------------

    pub fn feed_bars(&mut self, period: BarPeriod, bars: Vec<Bar>) -> FeedReport {
        append_all(&mut self.bars, &mut self.next_ordinal, bars, |b| {
            (b.code.clone(), period)
        })
    }

    pub fn feed_ticks(&mut self, ticks: Vec<Tick>) -> FeedReport {
        append_all(&mut self.ticks, &mut self.next_ordinal, ticks, |t| t.code.clone())
    }

    pub fn feed_ordques(&mut self, items: Vec<OrderQueue>) -> FeedReport {
        append_all(&mut self.ordques, &mut self.next_ordinal, items, |t| t.code.clone())
    }

    pub fn feed_orddtls(&mut self, items: Vec<OrderDetail>) -> FeedReport {
        append_all(&mut self.orddtls, &mut self.next_ordinal, items, |t| t.code.clone())
    }

    pub fn feed_transes(&mut self, items: Vec<Transaction>) -> FeedReport {
        append_all(&mut self.transes, &mut self.next_ordinal, items, |t| t.code.clone())
    }

    pub fn feed_adj_factors(
        &mut self,
        code: &str,
        dates: &[u32],
        factors: &[f64],
    ) -> Result<usize, PlatformError> {
        self.factors.feed(code, dates, factors)
    }

    /// Drop every series and factor.
    pub fn clear(&mut self) {
        self.bars.clear();
        self.ticks.clear();
        self.ordques.clear();
        self.orddtls.clear();
        self.transes.clear();
        self.factors.clear();
        self.warned_missing.lock().clear();
        self.next_ordinal = 0;
    }

    // -------------------------------------------------------------------------
    // Price transform
    // -------------------------------------------------------------------------

    pub fn set_auto_transform(&mut self, enabled: bool) {
        self.auto_transform = enabled;
    }

    pub fn auto_transform(&self) -> bool {
        self.auto_transform
    }

    pub fn factors(&self) -> &AdjustmentTable {
        &self.factors
    }

    /// Multiplier to apply to a price of `code` observed at `time`.
    ///
    /// Without auto transform this is always 1. With it, an instrument without a
    /// factor series is reported once and delivered untransformed.
    pub fn price_ratio(&self, code: &str, time: Nanos) -> f64 {
        if !self.auto_transform {
            return 1.0;
        }
        match self.factors.ratio(code, time) {
            Some(r) => r,
            None => {
                if self.warned_missing.lock().insert(code.to_string()) {
                    warn!(
                        error = %PlatformError::MissingAdjustmentFactor(code.to_string()),
                        "Skipping price transform"
                    );
                }
                1.0
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn has_bars(&self, code: &str, period: BarPeriod) -> bool {
        self.bars.contains_key(&(code.to_string(), period))
    }

    pub fn has_ticks(&self, code: &str) -> bool {
        self.ticks.contains_key(code)
    }

    /// Last `count` bars closed at or before `until`, transformed when enabled.
    pub fn bars_until(&self, code: &str, period: BarPeriod, until: Nanos, count: usize) -> Vec<Bar> {
        let Some(series) = self.bars.get(&(code.to_string(), period)) else {
            return Vec::new();
        };
        series
            .until(until, count)
            .iter()
            .map(|b| {
                let mut bar = b.clone();
                let ratio = self.price_ratio(code, bar.time);
                if ratio != 1.0 {
                    bar.scale_prices(ratio);
                }
                bar
            })
            .collect()
    }

    pub fn bar_series(&self) -> impl Iterator<Item = (&(String, BarPeriod), &Series<Bar>)> {
        self.bars.iter()
    }

    pub fn tick_series(&self) -> impl Iterator<Item = (&String, &Series<Tick>)> {
        self.ticks.iter()
    }

    pub fn ordque_series(&self) -> impl Iterator<Item = (&String, &Series<OrderQueue>)> {
        self.ordques.iter()
    }

    pub fn orddtl_series(&self) -> impl Iterator<Item = (&String, &Series<OrderDetail>)> {
        self.orddtls.iter()
    }

    pub fn trans_series(&self) -> impl Iterator<Item = (&String, &Series<Transaction>)> {
        self.transes.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
            && self.ticks.is_empty()
            && self.ordques.is_empty()
            && self.orddtls.is_empty()
            && self.transes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(code: &str, time: Nanos, close: f64) -> Bar {
        Bar {
            code: code.into(),
            time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            turnover: 0.0,
            open_interest: 0.0,
        }
    }

    #[test]
    fn test_out_of_order_entries_dropped() {
        let mut store = HistoryStore::new();
        let report = store.feed_bars(
            BarPeriod::M1,
            vec![bar("A.1", 10, 1.0), bar("A.1", 5, 2.0), bar("A.1", 10, 3.0), bar("A.1", 20, 4.0)],
        );
        assert_eq!(report, FeedReport { accepted: 3, dropped: 1 });

        // a later call must continue after the existing tail
        let report = store.feed_bars(BarPeriod::M1, vec![bar("A.1", 15, 5.0)]);
        assert_eq!(report.dropped, 1);
        let closes: Vec<f64> = store
            .bars_until("A.1", BarPeriod::M1, i64::MAX, 10)
            .iter()
            .map(|b| b.close)
            .collect();
        assert_eq!(closes, vec![1.0, 3.0, 4.0]);
    }

    #[test]
    fn test_instruments_sorted_independently() {
        let mut store = HistoryStore::new();
        let report = store.feed_bars(
            BarPeriod::M1,
            vec![bar("A.1", 10, 1.0), bar("B.1", 5, 1.0), bar("A.1", 11, 1.0)],
        );
        assert_eq!(report.dropped, 0);
    }

    #[test]
    fn test_no_look_ahead() {
        let mut store = HistoryStore::new();
        store.feed_bars(
            BarPeriod::M1,
            (1..=10).map(|t| bar("A.1", t * 100, t as f64)).collect(),
        );
        let bars = store.bars_until("A.1", BarPeriod::M1, 550, 3);
        let times: Vec<Nanos> = bars.iter().map(|b| b.time).collect();
        assert_eq!(times, vec![300, 400, 500]);
        assert!(store.bars_until("A.1", BarPeriod::M1, 50, 3).is_empty());
        assert!(store.bars_until("A.1", BarPeriod::D1, 550, 3).is_empty());
    }

    #[test]
    fn test_within_range() {
        let mut store = HistoryStore::new();
        store.feed_ticks(
            (0..10)
                .map(|t| Tick {
                    code: "A.1".into(),
                    time: t,
                    price: 1.0,
                    ..Default::default()
                })
                .collect(),
        );
        let (_, series) = store.tick_series().next().unwrap();
        assert_eq!(series.within(TimeRange { start: 3, end: 6 }).len(), 4);
        assert!(series.within(TimeRange { start: 20, end: 30 }).is_empty());
    }

    #[test]
    fn test_missing_factor_passes_through() {
        let mut store = HistoryStore::new();
        store.set_auto_transform(true);
        store.feed_bars(BarPeriod::D1, vec![bar("A.1", 100, 8.0)]);
        assert_eq!(store.bars_until("A.1", BarPeriod::D1, 100, 1)[0].close, 8.0);
        assert_eq!(store.price_ratio("A.1", 100), 1.0);
    }
}
