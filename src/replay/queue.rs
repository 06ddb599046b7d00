//! Replay Merge Queue
//!
//! K-way merge of per-instrument historical series into one event stream.
//!
//! # Ordering Guarantees
//! Events are ordered by:
//! 1. Timestamp (nanoseconds, ascending)
//! 2. Instrument code (lexicographic)
//! 3. Event kind (quote < order queue < order detail < transaction < bar)
//! 4. Series feed ordinal (the series first fed wins)
//! 5. Position within the series
//!
//! Every key component is derived from the fed data only, so identical feeds produce
//! identical streams across runs.

use crate::market::{EventKind, MarketEvent};
use crate::replay::clock::Nanos;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
struct MergeKey {
    time: Nanos,
    code: Arc<str>,
    kind: EventKind,
    ordinal: u32,
    index: usize,
    cursor: usize,
}

impl Ord for MergeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.code.cmp(&other.code))
            .then_with(|| self.kind.cmp(&other.kind))
            .then_with(|| self.ordinal.cmp(&other.ordinal))
            .then_with(|| self.index.cmp(&other.index))
    }
}

impl PartialOrd for MergeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One time-ordered input stream.
struct Cursor {
    code: Arc<str>,
    kind: EventKind,
    ordinal: u32,
    events: Vec<MarketEvent>,
    next: usize,
}

pub struct ReplayQueue {
    cursors: Vec<Cursor>,
    heap: BinaryHeap<Reverse<MergeKey>>,
    total_pushed: u64,
    total_popped: u64,
}

impl Default for ReplayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayQueue {
    pub fn new() -> Self {
        Self {
            cursors: Vec::new(),
            heap: BinaryHeap::new(),
            total_pushed: 0,
            total_popped: 0,
        }
    }

    /// Add a series. `events` must be ascending by time and all of `code`/`kind`.
    pub fn add_series(&mut self, code: &str, kind: EventKind, ordinal: u32, events: Vec<MarketEvent>) {
        if events.is_empty() {
            return;
        }
        debug_assert!(events.windows(2).all(|w| w[0].time() <= w[1].time()));
        self.total_pushed += events.len() as u64;
        let cursor = self.cursors.len();
        self.cursors.push(Cursor {
            code: Arc::from(code),
            kind,
            ordinal,
            events,
            next: 0,
        });
        self.schedule(cursor);
    }

    fn schedule(&mut self, cursor: usize) {
        let c = &self.cursors[cursor];
        if let Some(event) = c.events.get(c.next) {
            self.heap.push(Reverse(MergeKey {
                time: event.time(),
                code: Arc::clone(&c.code),
                kind: c.kind,
                ordinal: c.ordinal,
                index: c.next,
                cursor,
            }));
        }
    }

    pub fn peek_time(&self) -> Option<Nanos> {
        self.heap.peek().map(|Reverse(k)| k.time)
    }

    pub fn pop(&mut self) -> Option<MarketEvent> {
        let Reverse(key) = self.heap.pop()?;
        let c = &mut self.cursors[key.cursor];
        let event = std::mem::replace(
            &mut c.events[key.index],
            MarketEvent::Quote(Default::default()),
        );
        c.next += 1;
        self.schedule(key.cursor);
        self.total_popped += 1;
        Some(event)
    }

    pub fn len(&self) -> u64 {
        self.total_pushed - self.total_popped
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn total_popped(&self) -> u64 {
        self.total_popped
    }
}

impl Iterator for ReplayQueue {
    type Item = MarketEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Bar, BarPeriod, Tick};

    fn tick(code: &str, time: Nanos, price: f64) -> MarketEvent {
        MarketEvent::Quote(Tick {
            code: code.into(),
            time,
            price,
            ..Default::default()
        })
    }

    fn bar(code: &str, time: Nanos) -> MarketEvent {
        MarketEvent::Bar {
            period: BarPeriod::M1,
            bar: Bar {
                code: code.into(),
                time,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 0.0,
                turnover: 0.0,
                open_interest: 0.0,
            },
        }
    }

    fn keys(q: ReplayQueue) -> Vec<(Nanos, String, EventKind)> {
        q.map(|e| (e.time(), e.code().to_string(), e.kind())).collect()
    }

    #[test]
    fn test_time_then_code_then_kind() {
        let mut q = ReplayQueue::new();
        q.add_series("B.1", EventKind::Bar, 0, vec![bar("B.1", 10), bar("B.1", 20)]);
        q.add_series("B.1", EventKind::Quote, 1, vec![tick("B.1", 10, 1.0)]);
        q.add_series("A.1", EventKind::Quote, 2, vec![tick("A.1", 10, 1.0), tick("A.1", 30, 1.0)]);

        assert_eq!(
            keys(q),
            vec![
                (10, "A.1".into(), EventKind::Quote),
                (10, "B.1".into(), EventKind::Quote),
                (10, "B.1".into(), EventKind::Bar),
                (20, "B.1".into(), EventKind::Bar),
                (30, "A.1".into(), EventKind::Quote),
            ]
        );
    }

    #[test]
    fn test_feed_ordinal_and_index_break_ties() {
        let mut q = ReplayQueue::new();
        q.add_series("A.1", EventKind::Quote, 5, vec![tick("A.1", 10, 2.0)]);
        q.add_series("A.1", EventKind::Quote, 3, vec![tick("A.1", 10, 1.0), tick("A.1", 10, 1.5)]);
        let prices: Vec<f64> = q
            .map(|e| match e {
                MarketEvent::Quote(t) => t.price,
                _ => 0.0,
            })
            .collect();
        assert_eq!(prices, vec![1.0, 1.5, 2.0]);
    }

    #[test]
    fn test_counts() {
        let mut q = ReplayQueue::new();
        q.add_series("A.1", EventKind::Quote, 0, Vec::new());
        assert!(q.is_empty());
        q.add_series("A.1", EventKind::Quote, 0, vec![tick("A.1", 1, 1.0), tick("A.1", 2, 1.0)]);
        assert_eq!(q.peek_time(), Some(1));
        q.pop();
        assert_eq!(q.len(), 1);
        assert_eq!(q.total_popped(), 1);
    }
}
