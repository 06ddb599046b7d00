//! Market Event Model
//!
//! Canonical market data types shared by live connectors and the replay engine.
//! Every event carries its instrument code, exchange and timestamp so the dispatcher
//! can route it without looking at the payload.

use crate::market::code::split_std_code;
use crate::replay::clock::{Nanos, NANOS_PER_DAY, NANOS_PER_MIN};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type Price = f64;
pub type Qty = f64;

/// Position direction of a lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    #[inline]
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

/// Aggressor / order side on tick-level streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Side {
    #[default]
    Buy,
    Sell,
}

/// Bar period such as `m1`, `m5` or `d1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BarPeriod {
    pub unit: PeriodUnit,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PeriodUnit {
    Minute,
    Day,
}

impl BarPeriod {
    pub const M1: BarPeriod = BarPeriod {
        unit: PeriodUnit::Minute,
        count: 1,
    };
    pub const D1: BarPeriod = BarPeriod {
        unit: PeriodUnit::Day,
        count: 1,
    };

    /// Length of one bar.
    pub fn span(&self) -> Nanos {
        let unit = match self.unit {
            PeriodUnit::Minute => NANOS_PER_MIN,
            PeriodUnit::Day => NANOS_PER_DAY,
        };
        unit * self.count as i64
    }
}

impl FromStr for BarPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (unit, digits) = if let Some(rest) = s.strip_prefix("min") {
            (PeriodUnit::Minute, rest)
        } else if let Some(rest) = s.strip_prefix('m') {
            (PeriodUnit::Minute, rest)
        } else if let Some(rest) = s.strip_prefix('d') {
            (PeriodUnit::Day, rest)
        } else {
            return Err(format!("unknown bar period '{}'", s));
        };
        let count = if digits.is_empty() {
            1
        } else {
            digits
                .parse::<u32>()
                .map_err(|_| format!("bad bar period count in '{}'", s))?
        };
        if count == 0 {
            return Err(format!("zero-length bar period '{}'", s));
        }
        Ok(Self { unit, count })
    }
}

impl fmt::Display for BarPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            PeriodUnit::Minute => write!(f, "m{}", self.count),
            PeriodUnit::Day => write!(f, "d{}", self.count),
        }
    }
}

/// OHLC bar. `time` is the bar close time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub code: String,
    pub time: Nanos,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    #[serde(default)]
    pub volume: Qty,
    #[serde(default)]
    pub turnover: f64,
    #[serde(default)]
    pub open_interest: f64,
}

impl Bar {
    /// Multiply all prices by `ratio` (adjustment factor transform).
    pub fn scale_prices(&mut self, ratio: f64) {
        self.open *= ratio;
        self.high *= ratio;
        self.low *= ratio;
        self.close *= ratio;
    }
}

/// Level-1 quote snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Tick {
    pub code: String,
    #[serde(default)]
    pub exchange: String,
    pub time: Nanos,
    pub price: Price,
    #[serde(default)]
    pub open: Price,
    #[serde(default)]
    pub high: Price,
    #[serde(default)]
    pub low: Price,
    #[serde(default)]
    pub volume: Qty,
    #[serde(default)]
    pub turnover: f64,
    #[serde(default)]
    pub open_interest: f64,
    #[serde(default)]
    pub bid_price: Price,
    #[serde(default)]
    pub bid_qty: Qty,
    #[serde(default)]
    pub ask_price: Price,
    #[serde(default)]
    pub ask_qty: Qty,
}

impl Tick {
    pub fn scale_prices(&mut self, ratio: f64) {
        self.price *= ratio;
        self.open *= ratio;
        self.high *= ratio;
        self.low *= ratio;
        self.bid_price *= ratio;
        self.ask_price *= ratio;
    }

    /// Best price a buyer can take: ask when quoted, otherwise last.
    pub fn buy_price(&self) -> Price {
        if self.ask_price > 0.0 {
            self.ask_price
        } else {
            self.price
        }
    }

    /// Best price a seller can hit: bid when quoted, otherwise last.
    pub fn sell_price(&self) -> Price {
        if self.bid_price > 0.0 {
            self.bid_price
        } else {
            self.price
        }
    }
}

/// Order queue at one price level (level-2 style).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OrderQueue {
    pub code: String,
    #[serde(default)]
    pub exchange: String,
    pub time: Nanos,
    pub side: Side,
    pub price: Price,
    #[serde(default)]
    pub order_items: u32,
    #[serde(default)]
    pub volumes: Vec<Qty>,
}

/// Tick-by-tick trade print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Transaction {
    pub code: String,
    #[serde(default)]
    pub exchange: String,
    pub time: Nanos,
    #[serde(default)]
    pub index: u64,
    pub price: Price,
    pub volume: Qty,
    pub side: Side,
    #[serde(default)]
    pub ask_order: u64,
    #[serde(default)]
    pub bid_order: u64,
}

/// Tick-by-tick order entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OrderDetail {
    pub code: String,
    #[serde(default)]
    pub exchange: String,
    pub time: Nanos,
    #[serde(default)]
    pub index: u64,
    pub price: Price,
    pub volume: Qty,
    pub side: Side,
}

/// Event kind; the discriminant is the tie-break rank for simultaneous events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EventKind {
    Quote = 0,
    OrderQueue = 1,
    OrderDetail = 2,
    Transaction = 3,
    Bar = 4,
}

/// A market event produced by exactly one source.
///
/// JSON form is internally tagged: `{"type":"quote","code":...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    Quote(Tick),
    OrderQueue(OrderQueue),
    Transaction(Transaction),
    OrderDetail(OrderDetail),
    /// Closed bar; only the replay engine emits these.
    Bar { period: BarPeriod, bar: Bar },
}

impl MarketEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MarketEvent::Quote(_) => EventKind::Quote,
            MarketEvent::OrderQueue(_) => EventKind::OrderQueue,
            MarketEvent::Transaction(_) => EventKind::Transaction,
            MarketEvent::OrderDetail(_) => EventKind::OrderDetail,
            MarketEvent::Bar { .. } => EventKind::Bar,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            MarketEvent::Quote(t) => &t.code,
            MarketEvent::OrderQueue(q) => &q.code,
            MarketEvent::Transaction(t) => &t.code,
            MarketEvent::OrderDetail(d) => &d.code,
            MarketEvent::Bar { bar, .. } => &bar.code,
        }
    }

    /// Exchange code; falls back to the prefix of the standard code.
    pub fn exchange(&self) -> &str {
        let explicit = match self {
            MarketEvent::Quote(t) => t.exchange.as_str(),
            MarketEvent::OrderQueue(q) => q.exchange.as_str(),
            MarketEvent::Transaction(t) => t.exchange.as_str(),
            MarketEvent::OrderDetail(d) => d.exchange.as_str(),
            MarketEvent::Bar { .. } => "",
        };
        if explicit.is_empty() {
            split_std_code(self.code()).0
        } else {
            explicit
        }
    }

    pub fn time(&self) -> Nanos {
        match self {
            MarketEvent::Quote(t) => t.time,
            MarketEvent::OrderQueue(q) => q.time,
            MarketEvent::Transaction(t) => t.time,
            MarketEvent::OrderDetail(d) => d.time,
            MarketEvent::Bar { bar, .. } => bar.time,
        }
    }

    /// Price usable for marking positions, if the event carries one.
    pub fn mark_price(&self) -> Option<Price> {
        match self {
            MarketEvent::Quote(t) if t.price > 0.0 => Some(t.price),
            MarketEvent::Transaction(t) if t.price > 0.0 => Some(t.price),
            MarketEvent::Bar { bar, .. } => Some(bar.close),
            _ => None,
        }
    }
}
