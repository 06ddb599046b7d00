//! Position Ledger
//!
//! Lot-level position and P&L bookkeeping owned by exactly one strategy context.
//!
//! Every open creates (or, in incremental mode, merges into) a tagged lot; exits consume
//! lots FIFO, optionally restricted to one tag. Aggregates are cached per instrument and
//! direction and must always equal the sum of the live lots' remaining quantities
//! (`check_invariants` verifies this).
//!
//! # Quantities
//! - `volume`: remaining quantity of the lot, frozen part included
//! - `frozen`: part of `volume` reserved by a pending exit; not available to other exits
//! - "valid" position = `volume - frozen`

use crate::error::{PlatformError, PlatformResult};
use crate::market::{Direction, Price, Qty};
use crate::replay::clock::Nanos;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Quantities below this are treated as zero.
pub const QTY_EPSILON: f64 = 1e-9;

// =============================================================================
// LOTS
// =============================================================================

/// One open position increment ("lot").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionDetail {
    pub code: String,
    pub direction: Direction,
    pub tag: String,
    pub open_time: Nanos,
    pub open_price: Price,
    /// Quantity at open (grows when incremental opens merge into this lot).
    pub open_qty: Qty,
    /// Remaining quantity, frozen part included.
    pub volume: Qty,
    /// Part of `volume` pending exit.
    pub frozen: Qty,
    /// Realized P&L accumulated by exits from this lot.
    pub closed_profit: f64,
    pub last_exit_time: Option<Nanos>,
}

impl PositionDetail {
    /// Quantity available to a new exit.
    #[inline]
    pub fn available(&self) -> Qty {
        (self.volume - self.frozen).max(0.0)
    }

    /// Floating P&L at `mark`.
    #[inline]
    pub fn unrealized(&self, mark: Price) -> f64 {
        (mark - self.open_price) * self.volume * self.direction.sign()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.volume <= QTY_EPSILON
    }
}

/// Which profit a detail query reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfitFlag {
    /// Realized plus unrealized.
    Total,
    Realized,
    Unrealized,
}

impl ProfitFlag {
    /// Boundary encoding: 1 realized, 2 unrealized, anything else total.
    pub fn from_code(flag: i32) -> Self {
        match flag {
            1 => Self::Realized,
            2 => Self::Unrealized,
            _ => Self::Total,
        }
    }
}

// =============================================================================
// JOURNAL
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeAction {
    Open,
    Close,
}

/// Every ledger mutation, in order. Feeds the backtest blotter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub time: Nanos,
    pub code: String,
    pub direction: Direction,
    pub action: TradeAction,
    pub price: Price,
    pub qty: Qty,
    pub tag: String,
    pub fee: f64,
}

/// Realized round trip for (part of) one lot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseRecord {
    pub code: String,
    pub direction: Direction,
    pub open_time: Nanos,
    pub open_price: Price,
    pub close_time: Nanos,
    pub close_price: Price,
    pub qty: Qty,
    pub profit: f64,
    pub open_tag: String,
    pub close_tag: String,
}

/// Ledger step produced by `set_target_position`.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerAction {
    Open { direction: Direction, qty: Qty },
    Close { direction: Direction, qty: Qty },
}

// =============================================================================
// PER-INSTRUMENT SUMMARY
// =============================================================================

/// Per-instrument insertion-ordered lots plus cached aggregates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionSummary {
    pub code: String,
    lots: Vec<PositionDetail>,
    /// Fully closed lots, kept so tag queries still report realized profit.
    retired: Vec<PositionDetail>,
    long_qty: Qty,
    short_qty: Qty,
    closed_profit: f64,
    mark_price: Option<Price>,
    last_entry_time: Option<Nanos>,
    last_entry_price: Option<Price>,
    last_entry_tag: Option<String>,
    last_exit_time: Option<Nanos>,
}

impl PositionSummary {
    fn new(code: &str) -> Self {
        Self {
            code: code.to_string(),
            ..Default::default()
        }
    }

    pub fn lots(&self) -> &[PositionDetail] {
        &self.lots
    }

    pub fn retired(&self) -> &[PositionDetail] {
        &self.retired
    }

    /// Cached aggregate for one direction.
    pub fn qty(&self, direction: Direction) -> Qty {
        match direction {
            Direction::Long => self.long_qty,
            Direction::Short => self.short_qty,
        }
    }

    fn qty_mut(&mut self, direction: Direction) -> &mut Qty {
        match direction {
            Direction::Long => &mut self.long_qty,
            Direction::Short => &mut self.short_qty,
        }
    }

    pub fn frozen(&self, direction: Direction) -> Qty {
        self.lots
            .iter()
            .filter(|l| l.direction == direction)
            .map(|l| l.frozen)
            .sum()
    }

    /// Signed net position (long minus short).
    pub fn net(&self) -> Qty {
        self.long_qty - self.short_qty
    }

    pub fn closed_profit(&self) -> f64 {
        self.closed_profit
    }

    pub fn mark_price(&self) -> Option<Price> {
        self.mark_price
    }

    fn available(&self, direction: Direction, tag: Option<&str>) -> Qty {
        self.lots
            .iter()
            .filter(|l| l.direction == direction && tag.map_or(true, |t| l.tag == t))
            .map(PositionDetail::available)
            .sum()
    }

    fn retire_closed(&mut self) {
        let mut i = 0;
        while i < self.lots.len() {
            if self.lots[i].is_closed() {
                let mut lot = self.lots.remove(i);
                lot.volume = 0.0;
                lot.frozen = 0.0;
                self.retired.push(lot);
            } else {
                i += 1;
            }
        }
    }

    /// Live lot first (FIFO), then most recent retired lot.
    fn find_detail(&self, tag: &str) -> Option<&PositionDetail> {
        self.lots
            .iter()
            .find(|l| l.tag == tag)
            .or_else(|| self.retired.iter().rev().find(|l| l.tag == tag))
    }
}

// =============================================================================
// LEDGER
// =============================================================================

/// Ledger behaviour flags, fixed at context creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerConfig {
    /// Merge an open into the existing live lot with the same tag instead of
    /// appending a new lot.
    pub incremental: bool,
    /// Fee as a fraction of turnover, charged on opens and closes.
    pub commission_rate: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PositionLedger {
    config: LedgerConfig,
    positions: BTreeMap<String, PositionSummary>,
    trades: Vec<TradeRecord>,
    closes: Vec<CloseRecord>,
    total_fees: f64,
}

impl PositionLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn fee(&self, price: Price, qty: Qty) -> f64 {
        (price * qty * self.config.commission_rate).abs()
    }

    fn check_qty(qty: Qty) -> PlatformResult<()> {
        if !qty.is_finite() || qty <= QTY_EPSILON {
            return Err(PlatformError::InvalidQuantity(qty));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Open a lot (or merge into the same-tag lot in incremental mode).
    pub fn open_lot(
        &mut self,
        code: &str,
        direction: Direction,
        qty: Qty,
        tag: &str,
        price: Price,
        now: Nanos,
    ) -> PlatformResult<()> {
        Self::check_qty(qty)?;
        let fee = self.fee(price, qty);
        let incremental = self.config.incremental;
        let pos = self
            .positions
            .entry(code.to_string())
            .or_insert_with(|| PositionSummary::new(code));

        let merged = if incremental {
            match pos
                .lots
                .iter_mut()
                .find(|l| l.direction == direction && l.tag == tag)
            {
                Some(lot) => {
                    let total = lot.volume + qty;
                    lot.open_price = (lot.open_price * lot.volume + price * qty) / total;
                    lot.volume = total;
                    lot.open_qty += qty;
                    true
                }
                None => false,
            }
        } else {
            false
        };

        if !merged {
            pos.lots.push(PositionDetail {
                code: code.to_string(),
                direction,
                tag: tag.to_string(),
                open_time: now,
                open_price: price,
                open_qty: qty,
                volume: qty,
                frozen: 0.0,
                closed_profit: 0.0,
                last_exit_time: None,
            });
        }

        *pos.qty_mut(direction) += qty;
        pos.last_entry_time = Some(now);
        pos.last_entry_price = Some(price);
        pos.last_entry_tag = Some(tag.to_string());
        if pos.mark_price.is_none() {
            pos.mark_price = Some(price);
        }

        self.total_fees += fee;
        self.trades.push(TradeRecord {
            time: now,
            code: code.to_string(),
            direction,
            action: TradeAction::Open,
            price,
            qty,
            tag: tag.to_string(),
            fee,
        });
        Ok(())
    }

    /// Exit `qty` FIFO from the lots of `direction`, restricted to `tag` when given.
    /// Returns the realized profit. Rejected without mutation when the scope's
    /// unfrozen quantity is short.
    pub fn close_lot(
        &mut self,
        code: &str,
        direction: Direction,
        qty: Qty,
        tag: Option<&str>,
        price: Price,
        now: Nanos,
    ) -> PlatformResult<f64> {
        Self::check_qty(qty)?;
        let available = self
            .positions
            .get(code)
            .map(|p| p.available(direction, tag))
            .unwrap_or(0.0);
        if qty > available + QTY_EPSILON {
            return Err(PlatformError::OverExit {
                code: code.to_string(),
                requested: qty,
                available,
            });
        }

        let close_tag = tag.unwrap_or("").to_string();
        let mut left = qty;
        let mut realized = 0.0;
        let mut closes = Vec::new();
        let pos = match self.positions.get_mut(code) {
            Some(p) => p,
            None => return Err(PlatformError::OverExit {
                code: code.to_string(),
                requested: qty,
                available: 0.0,
            }),
        };

        for lot in pos.lots.iter_mut() {
            if left <= QTY_EPSILON {
                break;
            }
            if lot.direction != direction || tag.map_or(false, |t| lot.tag != t) {
                continue;
            }
            let take = left.min(lot.available());
            if take <= QTY_EPSILON {
                continue;
            }
            let profit = (price - lot.open_price) * take * direction.sign();
            lot.volume -= take;
            if lot.volume < QTY_EPSILON {
                lot.volume = 0.0;
            }
            lot.closed_profit += profit;
            lot.last_exit_time = Some(now);
            realized += profit;
            left -= take;
            closes.push(CloseRecord {
                code: code.to_string(),
                direction,
                open_time: lot.open_time,
                open_price: lot.open_price,
                close_time: now,
                close_price: price,
                qty: take,
                profit,
                open_tag: lot.tag.clone(),
                close_tag: close_tag.clone(),
            });
        }

        let closed = qty - left.max(0.0);
        let agg = pos.qty_mut(direction);
        *agg -= closed;
        if *agg < QTY_EPSILON {
            *agg = 0.0;
        }
        pos.closed_profit += realized;
        pos.last_exit_time = Some(now);
        pos.retire_closed();

        let fee = self.fee(price, closed);
        self.total_fees += fee;
        self.closes.extend(closes);
        self.trades.push(TradeRecord {
            time: now,
            code: code.to_string(),
            direction,
            action: TradeAction::Close,
            price,
            qty: closed,
            tag: close_tag,
            fee,
        });
        Ok(realized)
    }

    /// Move the signed net position to `target`, closing the opposite side first.
    pub fn set_target_position(
        &mut self,
        code: &str,
        target: Qty,
        tag: &str,
        price: Price,
        now: Nanos,
    ) -> PlatformResult<Vec<LedgerAction>> {
        if !target.is_finite() {
            return Err(PlatformError::InvalidQuantity(target));
        }
        let plan = self.plan_target(code, target);
        for action in &plan {
            match *action {
                LedgerAction::Close { direction, qty } => {
                    self.close_lot(code, direction, qty, None, price, now)?;
                }
                LedgerAction::Open { direction, qty } => {
                    self.open_lot(code, direction, qty, tag, price, now)?;
                }
            }
        }
        Ok(plan)
    }

    /// Steps that would take the net position to `target`; no mutation.
    pub fn plan_target(&self, code: &str, target: Qty) -> Vec<LedgerAction> {
        let current = self.position(code, false, None);
        let delta = target - current;
        let mut plan = Vec::new();
        if delta.abs() <= QTY_EPSILON {
            return plan;
        }
        let (close_dir, open_dir) = if delta > 0.0 {
            (Direction::Short, Direction::Long)
        } else {
            (Direction::Long, Direction::Short)
        };
        let want = delta.abs();
        let closable = self
            .positions
            .get(code)
            .map(|p| p.available(close_dir, None))
            .unwrap_or(0.0);
        let close_qty = want.min(closable);
        if close_qty > QTY_EPSILON {
            plan.push(LedgerAction::Close {
                direction: close_dir,
                qty: close_qty,
            });
        }
        let open_qty = want - close_qty;
        if open_qty > QTY_EPSILON {
            plan.push(LedgerAction::Open {
                direction: open_dir,
                qty: open_qty,
            });
        }
        plan
    }

    /// Reserve `qty` of the scope for a pending exit (FIFO).
    pub fn freeze(
        &mut self,
        code: &str,
        direction: Direction,
        qty: Qty,
        tag: Option<&str>,
    ) -> PlatformResult<()> {
        Self::check_qty(qty)?;
        let pos = self.positions.get_mut(code).ok_or(PlatformError::OverExit {
            code: code.to_string(),
            requested: qty,
            available: 0.0,
        })?;
        let available = pos.available(direction, tag);
        if qty > available + QTY_EPSILON {
            return Err(PlatformError::OverExit {
                code: code.to_string(),
                requested: qty,
                available,
            });
        }
        let mut left = qty;
        for lot in pos.lots.iter_mut() {
            if left <= QTY_EPSILON {
                break;
            }
            if lot.direction != direction || tag.map_or(false, |t| lot.tag != t) {
                continue;
            }
            let take = left.min(lot.available());
            lot.frozen += take;
            left -= take;
        }
        Ok(())
    }

    /// Release up to `qty` of frozen quantity (FIFO). Returns the amount released.
    pub fn unfreeze(&mut self, code: &str, direction: Direction, qty: Qty) -> Qty {
        let Some(pos) = self.positions.get_mut(code) else {
            return 0.0;
        };
        let mut left = qty.max(0.0);
        for lot in pos.lots.iter_mut() {
            if left <= QTY_EPSILON {
                break;
            }
            if lot.direction != direction {
                continue;
            }
            let take = left.min(lot.frozen);
            lot.frozen -= take;
            if lot.frozen < QTY_EPSILON {
                lot.frozen = 0.0;
            }
            left -= take;
        }
        qty.max(0.0) - left
    }

    /// Record the latest price used for unrealized P&L.
    pub fn update_mark(&mut self, code: &str, price: Price) {
        if let Some(pos) = self.positions.get_mut(code) {
            pos.mark_price = Some(price);
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn summary(&self, code: &str) -> Option<&PositionSummary> {
        self.positions.get(code)
    }

    pub fn summaries(&self) -> impl Iterator<Item = &PositionSummary> {
        self.positions.values()
    }

    /// Signed net position. `valid_only` excludes frozen quantity; a tag restricts
    /// the sum to that tag's live lots.
    pub fn position(&self, code: &str, valid_only: bool, tag: Option<&str>) -> Qty {
        let Some(pos) = self.positions.get(code) else {
            return 0.0;
        };
        if tag.is_none() && !valid_only {
            return pos.net();
        }
        pos.lots
            .iter()
            .filter(|l| tag.map_or(true, |t| l.tag == t))
            .map(|l| {
                let q = if valid_only { l.available() } else { l.volume };
                q * l.direction.sign()
            })
            .sum()
    }

    /// Unsigned aggregate for one direction.
    pub fn position_of(&self, code: &str, direction: Direction, valid_only: bool) -> Qty {
        let Some(pos) = self.positions.get(code) else {
            return 0.0;
        };
        if valid_only {
            pos.available(direction, None)
        } else {
            pos.qty(direction)
        }
    }

    /// Quantity-weighted mean open price of the lots on the net side.
    /// Zero when flat, hedged flat included.
    pub fn avg_price(&self, code: &str) -> Price {
        let net = self.position(code, false, None);
        if net > QTY_EPSILON {
            self.avg_price_of(code, Direction::Long)
        } else if net < -QTY_EPSILON {
            self.avg_price_of(code, Direction::Short)
        } else {
            0.0
        }
    }

    /// Quantity-weighted mean open price of the live lots in one direction.
    pub fn avg_price_of(&self, code: &str, direction: Direction) -> Price {
        let Some(pos) = self.positions.get(code) else {
            return 0.0;
        };
        let (notional, qty) = pos
            .lots
            .iter()
            .filter(|l| l.direction == direction)
            .fold((0.0, 0.0), |(n, q), l| (n + l.open_price * l.volume, q + l.volume));
        if qty <= QTY_EPSILON {
            0.0
        } else {
            notional / qty
        }
    }

    /// Floating P&L of the live lots at the last mark.
    pub fn position_profit(&self, code: &str) -> f64 {
        let Some(pos) = self.positions.get(code) else {
            return 0.0;
        };
        let Some(mark) = pos.mark_price else {
            return 0.0;
        };
        pos.lots.iter().map(|l| l.unrealized(mark)).sum()
    }

    pub fn detail(&self, code: &str, tag: &str) -> Option<&PositionDetail> {
        self.positions.get(code).and_then(|p| p.find_detail(tag))
    }

    /// Open price of the lot with `tag`.
    pub fn detail_cost(&self, code: &str, tag: &str) -> Price {
        self.detail(code, tag).map_or(0.0, |l| l.open_price)
    }

    pub fn detail_entry_time(&self, code: &str, tag: &str) -> Option<Nanos> {
        self.detail(code, tag).map(|l| l.open_time)
    }

    pub fn detail_profit(&self, code: &str, tag: &str, flag: ProfitFlag) -> f64 {
        let Some(pos) = self.positions.get(code) else {
            return 0.0;
        };
        let Some(lot) = pos.find_detail(tag) else {
            return 0.0;
        };
        let unrealized = pos.mark_price.map_or(0.0, |m| lot.unrealized(m));
        match flag {
            ProfitFlag::Realized => lot.closed_profit,
            ProfitFlag::Unrealized => unrealized,
            ProfitFlag::Total => lot.closed_profit + unrealized,
        }
    }

    pub fn first_entry_time(&self, code: &str) -> Option<Nanos> {
        self.positions
            .get(code)
            .and_then(|p| p.lots.iter().map(|l| l.open_time).min())
    }

    pub fn last_entry_time(&self, code: &str) -> Option<Nanos> {
        self.positions.get(code).and_then(|p| p.last_entry_time)
    }

    pub fn last_exit_time(&self, code: &str) -> Option<Nanos> {
        self.positions.get(code).and_then(|p| p.last_exit_time)
    }

    pub fn last_entry_price(&self, code: &str) -> Price {
        self.positions
            .get(code)
            .and_then(|p| p.last_entry_price)
            .unwrap_or(0.0)
    }

    pub fn last_entry_tag(&self, code: &str) -> Option<&str> {
        self.positions
            .get(code)
            .and_then(|p| p.last_entry_tag.as_deref())
    }

    /// `(code, signed net)` for every instrument with a non-flat position.
    pub fn all_positions(&self) -> Vec<(String, Qty)> {
        self.positions
            .values()
            .filter(|p| p.long_qty > QTY_EPSILON || p.short_qty > QTY_EPSILON)
            .map(|p| (p.code.clone(), p.net()))
            .collect()
    }

    pub fn closed_profit(&self) -> f64 {
        self.positions.values().map(|p| p.closed_profit).sum()
    }

    pub fn dynamic_profit(&self) -> f64 {
        self.positions
            .keys()
            .map(|code| self.position_profit(code))
            .sum()
    }

    pub fn total_fees(&self) -> f64 {
        self.total_fees
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn closes(&self) -> &[CloseRecord] {
        &self.closes
    }

    /// Cached aggregates equal the lot sums and no quantity is negative.
    pub fn check_invariants(&self) -> bool {
        self.positions.values().all(|p| {
            let mut long = 0.0;
            let mut short = 0.0;
            for lot in &p.lots {
                if lot.volume < 0.0 || lot.frozen < 0.0 || lot.frozen > lot.volume + QTY_EPSILON {
                    return false;
                }
                match lot.direction {
                    Direction::Long => long += lot.volume,
                    Direction::Short => short += lot.volume,
                }
            }
            (long - p.long_qty).abs() <= 1e-6 && (short - p.short_qty).abs() <= 1e-6
        })
    }
}
