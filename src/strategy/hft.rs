//! HFT Context
//!
//! Order-level strategies. Orders are simulated against the quote stream: a resting
//! order fills completely on the first later tick whose opposite side crosses its
//! price. Fill-and-kill and fill-or-kill orders that do not fill on that tick are
//! cancelled.
//!
//! A sell against a long holding freezes the covered quantity until the order fills
//! or is cancelled; any excess opens a short. Buys against a short holding mirror
//! this.

use crate::ingest::TopicKind;
use crate::market::{
    Bar, BarPeriod, Direction, MarketEvent, OrderDetail, OrderQueue, Price, Qty, Tick, Transaction,
};
use crate::strategy::callbacks::{HftFactory, HftStrategy};
use crate::strategy::context::{ContextApi, ContextCore, StepGate, TICK_CACHE_LEN};
use crate::strategy::ledger::QTY_EPSILON;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderFlag {
    #[default]
    Normal,
    /// Fill and kill.
    Fak,
    /// Fill or kill.
    Fok,
}

impl OrderFlag {
    pub fn from_code(flag: u32) -> Self {
        match flag {
            1 => OrderFlag::Fak,
            2 => OrderFlag::Fok,
            _ => OrderFlag::Normal,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimOrder {
    pub local_id: u32,
    pub code: String,
    pub is_buy: bool,
    /// Limit price; zero or less trades at the next quote.
    pub price: Price,
    pub qty: Qty,
    pub left: Qty,
    pub tag: String,
    pub flag: OrderFlag,
    /// Holding frozen on the closing side.
    frozen: Qty,
}

impl SimOrder {
    fn close_direction(&self) -> Direction {
        if self.is_buy {
            Direction::Short
        } else {
            Direction::Long
        }
    }

    /// Execution price against `tick`, if the order crosses.
    fn cross(&self, tick: &Tick) -> Option<Price> {
        let quote = if self.is_buy {
            tick.buy_price()
        } else {
            tick.sell_price()
        };
        if !(quote > 0.0) {
            return None;
        }
        let crosses = self.price <= 0.0
            || if self.is_buy {
                quote <= self.price
            } else {
                quote >= self.price
            };
        crosses.then_some(quote)
    }
}

#[derive(Debug, Clone)]
enum HftNotice {
    Entrust {
        local_id: u32,
        code: String,
        success: bool,
        message: String,
        tag: String,
    },
    Order {
        local_id: u32,
        code: String,
        is_buy: bool,
        total: Qty,
        left: Qty,
        price: Price,
        canceled: bool,
        tag: String,
    },
    Trade {
        local_id: u32,
        code: String,
        is_buy: bool,
        qty: Qty,
        price: Price,
        tag: String,
    },
}

fn push_capped<T>(cache: &mut VecDeque<T>, item: T) {
    if cache.len() == TICK_CACHE_LEN {
        cache.pop_front();
    }
    cache.push_back(item);
}

fn tail<T: Clone>(cache: Option<&VecDeque<T>>, count: usize) -> Vec<T> {
    cache.map_or_else(Vec::new, |c| {
        c.iter().skip(c.len().saturating_sub(count)).cloned().collect()
    })
}

pub struct HftContext {
    core: ContextCore,
    orders: BTreeMap<u32, SimOrder>,
    next_id: u32,
    notices: Vec<HftNotice>,
    ordques: HashMap<String, VecDeque<OrderQueue>>,
    orddtls: HashMap<String, VecDeque<OrderDetail>>,
    transes: HashMap<String, VecDeque<Transaction>>,
    gate: Option<Arc<StepGate>>,
}

impl ContextApi for HftContext {
    fn core(&self) -> &ContextCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ContextCore {
        &mut self.core
    }
}

impl HftContext {
    pub fn new(core: ContextCore, gate: Option<Arc<StepGate>>) -> Self {
        Self {
            core,
            orders: BTreeMap::new(),
            next_id: 1,
            notices: Vec::new(),
            ordques: HashMap::new(),
            orddtls: HashMap::new(),
            transes: HashMap::new(),
            gate,
        }
    }

    // -------------------------------------------------------------------------
    // Data
    // -------------------------------------------------------------------------

    pub fn get_bars(&mut self, code: &str, period: BarPeriod, count: usize) -> Vec<Bar> {
        self.core.route(code, TopicKind::Bar(period));
        self.core.bars(code, period, count)
    }

    pub fn sub_order_queue(&mut self, code: &str) {
        self.core.route(code, TopicKind::OrderQueue);
    }

    pub fn sub_order_detail(&mut self, code: &str) {
        self.core.route(code, TopicKind::OrderDetail);
    }

    pub fn sub_transactions(&mut self, code: &str) {
        self.core.route(code, TopicKind::Transaction);
    }

    pub fn get_ordque(&self, code: &str, count: usize) -> Vec<OrderQueue> {
        tail(self.ordques.get(code), count)
    }

    pub fn get_orddtl(&self, code: &str, count: usize) -> Vec<OrderDetail> {
        tail(self.orddtls.get(code), count)
    }

    pub fn get_trans(&self, code: &str, count: usize) -> Vec<Transaction> {
        tail(self.transes.get(code), count)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    pub fn buy(&mut self, code: &str, price: Price, qty: Qty, tag: &str, flag: u32) -> Vec<u32> {
        self.place(code, true, price, qty, tag, OrderFlag::from_code(flag))
    }

    pub fn sell(&mut self, code: &str, price: Price, qty: Qty, tag: &str, flag: u32) -> Vec<u32> {
        self.place(code, false, price, qty, tag, OrderFlag::from_code(flag))
    }

    fn place(
        &mut self,
        code: &str,
        is_buy: bool,
        price: Price,
        qty: Qty,
        tag: &str,
        flag: OrderFlag,
    ) -> Vec<u32> {
        if !(qty > QTY_EPSILON) || !qty.is_finite() {
            warn!(context = %self.core.name(), code = %code, qty, "Rejected non-positive quantity");
            return Vec::new();
        }
        let local_id = self.next_id;
        self.next_id += 1;

        let mut order = SimOrder {
            local_id,
            code: code.to_string(),
            is_buy,
            price,
            qty,
            left: qty,
            tag: tag.to_string(),
            flag,
            frozen: 0.0,
        };
        let close_dir = order.close_direction();
        let held = self.core.ledger.position_of(code, close_dir, true);
        let cover = qty.min(held);
        if cover > QTY_EPSILON {
            match self.core.ledger.freeze(code, close_dir, cover, None) {
                Ok(()) => order.frozen = cover,
                Err(e) => warn!(context = %self.core.name(), code = %code, error = %e, "Freeze failed"),
            }
        }
        debug!(
            context = %self.core.name(),
            local_id,
            code = %code,
            is_buy,
            price,
            qty,
            frozen = order.frozen,
            "Order placed"
        );
        self.notices.push(HftNotice::Entrust {
            local_id,
            code: code.to_string(),
            success: true,
            message: String::new(),
            tag: tag.to_string(),
        });
        self.orders.insert(local_id, order);
        vec![local_id]
    }

    /// Cancel a live order. Returns false for unknown or finished ids.
    pub fn cancel(&mut self, local_id: u32) -> bool {
        let Some(order) = self.orders.remove(&local_id) else {
            return false;
        };
        self.retire_cancelled(order);
        true
    }

    /// Cancel every live order of `code` on one side. Returns the cancelled ids.
    pub fn cancel_all(&mut self, code: &str, is_buy: bool) -> Vec<u32> {
        let ids: Vec<u32> = self
            .orders
            .values()
            .filter(|o| o.code == code && o.is_buy == is_buy)
            .map(|o| o.local_id)
            .collect();
        for id in &ids {
            self.cancel(*id);
        }
        ids
    }

    /// Signed unfilled quantity of `code`: buys positive, sells negative.
    pub fn get_undone(&self, code: &str) -> Qty {
        self.orders
            .values()
            .filter(|o| o.code == code)
            .map(|o| if o.is_buy { o.left } else { -o.left })
            .sum()
    }

    pub fn live_orders(&self) -> impl Iterator<Item = &SimOrder> {
        self.orders.values()
    }

    fn retire_cancelled(&mut self, order: SimOrder) {
        if order.frozen > QTY_EPSILON {
            self.core
                .ledger
                .unfreeze(&order.code, order.close_direction(), order.frozen);
        }
        self.notices.push(HftNotice::Order {
            local_id: order.local_id,
            code: order.code,
            is_buy: order.is_buy,
            total: order.qty,
            left: order.left,
            price: order.price,
            canceled: true,
            tag: order.tag,
        });
    }

    /// Match live orders of the tick's instrument, in id order.
    fn match_orders(&mut self, tick: &Tick) {
        let ids: Vec<u32> = self
            .orders
            .values()
            .filter(|o| o.code == tick.code)
            .map(|o| o.local_id)
            .collect();
        for id in ids {
            let Some(order) = self.orders.remove(&id) else {
                continue;
            };
            match order.cross(tick) {
                Some(quote) => self.fill(order, quote),
                None if order.flag != OrderFlag::Normal => self.retire_cancelled(order),
                None => {
                    self.orders.insert(id, order);
                }
            }
        }
    }

    fn fill(&mut self, order: SimOrder, quote: Price) {
        let price = self.core.fill_price(&order.code, quote, order.is_buy);
        let now = self.core.now();
        let close_dir = order.close_direction();
        let ledger = &mut self.core.ledger;

        let mut result = Ok(());
        if order.frozen > QTY_EPSILON {
            ledger.unfreeze(&order.code, close_dir, order.frozen);
            result = ledger
                .close_lot(&order.code, close_dir, order.frozen, None, price, now)
                .map(|_| ());
        }
        let open = order.qty - order.frozen;
        if result.is_ok() && open > QTY_EPSILON {
            result = ledger.open_lot(&order.code, close_dir.opposite(), open, &order.tag, price, now);
        }
        if let Err(e) = result {
            warn!(context = %self.core.name(), local_id = order.local_id, error = %e, "Fill rejected");
        }

        self.notices.push(HftNotice::Trade {
            local_id: order.local_id,
            code: order.code.clone(),
            is_buy: order.is_buy,
            qty: order.qty,
            price,
            tag: order.tag.clone(),
        });
        self.notices.push(HftNotice::Order {
            local_id: order.local_id,
            code: order.code,
            is_buy: order.is_buy,
            total: order.qty,
            left: 0.0,
            price: order.price,
            canceled: false,
            tag: order.tag,
        });
    }

    fn record_l2(&mut self, event: &MarketEvent) {
        match event {
            MarketEvent::OrderQueue(q) => {
                push_capped(self.ordques.entry(q.code.clone()).or_default(), q.clone())
            }
            MarketEvent::OrderDetail(d) => {
                push_capped(self.orddtls.entry(d.code.clone()).or_default(), d.clone())
            }
            MarketEvent::Transaction(t) => {
                push_capped(self.transes.entry(t.code.clone()).or_default(), t.clone())
            }
            _ => {}
        }
    }

    pub(crate) fn reset_run_state(&mut self) {
        self.core.reset_run_state();
        self.orders.clear();
        self.notices.clear();
        self.ordques.clear();
        self.orddtls.clear();
        self.transes.clear();
        self.next_id = 1;
    }
}

pub struct HftRunner {
    pub(crate) ctx: HftContext,
    strategy: Box<dyn HftStrategy>,
    factory: HftFactory,
}

impl HftRunner {
    pub fn new(ctx: HftContext, factory: HftFactory) -> Self {
        let strategy = factory(ctx.core.name());
        Self {
            ctx,
            strategy,
            factory,
        }
    }

    pub fn context(&self) -> &HftContext {
        &self.ctx
    }

    /// `on_init` followed by `on_channel_ready`.
    pub fn on_init(&mut self) {
        self.strategy.on_init(&mut self.ctx);
        self.drain_notices();
        self.strategy.on_channel_ready(&mut self.ctx);
        self.drain_notices();
    }

    pub fn on_session_begin(&mut self, tdate: u32) {
        self.strategy.on_session_begin(&mut self.ctx, tdate);
        self.drain_notices();
    }

    pub fn on_session_end(&mut self, tdate: u32) {
        self.strategy.on_session_end(&mut self.ctx, tdate);
        self.drain_notices();
        self.ctx.core.record_session(tdate);
    }

    pub fn on_channel_lost(&mut self) {
        self.strategy.on_channel_lost(&mut self.ctx);
        self.drain_notices();
    }

    pub fn on_backtest_end(&mut self) {
        self.strategy.on_backtest_end(&mut self.ctx);
    }

    pub fn on_market_event(&mut self, event: &MarketEvent) {
        self.ctx.core.observe(event);
        self.ctx.record_l2(event);
        match event {
            MarketEvent::Quote(tick) => {
                self.ctx.match_orders(tick);
                self.drain_notices();
                if self.ctx.core.tick_subs().contains(&tick.code) {
                    if let Some(gate) = &self.ctx.gate {
                        if !gate.wait(&self.ctx.core.env().status) {
                            return;
                        }
                    }
                    self.strategy.on_tick(&mut self.ctx, tick);
                }
            }
            MarketEvent::Bar { period, bar } => {
                if self.ctx.core.bar_subs().contains(&(bar.code.clone(), *period)) {
                    self.strategy.on_bar(&mut self.ctx, &bar.code, *period, bar);
                }
            }
            MarketEvent::OrderQueue(q) => self.strategy.on_order_queue(&mut self.ctx, q),
            MarketEvent::OrderDetail(d) => self.strategy.on_order_detail(&mut self.ctx, d),
            MarketEvent::Transaction(t) => self.strategy.on_transaction(&mut self.ctx, t),
        }
        self.drain_notices();
    }

    fn drain_notices(&mut self) {
        while !self.ctx.notices.is_empty() {
            let notices = std::mem::take(&mut self.ctx.notices);
            for n in notices {
                let ctx = &mut self.ctx;
                match n {
                    HftNotice::Entrust {
                        local_id,
                        code,
                        success,
                        message,
                        tag,
                    } => self
                        .strategy
                        .on_entrust(ctx, local_id, &code, success, &message, &tag),
                    HftNotice::Order {
                        local_id,
                        code,
                        is_buy,
                        total,
                        left,
                        price,
                        canceled,
                        tag,
                    } => self.strategy.on_order(
                        ctx, local_id, &code, is_buy, total, left, price, canceled, &tag,
                    ),
                    HftNotice::Trade {
                        local_id,
                        code,
                        is_buy,
                        qty,
                        price,
                        tag,
                    } => self
                        .strategy
                        .on_trade(ctx, local_id, &code, is_buy, qty, price, &tag),
                }
            }
        }
    }

    pub fn reset_for_run(&mut self) {
        self.ctx.reset_run_state();
        self.strategy = (self.factory)(self.ctx.core.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::context::test_support::{core, env};
    use crate::strategy::context::ContextKind;

    fn ctx() -> HftContext {
        HftContext::new(core(ContextKind::Hft, env()), None)
    }

    fn quote(bid: f64, ask: f64) -> Tick {
        Tick {
            code: "SZSE.000001".into(),
            time: 1,
            price: (bid + ask) / 2.0,
            bid_price: bid,
            bid_qty: 100.0,
            ask_price: ask,
            ask_qty: 100.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_buy_fills_when_ask_crosses() {
        let mut c = ctx();
        let ids = c.buy("SZSE.000001", 10.0, 100.0, "b", 0);
        assert_eq!(ids, vec![1]);
        assert_eq!(c.get_undone("SZSE.000001"), 100.0);

        c.match_orders(&quote(10.1, 10.2));
        assert_eq!(c.get_position("SZSE.000001", false, ""), 0.0);
        c.match_orders(&quote(9.9, 10.0));
        assert_eq!(c.get_position("SZSE.000001", false, ""), 100.0);
        assert_eq!(c.get_position_avgpx("SZSE.000001"), 10.0);
        assert_eq!(c.get_undone("SZSE.000001"), 0.0);
    }

    #[test]
    fn test_sell_freezes_then_closes() {
        let mut c = ctx();
        c.buy("SZSE.000001", 0.0, 100.0, "b", 0);
        c.match_orders(&quote(9.9, 10.0));

        let id = c.sell("SZSE.000001", 11.0, 150.0, "s", 0)[0];
        assert_eq!(c.get_position("SZSE.000001", true, ""), 0.0);
        assert_eq!(c.get_position("SZSE.000001", false, ""), 100.0);
        assert_eq!(c.get_undone("SZSE.000001"), -150.0);

        assert!(c.cancel(id));
        assert!(!c.cancel(id));
        assert_eq!(c.get_position("SZSE.000001", true, ""), 100.0);

        c.sell("SZSE.000001", 11.0, 150.0, "s", 0);
        c.match_orders(&quote(11.0, 11.1));
        assert_eq!(c.get_position("SZSE.000001", false, ""), -50.0);
        assert_eq!(c.get_fund_data(1), 100.0);
    }

    #[test]
    fn test_fak_cancelled_when_not_crossing() {
        let mut c = ctx();
        c.buy("SZSE.000001", 9.0, 10.0, "", 1);
        c.buy("SZSE.000001", 9.0, 10.0, "", 0);
        c.match_orders(&quote(9.5, 9.6));
        assert_eq!(c.live_orders().count(), 1);
        assert_eq!(c.cancel_all("SZSE.000001", true), vec![2]);
        assert_eq!(c.get_undone("SZSE.000001"), 0.0);
    }

    #[test]
    fn test_l2_cache() {
        let mut c = ctx();
        for i in 0..3 {
            c.record_l2(&MarketEvent::Transaction(Transaction {
                code: "SZSE.000001".into(),
                index: i,
                ..Default::default()
            }));
        }
        let last = c.get_trans("SZSE.000001", 2);
        assert_eq!(last.iter().map(|t| t.index).collect::<Vec<_>>(), vec![1, 2]);
        assert!(c.get_ordque("SZSE.000001", 5).is_empty());
    }
}
