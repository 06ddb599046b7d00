//! CTA Context
//!
//! Bar-driven strategies. Entries and exits are tagged; when a limit or stop price is
//! given the action becomes a condition order that is checked against every later
//! tick or bar of the instrument and cleared at the next calc.
//!
//! # Calc cycle
//! 1. bars of every subscribed (code, period) are delivered through `on_bar`
//! 2. when the main bar closes, pending conditions are dropped and `on_calc` runs
//! 3. conditions set during `on_calc` live until the next main bar

use crate::market::{Bar, BarPeriod, Direction, MarketEvent, Price, Qty};
use crate::ingest::TopicKind;
use crate::replay::clock::{nanos_to_hhmm, nanos_to_ymd};
use crate::strategy::callbacks::{CtaFactory, CtaStrategy};
use crate::strategy::chart::{ChartRegistry, IndexKind};
use crate::strategy::context::{ContextApi, ContextCore, StepGate};
use crate::strategy::ledger::QTY_EPSILON;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a CTA action does to the position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CtaAction {
    EnterLong,
    ExitLong,
    EnterShort,
    ExitShort,
    /// Move the net position to the given signed target.
    SetPosition(Qty),
}

impl CtaAction {
    fn is_buy(&self, current: Qty) -> bool {
        match *self {
            CtaAction::EnterLong | CtaAction::ExitShort => true,
            CtaAction::ExitLong | CtaAction::EnterShort => false,
            CtaAction::SetPosition(target) => target > current,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    /// Fill at the price or better.
    Limit,
    /// Fill once the price trades through.
    Stop,
}

/// Pending condition order.
#[derive(Debug, Clone, PartialEq)]
pub struct CondOrder {
    pub code: String,
    pub action: CtaAction,
    pub qty: Qty,
    pub tag: String,
    pub price: Price,
    pub kind: ConditionKind,
}

impl CondOrder {
    /// Trigger check against the traded range `[low, high]`.
    fn triggered(&self, is_buy: bool, low: Price, high: Price) -> bool {
        match (is_buy, self.kind) {
            (true, ConditionKind::Limit) => low <= self.price,
            (true, ConditionKind::Stop) => high >= self.price,
            (false, ConditionKind::Limit) => high >= self.price,
            (false, ConditionKind::Stop) => low <= self.price,
        }
    }
}

#[derive(Debug, Clone)]
struct TriggerNotice {
    code: String,
    target: Qty,
    price: Price,
    tag: String,
}

pub struct CtaContext {
    core: ContextCore,
    main_key: Option<(String, BarPeriod)>,
    conditions: Vec<CondOrder>,
    notices: Vec<TriggerNotice>,
    chart: ChartRegistry,
    gate: Option<Arc<StepGate>>,
}

impl ContextApi for CtaContext {
    fn core(&self) -> &ContextCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ContextCore {
        &mut self.core
    }
}

impl CtaContext {
    /// `gate` makes the context hooked: every calc waits for a step.
    pub fn new(core: ContextCore, gate: Option<Arc<StepGate>>) -> Self {
        Self {
            core,
            main_key: None,
            conditions: Vec::new(),
            notices: Vec::new(),
            chart: ChartRegistry::default(),
            gate,
        }
    }

    pub fn main_key(&self) -> Option<&(String, BarPeriod)> {
        self.main_key.as_ref()
    }

    pub fn conditions(&self) -> &[CondOrder] {
        &self.conditions
    }

    pub fn chart(&self) -> &ChartRegistry {
        &self.chart
    }

    // -------------------------------------------------------------------------
    // Data
    // -------------------------------------------------------------------------

    /// Closed bars up to now. Subscribes the (code, period) pair; `is_main` makes it
    /// the bar that drives `on_calc` (the first main key wins).
    pub fn get_bars(&mut self, code: &str, period: BarPeriod, count: usize, is_main: bool) -> Vec<Bar> {
        self.core.route(code, TopicKind::Bar(period));
        if is_main {
            match &self.main_key {
                None => self.main_key = Some((code.to_string(), period)),
                Some((c, p)) if c == code && *p == period => {}
                Some((c, p)) => warn!(
                    context = %self.core.name(),
                    main = %format!("{}/{}", c, p),
                    requested = %format!("{}/{}", code, period),
                    "Main bar already set"
                ),
            }
        }
        self.core.bars(code, period, count)
    }

    /// Deliver bars of (code, period) to `on_bar` without fetching history.
    pub fn sub_bar_events(&mut self, code: &str, period: BarPeriod) {
        self.core.route(code, TopicKind::Bar(period));
    }

    // -------------------------------------------------------------------------
    // Trading
    // -------------------------------------------------------------------------

    pub fn enter_long(&mut self, code: &str, qty: Qty, tag: &str, limit: Price, stop: Price) {
        self.submit(code, CtaAction::EnterLong, qty, tag, limit, stop);
    }

    pub fn exit_long(&mut self, code: &str, qty: Qty, tag: &str, limit: Price, stop: Price) {
        self.submit(code, CtaAction::ExitLong, qty, tag, limit, stop);
    }

    pub fn enter_short(&mut self, code: &str, qty: Qty, tag: &str, limit: Price, stop: Price) {
        self.submit(code, CtaAction::EnterShort, qty, tag, limit, stop);
    }

    pub fn exit_short(&mut self, code: &str, qty: Qty, tag: &str, limit: Price, stop: Price) {
        self.submit(code, CtaAction::ExitShort, qty, tag, limit, stop);
    }

    /// Move the signed net position of `code` to `qty`.
    pub fn set_position(&mut self, code: &str, qty: Qty, tag: &str, limit: Price, stop: Price) {
        if !qty.is_finite() {
            warn!(context = %self.core.name(), code = %code, qty, "Rejected non-finite target");
            return;
        }
        self.submit(code, CtaAction::SetPosition(qty), qty.abs(), tag, limit, stop);
    }

    fn submit(&mut self, code: &str, action: CtaAction, qty: Qty, tag: &str, limit: Price, stop: Price) {
        let sized = !matches!(action, CtaAction::SetPosition(_));
        if sized && (!(qty > QTY_EPSILON) || !qty.is_finite()) {
            warn!(context = %self.core.name(), code = %code, qty, "Rejected non-positive quantity");
            return;
        }
        let condition = if limit > 0.0 {
            Some((limit, ConditionKind::Limit))
        } else if stop > 0.0 {
            Some((stop, ConditionKind::Stop))
        } else {
            None
        };
        match condition {
            Some((price, kind)) => {
                debug!(
                    context = %self.core.name(),
                    code = %code,
                    action = ?action,
                    price,
                    kind = ?kind,
                    "Condition order set"
                );
                self.conditions.push(CondOrder {
                    code: code.to_string(),
                    action,
                    qty,
                    tag: tag.to_string(),
                    price,
                    kind,
                });
            }
            None => {
                let Some(price) = self.core.last_price(code) else {
                    warn!(context = %self.core.name(), code = %code, "No price yet; action rejected");
                    return;
                };
                self.execute(code, action, qty, tag, price);
            }
        }
    }

    /// Apply an action to the ledger at `raw` price (slippage added here).
    fn execute(&mut self, code: &str, action: CtaAction, qty: Qty, tag: &str, raw: Price) {
        let now = self.core.now();
        let current = self.core.ledger.position(code, false, None);
        let is_buy = action.is_buy(current);
        let price = self.core.fill_price(code, raw, is_buy);
        let name = self.core.name().to_string();
        let ledger = &mut self.core.ledger;

        let result = match action {
            CtaAction::EnterLong | CtaAction::EnterShort => {
                let (open_dir, opposite) = if action == CtaAction::EnterLong {
                    (Direction::Long, Direction::Short)
                } else {
                    (Direction::Short, Direction::Long)
                };
                let held = ledger.position_of(code, opposite, true);
                let closed = if held > QTY_EPSILON {
                    ledger.close_lot(code, opposite, held, None, price, now).map(|_| ())
                } else {
                    Ok(())
                };
                closed.and_then(|_| ledger.open_lot(code, open_dir, qty, tag, price, now))
            }
            CtaAction::ExitLong | CtaAction::ExitShort => {
                let dir = if action == CtaAction::ExitLong {
                    Direction::Long
                } else {
                    Direction::Short
                };
                // a tag scopes the exit to that tag's lots; an empty tag exits FIFO
                let scope = (!tag.is_empty()).then_some(tag);
                ledger.close_lot(code, dir, qty, scope, price, now).map(|_| ())
            }
            CtaAction::SetPosition(target) => ledger
                .set_target_position(code, target, tag, price, now)
                .map(|_| ()),
        };
        if let Err(e) = result {
            warn!(context = %name, code = %code, error = %e, "CTA action rejected");
        }
    }

    /// Fire conditions of `code` whose trigger lies inside `[low, high]`.
    fn check_conditions(&mut self, code: &str, low: Price, high: Price) {
        if self.conditions.is_empty() {
            return;
        }
        let mut fired = Vec::new();
        let mut i = 0;
        while i < self.conditions.len() {
            let cond = &self.conditions[i];
            if cond.code != code {
                i += 1;
                continue;
            }
            let current = self.core.ledger.position(code, false, None);
            if cond.triggered(cond.action.is_buy(current), low, high) {
                fired.push(self.conditions.remove(i));
            } else {
                i += 1;
            }
        }
        for cond in fired {
            self.execute(&cond.code, cond.action, cond.qty, &cond.tag, cond.price);
            let target = self.core.ledger.position(&cond.code, false, None);
            self.notices.push(TriggerNotice {
                code: cond.code,
                target,
                price: cond.price,
                tag: cond.tag,
            });
        }
    }

    // -------------------------------------------------------------------------
    // Chart
    // -------------------------------------------------------------------------

    pub fn set_chart_kline(&mut self, code: &str, period: BarPeriod) {
        self.chart.set_kline(code, period);
    }

    pub fn add_chart_mark(&mut self, price: Price, icon: &str, tag: &str) {
        let now = self.core.now();
        self.chart.add_mark(now, price, icon, tag);
    }

    /// `kind`: 0 main panel, otherwise sub panel.
    pub fn register_index(&mut self, name: &str, kind: u32) {
        self.chart.register_index(name, IndexKind::from_code(kind));
    }

    pub fn register_index_line(&mut self, index: &str, line: &str, style: u32) -> bool {
        self.chart.register_line(index, line, style)
    }

    pub fn add_index_baseline(&mut self, index: &str, line: &str, value: f64) -> bool {
        self.chart.add_baseline(index, line, value)
    }

    pub fn set_index_value(&mut self, index: &str, line: &str, value: f64) -> bool {
        let now = self.core.now();
        self.chart.set_value(index, line, now, value)
    }

    pub(crate) fn reset_run_state(&mut self) {
        self.core.reset_run_state();
        self.conditions.clear();
        self.notices.clear();
        self.chart.clear_series();
    }
}

/// A CTA context paired with its callback instance.
pub struct CtaRunner {
    pub(crate) ctx: CtaContext,
    strategy: Box<dyn CtaStrategy>,
    factory: CtaFactory,
}

impl CtaRunner {
    pub fn new(ctx: CtaContext, factory: CtaFactory) -> Self {
        let strategy = factory(ctx.core.name());
        Self {
            ctx,
            strategy,
            factory,
        }
    }

    pub fn context(&self) -> &CtaContext {
        &self.ctx
    }

    pub fn on_init(&mut self) {
        self.strategy.on_init(&mut self.ctx);
    }

    pub fn on_session_begin(&mut self, tdate: u32) {
        self.strategy.on_session_begin(&mut self.ctx, tdate);
    }

    pub fn on_session_end(&mut self, tdate: u32) {
        self.strategy.on_session_end(&mut self.ctx, tdate);
        self.ctx.core.record_session(tdate);
    }

    pub fn on_backtest_end(&mut self) {
        self.strategy.on_backtest_end(&mut self.ctx);
    }

    pub fn on_market_event(&mut self, event: &MarketEvent) {
        self.ctx.core.observe(event);
        match event {
            MarketEvent::Quote(tick) => {
                self.ctx.check_conditions(&tick.code, tick.price, tick.price);
                self.drain_notices();
                if self.ctx.core.tick_subs().contains(&tick.code) {
                    self.strategy.on_tick(&mut self.ctx, tick);
                }
            }
            MarketEvent::Bar { period, bar } => {
                self.ctx.check_conditions(&bar.code, bar.low, bar.high);
                self.drain_notices();
                let key = (bar.code.clone(), *period);
                if self.ctx.core.bar_subs().contains(&key) {
                    self.strategy.on_bar(&mut self.ctx, &bar.code, *period, bar);
                }
                if self.ctx.main_key.as_ref() == Some(&key) {
                    self.calc(bar.time);
                }
            }
            _ => {}
        }
        self.drain_notices();
    }

    fn calc(&mut self, time: i64) {
        if let Some(gate) = &self.ctx.gate {
            if !gate.wait(&self.ctx.core.env().status) {
                return;
            }
        }
        self.ctx.conditions.clear();
        self.strategy
            .on_calc(&mut self.ctx, nanos_to_ymd(time), nanos_to_hhmm(time));
    }

    fn drain_notices(&mut self) {
        while !self.ctx.notices.is_empty() {
            let notices = std::mem::take(&mut self.ctx.notices);
            for n in notices {
                self.strategy
                    .on_condition_triggered(&mut self.ctx, &n.code, n.target, n.price, &n.tag);
            }
        }
    }

    /// Fresh ledger and callback instance for a new run.
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
    use crate::market::Tick;

    fn ctx() -> CtaContext {
        CtaContext::new(core(ContextKind::Cta, env()), None)
    }

    fn quote(price: f64, time: i64) -> MarketEvent {
        MarketEvent::Quote(Tick {
            code: "SHFE.rb".into(),
            time,
            price,
            ..Default::default()
        })
    }

    #[test]
    fn test_enter_long_reverses_short() {
        let mut c = ctx();
        c.core.observe(&quote(100.0, 1));
        c.enter_short("SHFE.rb", 2.0, "s", 0.0, 0.0);
        assert_eq!(c.get_position("SHFE.rb", false, ""), -2.0);
        c.enter_long("SHFE.rb", 1.0, "l", 0.0, 0.0);
        assert_eq!(c.get_position("SHFE.rb", false, ""), 1.0);
        assert_eq!(c.get_last_entertag("SHFE.rb"), "l");
    }

    #[test]
    fn test_exit_is_tag_scoped() {
        let mut c = ctx();
        c.core.observe(&quote(100.0, 1));
        c.enter_long("SHFE.rb", 1.0, "a", 0.0, 0.0);
        c.enter_long("SHFE.rb", 2.0, "b", 0.0, 0.0);
        c.exit_long("SHFE.rb", 2.0, "b", 0.0, 0.0);
        assert_eq!(c.get_position("SHFE.rb", false, ""), 1.0);
        assert_eq!(c.get_position("SHFE.rb", false, "a"), 1.0);
    }

    #[test]
    fn test_over_exit_rejected_position_kept() {
        let mut c = ctx();
        c.core.observe(&quote(10.0, 1));
        c.enter_long("SHFE.rb", 100.0, "a", 0.0, 0.0);
        c.exit_long("SHFE.rb", 150.0, "a", 0.0, 0.0);
        assert_eq!(c.get_position("SHFE.rb", false, ""), 100.0);
        assert_eq!(c.get_detail_cost("SHFE.rb", "a"), 10.0);

        // untagged exits are bounded by every lot of the side
        c.enter_long("SHFE.rb", 20.0, "b", 0.0, 0.0);
        c.exit_long("SHFE.rb", 121.0, "", 0.0, 0.0);
        assert_eq!(c.get_position("SHFE.rb", false, ""), 120.0);
        c.exit_short("SHFE.rb", 1.0, "", 0.0, 0.0);
        assert_eq!(c.get_position("SHFE.rb", false, ""), 120.0);
    }

    #[test]
    fn test_unknown_exit_tag_touches_nothing() {
        let mut c = ctx();
        c.core.observe(&quote(10.0, 1));
        c.enter_long("SHFE.rb", 100.0, "a", 0.0, 0.0);
        c.exit_long("SHFE.rb", 50.0, "nosuchtag", 0.0, 0.0);
        assert_eq!(c.get_position("SHFE.rb", false, ""), 100.0);
        assert_eq!(c.get_position("SHFE.rb", false, "a"), 100.0);
        assert!(c.core.ledger.closes().is_empty());
    }

    #[test]
    fn test_no_price_rejects() {
        let mut c = ctx();
        c.enter_long("SHFE.rb", 1.0, "a", 0.0, 0.0);
        assert_eq!(c.get_position("SHFE.rb", false, ""), 0.0);
    }

    #[test]
    fn test_limit_condition_fires_on_cross() {
        let mut c = ctx();
        c.core.observe(&quote(100.0, 1));
        c.enter_long("SHFE.rb", 1.0, "dip", 95.0, 0.0);
        assert_eq!(c.conditions().len(), 1);

        c.check_conditions("SHFE.rb", 97.0, 97.0);
        assert_eq!(c.get_position("SHFE.rb", false, ""), 0.0);
        c.check_conditions("SHFE.rb", 94.0, 96.0);
        assert_eq!(c.get_position("SHFE.rb", false, ""), 1.0);
        assert!(c.conditions().is_empty());
        assert_eq!(c.get_detail_cost("SHFE.rb", "dip"), 95.0);
        assert_eq!(c.notices.len(), 1);
    }

    #[test]
    fn test_stop_condition_for_exit() {
        let mut c = ctx();
        c.core.observe(&quote(100.0, 1));
        c.enter_long("SHFE.rb", 1.0, "a", 0.0, 0.0);
        c.exit_long("SHFE.rb", 1.0, "", 0.0, 90.0);
        c.check_conditions("SHFE.rb", 91.0, 99.0);
        assert_eq!(c.get_position("SHFE.rb", false, ""), 1.0);
        c.check_conditions("SHFE.rb", 89.0, 92.0);
        assert_eq!(c.get_position("SHFE.rb", false, ""), 0.0);
        assert_eq!(c.get_fund_data(1), -10.0);
    }

    #[test]
    fn test_main_key_first_wins() {
        let mut c = ctx();
        c.get_bars("A.1", BarPeriod::M1, 10, true);
        c.get_bars("B.1", BarPeriod::M1, 10, true);
        assert_eq!(c.main_key(), Some(&("A.1".to_string(), BarPeriod::M1)));
        assert!(c.core.bar_subs().contains(&("B.1".to_string(), BarPeriod::M1)));
    }
}
