//! SEL Context
//!
//! Portfolio-selection strategies. The only execution primitive is a target position
//! per instrument; calcs fire on a calendar schedule rather than on a main bar.

use crate::ingest::TopicKind;
use crate::market::{Bar, BarPeriod, MarketEvent, Qty};
use crate::replay::clock::{nanos_to_datetime, nanos_to_hhmm, nanos_to_ymd, Nanos, NANOS_PER_MIN};
use crate::strategy::callbacks::{SelFactory, SelStrategy};
use crate::strategy::context::{ContextApi, ContextCore};
use chrono::Datelike;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleUnit {
    /// Every day at `time`.
    Day,
    /// On weekday `date` (Monday = 1) at `time`.
    Week,
    /// On the first trading day on or after day-of-month `date`, at `time`.
    Month,
    /// Every `time` minutes.
    Minute,
}

impl FromStr for ScheduleUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "d" => Ok(ScheduleUnit::Day),
            "w" => Ok(ScheduleUnit::Week),
            "m" => Ok(ScheduleUnit::Month),
            "min" => Ok(ScheduleUnit::Minute),
            other => Err(format!("unknown schedule period '{}'", other)),
        }
    }
}

/// When a SEL context calcs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelSchedule {
    pub unit: ScheduleUnit,
    pub date: u32,
    /// `HHMM`, or the interval in minutes for [`ScheduleUnit::Minute`].
    pub time: u32,
    last_fired: Option<i64>,
}

impl SelSchedule {
    pub fn new(unit: ScheduleUnit, date: u32, time: u32) -> Self {
        Self {
            unit,
            date,
            time,
            last_fired: None,
        }
    }

    /// Whether a calc is due at `t`. Marks the slot as fired when it is.
    pub fn due(&mut self, t: Nanos) -> bool {
        let dt = nanos_to_datetime(t);
        let hhmm = nanos_to_hhmm(t);
        let slot = match self.unit {
            ScheduleUnit::Day => (hhmm >= self.time).then(|| nanos_to_ymd(t) as i64),
            ScheduleUnit::Week => (dt.weekday().number_from_monday() == self.date
                && hhmm >= self.time)
                .then(|| nanos_to_ymd(t) as i64),
            ScheduleUnit::Month => (dt.day() >= self.date && hhmm >= self.time)
                .then(|| dt.year() as i64 * 100 + dt.month() as i64),
            ScheduleUnit::Minute => {
                let span = self.time.max(1) as i64 * NANOS_PER_MIN;
                Some(t.div_euclid(span))
            }
        };
        match slot {
            Some(s) if self.last_fired != Some(s) => {
                self.last_fired = Some(s);
                true
            }
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.last_fired = None;
    }
}

pub struct SelContext {
    core: ContextCore,
    schedule: SelSchedule,
}

impl ContextApi for SelContext {
    fn core(&self) -> &ContextCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ContextCore {
        &mut self.core
    }
}

impl SelContext {
    pub fn new(core: ContextCore, schedule: SelSchedule) -> Self {
        Self { core, schedule }
    }

    pub fn schedule(&self) -> &SelSchedule {
        &self.schedule
    }

    /// Closed bars up to now; also delivers later bars of (code, period) to `on_bar`.
    pub fn get_bars(&mut self, code: &str, period: BarPeriod, count: usize) -> Vec<Bar> {
        self.core.route(code, TopicKind::Bar(period));
        self.core.bars(code, period, count)
    }

    /// Rebalance `code` to the signed target `qty` at the last price.
    pub fn set_position(&mut self, code: &str, qty: Qty, tag: &str) {
        let Some(raw) = self.core.last_price(code) else {
            warn!(context = %self.core.name(), code = %code, "No price yet; target rejected");
            return;
        };
        let current = self.core.ledger.position(code, false, None);
        let price = self.core.fill_price(code, raw, qty > current);
        let now = self.core.now();
        if let Err(e) = self
            .core
            .ledger
            .set_target_position(code, qty, tag, price, now)
        {
            warn!(context = %self.core.name(), code = %code, error = %e, "Target rejected");
        }
    }

    pub(crate) fn reset_run_state(&mut self) {
        self.core.reset_run_state();
        self.schedule.reset();
    }
}

pub struct SelRunner {
    pub(crate) ctx: SelContext,
    strategy: Box<dyn SelStrategy>,
    factory: SelFactory,
}

impl SelRunner {
    pub fn new(ctx: SelContext, factory: SelFactory) -> Self {
        let strategy = factory(ctx.core.name());
        Self {
            ctx,
            strategy,
            factory,
        }
    }

    pub fn context(&self) -> &SelContext {
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
            MarketEvent::Quote(tick) if self.ctx.core.tick_subs().contains(&tick.code) => {
                self.strategy.on_tick(&mut self.ctx, tick);
            }
            MarketEvent::Bar { period, bar }
                if self.ctx.core.bar_subs().contains(&(bar.code.clone(), *period)) =>
            {
                self.strategy.on_bar(&mut self.ctx, &bar.code, *period, bar);
            }
            _ => {}
        }
    }

    /// Called once after all events of timestamp `t` were delivered.
    pub fn on_time_advanced(&mut self, t: Nanos) {
        if self.ctx.schedule.due(t) {
            self.strategy
                .on_calc(&mut self.ctx, nanos_to_ymd(t), nanos_to_hhmm(t));
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
    use crate::market::Tick;
    use crate::replay::clock::ymdhm_to_nanos;
    use crate::strategy::context::test_support::{core, env};
    use crate::strategy::context::ContextKind;

    fn t(stamp: u64) -> Nanos {
        ymdhm_to_nanos(stamp).unwrap()
    }

    #[test]
    fn test_daily_fires_once_after_time() {
        let mut s = SelSchedule::new(ScheduleUnit::Day, 0, 1400);
        assert!(!s.due(t(202403041300)));
        assert!(s.due(t(202403041400)));
        assert!(!s.due(t(202403041500)));
        assert!(s.due(t(202403051401)));
    }

    #[test]
    fn test_weekly_on_weekday() {
        // 2024-03-04 is a Monday
        let mut s = SelSchedule::new(ScheduleUnit::Week, 3, 930);
        assert!(!s.due(t(202403041000)));
        assert!(s.due(t(202403061000)));
        assert!(!s.due(t(202403061100)));
        assert!(s.due(t(202403131000)));
    }

    #[test]
    fn test_monthly_on_or_after_day() {
        let mut s = SelSchedule::new(ScheduleUnit::Month, 15, 0);
        assert!(!s.due(t(202403141000)));
        assert!(s.due(t(202403181000)));
        assert!(!s.due(t(202403191000)));
        assert!(s.due(t(202404151000)));
    }

    #[test]
    fn test_minute_interval() {
        let mut s = SelSchedule::new(ScheduleUnit::Minute, 0, 5);
        assert!(s.due(t(202403041000)));
        assert!(!s.due(t(202403041004)));
        assert!(s.due(t(202403041005)));
    }

    #[test]
    fn test_set_position_rebalances() {
        let mut ctx = SelContext::new(
            core(ContextKind::Sel, env()),
            SelSchedule::new(ScheduleUnit::Day, 0, 0),
        );
        ctx.set_position("SSE.600000", 100.0, "r");
        assert_eq!(ctx.get_position("SSE.600000", false, ""), 0.0);

        ctx.core.observe(&MarketEvent::Quote(Tick {
            code: "SSE.600000".into(),
            time: 1,
            price: 10.0,
            ..Default::default()
        }));
        ctx.set_position("SSE.600000", 100.0, "r");
        ctx.set_position("SSE.600000", -50.0, "r");
        assert_eq!(ctx.get_position("SSE.600000", false, ""), -50.0);
        assert_eq!(ctx.get_all_position().len(), 1);
    }

    #[test]
    fn test_schedule_unit_parse() {
        assert_eq!("min".parse::<ScheduleUnit>(), Ok(ScheduleUnit::Minute));
        assert!("x".parse::<ScheduleUnit>().is_err());
    }
}
