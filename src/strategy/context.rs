//! Strategy Context Core
//!
//! State and capabilities shared by CTA, SEL and HFT contexts: clock access, market
//! data queries, the owned position ledger, user data and logging.
//!
//! Strategy code reaches all of this through the [`ContextApi`] trait, implemented by
//! every context variant.

use crate::ingest::{Dispatcher, LogLevel, PriceBoard, SubscriberId, TopicKind};
use crate::market::{Bar, BarPeriod, Direction, MarketEvent, Price, Qty, Tick};
use crate::replay::blotter::{FundRow, PositionRow};
use crate::replay::clock::{ClockHandle, Nanos, RunStatus};
use crate::replay::history::HistoryStore;
use crate::strategy::ledger::{PositionLedger, ProfitFlag};
use crate::strategy::userdata::UserDataStore;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Ticks kept per instrument for `get_ticks`.
pub const TICK_CACHE_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    Cta,
    Sel,
    Hft,
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContextKind::Cta => "cta",
            ContextKind::Sel => "sel",
            ContextKind::Hft => "hft",
        };
        f.write_str(s)
    }
}

/// Execution price penalty applied to simulated fills.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slippage {
    /// Whole price ticks.
    Ticks(f64),
    /// Basis points of the price.
    Ratio(f64),
}

impl Default for Slippage {
    fn default() -> Self {
        Slippage::Ticks(0.0)
    }
}

impl Slippage {
    /// `slippage` is in ticks, or in basis points when `is_ratio`.
    pub fn new(slippage: f64, is_ratio: bool) -> Self {
        if is_ratio {
            Slippage::Ratio(slippage)
        } else {
            Slippage::Ticks(slippage)
        }
    }

    pub fn apply(&self, price: Price, is_buy: bool, price_tick: f64) -> Price {
        let offset = match *self {
            Slippage::Ticks(n) => n * price_tick,
            Slippage::Ratio(bps) => price * bps / 10_000.0,
        };
        if is_buy {
            price + offset
        } else {
            price - offset
        }
    }
}

/// Gate that holds a hooked context before each calc until it is stepped.
#[derive(Debug, Default)]
pub struct StepGate {
    permits: Mutex<u64>,
    cv: Condvar,
}

impl StepGate {
    /// Allow one calc through.
    pub fn step(&self) {
        *self.permits.lock() += 1;
        self.cv.notify_all();
    }

    /// Block until stepped. Returns false without consuming a permit once the run is
    /// no longer active.
    pub fn wait(&self, status: &RunStatus) -> bool {
        let mut permits = self.permits.lock();
        loop {
            if *permits > 0 {
                *permits -= 1;
                return true;
            }
            if !matches!(status.get(), crate::replay::clock::RunState::Running) {
                return false;
            }
            self.cv.wait_for(&mut permits, Duration::from_millis(10));
        }
    }
}

/// Shared services a context is created with.
#[derive(Clone)]
pub struct ContextEnv {
    pub clock: ClockHandle,
    pub history: Arc<RwLock<HistoryStore>>,
    pub prices: Arc<PriceBoard>,
    pub status: Arc<RunStatus>,
    pub price_ticks: Arc<HashMap<String, f64>>,
    pub commission_rate: f64,
}

/// Everything a context variant shares.
pub struct ContextCore {
    name: String,
    kind: ContextKind,
    env: ContextEnv,
    router: Option<(Arc<Dispatcher>, SubscriberId)>,
    pub(crate) ledger: PositionLedger,
    pub(crate) userdata: UserDataStore,
    pub(crate) slippage: Slippage,
    tick_subs: BTreeSet<String>,
    bar_subs: BTreeSet<(String, BarPeriod)>,
    /// Level-2 subscriptions (order queue / detail / transaction).
    l2_subs: Vec<(String, TopicKind)>,
    recent_ticks: HashMap<String, VecDeque<Tick>>,
    last_prices: HashMap<String, Price>,
    pub(crate) funds: Vec<FundRow>,
    pub(crate) position_rows: Vec<PositionRow>,
    released: bool,
}

impl ContextCore {
    pub fn new(
        name: &str,
        kind: ContextKind,
        env: ContextEnv,
        ledger: PositionLedger,
        userdata: UserDataStore,
        slippage: Slippage,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            env,
            router: None,
            ledger,
            userdata,
            slippage,
            tick_subs: BTreeSet::new(),
            bar_subs: BTreeSet::new(),
            l2_subs: Vec::new(),
            recent_ticks: HashMap::new(),
            last_prices: HashMap::new(),
            funds: Vec::new(),
            position_rows: Vec::new(),
            released: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn env(&self) -> &ContextEnv {
        &self.env
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn now(&self) -> Nanos {
        self.env.clock.now()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub(crate) fn mark_released(&mut self) {
        self.released = true;
        self.router = None;
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Bind to a dispatcher; existing subscriptions are replayed onto it.
    pub(crate) fn bind_router(&mut self, dispatcher: Arc<Dispatcher>, id: SubscriberId) {
        for code in &self.tick_subs {
            dispatcher.subscribe(id, code, TopicKind::Tick);
        }
        for (code, period) in &self.bar_subs {
            dispatcher.subscribe(id, code, TopicKind::Bar(*period));
        }
        for (code, kind) in &self.l2_subs {
            dispatcher.subscribe(id, code, *kind);
        }
        self.router = Some((dispatcher, id));
    }

    pub(crate) fn route(&mut self, code: &str, kind: TopicKind) {
        let fresh = match kind {
            TopicKind::Tick => self.tick_subs.insert(code.to_string()),
            TopicKind::Bar(period) => self.bar_subs.insert((code.to_string(), period)),
            _ => {
                let key = (code.to_string(), kind);
                if self.l2_subs.contains(&key) {
                    false
                } else {
                    self.l2_subs.push(key);
                    true
                }
            }
        };
        if !fresh {
            return;
        }
        if let Some((dispatcher, id)) = &self.router {
            dispatcher.subscribe(*id, code, kind);
        }
        debug!(context = %self.name, code = %code, topic = ?kind, "Subscribed");
    }

    pub fn tick_subs(&self) -> &BTreeSet<String> {
        &self.tick_subs
    }

    pub fn bar_subs(&self) -> &BTreeSet<(String, BarPeriod)> {
        &self.bar_subs
    }

    // -------------------------------------------------------------------------
    // Market state
    // -------------------------------------------------------------------------

    /// Bookkeeping done for every delivered event before variant handling.
    pub(crate) fn observe(&mut self, event: &MarketEvent) {
        if let Some(price) = event.mark_price() {
            let code = event.code();
            match self.last_prices.get_mut(code) {
                Some(p) => *p = price,
                None => {
                    self.last_prices.insert(code.to_string(), price);
                }
            }
            self.ledger.update_mark(code, price);
        }
        if let MarketEvent::Quote(tick) = event {
            let cache = self.recent_ticks.entry(tick.code.clone()).or_default();
            if cache.len() == TICK_CACHE_LEN {
                cache.pop_front();
            }
            cache.push_back(tick.clone());
        }
    }

    pub fn price_tick(&self, code: &str) -> f64 {
        self.env.price_ticks.get(code).copied().unwrap_or(1.0)
    }

    pub fn last_price(&self, code: &str) -> Option<Price> {
        self.last_prices
            .get(code)
            .copied()
            .or_else(|| self.env.prices.get(code))
    }

    /// Price with slippage for a simulated fill.
    pub(crate) fn fill_price(&self, code: &str, raw: Price, is_buy: bool) -> Price {
        self.slippage.apply(raw, is_buy, self.price_tick(code))
    }

    pub fn bars(&self, code: &str, period: BarPeriod, count: usize) -> Vec<Bar> {
        self.env
            .history
            .read()
            .bars_until(code, period, self.now(), count)
    }

    pub fn ticks(&self, code: &str, count: usize) -> Vec<Tick> {
        self.recent_ticks.get(code).map_or_else(Vec::new, |cache| {
            let skip = cache.len().saturating_sub(count);
            cache.iter().skip(skip).cloned().collect()
        })
    }

    // -------------------------------------------------------------------------
    // Journals
    // -------------------------------------------------------------------------

    /// End-of-session fund and position snapshot.
    pub(crate) fn record_session(&mut self, tdate: u32) {
        let ledger = &self.ledger;
        self.funds.push(FundRow {
            date: tdate,
            closed_profit: ledger.closed_profit(),
            dynamic_profit: ledger.dynamic_profit(),
            fees: ledger.total_fees(),
        });
        for (code, net) in ledger.all_positions() {
            self.position_rows.push(PositionRow {
                date: tdate,
                avg_price: ledger.avg_price(&code),
                profit: ledger.position_profit(&code),
                code,
                net,
            });
        }
    }

    /// Forget everything a run produced; subscriptions and user data stay.
    pub(crate) fn reset_run_state(&mut self) {
        let config = self.ledger.config().clone();
        self.ledger = PositionLedger::new(config);
        self.recent_ticks.clear();
        self.last_prices.clear();
        self.funds.clear();
        self.position_rows.clear();
    }

    /// `level` uses the connector log encoding (0/1 debug, 2 info, 3 warn, 4+ error).
    pub fn log(&self, level: u32, message: &str) {
        let ctx = self.name.as_str();
        match LogLevel::from_code(level) {
            LogLevel::Debug => debug!(context = %ctx, "{}", message),
            LogLevel::Info => info!(context = %ctx, "{}", message),
            LogLevel::Warn => warn!(context = %ctx, "{}", message),
            LogLevel::Error => error!(context = %ctx, "{}", message),
        }
    }
}

/// Capabilities common to every context variant.
pub trait ContextApi {
    fn core(&self) -> &ContextCore;
    fn core_mut(&mut self) -> &mut ContextCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    /// Current date `YYYYMMDD`.
    fn get_date(&self) -> u32 {
        self.core().env().clock.date()
    }

    /// Current time `HHMM`.
    fn get_time(&self) -> u32 {
        self.core().env().clock.time()
    }

    /// Current time `HHMMSSmmm`.
    fn get_secs(&self) -> u32 {
        self.core().env().clock.secs()
    }

    /// Trading date; sessions follow the UTC calendar date.
    fn get_tdate(&self) -> u32 {
        self.get_date()
    }

    fn get_price(&self, code: &str) -> Price {
        self.core().last_price(code).unwrap_or(0.0)
    }

    fn get_ticks(&self, code: &str, count: usize) -> Vec<Tick> {
        self.core().ticks(code, count)
    }

    /// Deliver ticks of `code` to `on_tick`.
    fn sub_ticks(&mut self, code: &str) {
        self.core_mut().route(code, TopicKind::Tick);
    }

    fn log_text(&self, level: u32, message: &str) {
        self.core().log(level, message);
    }

    fn save_userdata(&mut self, key: &str, value: &str) {
        self.core_mut().userdata.save(key, value);
    }

    fn load_userdata(&self, key: &str, default: &str) -> String {
        self.core().userdata.load(key, default).to_string()
    }

    // -------------------------------------------------------------------------
    // Position queries
    // -------------------------------------------------------------------------

    /// Signed position; `valid_only` excludes frozen quantity, an empty tag means all lots.
    fn get_position(&self, code: &str, valid_only: bool, tag: &str) -> Qty {
        let tag = (!tag.is_empty()).then_some(tag);
        self.core().ledger.position(code, valid_only, tag)
    }

    fn get_position_avgpx(&self, code: &str) -> Price {
        self.core().ledger.avg_price(code)
    }

    fn get_position_profit(&self, code: &str) -> f64 {
        self.core().ledger.position_profit(code)
    }

    fn get_detail_cost(&self, code: &str, tag: &str) -> Price {
        self.core().ledger.detail_cost(code, tag)
    }

    fn get_detail_entertime(&self, code: &str, tag: &str) -> u64 {
        self.core()
            .ledger
            .detail_entry_time(code, tag)
            .map_or(0, |t| t.max(0) as u64)
    }

    /// `flag`: 1 realized, 2 unrealized, otherwise total.
    fn get_detail_profit(&self, code: &str, tag: &str, flag: i32) -> f64 {
        self.core()
            .ledger
            .detail_profit(code, tag, ProfitFlag::from_code(flag))
    }

    fn get_first_entertime(&self, code: &str) -> u64 {
        self.core()
            .ledger
            .first_entry_time(code)
            .map_or(0, |t| t.max(0) as u64)
    }

    fn get_last_entertime(&self, code: &str) -> u64 {
        self.core()
            .ledger
            .last_entry_time(code)
            .map_or(0, |t| t.max(0) as u64)
    }

    fn get_last_exittime(&self, code: &str) -> u64 {
        self.core()
            .ledger
            .last_exit_time(code)
            .map_or(0, |t| t.max(0) as u64)
    }

    fn get_last_entry_price(&self, code: &str) -> Price {
        self.core().ledger.last_entry_price(code)
    }

    fn get_last_entertag(&self, code: &str) -> String {
        self.core()
            .ledger
            .last_entry_tag(code)
            .unwrap_or_default()
            .to_string()
    }

    fn get_all_position(&self) -> BTreeMap<String, Qty> {
        self.core().ledger.all_positions().into_iter().collect()
    }

    /// `flag`: 0 total (closed + floating - fees), 1 closed, 2 floating, 3 fees.
    fn get_fund_data(&self, flag: i32) -> f64 {
        let ledger = &self.core().ledger;
        match flag {
            1 => ledger.closed_profit(),
            2 => ledger.dynamic_profit(),
            3 => ledger.total_fees(),
            _ => ledger.closed_profit() + ledger.dynamic_profit() - ledger.total_fees(),
        }
    }

    /// Unsigned holding of one side.
    fn get_side_position(&self, code: &str, direction: Direction, valid_only: bool) -> Qty {
        self.core().ledger.position_of(code, direction, valid_only)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_slippage() {
        assert_eq!(Slippage::new(2.0, false).apply(100.0, true, 0.5), 101.0);
        assert_eq!(Slippage::new(2.0, false).apply(100.0, false, 0.5), 99.0);
        assert_eq!(Slippage::new(10.0, true).apply(100.0, true, 1.0), 100.1);
    }

    #[test]
    fn test_step_gate_released_by_step() {
        use crate::replay::clock::RunState;
        let gate = Arc::new(StepGate::default());
        let status = Arc::new(RunStatus::default());
        status.set(RunState::Running);

        let waiter = {
            let gate = Arc::clone(&gate);
            let status = Arc::clone(&status);
            std::thread::spawn(move || gate.wait(&status))
        };
        gate.step();
        assert!(waiter.join().unwrap());

        status.set(RunState::Stopping);
        assert!(!gate.wait(&status));
    }

    #[test]
    fn test_tick_cache_and_price() {
        let mut core = core(ContextKind::Cta, env());
        for t in 0..5 {
            core.observe(&MarketEvent::Quote(Tick {
                code: "A.1".into(),
                time: t,
                price: 10.0 + t as f64,
                ..Default::default()
            }));
        }
        let ticks = core.ticks("A.1", 2);
        assert_eq!(ticks.iter().map(|t| t.time).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(core.last_price("A.1"), Some(14.0));
        assert_eq!(core.last_price("B.1"), None);
    }
}
