//! Backtest Porter
//!
//! Flat, handle-based facade over the replay engine: the surface an embedding host
//! drives. Every call is non-fatal. Failures are logged and answered with a neutral
//! value (`false`, `0.0`, an empty collection or [`ContextHandle::INVALID`]); state
//! is left untouched.
//!
//! Capabilities shared by all context variants (positions, prices, bars, user data,
//! logging) take a handle of any kind. Variant-specific calls are prefixed `cta_`,
//! `sel_` or `hft_` and reject handles of another kind.

use crate::config::PlatformConfig;
use crate::error::{PlatformError, PlatformResult};
use crate::ingest::LogLevel;
use crate::market::{
    raw_std_code, Bar, BarPeriod, OrderDetail, OrderQueue, Price, Qty, Tick, Transaction,
};
use crate::replay::clock::{ymdhm_to_nanos, Nanos, ReplayMode};
use crate::replay::{Blotter, ExtDataLoader, ReplayEngine, ReplaySettings, RunReport};
use crate::strategy::context::{ContextApi, ContextCore, ContextKind, Slippage, StepGate};
use crate::strategy::cta::{CtaContext, CtaRunner};
use crate::strategy::hft::{HftContext, HftRunner};
use crate::strategy::sel::{ScheduleUnit, SelContext, SelRunner, SelSchedule};
use crate::strategy::{
    CallbackRegistry, ContextCell, ContextHandle, CtaFactory, HftFactory, LedgerConfig,
    PositionLedger, SelFactory, UserDataStore,
};
use crate::telemetry;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

fn rejected<R>(op: &str, err: PlatformError, neutral: R) -> R {
    warn!(op = %op, error = %err, "Call rejected");
    neutral
}

/// Options of `init_cta_mocker`.
#[derive(Debug, Clone, Default)]
pub struct CtaOptions {
    /// Ticks, or basis points when `ratio_slippage`.
    pub slippage: f64,
    pub ratio_slippage: bool,
    /// Calcs wait for `cta_step`.
    pub hook: bool,
    pub persist_data: bool,
    pub incremental: bool,
}

pub struct BacktestPorter {
    engine: ReplayEngine,
    config: RwLock<PlatformConfig>,
    callbacks: RwLock<CallbackRegistry>,
}

impl Default for BacktestPorter {
    fn default() -> Self {
        Self::new()
    }
}

impl BacktestPorter {
    pub fn new() -> Self {
        Self {
            engine: ReplayEngine::new(ReplaySettings::default()),
            config: RwLock::new(PlatformConfig::default()),
            callbacks: RwLock::new(CallbackRegistry::default()),
        }
    }

    pub fn engine(&self) -> &ReplayEngine {
        &self.engine
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Install logging (first caller wins) and reset configuration to defaults.
    pub fn init_backtest(&self, log_profile: Option<&str>, output_dir: Option<&str>) -> bool {
        telemetry::init_logging(log_profile);
        if let Some(dir) = output_dir {
            let mut config = self.config.write();
            config.replay.output_dir = dir.to_string();
            self.engine.set_output_dir(PathBuf::from(dir));
        }
        info!(version = %Self::get_version(), "Backtest porter initialized");
        true
    }

    /// Apply a TOML configuration, given inline or as a file path.
    pub fn config_backtest(&self, text: &str, is_file: bool) -> bool {
        let parsed = if is_file {
            PlatformConfig::load(text)
        } else {
            PlatformConfig::from_toml_str(text)
        };
        match parsed.and_then(|c| self.apply_config(c)) {
            Ok(()) => true,
            Err(e) => rejected("config_backtest", e, false),
        }
    }

    fn apply_config(&self, config: PlatformConfig) -> PlatformResult<()> {
        if self.engine.is_running() {
            return Err(PlatformError::Busy("reconfigure"));
        }
        let replay = &config.replay;
        let start = replay
            .begin_time
            .and_then(ymdhm_to_nanos)
            .unwrap_or(Nanos::MIN);
        let end = replay.end_time.and_then(ymdhm_to_nanos).unwrap_or(Nanos::MAX);
        self.engine.set_time_range(start, end)?;
        self.engine.enable_tick(replay.tick_enabled);
        self.engine.set_output_dir(PathBuf::from(&replay.output_dir));
        self.engine
            .history()
            .write()
            .set_auto_transform(replay.auto_transform);
        info!(
            parsers = config.parsers.len(),
            contracts = config.contracts.len(),
            tick_enabled = replay.tick_enabled,
            auto_transform = replay.auto_transform,
            "Backtest configured"
        );
        *self.config.write() = config;
        Ok(())
    }

    /// `begin`/`end` as `YYYYMMDDHHMM`.
    pub fn set_time_range(&self, begin: u64, end: u64) -> bool {
        let (Some(start), Some(stop)) = (ymdhm_to_nanos(begin), ymdhm_to_nanos(end)) else {
            return rejected(
                "set_time_range",
                PlatformError::Config(format!("bad time range {} - {}", begin, end)),
                false,
            );
        };
        if start > stop {
            return rejected(
                "set_time_range",
                PlatformError::Config("begin after end".into()),
                false,
            );
        }
        match self.engine.set_time_range(start, stop) {
            Ok(()) => true,
            Err(e) => rejected("set_time_range", e, false),
        }
    }

    pub fn enable_tick(&self, enabled: bool) {
        self.engine.enable_tick(enabled);
    }

    pub fn run_backtest(&self, need_dump: bool, asynchronous: bool) -> bool {
        let mode = if asynchronous {
            ReplayMode::Asynchronous
        } else {
            ReplayMode::Synchronous
        };
        match self.engine.run(need_dump, mode) {
            Ok(()) => true,
            Err(e) => rejected("run_backtest", e, false),
        }
    }

    pub fn stop_backtest(&self) -> bool {
        self.engine.stop()
    }

    /// Block until an asynchronous run finishes.
    pub fn wait_backtest(&self) {
        self.engine.wait();
    }

    /// Stop and wait for any run, then release every context.
    pub fn release_backtest(&self) {
        self.engine.release();
    }

    pub fn clear_cache(&self) -> bool {
        match self.engine.clear_cache() {
            Ok(()) => true,
            Err(e) => rejected("clear_cache", e, false),
        }
    }

    pub fn get_version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn get_raw_stdcode(code: &str) -> String {
        raw_std_code(code)
    }

    pub fn write_log(level: u32, message: &str, category: &str) {
        match LogLevel::from_code(level) {
            LogLevel::Debug => debug!(category = %category, "{}", message),
            LogLevel::Info => info!(category = %category, "{}", message),
            LogLevel::Warn => warn!(category = %category, "{}", message),
            LogLevel::Error => error!(category = %category, "{}", message),
        }
    }

    pub fn last_report(&self) -> Option<RunReport> {
        self.engine.last_report()
    }

    pub fn blotter(&self) -> Option<Blotter> {
        self.engine.blotter()
    }

    // =========================================================================
    // DATA
    // =========================================================================

    /// Append bars of one period. Returns how many were accepted.
    pub fn feed_raw_bars(&self, period: &str, bars: Vec<Bar>) -> usize {
        let period: BarPeriod = match period.parse() {
            Ok(p) => p,
            Err(e) => return rejected("feed_raw_bars", PlatformError::Config(e), 0),
        };
        self.engine.history().write().feed_bars(period, bars).accepted
    }

    pub fn feed_raw_ticks(&self, ticks: Vec<Tick>) -> usize {
        self.engine.history().write().feed_ticks(ticks).accepted
    }

    pub fn feed_raw_ordques(&self, items: Vec<OrderQueue>) -> usize {
        self.engine.history().write().feed_ordques(items).accepted
    }

    pub fn feed_raw_orddtls(&self, items: Vec<OrderDetail>) -> usize {
        self.engine.history().write().feed_orddtls(items).accepted
    }

    pub fn feed_raw_transes(&self, items: Vec<Transaction>) -> usize {
        self.engine.history().write().feed_transes(items).accepted
    }

    pub fn feed_adj_factors(&self, code: &str, dates: &[u32], factors: &[f64]) -> bool {
        match self
            .engine
            .history()
            .write()
            .feed_adj_factors(code, dates, factors)
        {
            Ok(_) => true,
            Err(e) => rejected("feed_adj_factors", e, false),
        }
    }

    pub fn register_ext_data_loader(&self, loader: Arc<dyn ExtDataLoader>) {
        self.engine.set_loader(loader);
    }

    // =========================================================================
    // CONTEXTS
    // =========================================================================

    pub fn register_cta_callbacks(&self, factory: CtaFactory) {
        self.callbacks.write().cta = Some(factory);
    }

    pub fn register_sel_callbacks(&self, factory: SelFactory) {
        self.callbacks.write().sel = Some(factory);
    }

    pub fn register_hft_callbacks(&self, factory: HftFactory) {
        self.callbacks.write().hft = Some(factory);
    }

    fn new_core(
        &self,
        name: &str,
        kind: ContextKind,
        slippage: Slippage,
        incremental: bool,
        persist: bool,
    ) -> PlatformResult<ContextCore> {
        if self.engine.is_running() {
            return Err(PlatformError::Busy("create a context"));
        }
        if name.trim().is_empty() {
            return Err(PlatformError::Config("blank context name".into()));
        }
        if self
            .engine
            .registry()
            .entries()
            .iter()
            .any(|(_, e)| e.name == name)
        {
            return Err(PlatformError::DuplicateId(name.to_string()));
        }
        let config = self.config.read();
        let price_ticks: HashMap<String, f64> = config
            .contracts
            .iter()
            .map(|c| (c.code.clone(), c.price_tick))
            .collect();
        let commission_rate = config.fees.commission_rate;
        let env = self
            .engine
            .context_env(Arc::new(price_ticks), commission_rate);
        let ledger = PositionLedger::new(LedgerConfig {
            incremental,
            commission_rate,
        });
        let userdata = if persist && config.replay.persist_userdata {
            UserDataStore::persistent(Path::new(&config.replay.output_dir), name)
        } else {
            UserDataStore::volatile()
        };
        Ok(ContextCore::new(name, kind, env, ledger, userdata, slippage))
    }

    fn insert(&self, cell: ContextCell, gate: Option<Arc<StepGate>>) -> ContextHandle {
        self.engine
            .registry()
            .insert(cell, self.engine.dispatcher(), gate)
    }

    pub fn init_cta_mocker(&self, name: &str, options: CtaOptions) -> ContextHandle {
        let Some(factory) = self.callbacks.read().cta.clone() else {
            return rejected(
                "init_cta_mocker",
                PlatformError::Config("no CTA callbacks registered".into()),
                ContextHandle::INVALID,
            );
        };
        let slippage = Slippage::new(options.slippage, options.ratio_slippage);
        match self.new_core(name, ContextKind::Cta, slippage, options.incremental, options.persist_data) {
            Ok(core) => {
                let gate = options.hook.then(|| Arc::new(StepGate::default()));
                let ctx = CtaContext::new(core, gate.clone());
                self.insert(ContextCell::Cta(CtaRunner::new(ctx, factory)), gate)
            }
            Err(e) => rejected("init_cta_mocker", e, ContextHandle::INVALID),
        }
    }

    /// `period` is `d`, `w`, `m` or `min`; see [`ScheduleUnit`] for `date`/`time`.
    #[allow(clippy::too_many_arguments)]
    pub fn init_sel_mocker(
        &self,
        name: &str,
        date: u32,
        time: u32,
        period: &str,
        slippage: f64,
        ratio_slippage: bool,
        persist_data: bool,
    ) -> ContextHandle {
        let Some(factory) = self.callbacks.read().sel.clone() else {
            return rejected(
                "init_sel_mocker",
                PlatformError::Config("no SEL callbacks registered".into()),
                ContextHandle::INVALID,
            );
        };
        let unit: ScheduleUnit = match period.parse() {
            Ok(u) => u,
            Err(e) => {
                return rejected("init_sel_mocker", PlatformError::Config(e), ContextHandle::INVALID)
            }
        };
        let slippage = Slippage::new(slippage, ratio_slippage);
        match self.new_core(name, ContextKind::Sel, slippage, false, persist_data) {
            Ok(core) => {
                let ctx = SelContext::new(core, SelSchedule::new(unit, date, time));
                self.insert(ContextCell::Sel(SelRunner::new(ctx, factory)), None)
            }
            Err(e) => rejected("init_sel_mocker", e, ContextHandle::INVALID),
        }
    }

    pub fn init_hft_mocker(&self, name: &str, hook: bool, persist_data: bool) -> ContextHandle {
        let Some(factory) = self.callbacks.read().hft.clone() else {
            return rejected(
                "init_hft_mocker",
                PlatformError::Config("no HFT callbacks registered".into()),
                ContextHandle::INVALID,
            );
        };
        match self.new_core(name, ContextKind::Hft, Slippage::default(), false, persist_data) {
            Ok(core) => {
                let gate = hook.then(|| Arc::new(StepGate::default()));
                let ctx = HftContext::new(core, gate.clone());
                self.insert(ContextCell::Hft(HftRunner::new(ctx, factory)), gate)
            }
            Err(e) => rejected("init_hft_mocker", e, ContextHandle::INVALID),
        }
    }

    pub fn release_context(&self, handle: ContextHandle) -> bool {
        if self.engine.is_running() {
            return rejected("release_context", PlatformError::Busy("release a context"), false);
        }
        self.engine.release_context(handle)
    }

    // -------------------------------------------------------------------------
    // Handle resolution
    // -------------------------------------------------------------------------

    fn with_api<R>(
        &self,
        op: &str,
        handle: ContextHandle,
        neutral: R,
        f: impl FnOnce(&mut dyn ContextApi) -> R,
    ) -> R {
        let result = self.engine.registry().with_cell(handle, |cell| match cell {
            ContextCell::Cta(r) => f(&mut r.ctx),
            ContextCell::Sel(r) => f(&mut r.ctx),
            ContextCell::Hft(r) => f(&mut r.ctx),
        });
        match result {
            Ok(v) => v,
            Err(e) => rejected(op, e, neutral),
        }
    }

    fn with_cta<R>(&self, op: &str, handle: ContextHandle, neutral: R, f: impl FnOnce(&mut CtaContext) -> R) -> R {
        let result = self.engine.registry().with_cell(handle, |cell| match cell {
            ContextCell::Cta(r) => Some(f(&mut r.ctx)),
            _ => None,
        });
        match result {
            Ok(Some(v)) => v,
            Ok(None) => rejected(op, PlatformError::UnknownHandle(handle.raw()), neutral),
            Err(e) => rejected(op, e, neutral),
        }
    }

    fn with_sel<R>(&self, op: &str, handle: ContextHandle, neutral: R, f: impl FnOnce(&mut SelContext) -> R) -> R {
        let result = self.engine.registry().with_cell(handle, |cell| match cell {
            ContextCell::Sel(r) => Some(f(&mut r.ctx)),
            _ => None,
        });
        match result {
            Ok(Some(v)) => v,
            Ok(None) => rejected(op, PlatformError::UnknownHandle(handle.raw()), neutral),
            Err(e) => rejected(op, e, neutral),
        }
    }

    fn with_hft<R>(&self, op: &str, handle: ContextHandle, neutral: R, f: impl FnOnce(&mut HftContext) -> R) -> R {
        let result = self.engine.registry().with_cell(handle, |cell| match cell {
            ContextCell::Hft(r) => Some(f(&mut r.ctx)),
            _ => None,
        });
        match result {
            Ok(Some(v)) => v,
            Ok(None) => rejected(op, PlatformError::UnknownHandle(handle.raw()), neutral),
            Err(e) => rejected(op, e, neutral),
        }
    }

    fn step(&self, op: &str, handle: ContextHandle, kind: ContextKind) -> bool {
        // the gate is reached without the context lock, which a waiting calc holds
        match self.engine.registry().get(handle) {
            Some(entry) if entry.kind == kind => match &entry.gate {
                Some(gate) => {
                    gate.step();
                    true
                }
                None => rejected(op, PlatformError::Config("context is not hooked".into()), false),
            },
            _ => rejected(op, PlatformError::UnknownHandle(handle.raw()), false),
        }
    }

    // =========================================================================
    // SHARED CAPABILITIES
    // =========================================================================

    pub fn get_date(&self, h: ContextHandle) -> u32 {
        self.with_api("get_date", h, 0, |c| c.get_date())
    }

    pub fn get_time(&self, h: ContextHandle) -> u32 {
        self.with_api("get_time", h, 0, |c| c.get_time())
    }

    pub fn get_tdate(&self, h: ContextHandle) -> u32 {
        self.with_api("get_tdate", h, 0, |c| c.get_tdate())
    }

    pub fn get_price(&self, h: ContextHandle, code: &str) -> Price {
        self.with_api("get_price", h, 0.0, |c| c.get_price(code))
    }

    pub fn get_ticks(&self, h: ContextHandle, code: &str, count: usize) -> Vec<Tick> {
        self.with_api("get_ticks", h, Vec::new(), |c| c.get_ticks(code, count))
    }

    pub fn sub_ticks(&self, h: ContextHandle, code: &str) -> bool {
        self.with_api("sub_ticks", h, false, |c| {
            c.sub_ticks(code);
            true
        })
    }

    pub fn log_text(&self, h: ContextHandle, level: u32, message: &str) {
        self.with_api("log_text", h, (), |c| c.log_text(level, message))
    }

    pub fn save_userdata(&self, h: ContextHandle, key: &str, value: &str) -> bool {
        self.with_api("save_userdata", h, false, |c| {
            c.save_userdata(key, value);
            true
        })
    }

    pub fn load_userdata(&self, h: ContextHandle, key: &str, default: &str) -> String {
        self.with_api("load_userdata", h, default.to_string(), |c| {
            c.load_userdata(key, default)
        })
    }

    pub fn get_position(&self, h: ContextHandle, code: &str, valid_only: bool, tag: &str) -> Qty {
        self.with_api("get_position", h, 0.0, |c| c.get_position(code, valid_only, tag))
    }

    pub fn get_position_avgpx(&self, h: ContextHandle, code: &str) -> Price {
        self.with_api("get_position_avgpx", h, 0.0, |c| c.get_position_avgpx(code))
    }

    pub fn get_position_profit(&self, h: ContextHandle, code: &str) -> f64 {
        self.with_api("get_position_profit", h, 0.0, |c| c.get_position_profit(code))
    }

    pub fn get_detail_cost(&self, h: ContextHandle, code: &str, tag: &str) -> Price {
        self.with_api("get_detail_cost", h, 0.0, |c| c.get_detail_cost(code, tag))
    }

    pub fn get_detail_entertime(&self, h: ContextHandle, code: &str, tag: &str) -> u64 {
        self.with_api("get_detail_entertime", h, 0, |c| c.get_detail_entertime(code, tag))
    }

    /// `flag`: 1 realized, 2 unrealized, otherwise total.
    pub fn get_detail_profit(&self, h: ContextHandle, code: &str, tag: &str, flag: i32) -> f64 {
        self.with_api("get_detail_profit", h, 0.0, |c| c.get_detail_profit(code, tag, flag))
    }

    pub fn get_first_entertime(&self, h: ContextHandle, code: &str) -> u64 {
        self.with_api("get_first_entertime", h, 0, |c| c.get_first_entertime(code))
    }

    pub fn get_last_entertime(&self, h: ContextHandle, code: &str) -> u64 {
        self.with_api("get_last_entertime", h, 0, |c| c.get_last_entertime(code))
    }

    pub fn get_last_exittime(&self, h: ContextHandle, code: &str) -> u64 {
        self.with_api("get_last_exittime", h, 0, |c| c.get_last_exittime(code))
    }

    pub fn get_last_entry_price(&self, h: ContextHandle, code: &str) -> Price {
        self.with_api("get_last_entry_price", h, 0.0, |c| c.get_last_entry_price(code))
    }

    pub fn get_last_entertag(&self, h: ContextHandle, code: &str) -> String {
        self.with_api("get_last_entertag", h, String::new(), |c| c.get_last_entertag(code))
    }

    pub fn get_all_position(&self, h: ContextHandle) -> BTreeMap<String, Qty> {
        self.with_api("get_all_position", h, BTreeMap::new(), |c| c.get_all_position())
    }

    /// `flag`: 0 total, 1 closed, 2 floating, 3 fees.
    pub fn get_fund_data(&self, h: ContextHandle, flag: i32) -> f64 {
        self.with_api("get_fund_data", h, 0.0, |c| c.get_fund_data(flag))
    }

    // =========================================================================
    // CTA
    // =========================================================================

    pub fn cta_enter_long(&self, h: ContextHandle, code: &str, qty: Qty, tag: &str, limit: Price, stop: Price) {
        self.with_cta("cta_enter_long", h, (), |c| c.enter_long(code, qty, tag, limit, stop))
    }

    pub fn cta_exit_long(&self, h: ContextHandle, code: &str, qty: Qty, tag: &str, limit: Price, stop: Price) {
        self.with_cta("cta_exit_long", h, (), |c| c.exit_long(code, qty, tag, limit, stop))
    }

    pub fn cta_enter_short(&self, h: ContextHandle, code: &str, qty: Qty, tag: &str, limit: Price, stop: Price) {
        self.with_cta("cta_enter_short", h, (), |c| c.enter_short(code, qty, tag, limit, stop))
    }

    pub fn cta_exit_short(&self, h: ContextHandle, code: &str, qty: Qty, tag: &str, limit: Price, stop: Price) {
        self.with_cta("cta_exit_short", h, (), |c| c.exit_short(code, qty, tag, limit, stop))
    }

    pub fn cta_set_position(&self, h: ContextHandle, code: &str, qty: Qty, tag: &str, limit: Price, stop: Price) {
        self.with_cta("cta_set_position", h, (), |c| c.set_position(code, qty, tag, limit, stop))
    }

    pub fn cta_get_bars(&self, h: ContextHandle, code: &str, period: &str, count: usize, is_main: bool) -> Vec<Bar> {
        let period: BarPeriod = match period.parse() {
            Ok(p) => p,
            Err(e) => return rejected("cta_get_bars", PlatformError::Config(e), Vec::new()),
        };
        self.with_cta("cta_get_bars", h, Vec::new(), |c| c.get_bars(code, period, count, is_main))
    }

    pub fn cta_sub_bar_events(&self, h: ContextHandle, code: &str, period: &str) -> bool {
        let period: BarPeriod = match period.parse() {
            Ok(p) => p,
            Err(e) => return rejected("cta_sub_bar_events", PlatformError::Config(e), false),
        };
        self.with_cta("cta_sub_bar_events", h, false, |c| {
            c.sub_bar_events(code, period);
            true
        })
    }

    pub fn cta_set_chart_kline(&self, h: ContextHandle, code: &str, period: &str) -> bool {
        let period: BarPeriod = match period.parse() {
            Ok(p) => p,
            Err(e) => return rejected("cta_set_chart_kline", PlatformError::Config(e), false),
        };
        self.with_cta("cta_set_chart_kline", h, false, |c| {
            c.set_chart_kline(code, period);
            true
        })
    }

    pub fn cta_add_chart_mark(&self, h: ContextHandle, price: Price, icon: &str, tag: &str) {
        self.with_cta("cta_add_chart_mark", h, (), |c| c.add_chart_mark(price, icon, tag))
    }

    pub fn cta_register_index(&self, h: ContextHandle, name: &str, kind: u32) {
        self.with_cta("cta_register_index", h, (), |c| c.register_index(name, kind))
    }

    pub fn cta_register_index_line(&self, h: ContextHandle, index: &str, line: &str, style: u32) -> bool {
        self.with_cta("cta_register_index_line", h, false, |c| c.register_index_line(index, line, style))
    }

    pub fn cta_add_index_baseline(&self, h: ContextHandle, index: &str, line: &str, value: f64) -> bool {
        self.with_cta("cta_add_index_baseline", h, false, |c| c.add_index_baseline(index, line, value))
    }

    pub fn cta_set_index_value(&self, h: ContextHandle, index: &str, line: &str, value: f64) -> bool {
        self.with_cta("cta_set_index_value", h, false, |c| c.set_index_value(index, line, value))
    }

    /// Let one calc of a hooked CTA context proceed.
    pub fn cta_step(&self, h: ContextHandle) -> bool {
        self.step("cta_step", h, ContextKind::Cta)
    }

    // =========================================================================
    // SEL
    // =========================================================================

    pub fn sel_set_position(&self, h: ContextHandle, code: &str, qty: Qty, tag: &str) {
        self.with_sel("sel_set_position", h, (), |c| c.set_position(code, qty, tag))
    }

    pub fn sel_get_bars(&self, h: ContextHandle, code: &str, period: &str, count: usize) -> Vec<Bar> {
        let period: BarPeriod = match period.parse() {
            Ok(p) => p,
            Err(e) => return rejected("sel_get_bars", PlatformError::Config(e), Vec::new()),
        };
        self.with_sel("sel_get_bars", h, Vec::new(), |c| c.get_bars(code, period, count))
    }

    // =========================================================================
    // HFT
    // =========================================================================

    /// `flag`: 0 normal, 1 fill-and-kill, 2 fill-or-kill. Returns local order ids.
    pub fn hft_buy(&self, h: ContextHandle, code: &str, price: Price, qty: Qty, tag: &str, flag: u32) -> Vec<u32> {
        self.with_hft("hft_buy", h, Vec::new(), |c| c.buy(code, price, qty, tag, flag))
    }

    pub fn hft_sell(&self, h: ContextHandle, code: &str, price: Price, qty: Qty, tag: &str, flag: u32) -> Vec<u32> {
        self.with_hft("hft_sell", h, Vec::new(), |c| c.sell(code, price, qty, tag, flag))
    }

    pub fn hft_cancel(&self, h: ContextHandle, local_id: u32) -> bool {
        self.with_hft("hft_cancel", h, false, |c| c.cancel(local_id))
    }

    pub fn hft_cancel_all(&self, h: ContextHandle, code: &str, is_buy: bool) -> Vec<u32> {
        self.with_hft("hft_cancel_all", h, Vec::new(), |c| c.cancel_all(code, is_buy))
    }

    pub fn hft_get_undone(&self, h: ContextHandle, code: &str) -> Qty {
        self.with_hft("hft_get_undone", h, 0.0, |c| c.get_undone(code))
    }

    pub fn hft_get_bars(&self, h: ContextHandle, code: &str, period: &str, count: usize) -> Vec<Bar> {
        let period: BarPeriod = match period.parse() {
            Ok(p) => p,
            Err(e) => return rejected("hft_get_bars", PlatformError::Config(e), Vec::new()),
        };
        self.with_hft("hft_get_bars", h, Vec::new(), |c| c.get_bars(code, period, count))
    }

    pub fn hft_sub_order_queue(&self, h: ContextHandle, code: &str) -> bool {
        self.with_hft("hft_sub_order_queue", h, false, |c| {
            c.sub_order_queue(code);
            true
        })
    }

    pub fn hft_sub_order_detail(&self, h: ContextHandle, code: &str) -> bool {
        self.with_hft("hft_sub_order_detail", h, false, |c| {
            c.sub_order_detail(code);
            true
        })
    }

    pub fn hft_sub_transactions(&self, h: ContextHandle, code: &str) -> bool {
        self.with_hft("hft_sub_transactions", h, false, |c| {
            c.sub_transactions(code);
            true
        })
    }

    pub fn hft_get_ordque(&self, h: ContextHandle, code: &str, count: usize) -> Vec<OrderQueue> {
        self.with_hft("hft_get_ordque", h, Vec::new(), |c| c.get_ordque(code, count))
    }

    pub fn hft_get_orddtl(&self, h: ContextHandle, code: &str, count: usize) -> Vec<OrderDetail> {
        self.with_hft("hft_get_orddtl", h, Vec::new(), |c| c.get_orddtl(code, count))
    }

    pub fn hft_get_trans(&self, h: ContextHandle, code: &str, count: usize) -> Vec<Transaction> {
        self.with_hft("hft_get_trans", h, Vec::new(), |c| c.get_trans(code, count))
    }

    /// Let one tick callback of a hooked HFT context proceed.
    pub fn hft_step(&self, h: ContextHandle) -> bool {
        self.step("hft_step", h, ContextKind::Hft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{cta_factory, CtaStrategy};

    struct Idle;
    impl CtaStrategy for Idle {}

    fn porter() -> BacktestPorter {
        let porter = BacktestPorter::new();
        porter.register_cta_callbacks(cta_factory(|_| Idle));
        porter
    }

    #[test]
    fn test_context_without_callbacks_is_invalid() {
        let porter = BacktestPorter::new();
        assert_eq!(porter.init_cta_mocker("a", CtaOptions::default()), ContextHandle::INVALID);
        assert_eq!(
            porter.init_hft_mocker("h", false, false),
            ContextHandle::INVALID
        );
    }

    #[test]
    fn test_duplicate_context_name_rejected() {
        let porter = porter();
        let h = porter.init_cta_mocker("a", CtaOptions::default());
        assert!(h.is_valid());
        assert_eq!(porter.init_cta_mocker("a", CtaOptions::default()), ContextHandle::INVALID);
    }

    #[test]
    fn test_stale_and_mismatched_handles_are_neutral() {
        let porter = porter();
        let h = porter.init_cta_mocker("a", CtaOptions::default());
        assert!(porter.hft_buy(h, "A.1", 1.0, 1.0, "", 0).is_empty());
        assert!(porter.release_context(h));
        assert_eq!(porter.get_position(h, "A.1", false, ""), 0.0);
        porter.cta_enter_long(h, "A.1", 1.0, "t", 0.0, 0.0);
        assert!(!porter.cta_step(h));
        assert!(!porter.cta_step(ContextHandle::from_raw(u64::MAX)));
    }

    #[test]
    fn test_config_backtest_inline() {
        let porter = porter();
        assert!(porter.config_backtest(
            "[replay]\nbegin_time = 202401020930\nend_time = 202401031500\ntick_enabled = false\n",
            false
        ));
        assert!(!porter.engine().settings().tick_enabled);
        assert!(!porter.config_backtest("[replay\n", false));
        assert!(!porter.config_backtest("/definitely/not/here.toml", true));
        assert!(!porter.set_time_range(202401031500, 202401020930));
    }

    #[test]
    fn test_feed_bad_period() {
        let porter = porter();
        assert_eq!(porter.feed_raw_bars("x9", Vec::new()), 0);
        assert_eq!(BacktestPorter::get_raw_stdcode("SSE.600000Q"), "SSE.600000");
    }
}
