//! Replay Engine
//!
//! Single producer of market events during a backtest. Fed series are merged into one
//! deterministic stream (see [`ReplayQueue`]), the replay clock is advanced to each
//! event before it is delivered, and delivery goes through an inline dispatcher so
//! every callback runs on the engine thread in stream order.
//!
//! # Run sequence
//! 1. contexts are reset, then `on_init` runs in creation order
//! 2. subscribed series that were never fed are pulled from the external loader
//! 3. events replay in order; sessions open and close on UTC date changes and SEL
//!    schedules are checked after the last event of each timestamp
//! 4. `on_backtest_end`, user data flush, blotter capture (and dump when requested)
//!
//! `stop` takes effect at the next event boundary.

use crate::error::{PlatformError, PlatformResult};
use crate::ingest::{DeliveryMode, Dispatcher};
use crate::market::{EventKind, MarketEvent};
use crate::replay::blotter::{Blotter, ContextBlotter};
use crate::replay::clock::{nanos_to_ymd, ClockHandle, Nanos, ReplayClock, ReplayMode, RunState, RunStatus, TimeRange};
use crate::replay::history::HistoryStore;
use crate::replay::loader::ExtDataLoader;
use crate::replay::queue::ReplayQueue;
use crate::strategy::context::ContextEnv;
use crate::strategy::registry::{ContextCell, ContextEntry, ContextRegistry};
use crate::strategy::ContextHandle;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Dispatcher source name of replayed events.
pub const REPLAY_SOURCE: &str = "replay";

#[derive(Debug, Clone)]
pub struct ReplaySettings {
    pub tick_enabled: bool,
    pub output_dir: PathBuf,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            tick_enabled: true,
            output_dir: PathBuf::from("outputs_bt"),
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub events: u64,
    pub stopped: bool,
    pub fingerprint: String,
}

struct EngineInner {
    history: Arc<RwLock<HistoryStore>>,
    dispatcher: Arc<Dispatcher>,
    registry: ContextRegistry,
    clock: RwLock<ReplayClock>,
    status: Arc<RunStatus>,
    settings: RwLock<ReplaySettings>,
    loader: RwLock<Option<Arc<dyn ExtDataLoader>>>,
    blotter: Mutex<Option<Blotter>>,
    report: Mutex<Option<RunReport>>,
}

pub struct ReplayEngine {
    inner: Arc<EngineInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ReplayEngine {
    fn default() -> Self {
        Self::new(ReplaySettings::default())
    }
}

impl ReplayEngine {
    pub fn new(settings: ReplaySettings) -> Self {
        let clock = ReplayClock::new();
        let status = clock.status();
        let dispatcher = Dispatcher::new(DeliveryMode::Inline);
        dispatcher.attach_source(REPLAY_SOURCE);
        Self {
            inner: Arc::new(EngineInner {
                history: Arc::new(RwLock::new(HistoryStore::new())),
                dispatcher,
                registry: ContextRegistry::new(),
                clock: RwLock::new(clock),
                status,
                settings: RwLock::new(settings),
                loader: RwLock::new(None),
                blotter: Mutex::new(None),
                report: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Wiring
    // -------------------------------------------------------------------------

    pub fn history(&self) -> Arc<RwLock<HistoryStore>> {
        Arc::clone(&self.inner.history)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn registry(&self) -> &ContextRegistry {
        &self.inner.registry
    }

    pub fn clock(&self) -> ClockHandle {
        self.inner.clock.read().handle()
    }

    pub fn status(&self) -> RunState {
        self.inner.status.get()
    }

    pub fn is_running(&self) -> bool {
        self.inner.status.is_active()
    }

    /// Services a context created on this engine is bound to.
    pub fn context_env(&self, price_ticks: Arc<HashMap<String, f64>>, commission_rate: f64) -> ContextEnv {
        ContextEnv {
            clock: self.clock(),
            history: self.history(),
            prices: self.inner.dispatcher.prices(),
            status: Arc::clone(&self.inner.status),
            price_ticks,
            commission_rate,
        }
    }

    pub fn set_time_range(&self, start: Nanos, end: Nanos) -> PlatformResult<()> {
        self.ensure_idle("change the time range")?;
        self.inner.clock.write().set_range(start, end);
        Ok(())
    }

    pub fn time_range(&self) -> TimeRange {
        self.inner.clock.read().range()
    }

    pub fn enable_tick(&self, enabled: bool) {
        self.inner.settings.write().tick_enabled = enabled;
    }

    pub fn settings(&self) -> ReplaySettings {
        self.inner.settings.read().clone()
    }

    pub fn set_output_dir(&self, dir: PathBuf) {
        self.inner.settings.write().output_dir = dir;
    }

    pub fn set_loader(&self, loader: Arc<dyn ExtDataLoader>) {
        info!(loader = %loader.name(), "External data loader registered");
        *self.inner.loader.write() = Some(loader);
    }

    fn ensure_idle(&self, what: &'static str) -> PlatformResult<()> {
        if self.inner.status.is_active() {
            return Err(PlatformError::Busy(what));
        }
        Ok(())
    }

    /// Drop every fed series and adjustment factor.
    pub fn clear_cache(&self) -> PlatformResult<()> {
        self.ensure_idle("clear the cache")?;
        self.inner.history.write().clear();
        info!("Historical data cache cleared");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Run control
    // -------------------------------------------------------------------------

    /// Start a run. Synchronous runs return once it completes; asynchronous runs
    /// return immediately and are finished with [`wait`](Self::wait).
    pub fn run(&self, need_dump: bool, mode: ReplayMode) -> PlatformResult<()> {
        self.ensure_idle("start a run")?;
        self.join_worker();
        // claim the run before handing off so a second call is rejected
        self.inner.status.set(RunState::Running);
        self.inner.clock.write().set_mode(mode);

        if mode == ReplayMode::Synchronous {
            run_once(&self.inner, need_dump);
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("replay".into())
            .spawn(move || run_once(&inner, need_dump))
            .map_err(|e| {
                self.inner.status.set(RunState::Idle);
                PlatformError::Io(e.to_string())
            })?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Request the current run to stop at the next event boundary.
    pub fn stop(&self) -> bool {
        let requested = self.inner.status.request_stop();
        if requested {
            info!("Replay stop requested");
        }
        requested
    }

    /// Block until an asynchronous run finishes.
    pub fn wait(&self) {
        self.join_worker();
    }

    fn join_worker(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Replay thread panicked");
                self.inner.status.set(RunState::Done);
            }
        }
    }

    /// Stop and wait for any run, then release every context.
    pub fn release(&self) {
        self.stop();
        self.join_worker();
        let released = self.inner.registry.release_all();
        info!(contexts = released, "Replay engine released");
    }

    pub fn release_context(&self, handle: ContextHandle) -> bool {
        self.inner.registry.release(handle)
    }

    /// Blotter of the last finished run.
    pub fn blotter(&self) -> Option<Blotter> {
        self.inner.blotter.lock().clone()
    }

    pub fn last_report(&self) -> Option<RunReport> {
        self.inner.report.lock().clone()
    }
}

impl Drop for ReplayEngine {
    fn drop(&mut self) {
        self.release();
    }
}

// =============================================================================
// RUN
// =============================================================================

fn for_each_context(
    entries: &[(ContextHandle, Arc<ContextEntry>)],
    mut f: impl FnMut(&mut ContextCell),
) {
    for (_, entry) in entries {
        let mut cell = entry.enter();
        if !cell.is_released() {
            f(&mut cell);
        }
    }
}

/// Pull series that contexts subscribed to but that were never fed.
fn pull_missing(
    inner: &EngineInner,
    entries: &[(ContextHandle, Arc<ContextEntry>)],
    range: TimeRange,
    tick_enabled: bool,
) {
    let Some(loader) = inner.loader.read().clone() else {
        return;
    };
    let mut bar_keys = BTreeSet::new();
    let mut tick_codes = BTreeSet::new();
    for (_, entry) in entries {
        let cell = entry.cell.lock();
        bar_keys.extend(cell.core().bar_subs().iter().cloned());
        tick_codes.extend(cell.core().tick_subs().iter().cloned());
    }

    let mut history = inner.history.write();
    let mut codes = BTreeSet::new();
    for (code, period) in bar_keys {
        codes.insert(code.clone());
        if history.has_bars(&code, period) {
            continue;
        }
        match loader.load_bars(&code, period, range) {
            Ok(bars) => {
                let report = history.feed_bars(period, bars);
                debug!(code = %code, period = %period, accepted = report.accepted, "Bars loaded");
            }
            Err(e) => warn!(code = %code, period = %period, error = %e, "Bar load failed"),
        }
    }
    if tick_enabled {
        for code in tick_codes {
            codes.insert(code.clone());
            if history.has_ticks(&code) {
                continue;
            }
            match loader.load_ticks(&code, range) {
                Ok(ticks) => {
                    history.feed_ticks(ticks);
                }
                Err(e) => warn!(code = %code, error = %e, "Tick load failed"),
            }
        }
    }
    if history.auto_transform() {
        for code in codes {
            if history.factors().has(&code) {
                continue;
            }
            match loader.load_adj_factors(&code) {
                Ok(Some(factors)) => {
                    let dates: Vec<u32> = factors.iter().map(|f| f.date).collect();
                    let values: Vec<f64> = factors.iter().map(|f| f.factor).collect();
                    if let Err(e) = history.feed_adj_factors(&code, &dates, &values) {
                        warn!(code = %code, error = %e, "Adjustment factors rejected");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(code = %code, error = %e, "Adjustment factor load failed"),
            }
        }
    }
}

fn build_queue(history: &HistoryStore, range: TimeRange, tick_enabled: bool) -> ReplayQueue {
    let mut queue = ReplayQueue::new();
    for ((code, period), series) in history.bar_series() {
        let events = series
            .within(range)
            .iter()
            .map(|b| MarketEvent::Bar {
                period: *period,
                bar: b.clone(),
            })
            .collect();
        queue.add_series(code, EventKind::Bar, series.ordinal, events);
    }
    if !tick_enabled {
        return queue;
    }
    for (code, series) in history.tick_series() {
        let events = series.within(range).iter().cloned().map(MarketEvent::Quote).collect();
        queue.add_series(code, EventKind::Quote, series.ordinal, events);
    }
    for (code, series) in history.ordque_series() {
        let events = series.within(range).iter().cloned().map(MarketEvent::OrderQueue).collect();
        queue.add_series(code, EventKind::OrderQueue, series.ordinal, events);
    }
    for (code, series) in history.orddtl_series() {
        let events = series.within(range).iter().cloned().map(MarketEvent::OrderDetail).collect();
        queue.add_series(code, EventKind::OrderDetail, series.ordinal, events);
    }
    for (code, series) in history.trans_series() {
        let events = series.within(range).iter().cloned().map(MarketEvent::Transaction).collect();
        queue.add_series(code, EventKind::Transaction, series.ordinal, events);
    }
    queue
}

fn scale_event(event: &mut MarketEvent, ratio: f64) {
    match event {
        MarketEvent::Quote(t) => t.scale_prices(ratio),
        MarketEvent::Bar { bar, .. } => bar.scale_prices(ratio),
        MarketEvent::OrderQueue(q) => q.price *= ratio,
        MarketEvent::OrderDetail(d) => d.price *= ratio,
        MarketEvent::Transaction(t) => t.price *= ratio,
    }
}

fn run_once(inner: &EngineInner, need_dump: bool) {
    let started = Instant::now();
    let settings = inner.settings.read().clone();
    let (range, clock) = {
        let clock = inner.clock.read();
        clock.rewind(None);
        (clock.range(), clock.clone())
    };
    inner.dispatcher.prices().clear();
    let entries = inner.registry.entries();
    info!(
        contexts = entries.len(),
        tick_enabled = settings.tick_enabled,
        "Replay starting"
    );

    for_each_context(&entries, |c| c.reset_for_run());
    for_each_context(&entries, |c| c.on_init());

    pull_missing(inner, &entries, range, settings.tick_enabled);
    let mut queue = build_queue(&inner.history.read(), range, settings.tick_enabled);
    debug!(events = queue.len(), "Replay queue built");
    clock.rewind(queue.peek_time());

    let mut session: Option<u32> = None;
    let mut stopped = false;
    let mut delivered = 0u64;
    while let Some(mut event) = queue.pop() {
        if inner.status.get() == RunState::Stopping {
            stopped = true;
            break;
        }
        let t = event.time();
        let date = nanos_to_ymd(t);
        if session != Some(date) {
            if let Some(prev) = session {
                for_each_context(&entries, |c| c.on_session_end(prev));
            }
            clock.advance_to(t);
            for_each_context(&entries, |c| c.on_session_begin(date));
            session = Some(date);
        }
        clock.advance_to(t);

        let ratio = inner.history.read().price_ratio(event.code(), t);
        if ratio != 1.0 {
            scale_event(&mut event, ratio);
        }
        inner.dispatcher.dispatch(REPLAY_SOURCE, event);
        delivered += 1;

        if queue.peek_time() != Some(t) {
            for_each_context(&entries, |c| c.on_time_advanced(t));
        }
    }

    if let Some(last) = session {
        for_each_context(&entries, |c| c.on_session_end(last));
    }
    for_each_context(&entries, |c| {
        c.on_backtest_end();
        c.flush_userdata();
    });

    let blotter = Blotter {
        contexts: entries
            .iter()
            .map(|(_, e)| ContextBlotter::capture(&e.cell.lock()))
            .collect(),
    };
    if need_dump {
        match blotter.write_to(&settings.output_dir) {
            Ok(()) => info!(dir = %settings.output_dir.display(), "Blotter written"),
            Err(e) => warn!(error = %e, "Blotter dump failed"),
        }
    }
    let report = RunReport {
        events: delivered,
        stopped,
        fingerprint: blotter.fingerprint(),
    };
    info!(
        events = report.events,
        stopped,
        fingerprint = %report.fingerprint,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Replay finished"
    );
    *inner.blotter.lock() = Some(blotter);
    *inner.report.lock() = Some(report);
    inner.status.set(RunState::Done);
}
