//! Live Runner
//!
//! Wires configured parser adapters to strategy contexts through a queued dispatcher:
//! every connector feeds on its own thread, every context drains its own delivery
//! queue, so one slow context never holds up another.
//!
//! The live clock follows wall time; [`LiveRunner::sync_clock`] is pumped by the host.

use crate::config::PlatformConfig;
use crate::error::{PlatformError, PlatformResult};
use crate::ingest::{ConnectorRegistry, Dispatcher, ParserAdapterMgr};
use crate::replay::clock::{nanos_to_ymd, ClockHandle, Nanos, RunState, RunStatus};
use crate::replay::history::HistoryStore;
use crate::strategy::context::{ContextCore, ContextEnv, ContextKind, Slippage};
use crate::strategy::cta::{CtaContext, CtaRunner};
use crate::strategy::hft::{HftContext, HftRunner};
use crate::strategy::{
    ContextCell, ContextHandle, ContextRegistry, CtaFactory, HftFactory, LedgerConfig,
    PositionLedger, UserDataStore,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

fn wall_nanos() -> Nanos {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

pub struct LiveRunner {
    config: PlatformConfig,
    connectors: ConnectorRegistry,
    dispatcher: Arc<Dispatcher>,
    adapters: ParserAdapterMgr,
    registry: ContextRegistry,
    clock: ClockHandle,
    status: Arc<RunStatus>,
    history: Arc<RwLock<HistoryStore>>,
    session: Mutex<Option<u32>>,
}

impl LiveRunner {
    pub fn new(config: PlatformConfig, connectors: ConnectorRegistry) -> Self {
        let dispatcher = Dispatcher::new(config.live.delivery);
        Self {
            config,
            connectors,
            dispatcher,
            adapters: ParserAdapterMgr::new(),
            registry: ContextRegistry::new(),
            clock: ClockHandle::new(wall_nanos()),
            status: Arc::new(RunStatus::default()),
            history: Arc::new(RwLock::new(HistoryStore::new())),
            session: Mutex::new(None),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn adapters(&self) -> &ParserAdapterMgr {
        &self.adapters
    }

    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.status.get() == RunState::Running
    }

    fn new_core(&self, name: &str, kind: ContextKind, slippage: Slippage) -> PlatformResult<ContextCore> {
        if self.status.is_active() {
            return Err(PlatformError::Busy("create a context"));
        }
        if self.registry.entries().iter().any(|(_, e)| e.name == name) {
            return Err(PlatformError::DuplicateId(name.to_string()));
        }
        let price_ticks: HashMap<String, f64> = self
            .config
            .contracts
            .iter()
            .map(|c| (c.code.clone(), c.price_tick))
            .collect();
        let commission_rate = self.config.fees.commission_rate;
        let env = ContextEnv {
            clock: self.clock.clone(),
            history: Arc::clone(&self.history),
            prices: self.dispatcher.prices(),
            status: Arc::clone(&self.status),
            price_ticks: Arc::new(price_ticks),
            commission_rate,
        };
        let userdata = if self.config.replay.persist_userdata {
            UserDataStore::persistent(Path::new(&self.config.replay.output_dir), name)
        } else {
            UserDataStore::volatile()
        };
        let ledger = PositionLedger::new(LedgerConfig {
            incremental: false,
            commission_rate,
        });
        Ok(ContextCore::new(name, kind, env, ledger, userdata, slippage))
    }

    pub fn add_cta(&self, name: &str, factory: CtaFactory, slippage: Slippage) -> PlatformResult<ContextHandle> {
        let core = self.new_core(name, ContextKind::Cta, slippage)?;
        let cell = ContextCell::Cta(CtaRunner::new(CtaContext::new(core, None), factory));
        Ok(self.registry.insert(cell, &self.dispatcher, None))
    }

    pub fn add_hft(&self, name: &str, factory: HftFactory) -> PlatformResult<ContextHandle> {
        let core = self.new_core(name, ContextKind::Hft, Slippage::default())?;
        let cell = ContextCell::Hft(HftRunner::new(HftContext::new(core, None), factory));
        Ok(self.registry.insert(cell, &self.dispatcher, None))
    }

    /// Initialize contexts, open the session and start every configured adapter.
    /// Returns the number of adapters running.
    pub fn start(&self) -> PlatformResult<usize> {
        if self.status.is_active() {
            return Err(PlatformError::Busy("start"));
        }
        self.status.set(RunState::Running);
        self.sync_clock();

        // contexts subscribe in on_init, before any adapter produces
        for (_, entry) in self.registry.entries() {
            entry.enter().on_init();
        }
        let today = nanos_to_ymd(self.clock.now());
        self.open_session(today);

        let loaded = self
            .adapters
            .load_adapters(&self.config.parsers, &self.connectors, &self.dispatcher);
        let running = self.adapters.run();
        if running < loaded {
            warn!(loaded, running, "Some parser adapters failed to start");
        }
        info!(
            adapters = running,
            contexts = self.registry.len(),
            delivery = ?self.dispatcher.mode(),
            "Live runner started"
        );
        Ok(running)
    }

    fn open_session(&self, tdate: u32) {
        for (_, entry) in self.registry.entries() {
            entry.enter().on_session_begin(tdate);
        }
        *self.session.lock() = Some(tdate);
    }

    fn close_session(&self) {
        let Some(tdate) = self.session.lock().take() else {
            return;
        };
        for (_, entry) in self.registry.entries() {
            let mut cell = entry.enter();
            if !cell.is_released() {
                cell.on_session_end(tdate);
            }
        }
    }

    /// Advance the clock to wall time, rolling the session over on a date change.
    pub fn sync_clock(&self) {
        self.clock.advance_to(wall_nanos());
        if !self.is_running() {
            return;
        }
        let today = nanos_to_ymd(self.clock.now());
        let current = *self.session.lock();
        if current.is_some_and(|d| d != today) {
            self.close_session();
            self.open_session(today);
        }
    }

    /// Stop adapters first, then close the session and release every context.
    pub fn shutdown(&self) {
        if self.status.get() != RunState::Running {
            return;
        }
        self.status.set(RunState::Stopping);
        self.adapters.release();
        self.close_session();
        for (_, entry) in self.registry.entries() {
            let mut cell = entry.cell.lock();
            if !cell.is_released() {
                cell.flush_userdata();
            }
        }
        let released = self.registry.release_all();
        let stats = self.dispatcher.stats();
        info!(
            contexts = released,
            delivered = stats.delivered,
            dropped = stats.dropped,
            "Live runner stopped"
        );
        self.status.set(RunState::Done);
    }
}

impl Drop for LiveRunner {
    fn drop(&mut self) {
        self.shutdown();
        self.registry.release_all();
    }
}
