//! Context Registry
//!
//! Owns every live strategy context behind a generation-checked handle. Each context
//! sits in its own mutex: market events, session callbacks and handle-based calls all
//! take that lock, so a context is never entered concurrently with itself while
//! different contexts proceed independently.
//!
//! Releasing a context takes the same lock, which makes release wait for any
//! in-flight callback before the context is marked released and unhooked from the
//! dispatcher.
//!
//! Callbacks run under a [`CellGuard`], which records the context on the calling
//! thread. A handle-based call that reaches [`ContextRegistry::with_cell`] for a
//! context the thread is already inside is refused with
//! [`PlatformError::Reentrant`]; the lock is not re-entrant.

use crate::error::{PlatformError, PlatformResult};
use crate::ingest::{Dispatcher, MarketSubscriber, SubscriberId};
use crate::market::MarketEvent;
use crate::replay::clock::Nanos;
use crate::strategy::context::{ContextApi, ContextCore, ContextKind, StepGate};
use crate::strategy::cta::CtaRunner;
use crate::strategy::handle::{ContextHandle, HandleTable};
use crate::strategy::hft::HftRunner;
use crate::strategy::sel::SelRunner;
use parking_lot::{Mutex, MutexGuard};
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{info, warn};

thread_local! {
    /// Context cells the current thread is inside, innermost last.
    static ENTERED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

fn cell_key(cell: &Arc<Mutex<ContextCell>>) -> usize {
    Arc::as_ptr(cell) as usize
}

fn is_entered(cell: &Arc<Mutex<ContextCell>>) -> bool {
    let key = cell_key(cell);
    ENTERED.with(|e| e.borrow().contains(&key))
}

/// Context lock held while callbacks run.
pub struct CellGuard<'a> {
    guard: MutexGuard<'a, ContextCell>,
    key: usize,
}

impl<'a> CellGuard<'a> {
    pub fn enter(cell: &'a Arc<Mutex<ContextCell>>) -> Self {
        let guard = cell.lock();
        let key = cell_key(cell);
        ENTERED.with(|e| e.borrow_mut().push(key));
        Self { guard, key }
    }
}

impl Deref for CellGuard<'_> {
    type Target = ContextCell;

    fn deref(&self) -> &ContextCell {
        &self.guard
    }
}

impl DerefMut for CellGuard<'_> {
    fn deref_mut(&mut self) -> &mut ContextCell {
        &mut self.guard
    }
}

impl Drop for CellGuard<'_> {
    fn drop(&mut self) {
        ENTERED.with(|e| {
            let mut entered = e.borrow_mut();
            if let Some(pos) = entered.iter().rposition(|k| *k == self.key) {
                entered.remove(pos);
            }
        });
    }
}

/// One context of any variant together with its callbacks.
pub enum ContextCell {
    Cta(CtaRunner),
    Sel(SelRunner),
    Hft(HftRunner),
}

impl ContextCell {
    pub fn core(&self) -> &ContextCore {
        match self {
            ContextCell::Cta(r) => r.ctx.core(),
            ContextCell::Sel(r) => r.ctx.core(),
            ContextCell::Hft(r) => r.ctx.core(),
        }
    }

    fn core_mut(&mut self) -> &mut ContextCore {
        match self {
            ContextCell::Cta(r) => r.ctx.core_mut(),
            ContextCell::Sel(r) => r.ctx.core_mut(),
            ContextCell::Hft(r) => r.ctx.core_mut(),
        }
    }

    pub fn name(&self) -> &str {
        self.core().name()
    }

    pub fn kind(&self) -> ContextKind {
        self.core().kind()
    }

    pub fn is_released(&self) -> bool {
        self.core().is_released()
    }

    pub fn on_init(&mut self) {
        match self {
            ContextCell::Cta(r) => r.on_init(),
            ContextCell::Sel(r) => r.on_init(),
            ContextCell::Hft(r) => r.on_init(),
        }
    }

    pub fn on_session_begin(&mut self, tdate: u32) {
        match self {
            ContextCell::Cta(r) => r.on_session_begin(tdate),
            ContextCell::Sel(r) => r.on_session_begin(tdate),
            ContextCell::Hft(r) => r.on_session_begin(tdate),
        }
    }

    pub fn on_session_end(&mut self, tdate: u32) {
        match self {
            ContextCell::Cta(r) => r.on_session_end(tdate),
            ContextCell::Sel(r) => r.on_session_end(tdate),
            ContextCell::Hft(r) => r.on_session_end(tdate),
        }
    }

    pub fn on_market_event(&mut self, event: &MarketEvent) {
        match self {
            ContextCell::Cta(r) => r.on_market_event(event),
            ContextCell::Sel(r) => r.on_market_event(event),
            ContextCell::Hft(r) => r.on_market_event(event),
        }
    }

    /// All events of `t` were delivered. Drives SEL schedules.
    pub fn on_time_advanced(&mut self, t: Nanos) {
        if let ContextCell::Sel(r) = self {
            r.on_time_advanced(t);
        }
    }

    pub fn on_backtest_end(&mut self) {
        match self {
            ContextCell::Cta(r) => r.on_backtest_end(),
            ContextCell::Sel(r) => r.on_backtest_end(),
            ContextCell::Hft(r) => {
                r.on_channel_lost();
                r.on_backtest_end();
            }
        }
    }

    pub fn reset_for_run(&mut self) {
        match self {
            ContextCell::Cta(r) => r.reset_for_run(),
            ContextCell::Sel(r) => r.reset_for_run(),
            ContextCell::Hft(r) => r.reset_for_run(),
        }
    }

    pub fn flush_userdata(&mut self) {
        let core = self.core_mut();
        if let Err(e) = core.userdata.flush() {
            warn!(context = %core.name(), error = %e, "Failed to persist user data");
        }
    }

    fn bind_router(&mut self, dispatcher: Arc<Dispatcher>, id: SubscriberId) {
        self.core_mut().bind_router(dispatcher, id);
    }

    fn release(&mut self) {
        self.flush_userdata();
        self.core_mut().mark_released();
    }
}

/// Dispatcher endpoint of a context.
struct ContextSubscriber {
    name: String,
    cell: Arc<Mutex<ContextCell>>,
}

impl MarketSubscriber for ContextSubscriber {
    fn on_market_event(&self, event: &MarketEvent) {
        let mut cell = CellGuard::enter(&self.cell);
        if cell.is_released() {
            return;
        }
        cell.on_market_event(event);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A registered context.
pub struct ContextEntry {
    pub name: String,
    pub kind: ContextKind,
    pub cell: Arc<Mutex<ContextCell>>,
    pub gate: Option<Arc<StepGate>>,
    subscriber: SubscriberId,
    dispatcher: Arc<Dispatcher>,
}

impl ContextEntry {
    /// Lock the context for callback dispatch.
    pub fn enter(&self) -> CellGuard<'_> {
        CellGuard::enter(&self.cell)
    }
}

#[derive(Default)]
pub struct ContextRegistry {
    table: Mutex<HandleTable<Arc<ContextEntry>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `cell` with `dispatcher` and issue its handle.
    pub fn insert(
        &self,
        cell: ContextCell,
        dispatcher: &Arc<Dispatcher>,
        gate: Option<Arc<StepGate>>,
    ) -> ContextHandle {
        let name = cell.name().to_string();
        let kind = cell.kind();
        let cell = Arc::new(Mutex::new(cell));
        let subscriber = dispatcher.register(Arc::new(ContextSubscriber {
            name: name.clone(),
            cell: Arc::clone(&cell),
        }));
        cell.lock().bind_router(Arc::clone(dispatcher), subscriber);

        let handle = self.table.lock().insert(Arc::new(ContextEntry {
            name: name.clone(),
            kind,
            cell,
            gate,
            subscriber,
            dispatcher: Arc::clone(dispatcher),
        }));
        info!(context = %name, kind = %kind, handle = %handle, "Context created");
        handle
    }

    pub fn get(&self, handle: ContextHandle) -> Option<Arc<ContextEntry>> {
        self.table.lock().get(handle).cloned()
    }

    /// Run `f` on the context behind `handle`.
    ///
    /// Refused with `Reentrant` when the calling thread is inside one of this
    /// context's callbacks.
    pub fn with_cell<R>(
        &self,
        handle: ContextHandle,
        f: impl FnOnce(&mut ContextCell) -> R,
    ) -> PlatformResult<R> {
        let entry = self
            .get(handle)
            .ok_or(PlatformError::UnknownHandle(handle.raw()))?;
        if is_entered(&entry.cell) {
            return Err(PlatformError::Reentrant(handle.raw()));
        }
        let mut cell = entry.cell.lock();
        if cell.is_released() {
            return Err(PlatformError::UnknownHandle(handle.raw()));
        }
        Ok(f(&mut cell))
    }

    /// Handles and entries in creation slot order.
    pub fn entries(&self) -> Vec<(ContextHandle, Arc<ContextEntry>)> {
        self.table
            .lock()
            .iter()
            .map(|(h, e)| (h, Arc::clone(e)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Release one context. The handle is stale afterwards.
    pub fn release(&self, handle: ContextHandle) -> bool {
        let Some(entry) = self.table.lock().remove(handle) else {
            return false;
        };
        Self::teardown(&entry);
        true
    }

    pub fn release_all(&self) -> usize {
        let entries = self.table.lock().drain();
        for (_, entry) in &entries {
            Self::teardown(entry);
        }
        entries.len()
    }

    fn teardown(entry: &ContextEntry) {
        if is_entered(&entry.cell) {
            warn!(context = %entry.name, "Context released from its own callback; not waiting");
            entry.dispatcher.unregister(entry.subscriber);
            return;
        }
        entry.cell.lock().release();
        entry.dispatcher.unregister(entry.subscriber);
        info!(context = %entry.name, "Context released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{DeliveryMode, TopicKind};
    use crate::market::Tick;
    use crate::strategy::callbacks::{cta_factory, CtaStrategy};
    use crate::strategy::context::test_support::{core, env};
    use crate::strategy::cta::CtaContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    impl CtaStrategy for Counting {
        fn on_init(&mut self, ctx: &mut CtaContext) {
            ctx.sub_ticks("A.1");
        }

        fn on_tick(&mut self, _ctx: &mut CtaContext, _tick: &Tick) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn cta_cell(count: &Arc<AtomicUsize>) -> ContextCell {
        let count = Arc::clone(count);
        let factory = cta_factory(move |_| Counting(Arc::clone(&count)));
        let ctx = CtaContext::new(core(ContextKind::Cta, env()), None);
        ContextCell::Cta(CtaRunner::new(ctx, factory))
    }

    fn tick(price: f64) -> MarketEvent {
        MarketEvent::Quote(Tick {
            code: "A.1".into(),
            time: 1,
            price,
            ..Default::default()
        })
    }

    #[test]
    fn test_subscriptions_route_after_init() {
        let dispatcher = Dispatcher::new(DeliveryMode::Inline);
        dispatcher.attach_source("t");
        let registry = ContextRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let h = registry.insert(cta_cell(&count), &dispatcher, None);

        registry.with_cell(h, |c| c.on_init()).unwrap();
        assert_eq!(dispatcher.dispatch("t", tick(1.0)), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // subscribing twice does not duplicate delivery
        registry
            .with_cell(h, |c| {
                if let ContextCell::Cta(r) = c {
                    r.ctx.core_mut().route("A.1", TopicKind::Tick);
                }
            })
            .unwrap();
        assert_eq!(dispatcher.dispatch("t", tick(1.0)), 1);
    }

    #[test]
    fn test_released_handle_is_stale() {
        let dispatcher = Dispatcher::new(DeliveryMode::Inline);
        dispatcher.attach_source("t");
        let registry = ContextRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let h1 = registry.insert(cta_cell(&count), &dispatcher, None);
        registry.with_cell(h1, |c| c.on_init()).unwrap();

        assert!(registry.release(h1));
        assert!(!registry.release(h1));
        assert!(matches!(
            registry.with_cell(h1, |_| ()),
            Err(PlatformError::UnknownHandle(_))
        ));
        assert_eq!(dispatcher.dispatch("t", tick(1.0)), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // the slot is reused under a new generation
        let h2 = registry.insert(cta_cell(&count), &dispatcher, None);
        assert_eq!(h2.index(), h1.index());
        assert_ne!(h2, h1);
        assert!(registry.with_cell(h1, |_| ()).is_err());
        assert!(registry.with_cell(h2, |_| ()).is_ok());
    }

    #[test]
    fn test_handle_call_from_inside_callback_refused() {
        let dispatcher = Dispatcher::new(DeliveryMode::Inline);
        let registry = ContextRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let h1 = registry.insert(cta_cell(&count), &dispatcher, None);
        let h2 = registry.insert(cta_cell(&count), &dispatcher, None);
        let entry = registry.get(h1).unwrap();

        {
            let _inside = entry.enter();
            assert!(matches!(
                registry.with_cell(h1, |_| ()),
                Err(PlatformError::Reentrant(_))
            ));
            assert!(registry.with_cell(h2, |_| ()).is_ok());
        }
        // leaving the callback clears the mark
        assert!(registry.with_cell(h1, |_| ()).is_ok());
    }
}
