//! Market Event Dispatcher
//!
//! Single delivery path from event sources (parser adapters, the replay engine) to
//! subscribed strategy contexts.
//!
//! # Design
//! - The route table is an immutable snapshot behind `ArcSwap`: `dispatch` never takes
//!   a lock on the hot path, writers (subscribe/attach) serialize on a mutex and swap in
//!   a new table.
//! - `Inline` delivery calls the subscriber on the dispatching thread. The replay engine
//!   uses it so delivery order is exactly the merged stream order.
//! - `Queued` delivery gives every subscriber its own channel and worker thread, so one
//!   slow context never blocks another and a context's callbacks never run concurrently
//!   with themselves.

use crate::market::{BarPeriod, EventKind, MarketEvent, Price};
use arc_swap::ArcSwap;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Anything that consumes routed market events.
pub trait MarketSubscriber: Send + Sync {
    fn on_market_event(&self, event: &MarketEvent);

    /// Name used in logs.
    fn name(&self) -> &str {
        "subscriber"
    }
}

pub type SubscriberId = u64;

/// Granularity a subscriber listens to for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Tick,
    Bar(BarPeriod),
    OrderQueue,
    OrderDetail,
    Transaction,
}

impl TopicKind {
    fn of(event: &MarketEvent) -> Self {
        match event {
            MarketEvent::Quote(_) => TopicKind::Tick,
            MarketEvent::Bar { period, .. } => TopicKind::Bar(*period),
            MarketEvent::OrderQueue(_) => TopicKind::OrderQueue,
            MarketEvent::OrderDetail(_) => TopicKind::OrderDetail,
            MarketEvent::Transaction(_) => TopicKind::Transaction,
        }
    }

    pub fn event_kind(&self) -> EventKind {
        match self {
            TopicKind::Tick => EventKind::Quote,
            TopicKind::Bar(_) => EventKind::Bar,
            TopicKind::OrderQueue => EventKind::OrderQueue,
            TopicKind::OrderDetail => EventKind::OrderDetail,
            TopicKind::Transaction => EventKind::Transaction,
        }
    }
}

/// How events reach subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// On the dispatching thread (deterministic; used by replay).
    #[default]
    Inline,
    /// Per-subscriber queue drained by a dedicated worker thread (live).
    Queued,
}

enum Envelope {
    Event(Arc<MarketEvent>),
    Shutdown,
}

/// Delivery endpoint of one subscriber.
struct Endpoint {
    id: SubscriberId,
    subscriber: Arc<dyn MarketSubscriber>,
    queue: Option<Sender<Envelope>>,
}

impl Endpoint {
    fn deliver(&self, event: &Arc<MarketEvent>) -> bool {
        match &self.queue {
            None => {
                self.subscriber.on_market_event(event);
                true
            }
            Some(tx) => tx.send(Envelope::Event(Arc::clone(event))).is_ok(),
        }
    }
}

#[derive(Clone)]
struct Route {
    kind: TopicKind,
    endpoint: Arc<Endpoint>,
}

/// Immutable routing snapshot.
#[derive(Default, Clone)]
struct RouteTable {
    sources: HashSet<String>,
    by_code: HashMap<String, Vec<Route>>,
    /// Subscribers that receive every event (recorders, loggers).
    firehose: Vec<Arc<Endpoint>>,
}

/// Registry entry kept by the writer side.
struct SubscriberSlot {
    endpoint: Arc<Endpoint>,
    worker: Option<JoinHandle<()>>,
}

/// Delivery counters.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub dispatched: AtomicU64,
    pub delivered: AtomicU64,
    /// Events with no subscriber for their topic.
    pub unrouted: AtomicU64,
    /// Events from a source that is not attached.
    pub rejected_source: AtomicU64,
    /// Queue sends that failed because the worker was gone.
    pub dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatcherStatsSnapshot {
    pub dispatched: u64,
    pub delivered: u64,
    pub unrouted: u64,
    pub rejected_source: u64,
    pub dropped: u64,
}

/// Last traded price per instrument, updated by every dispatched event.
#[derive(Debug, Default)]
pub struct PriceBoard {
    prices: RwLock<HashMap<String, Price>>,
}

impl PriceBoard {
    pub fn update(&self, code: &str, price: Price) {
        let mut prices = self.prices.write();
        match prices.get_mut(code) {
            Some(p) => *p = price,
            None => {
                prices.insert(code.to_string(), price);
            }
        }
    }

    pub fn get(&self, code: &str) -> Option<Price> {
        self.prices.read().get(code).copied()
    }

    pub fn clear(&self) {
        self.prices.write().clear();
    }
}

pub struct Dispatcher {
    mode: DeliveryMode,
    table: ArcSwap<RouteTable>,
    writer: Mutex<HashMap<SubscriberId, SubscriberSlot>>,
    next_id: AtomicU64,
    stats: DispatcherStats,
    prices: Arc<PriceBoard>,
}

impl Dispatcher {
    pub fn new(mode: DeliveryMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            table: ArcSwap::from_pointee(RouteTable::default()),
            writer: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stats: DispatcherStats::default(),
            prices: Arc::new(PriceBoard::default()),
        })
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn prices(&self) -> Arc<PriceBoard> {
        Arc::clone(&self.prices)
    }

    // -------------------------------------------------------------------------
    // Sources
    // -------------------------------------------------------------------------

    /// Allow events tagged with `source` through. Returns false if already attached.
    pub fn attach_source(&self, source: &str) -> bool {
        let _guard = self.writer.lock();
        let current = self.table.load();
        if current.sources.contains(source) {
            return false;
        }
        let mut next = RouteTable::clone(&current);
        next.sources.insert(source.to_string());
        self.table.store(Arc::new(next));
        debug!(source = %source, "Source attached to dispatcher");
        true
    }

    /// Stop accepting events from `source`. Events already queued still drain.
    pub fn detach_source(&self, source: &str) -> bool {
        let _guard = self.writer.lock();
        let current = self.table.load();
        if !current.sources.contains(source) {
            return false;
        }
        let mut next = RouteTable::clone(&current);
        next.sources.remove(source);
        self.table.store(Arc::new(next));
        debug!(source = %source, "Source detached from dispatcher");
        true
    }

    pub fn is_attached(&self, source: &str) -> bool {
        self.table.load().sources.contains(source)
    }

    // -------------------------------------------------------------------------
    // Subscribers
    // -------------------------------------------------------------------------

    /// Register a subscriber. In `Queued` mode this spawns its worker thread.
    pub fn register(&self, subscriber: Arc<dyn MarketSubscriber>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, worker) = match self.mode {
            DeliveryMode::Inline => (None, None),
            DeliveryMode::Queued => {
                let (tx, rx) = channel::unbounded();
                let worker = spawn_worker(id, Arc::clone(&subscriber), rx);
                (Some(tx), worker)
            }
        };
        let endpoint = Arc::new(Endpoint {
            id,
            subscriber,
            queue,
        });
        self.writer.lock().insert(
            id,
            SubscriberSlot {
                endpoint,
                worker,
            },
        );
        id
    }

    /// Route `kind` events for `code` to a registered subscriber.
    pub fn subscribe(&self, id: SubscriberId, code: &str, kind: TopicKind) -> bool {
        let writer = self.writer.lock();
        let Some(slot) = writer.get(&id) else {
            warn!(subscriber = id, code = %code, "Subscribe for unknown subscriber");
            return false;
        };
        let current = self.table.load();
        let already = current
            .by_code
            .get(code)
            .map_or(false, |r| r.iter().any(|r| r.kind == kind && r.endpoint.id == id));
        if already {
            return true;
        }
        let mut next = RouteTable::clone(&current);
        next.by_code.entry(code.to_string()).or_default().push(Route {
            kind,
            endpoint: Arc::clone(&slot.endpoint),
        });
        self.table.store(Arc::new(next));
        true
    }

    /// Receive every event regardless of topic.
    pub fn subscribe_all(&self, id: SubscriberId) -> bool {
        let writer = self.writer.lock();
        let Some(slot) = writer.get(&id) else {
            return false;
        };
        let current = self.table.load();
        if current.firehose.iter().any(|e| e.id == id) {
            return true;
        }
        let mut next = RouteTable::clone(&current);
        next.firehose.push(Arc::clone(&slot.endpoint));
        self.table.store(Arc::new(next));
        true
    }

    /// Remove a subscriber from every route. Blocks until its worker has finished any
    /// in-flight callback and exited.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let slot = {
            let mut writer = self.writer.lock();
            let Some(slot) = writer.remove(&id) else {
                return false;
            };
            let current = self.table.load();
            let mut next = RouteTable::clone(&current);
            for routes in next.by_code.values_mut() {
                routes.retain(|r| r.endpoint.id != id);
            }
            next.by_code.retain(|_, routes| !routes.is_empty());
            next.firehose.retain(|e| e.id != id);
            self.table.store(Arc::new(next));
            slot
        };

        if let Some(tx) = &slot.endpoint.queue {
            let _ = tx.send(Envelope::Shutdown);
        }
        if let Some(worker) = slot.worker {
            if worker.thread().id() == std::thread::current().id() {
                warn!(subscriber = id, "Subscriber unregistered from its own worker; not joining");
            } else if worker.join().is_err() {
                warn!(subscriber = id, "Subscriber worker panicked");
            }
        }
        true
    }

    pub fn subscriber_count(&self) -> usize {
        self.writer.lock().len()
    }

    /// Drop every subscriber and source.
    pub fn reset(&self) {
        let ids: Vec<SubscriberId> = self.writer.lock().keys().copied().collect();
        for id in ids {
            self.unregister(id);
        }
        let _guard = self.writer.lock();
        self.table.store(Arc::new(RouteTable::default()));
    }

    // -------------------------------------------------------------------------
    // Delivery
    // -------------------------------------------------------------------------

    /// Deliver one event from `source` to every subscriber of its topic.
    /// Returns the number of subscribers it was handed to.
    pub fn dispatch(&self, source: &str, event: MarketEvent) -> usize {
        let table = self.table.load();
        if !table.sources.contains(source) {
            self.stats.rejected_source.fetch_add(1, Ordering::Relaxed);
            return 0;
        }
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        if let Some(price) = event.mark_price() {
            self.prices.update(event.code(), price);
        }

        let kind = TopicKind::of(&event);
        let event = Arc::new(event);
        let mut handed = 0usize;
        if let Some(routes) = table.by_code.get(event.code()) {
            for route in routes.iter().filter(|r| r.kind == kind) {
                handed += self.deliver(&route.endpoint, &event);
            }
        }
        for endpoint in &table.firehose {
            handed += self.deliver(endpoint, &event);
        }
        if handed == 0 {
            self.stats.unrouted.fetch_add(1, Ordering::Relaxed);
        }
        handed
    }

    fn deliver(&self, endpoint: &Endpoint, event: &Arc<MarketEvent>) -> usize {
        if endpoint.deliver(event) {
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            1
        } else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            0
        }
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            unrouted: self.stats.unrouted.load(Ordering::Relaxed),
            rejected_source: self.stats.rejected_source.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let slots: Vec<SubscriberSlot> = self.writer.get_mut().drain().map(|(_, s)| s).collect();
        for slot in slots {
            if let Some(tx) = &slot.endpoint.queue {
                let _ = tx.send(Envelope::Shutdown);
            }
            if let Some(worker) = slot.worker {
                let _ = worker.join();
            }
        }
    }
}

fn spawn_worker(
    id: SubscriberId,
    subscriber: Arc<dyn MarketSubscriber>,
    rx: Receiver<Envelope>,
) -> Option<JoinHandle<()>> {
    let name = format!("dispatch-{}", id);
    let spawned = std::thread::Builder::new().name(name).spawn(move || {
        info!(subscriber = %subscriber.name(), "Dispatcher worker started");
        for envelope in rx.iter() {
            match envelope {
                Envelope::Event(event) => subscriber.on_market_event(&event),
                Envelope::Shutdown => break,
            }
        }
        debug!(subscriber = %subscriber.name(), "Dispatcher worker stopped");
    });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(subscriber = id, error = %e, "Failed to spawn dispatcher worker");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Bar, Tick};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, i64)>>,
    }

    impl MarketSubscriber for Recorder {
        fn on_market_event(&self, event: &MarketEvent) {
            self.seen
                .lock()
                .push((event.code().to_string(), event.time()));
        }
    }

    fn quote(code: &str, time: i64) -> MarketEvent {
        MarketEvent::Quote(Tick {
            code: code.into(),
            time,
            price: 10.0,
            ..Default::default()
        })
    }

    #[test]
    fn test_routes_by_code_and_kind() {
        let d = Dispatcher::new(DeliveryMode::Inline);
        d.attach_source("p1");
        let rec = Arc::new(Recorder::default());
        let id = d.register(rec.clone());
        d.subscribe(id, "SSE.600000", TopicKind::Tick);

        assert_eq!(d.dispatch("p1", quote("SSE.600000", 1)), 1);
        assert_eq!(d.dispatch("p1", quote("SSE.600036", 2)), 0);
        let bar = MarketEvent::Bar {
            period: BarPeriod::M1,
            bar: Bar {
                code: "SSE.600000".into(),
                time: 3,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 0.0,
                turnover: 0.0,
                open_interest: 0.0,
            },
        };
        assert_eq!(d.dispatch("p1", bar), 0);

        assert_eq!(rec.seen.lock().as_slice(), &[("SSE.600000".to_string(), 1)]);
        assert_eq!(d.prices().get("SSE.600036"), Some(10.0));
        let stats = d.stats();
        assert_eq!(stats.dispatched, 3);
        assert_eq!(stats.unrouted, 2);
    }

    #[test]
    fn test_unattached_source_rejected() {
        let d = Dispatcher::new(DeliveryMode::Inline);
        let rec = Arc::new(Recorder::default());
        let id = d.register(rec.clone());
        d.subscribe_all(id);
        assert_eq!(d.dispatch("ghost", quote("X.1", 1)), 0);
        assert!(rec.seen.lock().is_empty());
        assert_eq!(d.stats().rejected_source, 1);

        d.attach_source("ghost");
        d.detach_source("ghost");
        assert_eq!(d.dispatch("ghost", quote("X.1", 2)), 0);
    }

    #[test]
    fn test_queued_preserves_per_subscriber_order() {
        let d = Dispatcher::new(DeliveryMode::Queued);
        d.attach_source("p1");
        let rec = Arc::new(Recorder::default());
        let id = d.register(rec.clone());
        d.subscribe(id, "SSE.600000", TopicKind::Tick);

        for t in 0..500 {
            d.dispatch("p1", quote("SSE.600000", t));
        }
        // unregister drains the queue up to the shutdown marker and joins the worker
        assert!(d.unregister(id));
        let seen = rec.seen.lock();
        assert_eq!(seen.len(), 500);
        assert!(seen.windows(2).all(|w| w[0].1 < w[1].1));
        drop(seen);

        assert_eq!(d.dispatch("p1", quote("SSE.600000", 999)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(rec.seen.lock().len(), 500);
    }

    #[test]
    fn test_slow_subscriber_does_not_block_others() {
        struct Slow;
        impl MarketSubscriber for Slow {
            fn on_market_event(&self, _event: &MarketEvent) {
                std::thread::sleep(Duration::from_millis(20));
            }
        }

        let d = Dispatcher::new(DeliveryMode::Queued);
        d.attach_source("p1");
        let slow = d.register(Arc::new(Slow));
        let rec = Arc::new(Recorder::default());
        let fast = d.register(rec.clone());
        d.subscribe(slow, "A.1", TopicKind::Tick);
        d.subscribe(fast, "A.1", TopicKind::Tick);

        let started = std::time::Instant::now();
        for t in 0..10 {
            d.dispatch("p1", quote("A.1", t));
        }
        assert!(started.elapsed() < Duration::from_millis(100));
        d.unregister(fast);
        assert_eq!(rec.seen.lock().len(), 10);
        d.unregister(slow);
    }
}
