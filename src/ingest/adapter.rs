//! Parser Adapter
//!
//! Wraps one external connector, applies the configured exchange/instrument filter and
//! forwards accepted events to the dispatcher under the adapter's id.
//!
//! # Lifecycle
//! `init` (validate config, build filter, bind connector) -> `run` (connect) ->
//! `release` (disconnect, detach from dispatcher). The filter never changes after
//! `init`. Events that race with `release` are either forwarded or dropped.

use crate::config::ParserConfig;
use crate::error::PlatformResult;
use crate::ingest::connector::{Connector, ConnectorRegistry, ConnectorSink, LogLevel};
use crate::ingest::dispatcher::Dispatcher;
use crate::market::{MarketEvent, OrderDetail, OrderQueue, SubscriptionFilter, Tick, Transaction};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Connector-facing half of the adapter: filter + forward.
struct AdapterSink {
    id: String,
    filter: SubscriptionFilter,
    dispatcher: Arc<Dispatcher>,
    released: AtomicBool,
    forwarded: AtomicU64,
    filtered: AtomicU64,
}

impl AdapterSink {
    fn forward(&self, event: MarketEvent) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        if !self.filter.accepts(event.exchange(), event.code()) {
            self.filtered.fetch_add(1, Ordering::Relaxed);
            metrics::increment_counter!("parser_events_filtered", "adapter" => self.id.clone());
            return;
        }
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("parser_events_forwarded", "adapter" => self.id.clone());
        self.dispatcher.dispatch(&self.id, event);
    }
}

impl ConnectorSink for AdapterSink {
    fn handle_quote(&self, tick: Tick) {
        self.forward(MarketEvent::Quote(tick));
    }

    fn handle_order_queue(&self, queue: OrderQueue) {
        self.forward(MarketEvent::OrderQueue(queue));
    }

    fn handle_transaction(&self, trans: Transaction) {
        self.forward(MarketEvent::Transaction(trans));
    }

    fn handle_order_detail(&self, detail: OrderDetail) {
        self.forward(MarketEvent::OrderDetail(detail));
    }

    fn handle_parser_log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(adapter = %self.id, "{}", message),
            LogLevel::Info => info!(adapter = %self.id, "{}", message),
            LogLevel::Warn => warn!(adapter = %self.id, "{}", message),
            LogLevel::Error => error!(adapter = %self.id, "{}", message),
        }
    }
}

/// Snapshot of an adapter's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdapterStats {
    pub forwarded: u64,
    pub filtered: u64,
}

pub struct ParserAdapter {
    dispatcher: Arc<Dispatcher>,
    sink: Option<Arc<AdapterSink>>,
    connector: Mutex<Option<Box<dyn Connector>>>,
    subscriptions: Vec<String>,
    running: AtomicBool,
    released: AtomicBool,
}

impl ParserAdapter {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            sink: None,
            connector: Mutex::new(None),
            subscriptions: Vec::new(),
            running: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    /// Validate `config`, build the filter and bind a connector of `config.kind`.
    /// Returns false (adapter untouched) on any configuration error.
    pub fn init(&mut self, id: &str, config: &ParserConfig, registry: &ConnectorRegistry) -> bool {
        let connector = match registry.create(&config.kind) {
            Ok(c) => c,
            Err(e) => {
                error!(adapter = %id, error = %e, "Parser init failed");
                return false;
            }
        };
        self.init_with_connector(id, config, connector)
    }

    /// `init` with an externally supplied connector.
    pub fn init_with_connector(
        &mut self,
        id: &str,
        config: &ParserConfig,
        mut connector: Box<dyn Connector>,
    ) -> bool {
        match self.prepare(id, config, connector.as_mut()) {
            Ok(sink) => {
                info!(
                    adapter = %id,
                    kind = %connector.kind(),
                    exchanges = sink.filter.exchanges().len(),
                    codes = sink.filter.codes().len(),
                    "Parser adapter initialized"
                );
                self.sink = Some(Arc::new(sink));
                self.subscriptions = config.codes.clone();
                *self.connector.lock() = Some(connector);
                true
            }
            Err(e) => {
                error!(adapter = %id, error = %e, "Parser init failed");
                false
            }
        }
    }

    fn prepare(
        &self,
        id: &str,
        config: &ParserConfig,
        connector: &mut dyn Connector,
    ) -> PlatformResult<AdapterSink> {
        if self.sink.is_some() {
            return Err(crate::error::PlatformError::Config(format!(
                "adapter {} already initialized",
                id
            )));
        }
        config.validate()?;
        let filter = SubscriptionFilter::build(&config.exchanges, &config.codes)?;
        connector.init(&config.params)?;
        Ok(AdapterSink {
            id: id.to_string(),
            filter,
            dispatcher: Arc::clone(&self.dispatcher),
            released: AtomicBool::new(false),
            forwarded: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &str {
        self.sink.as_ref().map_or("", |s| s.id.as_str())
    }

    pub fn is_initialized(&self) -> bool {
        self.sink.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn filter(&self) -> Option<&SubscriptionFilter> {
        self.sink.as_ref().map(|s| &s.filter)
    }

    /// Start the connector. A no-op when already running; refused after release.
    pub fn run(&self) -> bool {
        let Some(sink) = &self.sink else {
            warn!("run() on uninitialized parser adapter");
            return false;
        };
        if self.released.load(Ordering::Acquire) {
            warn!(adapter = %sink.id, "run() on released parser adapter");
            return false;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return true;
        }

        self.dispatcher.attach_source(&sink.id);
        let mut guard = self.connector.lock();
        let Some(connector) = guard.as_mut() else {
            self.running.store(false, Ordering::Release);
            return false;
        };
        if !self.subscriptions.is_empty() {
            connector.subscribe(&self.subscriptions);
        }
        let sink_dyn: Arc<dyn ConnectorSink> = Arc::clone(sink) as Arc<dyn ConnectorSink>;
        match connector.connect(sink_dyn) {
            Ok(()) => {
                info!(adapter = %sink.id, "Parser adapter running");
                true
            }
            Err(e) => {
                error!(adapter = %sink.id, error = %e, "Connector failed to start");
                self.running.store(false, Ordering::Release);
                self.dispatcher.detach_source(&sink.id);
                false
            }
        }
    }

    /// Stop the connector and unregister from the dispatcher. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(sink) = &self.sink else {
            return;
        };
        sink.released.store(true, Ordering::Release);
        if let Some(mut connector) = self.connector.lock().take() {
            connector.disconnect();
        }
        self.dispatcher.detach_source(&sink.id);
        self.running.store(false, Ordering::Release);
        info!(
            adapter = %sink.id,
            forwarded = sink.forwarded.load(Ordering::Relaxed),
            filtered = sink.filtered.load(Ordering::Relaxed),
            "Parser adapter released"
        );
    }

    pub fn stats(&self) -> AdapterStats {
        self.sink.as_ref().map_or_else(AdapterStats::default, |s| AdapterStats {
            forwarded: s.forwarded.load(Ordering::Relaxed),
            filtered: s.filtered.load(Ordering::Relaxed),
        })
    }

    /// Connector entry point, exposed for in-process producers and tests.
    pub fn sink(&self) -> Option<Arc<dyn ConnectorSink>> {
        self.sink
            .as_ref()
            .map(|s| Arc::clone(s) as Arc<dyn ConnectorSink>)
    }
}

impl Drop for ParserAdapter {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::connector::ChannelConnector;
    use crate::ingest::dispatcher::{DeliveryMode, MarketSubscriber};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl MarketSubscriber for Counter {
        fn on_market_event(&self, _event: &MarketEvent) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn tick(code: &str, exchange: &str) -> Tick {
        Tick {
            code: code.into(),
            exchange: exchange.into(),
            time: 1,
            price: 1.0,
            ..Default::default()
        }
    }

    fn setup(exchanges: &[&str]) -> (Arc<Dispatcher>, ParserAdapter, Arc<Counter>) {
        let dispatcher = Dispatcher::new(DeliveryMode::Inline);
        let counter = Arc::new(Counter::default());
        let id = dispatcher.register(counter.clone());
        dispatcher.subscribe_all(id);

        let mut config = ParserConfig::new("p1", "channel");
        config.exchanges = exchanges.iter().map(|s| s.to_string()).collect();
        let (_tx, rx) = crossbeam::channel::unbounded();
        let mut adapter = ParserAdapter::new(Arc::clone(&dispatcher));
        assert!(adapter.init_with_connector("p1", &config, Box::new(ChannelConnector::new(rx))));
        (dispatcher, adapter, counter)
    }

    #[test]
    fn test_exchange_filter_drops_silently() {
        let (_d, adapter, counter) = setup(&["SSE"]);
        assert!(adapter.run());
        let sink = adapter.sink().unwrap();
        sink.handle_quote(tick("SSE.600000", "SSE"));
        sink.handle_quote(tick("SZSE.000001", "SZSE"));
        sink.handle_quote(tick("SZSE.000002", ""));
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);
        assert_eq!(
            adapter.stats(),
            AdapterStats {
                forwarded: 1,
                filtered: 2
            }
        );
        adapter.release();
    }

    #[test]
    fn test_run_twice_is_noop() {
        let (d, adapter, _counter) = setup(&[]);
        assert!(adapter.run());
        assert!(adapter.run());
        assert!(d.is_attached("p1"));
        adapter.release();
        assert!(!d.is_attached("p1"));
        assert!(!adapter.run());
    }

    #[test]
    fn test_events_after_release_dropped() {
        let (_d, adapter, counter) = setup(&[]);
        adapter.run();
        let sink = adapter.sink().unwrap();
        adapter.release();
        sink.handle_quote(tick("SSE.600000", "SSE"));
        assert_eq!(counter.0.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_bad_config_leaves_adapter_uninitialized() {
        let dispatcher = Dispatcher::new(DeliveryMode::Inline);
        let registry = ConnectorRegistry::with_builtins();
        let mut adapter = ParserAdapter::new(dispatcher);

        let mut config = ParserConfig::new("p1", "jsonl");
        // jsonl without a path
        assert!(!adapter.init("p1", &config, &registry));
        assert!(!adapter.is_initialized());

        config.kind = "nope".into();
        assert!(!adapter.init("p1", &config, &registry));

        let mut blank = ParserConfig::new("p1", "channel");
        blank.exchanges = vec!["".into()];
        let (_tx, rx) = crossbeam::channel::unbounded();
        assert!(!adapter.init_with_connector("p1", &blank, Box::new(ChannelConnector::new(rx))));
        assert!(adapter.filter().is_none());
    }
}
