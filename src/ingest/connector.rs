//! Market Data Connectors
//!
//! A connector is the external collaborator that actually talks to an exchange (or a
//! file, or an in-process producer) and pushes decoded events into a `ConnectorSink`.
//! Parser adapters own one connector each.
//!
//! Connector kinds are resolved through a `ConnectorRegistry` populated at process
//! start; there is no dynamic library loading.

use crate::error::{PlatformError, PlatformResult};
use crate::market::{MarketEvent, OrderDetail, OrderQueue, Tick, Transaction};
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Severity of a connector-originated log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Numeric boundary encoding: 0/1 debug, 2 info, 3 warn, 4+ error.
    pub fn from_code(level: u32) -> Self {
        match level {
            0 | 1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

/// Receiver of everything a connector produces. Called from the connector's thread.
pub trait ConnectorSink: Send + Sync {
    fn handle_quote(&self, tick: Tick);
    fn handle_order_queue(&self, queue: OrderQueue);
    fn handle_transaction(&self, trans: Transaction);
    fn handle_order_detail(&self, detail: OrderDetail);
    fn handle_parser_log(&self, level: LogLevel, message: &str);

    /// Route an already-decoded event to the matching handler.
    fn handle_event(&self, event: MarketEvent) {
        match event {
            MarketEvent::Quote(t) => self.handle_quote(t),
            MarketEvent::OrderQueue(q) => self.handle_order_queue(q),
            MarketEvent::Transaction(t) => self.handle_transaction(t),
            MarketEvent::OrderDetail(d) => self.handle_order_detail(d),
            MarketEvent::Bar { bar, .. } => self.handle_parser_log(
                LogLevel::Warn,
                &format!("connector produced a bar for {}; bars are replay-only", bar.code),
            ),
        }
    }
}

/// External market data connector.
pub trait Connector: Send {
    /// Validate and store connector parameters. No I/O.
    fn init(&mut self, params: &toml::Table) -> PlatformResult<()>;

    /// Start producing into `sink`, typically on a connector-owned thread.
    fn connect(&mut self, sink: Arc<dyn ConnectorSink>) -> PlatformResult<()>;

    /// Stop producing. Must not return while the connector can still call the sink.
    fn disconnect(&mut self);

    /// Instruments the adapter wants; connectors without server-side
    /// subscription ignore this.
    fn subscribe(&mut self, _codes: &[String]) {}

    fn is_connected(&self) -> bool;

    fn kind(&self) -> &str;
}

pub type ConnectorFactory = Arc<dyn Fn() -> Box<dyn Connector> + Send + Sync>;

/// Connector kind -> factory.
#[derive(Default)]
pub struct ConnectorRegistry {
    factories: RwLock<HashMap<String, ConnectorFactory>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `jsonl` kind.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("jsonl", || Box::new(JsonlFileConnector::default()));
        registry
    }

    /// Register (or replace) a connector kind.
    pub fn register<F>(&self, kind: &str, factory: F)
    where
        F: Fn() -> Box<dyn Connector> + Send + Sync + 'static,
    {
        let replaced = self
            .factories
            .write()
            .insert(kind.to_string(), Arc::new(factory))
            .is_some();
        if replaced {
            debug!(kind = %kind, "Connector kind replaced");
        }
    }

    /// Register a `channel` connector fed by `rx` under `kind`.
    pub fn register_channel(&self, kind: &str, rx: Receiver<MarketEvent>) {
        self.register(kind, move || Box::new(ChannelConnector::new(rx.clone())));
    }

    pub fn create(&self, kind: &str) -> PlatformResult<Box<dyn Connector>> {
        let factory = self
            .factories
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| PlatformError::Config(format!("unknown connector kind '{}'", kind)))?;
        Ok(factory())
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

// =============================================================================
// CONNECTOR THREAD
// =============================================================================

/// Stop flag plus join handle shared by the built-in connectors.
#[derive(Default)]
struct ConnectorThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ConnectorThread {
    fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    fn spawn<F>(&mut self, name: String, body: F) -> PlatformResult<()>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        self.stop = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&self.stop);
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || body(stop))?;
        self.handle = Some(handle);
        Ok(())
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Connector thread panicked");
            }
        }
    }
}

// =============================================================================
// JSONL FILE CONNECTOR
// =============================================================================

/// Streams `MarketEvent` JSON lines from a file.
///
/// Parameters:
/// - `path` (string, required)
/// - `pace_ms` (integer, optional): sleep between events
#[derive(Default)]
pub struct JsonlFileConnector {
    path: String,
    pace: Option<Duration>,
    thread: ConnectorThread,
}

impl Connector for JsonlFileConnector {
    fn init(&mut self, params: &toml::Table) -> PlatformResult<()> {
        let path = params
            .get("path")
            .and_then(|v| v.as_str())
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| PlatformError::Config("jsonl connector requires 'path'".into()))?;
        let pace = match params.get("pace_ms") {
            None => None,
            Some(v) => {
                let ms = v.as_integer().filter(|ms| *ms >= 0).ok_or_else(|| {
                    PlatformError::Config("'pace_ms' must be a non-negative integer".into())
                })?;
                Some(Duration::from_millis(ms as u64))
            }
        };
        self.path = path.to_string();
        self.pace = pace;
        Ok(())
    }

    fn connect(&mut self, sink: Arc<dyn ConnectorSink>) -> PlatformResult<()> {
        if self.thread.is_running() {
            return Ok(());
        }
        let file = File::open(&self.path)?;
        let pace = self.pace;
        let path = self.path.clone();
        self.thread.spawn(format!("jsonl-{}", path), move |stop| {
            let reader = BufReader::new(file);
            let mut forwarded = 0u64;
            for (lineno, line) in reader.lines().enumerate() {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        sink.handle_parser_log(LogLevel::Error, &format!("read failed: {}", e));
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<MarketEvent>(&line) {
                    Ok(event) => {
                        sink.handle_event(event);
                        forwarded += 1;
                    }
                    Err(e) => sink.handle_parser_log(
                        LogLevel::Warn,
                        &format!("{}:{}: bad event: {}", path, lineno + 1, e),
                    ),
                }
                if let Some(pace) = pace {
                    std::thread::sleep(pace);
                }
            }
            sink.handle_parser_log(
                LogLevel::Info,
                &format!("{} finished after {} events", path, forwarded),
            );
        })?;
        info!(path = %self.path, "JSONL connector started");
        Ok(())
    }

    fn disconnect(&mut self) {
        self.thread.stop_and_join();
    }

    fn is_connected(&self) -> bool {
        self.thread.is_running()
    }

    fn kind(&self) -> &str {
        "jsonl"
    }
}

// =============================================================================
// CHANNEL CONNECTOR
// =============================================================================

/// Pulls events pushed by an in-process producer through a crossbeam channel.
pub struct ChannelConnector {
    rx: Receiver<MarketEvent>,
    thread: ConnectorThread,
}

/// Producer half for a `ChannelConnector`.
pub fn channel_feed() -> (Sender<MarketEvent>, Receiver<MarketEvent>) {
    crossbeam::channel::unbounded()
}

impl ChannelConnector {
    pub fn new(rx: Receiver<MarketEvent>) -> Self {
        Self {
            rx,
            thread: ConnectorThread::default(),
        }
    }
}

impl Connector for ChannelConnector {
    fn init(&mut self, _params: &toml::Table) -> PlatformResult<()> {
        Ok(())
    }

    fn connect(&mut self, sink: Arc<dyn ConnectorSink>) -> PlatformResult<()> {
        if self.thread.is_running() {
            return Ok(());
        }
        let rx = self.rx.clone();
        self.thread
            .spawn("channel-connector".to_string(), move |stop| loop {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                match rx.recv_timeout(Duration::from_millis(10)) {
                    Ok(event) => sink.handle_event(event),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.thread.stop_and_join();
    }

    fn is_connected(&self) -> bool {
        self.thread.is_running()
    }

    fn kind(&self) -> &str {
        "channel"
    }
}

impl Drop for ChannelConnector {
    fn drop(&mut self) {
        self.thread.stop_and_join();
    }
}

impl Drop for JsonlFileConnector {
    fn drop(&mut self) {
        self.thread.stop_and_join();
    }
}
