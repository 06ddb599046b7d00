//! Parser Adapter Manager
//!
//! Registry and lifecycle owner of every parser adapter, keyed by adapter id.

use crate::config::ParserConfig;
use crate::ingest::adapter::ParserAdapter;
use crate::ingest::connector::ConnectorRegistry;
use crate::ingest::dispatcher::Dispatcher;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Default)]
pub struct ParserAdapterMgr {
    adapters: Mutex<BTreeMap<String, Arc<ParserAdapter>>>,
}

impl ParserAdapterMgr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an initialized adapter. False (registry unchanged) if the id is taken.
    pub fn add_adapter(&self, id: &str, adapter: Arc<ParserAdapter>) -> bool {
        let mut adapters = self.adapters.lock();
        if adapters.contains_key(id) {
            warn!(adapter = %id, "Duplicate parser adapter id rejected");
            return false;
        }
        adapters.insert(id.to_string(), adapter);
        true
    }

    pub fn get_adapter(&self, id: &str) -> Option<Arc<ParserAdapter>> {
        self.adapters.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.adapters.lock().keys().cloned().collect()
    }

    /// Build, initialize and register adapters for every active parser entry.
    /// Returns the number registered; failed entries are logged and skipped.
    pub fn load_adapters(
        &self,
        configs: &[ParserConfig],
        registry: &ConnectorRegistry,
        dispatcher: &Arc<Dispatcher>,
    ) -> usize {
        let mut loaded = 0;
        for config in configs {
            if !config.active {
                info!(adapter = %config.id, "Parser inactive, skipped");
                continue;
            }
            if self.adapters.lock().contains_key(&config.id) {
                warn!(adapter = %config.id, "Duplicate parser adapter id rejected");
                continue;
            }
            let mut adapter = ParserAdapter::new(Arc::clone(dispatcher));
            if !adapter.init(&config.id, config, registry) {
                continue;
            }
            if self.add_adapter(&config.id, Arc::new(adapter)) {
                loaded += 1;
            }
        }
        info!(loaded, configured = configs.len(), "Parser adapters loaded");
        loaded
    }

    /// Start every registered adapter.
    pub fn run(&self) -> usize {
        let snapshot: Vec<Arc<ParserAdapter>> = self.adapters.lock().values().cloned().collect();
        snapshot.iter().filter(|a| a.run()).count()
    }

    /// Stop and drop every adapter.
    ///
    /// The map is taken out before any adapter is released, so an adapter whose
    /// teardown calls back into the manager sees an empty registry instead of
    /// deadlocking.
    pub fn release(&self) {
        let adapters = std::mem::take(&mut *self.adapters.lock());
        for (id, adapter) in adapters {
            adapter.release();
            info!(adapter = %id, "Parser adapter removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::dispatcher::DeliveryMode;

    fn channel_registry() -> ConnectorRegistry {
        let registry = ConnectorRegistry::with_builtins();
        let (_tx, rx) = crossbeam::channel::unbounded();
        registry.register_channel("channel", rx);
        registry
    }

    fn adapter(dispatcher: &Arc<Dispatcher>, registry: &ConnectorRegistry, id: &str) -> Arc<ParserAdapter> {
        let mut a = ParserAdapter::new(Arc::clone(dispatcher));
        assert!(a.init(id, &ParserConfig::new(id, "channel"), registry));
        Arc::new(a)
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let d = Dispatcher::new(DeliveryMode::Inline);
        let registry = channel_registry();
        let mgr = ParserAdapterMgr::new();
        assert!(mgr.add_adapter("P1", adapter(&d, &registry, "P1")));
        assert!(!mgr.add_adapter("P1", adapter(&d, &registry, "P1")));
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_unknown_id_is_none() {
        let mgr = ParserAdapterMgr::new();
        assert!(mgr.get_adapter("missing").is_none());
    }

    #[test]
    fn test_run_and_release_all() {
        let d = Dispatcher::new(DeliveryMode::Inline);
        let registry = channel_registry();
        let mgr = ParserAdapterMgr::new();
        mgr.add_adapter("a", adapter(&d, &registry, "a"));
        mgr.add_adapter("b", adapter(&d, &registry, "b"));
        assert_eq!(mgr.run(), 2);
        assert!(d.is_attached("a") && d.is_attached("b"));

        let kept = mgr.get_adapter("a").unwrap();
        mgr.release();
        assert!(mgr.is_empty());
        assert!(!kept.is_running());
        assert!(!d.is_attached("a"));
    }

    #[test]
    fn test_load_skips_inactive_and_broken() {
        let d = Dispatcher::new(DeliveryMode::Inline);
        let registry = channel_registry();
        let mgr = ParserAdapterMgr::new();
        let mut inactive = ParserConfig::new("off", "channel");
        inactive.active = false;
        let configs = vec![
            ParserConfig::new("ok", "channel"),
            inactive,
            ParserConfig::new("broken", "nope"),
            ParserConfig::new("ok", "channel"),
        ];
        assert_eq!(mgr.load_adapters(&configs, &registry, &d), 1);
        assert_eq!(mgr.ids(), vec!["ok".to_string()]);
    }
}
