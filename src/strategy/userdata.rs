//! Per-context key/value user data.
//!
//! Values are opaque strings. When a path is bound the store is loaded on creation and
//! written back on `flush` as a flat JSON object.

use crate::error::{PlatformError, PlatformResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct UserDataStore {
    values: BTreeMap<String, String>,
    path: Option<PathBuf>,
    dirty: bool,
}

impl UserDataStore {
    /// In-memory only.
    pub fn volatile() -> Self {
        Self::default()
    }

    /// `<root>/<context>/ud_<context>.json`, loaded if present.
    pub fn persistent(root: &Path, context: &str) -> Self {
        let path = root.join(context).join(format!("ud_{}.json", context));
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<BTreeMap<String, String>>(&text) {
                Ok(v) => v,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable user data");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        debug!(path = %path.display(), keys = values.len(), "User data loaded");
        Self {
            values,
            path: Some(path),
            dirty: false,
        }
    }

    pub fn save(&mut self, key: &str, value: &str) {
        let changed = self.values.get(key).map_or(true, |v| v != value);
        if changed {
            self.values.insert(key.to_string(), value.to_string());
            self.dirty = true;
        }
    }

    /// Stored value or `default`.
    pub fn load<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.values.get(key).map_or(default, |v| v.as_str())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Write to disk when persistent and modified.
    pub fn flush(&mut self) -> PlatformResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let text = serde_json::to_string_pretty(&self.values)
            .map_err(|e| PlatformError::Io(e.to_string()))?;
        std::fs::write(path, text)?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volatile_defaults() {
        let mut ud = UserDataStore::volatile();
        assert_eq!(ud.load("k", "none"), "none");
        ud.save("k", "v");
        assert_eq!(ud.load("k", "none"), "v");
        assert!(ud.flush().is_ok());
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut ud = UserDataStore::persistent(dir.path(), "alpha");
        ud.save("count", "3");
        ud.flush().unwrap();
        assert!(dir.path().join("alpha").join("ud_alpha.json").exists());

        let reloaded = UserDataStore::persistent(dir.path(), "alpha");
        assert_eq!(reloaded.load("count", "0"), "3");
    }
}
