//! Logging setup shared by the binaries and the backtest porter.

use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither `RUST_LOG` nor a profile is given.
pub const DEFAULT_FILTER: &str = "tradeloom_backend=info";

fn filter(profile: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| profile.unwrap_or(DEFAULT_FILTER).into())
}

/// Install the global subscriber. Returns false if one was already installed.
pub fn init_logging(profile: Option<&str>) -> bool {
    tracing_subscriber::registry()
        .with(filter(profile))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Like [`init_logging`], additionally appending plain-text lines to `path`.
pub fn init_logging_to_file(profile: Option<&str>, path: &Path) -> anyhow::Result<bool> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let installed = tracing_subscriber::registry()
        .with(filter(profile))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
        .try_init()
        .is_ok();
    Ok(installed)
}
