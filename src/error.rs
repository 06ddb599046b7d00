//! Platform Error Taxonomy
//!
//! Every failure that can cross the ingestion / ledger / replay boundary.
//! None of these are fatal: the porter turns them into logged rejections.

use crate::replay::clock::Nanos;
use std::fmt;

/// Errors raised by adapters, the ledger, and the replay engine.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformError {
    /// Malformed or missing configuration (filters, parameters, connector kind).
    Config(String),
    /// An adapter (or other registry entry) with this id already exists.
    DuplicateId(String),
    /// Exit quantity exceeds the unfrozen quantity available in the matched scope.
    OverExit {
        code: String,
        requested: f64,
        available: f64,
    },
    /// Operation against a released or never-issued context handle.
    UnknownHandle(u64),
    /// Handle-based call into a context from inside that context's own callback.
    Reentrant(u64),
    /// Fed historical data is not sorted ascending by time.
    NonMonotonicFeed {
        code: String,
        previous: Nanos,
        offending: Nanos,
    },
    /// Auto price transform is on but the instrument has no factor series.
    MissingAdjustmentFactor(String),
    /// Non-positive or non-finite quantity.
    InvalidQuantity(f64),
    /// Operation not allowed while a replay is in progress.
    Busy(&'static str),
    /// Filesystem failure (dump, user data).
    Io(String),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::DuplicateId(id) => write!(f, "duplicate id: {}", id),
            Self::OverExit {
                code,
                requested,
                available,
            } => write!(
                f,
                "over-exit on {}: requested {}, available {}",
                code, requested, available
            ),
            Self::UnknownHandle(raw) => write!(f, "unknown or released context handle {:#x}", raw),
            Self::Reentrant(raw) => write!(
                f,
                "context {:#x} called through its handle from inside its own callback",
                raw
            ),
            Self::NonMonotonicFeed {
                code,
                previous,
                offending,
            } => write!(
                f,
                "non-monotonic feed for {}: {} after {}",
                code, offending, previous
            ),
            Self::MissingAdjustmentFactor(code) => {
                write!(f, "no adjustment factors for {}", code)
            }
            Self::InvalidQuantity(qty) => write!(f, "invalid quantity {}", qty),
            Self::Busy(what) => write!(f, "cannot {} while a replay is running", what),
            Self::Io(msg) => write!(f, "io error: {}", msg),
        }
    }
}

impl std::error::Error for PlatformError {}

impl From<std::io::Error> for PlatformError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;
