//! Tradeloom Backend Library
//!
//! Market data ingestion, deterministic backtest replay and strategy contexts that
//! run unchanged against either.
//!
//! - [`ingest`]: connectors, parser adapters and the fan-out dispatcher
//! - [`replay`]: replay clock, historical store, merge queue and engine
//! - [`strategy`]: position ledger and the CTA/SEL/HFT contexts
//! - [`porter`]: the flat, handle-based backtest surface
//! - [`live`]: adapters wired to contexts for live sessions

pub mod config;
pub mod error;
pub mod ingest;
pub mod live;
pub mod market;
pub mod porter;
pub mod replay;
pub mod strategy;
pub mod telemetry;

pub use error::{PlatformError, PlatformResult};
pub use porter::{BacktestPorter, CtaOptions};
