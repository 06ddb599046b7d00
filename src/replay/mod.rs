//! Deterministic backtest replay: clock, historical store, adjustment factors, the
//! merge queue, the engine and its blotter.

pub mod adjust;
pub mod blotter;
pub mod clock;
pub mod engine;
pub mod history;
pub mod loader;
pub mod queue;


pub use adjust::{AdjFactor, AdjustmentTable};
pub use blotter::{Blotter, ContextBlotter, FundRow, PositionRow};
pub use clock::{ClockHandle, Nanos, ReplayClock, ReplayMode, RunState, RunStatus, TimeRange};
pub use engine::{ReplayEngine, ReplaySettings, RunReport, REPLAY_SOURCE};
pub use history::{FeedReport, HistoryStore, Series};
pub use loader::{read_jsonl, ExtDataLoader, JsonlDirLoader};
pub use queue::ReplayQueue;
