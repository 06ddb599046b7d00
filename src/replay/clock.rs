//! Replay Clock
//!
//! Monotonic simulated clock with nanosecond resolution.
//! Single source of truth for replay time - strategy code never reads system time
//! while a backtest is running.

use chrono::{Datelike, NaiveDate, TimeZone, Timelike, Utc};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

/// Nanoseconds since Unix epoch (1970-01-01 00:00:00 UTC).
pub type Nanos = i64;

pub const NANOS_PER_MICRO: i64 = 1_000;
pub const NANOS_PER_MILLI: i64 = 1_000_000;
pub const NANOS_PER_SEC: i64 = 1_000_000_000;
pub const NANOS_PER_MIN: i64 = 60 * NANOS_PER_SEC;
pub const NANOS_PER_DAY: i64 = 24 * 60 * NANOS_PER_MIN;

/// Shared read view of the current replay time.
///
/// Contexts hold a clone so `get_date`/`get_time` work from inside callbacks
/// without borrowing the engine.
#[derive(Debug, Clone, Default)]
pub struct ClockHandle(Arc<AtomicI64>);

impl ClockHandle {
    pub fn new(start: Nanos) -> Self {
        Self(Arc::new(AtomicI64::new(start)))
    }

    #[inline]
    pub fn now(&self) -> Nanos {
        self.0.load(Ordering::Acquire)
    }

    /// Move forward to `t`; earlier values are ignored so concurrent live
    /// sources can never rewind the clock.
    #[inline]
    pub fn advance_to(&self, t: Nanos) {
        self.0.fetch_max(t, Ordering::AcqRel);
    }

    /// Hard reset (between runs only).
    pub fn reset(&self, t: Nanos) {
        self.0.store(t, Ordering::Release);
    }

    pub fn date(&self) -> u32 {
        nanos_to_ymd(self.now())
    }

    pub fn time(&self) -> u32 {
        nanos_to_hhmm(self.now())
    }

    pub fn secs(&self) -> u32 {
        nanos_to_hhmmss_ms(self.now())
    }
}

/// Execution mode of a replay run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Caller blocks until the run completes.
    Synchronous,
    /// Run executes on a background thread; poll or stop it.
    Asynchronous,
}

/// Lifecycle of a replay run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Done = 3,
}

impl RunState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Done,
            _ => Self::Idle,
        }
    }
}

/// Run state shared between the engine thread and its controller.
#[derive(Debug, Default)]
pub struct RunStatus(AtomicU8);

impl RunStatus {
    pub fn get(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: RunState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Running -> Stopping. Returns false if no run was in progress.
    pub fn request_stop(&self) -> bool {
        self.0
            .compare_exchange(
                RunState::Running as u8,
                RunState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.get(), RunState::Running | RunState::Stopping)
    }
}

/// Inclusive replay window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Nanos,
    pub end: Nanos,
}

impl TimeRange {
    pub fn unbounded() -> Self {
        Self {
            start: Nanos::MIN,
            end: Nanos::MAX,
        }
    }

    #[inline]
    pub fn contains(&self, t: Nanos) -> bool {
        t >= self.start && t <= self.end
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Monotonic replay clock.
///
/// # Determinism Contract
/// - `now()` is replay time, never system time
/// - `advance_to()` only moves forward
/// - the merged event stream drives every advance
#[derive(Debug, Clone)]
pub struct ReplayClock {
    handle: ClockHandle,
    range: TimeRange,
    mode: ReplayMode,
    status: Arc<RunStatus>,
}

impl ReplayClock {
    pub fn new() -> Self {
        Self {
            handle: ClockHandle::new(0),
            range: TimeRange::unbounded(),
            mode: ReplayMode::Synchronous,
            status: Arc::new(RunStatus::default()),
        }
    }

    #[inline]
    pub fn now(&self) -> Nanos {
        self.handle.now()
    }

    pub fn handle(&self) -> ClockHandle {
        self.handle.clone()
    }

    pub fn status(&self) -> Arc<RunStatus> {
        Arc::clone(&self.status)
    }

    pub fn state(&self) -> RunState {
        self.status.get()
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    pub fn set_range(&mut self, start: Nanos, end: Nanos) {
        self.range = TimeRange { start, end };
    }

    pub fn mode(&self) -> ReplayMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ReplayMode) {
        self.mode = mode;
    }

    /// Advance to a new time. Earlier timestamps are a caller bug.
    #[inline]
    pub fn advance_to(&self, t: Nanos) {
        debug_assert!(
            t >= self.now(),
            "ReplayClock: cannot go backward from {} to {}",
            self.now(),
            t
        );
        self.handle.advance_to(t);
    }

    /// Rewind for a fresh run: to the range start, or for an open range to
    /// the first queued event (zero when there is none).
    pub fn rewind(&self, first_event: Option<Nanos>) {
        let start = if self.range.start == Nanos::MIN {
            first_event.unwrap_or(0)
        } else {
            self.range.start
        };
        self.handle.reset(start);
    }
}

impl Default for ReplayClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReplayClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let now = self.now();
        write!(
            f,
            "{}.{:09}s",
            now.div_euclid(NANOS_PER_SEC),
            now.rem_euclid(NANOS_PER_SEC)
        )
    }
}

/// Convert Nanos to chrono DateTime (UTC).
#[inline]
pub fn nanos_to_datetime(nanos: Nanos) -> chrono::DateTime<Utc> {
    let secs = nanos.div_euclid(NANOS_PER_SEC);
    let nsecs = nanos.rem_euclid(NANOS_PER_SEC) as u32;
    Utc.timestamp_opt(secs, nsecs).single().unwrap_or_default()
}

/// Calendar date as `YYYYMMDD`.
pub fn nanos_to_ymd(nanos: Nanos) -> u32 {
    let dt = nanos_to_datetime(nanos);
    dt.year() as u32 * 10_000 + dt.month() * 100 + dt.day()
}

/// Wall time as `HHMM`.
pub fn nanos_to_hhmm(nanos: Nanos) -> u32 {
    let dt = nanos_to_datetime(nanos);
    dt.hour() * 100 + dt.minute()
}

/// Wall time as `HHMMSSmmm`.
pub fn nanos_to_hhmmss_ms(nanos: Nanos) -> u32 {
    let dt = nanos_to_datetime(nanos);
    let millis = dt.nanosecond() / 1_000_000;
    ((dt.hour() * 100 + dt.minute()) * 100 + dt.second()) * 1000 + millis.min(999)
}

/// `YYYYMMDD` at 00:00 UTC.
pub fn ymd_to_nanos(ymd: u32) -> Option<Nanos> {
    ymdhm_to_nanos(ymd as u64 * 10_000)
}

/// Parse a `YYYYMMDDHHMM` stamp (the format used by `set_time_range`).
pub fn ymdhm_to_nanos(stamp: u64) -> Option<Nanos> {
    let minute = (stamp % 100) as u32;
    let hour = (stamp / 100 % 100) as u32;
    let day = (stamp / 10_000 % 100) as u32;
    let month = (stamp / 1_000_000 % 100) as u32;
    let year = (stamp / 100_000_000) as i32;
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)?;
    Utc.from_utc_datetime(&naive).timestamp_nanos_opt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_monotonic() {
        let clock = ReplayClock::new();
        clock.advance_to(1_000_000_000);
        assert_eq!(clock.now(), 1_000_000_000);
        clock.advance_to(2_000_000_000);
        assert_eq!(clock.now(), 2_000_000_000);
    }

    #[test]
    fn test_open_range_rewinds_to_first_event() {
        let before_epoch = ymdhm_to_nanos(196912312350).unwrap();
        assert!(before_epoch < 0);
        let clock = ReplayClock::new();
        clock.advance_to(5_000);
        clock.rewind(Some(before_epoch));
        assert_eq!(clock.now(), before_epoch);
        clock.advance_to(before_epoch + NANOS_PER_MIN);
        assert_eq!(nanos_to_ymd(clock.now()), 19691231);

        clock.rewind(None);
        assert_eq!(clock.now(), 0);
    }

    #[test]
    fn test_handle_never_rewinds() {
        let handle = ClockHandle::new(500);
        handle.advance_to(100);
        assert_eq!(handle.now(), 500);
        handle.advance_to(900);
        assert_eq!(handle.now(), 900);
    }

    #[test]
    fn test_ymdhm_roundtrip() {
        let t = ymdhm_to_nanos(202401021530).unwrap();
        assert_eq!(nanos_to_ymd(t), 20240102);
        assert_eq!(nanos_to_hhmm(t), 1530);
        assert_eq!(nanos_to_hhmmss_ms(t), 153_000_000);
        assert!(ymdhm_to_nanos(202413011530).is_none());
    }

    #[test]
    fn test_run_status_stop_only_when_running() {
        let status = RunStatus::default();
        assert!(!status.request_stop());
        status.set(RunState::Running);
        assert!(status.request_stop());
        assert_eq!(status.get(), RunState::Stopping);
        assert!(status.is_active());
    }

    #[test]
    fn test_rewind_to_range_start() {
        let mut clock = ReplayClock::new();
        let start = ymd_to_nanos(20240101).unwrap();
        clock.set_range(start, start + NANOS_PER_DAY);
        clock.advance_to(start + 5);
        // a bounded range ignores the first event
        clock.rewind(Some(start + 3));
        assert_eq!(clock.now(), start);
    }
}
