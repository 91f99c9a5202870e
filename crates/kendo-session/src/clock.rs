//! Wall-clock sources.
//!
//! Renewal timers are driven by tokio's timer, while expiry timestamps are
//! absolute wall-clock values. [`Clock`] provides the latter so tests can pin
//! it to tokio's (pausable) time.

use chrono::Utc;
use tokio::time::Instant;

/// Source of the current wall-clock time in epoch milliseconds.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> i64;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Wall clock that advances with tokio's clock.
///
/// Under a paused runtime (`tokio::time::pause`, `start_paused = true`) this
/// moves only when tokio time is advanced, which keeps expiry arithmetic and
/// timer firing in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor_millis: i64,
    anchor: Instant,
}

impl TokioClock {
    /// Anchor the clock so that "now" reads as `anchor_millis`.
    pub fn new(anchor_millis: i64) -> Self {
        Self {
            anchor_millis,
            anchor: Instant::now(),
        }
    }

    /// Anchor the clock at the current system time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now().timestamp_millis())
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> i64 {
        let elapsed = i64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.anchor_millis.saturating_add(elapsed)
    }
}
