// Time source for the dispatch loop

use chrono::{DateTime, Duration, Utc};

/// Wall-clock source used to compute fire times
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock derived from tokio's monotonic time
///
/// Under a paused runtime (`#[tokio::test(start_paused = true)]`) it advances
/// together with `tokio::time::sleep`, so dispatch timing is deterministic.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    wall_anchor: DateTime<Utc>,
    instant_anchor: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(wall_anchor: DateTime<Utc>) -> Self {
        Self {
            wall_anchor,
            instant_anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Duration::from_std(self.instant_anchor.elapsed()).unwrap_or(Duration::zero());
        self.wall_anchor + elapsed
    }
}
