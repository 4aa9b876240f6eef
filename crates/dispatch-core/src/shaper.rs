use crate::config::ShapingConfig;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Fixed-cadence burst release: at most `burst` new tasks per tick,
/// regardless of how long earlier tasks take to finish.
pub struct RateShaper {
    burst: u32,
    tick: Duration,
    interval: Interval,
    ticks: u64,
}

impl RateShaper {
    pub fn new(config: ShapingConfig) -> Self {
        let tick = config.tick();
        let mut interval = interval(tick);
        // A late tick must not be followed by a catch-up burst.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            burst: config.burst,
            tick,
            interval,
            ticks: 0,
        }
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Ticks elapsed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Wait for the next tick boundary and return its release allowance.
    /// The first tick completes immediately.
    pub async fn next_tick(&mut self) -> u32 {
        self.interval.tick().await;
        self.ticks += 1;
        self.burst
    }
}
