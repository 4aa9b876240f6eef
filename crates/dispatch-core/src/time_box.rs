use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Wall-clock budget for admitting new work.
#[derive(Debug, Clone, Copy)]
pub struct TimeBox {
    start: Instant,
    budget: Option<Duration>,
}

impl TimeBox {
    pub fn start(budget: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    pub fn budget(&self) -> Option<Duration> {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.budget.map(|b| self.start + b)
    }

    pub fn is_closed(&self) -> bool {
        match self.budget {
            Some(budget) => self.elapsed() >= budget,
            None => false,
        }
    }

    /// Resolves once the budget is spent; never resolves without one.
    pub async fn closed(&self) {
        match self.deadline() {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
