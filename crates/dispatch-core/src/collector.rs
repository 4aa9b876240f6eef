use crate::outcome::Outcome;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Completed-task counter shared with observers.
#[derive(Debug, Clone, Default)]
pub struct Progress(Arc<AtomicU64>);

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Accumulates outcomes in completion order, at most one per task id.
#[derive(Debug, Default)]
pub struct ResultCollector {
    outcomes: Vec<Outcome>,
    seen: HashSet<u64>,
    successes: u64,
    progress: Progress,
}

impl ResultCollector {
    pub fn new(progress: Progress) -> Self {
        Self {
            progress,
            ..Self::default()
        }
    }

    /// Returns false, and drops the outcome, if the task was already recorded.
    pub fn record(&mut self, outcome: Outcome) -> bool {
        if !self.seen.insert(outcome.task_id()) {
            warn!(task_id = outcome.task_id(), "dropping second outcome for task");
            return false;
        }
        if outcome.is_success() {
            self.successes += 1;
        }
        self.outcomes.push(outcome);
        self.progress.increment();
        true
    }

    pub fn completed(&self) -> u64 {
        self.outcomes.len() as u64
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    pub fn into_outcomes(self) -> Vec<Outcome> {
        self.outcomes
    }
}

/// Sending side plus the task that drains the results channel.
pub struct CollectorHandle {
    tx: mpsc::Sender<Outcome>,
    join: JoinHandle<ResultCollector>,
    progress: Progress,
}

impl CollectorHandle {
    /// Spawn the single writer. `expected` is only used for progress lines.
    pub fn spawn(expected: u64, buffer: usize, print_every: Duration) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let progress = Progress::new();
        let collector = ResultCollector::new(progress.clone());
        let join = tokio::spawn(collect(rx, collector, expected, print_every));
        Self { tx, join, progress }
    }

    pub fn sender(&self) -> mpsc::Sender<Outcome> {
        self.tx.clone()
    }

    pub fn progress(&self) -> Progress {
        self.progress.clone()
    }

    /// Close the channel and wait for everything already sent. Senders
    /// handed out earlier must be dropped first.
    pub async fn finish(self) -> Vec<Outcome> {
        drop(self.tx);
        match self.join.await {
            Ok(collector) => collector.into_outcomes(),
            Err(e) => {
                warn!("result collector stopped abnormally: {e}");
                Vec::new()
            }
        }
    }
}

async fn collect(
    mut rx: mpsc::Receiver<Outcome>,
    mut collector: ResultCollector,
    expected: u64,
    print_every: Duration,
) -> ResultCollector {
    let mut last_print = Instant::now();
    while let Some(outcome) = rx.recv().await {
        collector.record(outcome);
        if last_print.elapsed() >= print_every {
            info!(
                "Progress: completed={}/{} successful={} failed={}",
                collector.completed(),
                expected,
                collector.successes(),
                collector.completed() - collector.successes()
            );
            last_print = Instant::now();
        }
    }
    collector
}
