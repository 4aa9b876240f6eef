//! Run orchestration: admission under the governor, optional rate shaping
//! and time box, then drain or cutoff, then reporting.

use crate::collector::CollectorHandle;
use crate::config::{ClosurePolicy, RunConfig, ShapingConfig};
use crate::error::{DispatchError, DispatchResult};
use crate::executor::CallExecutor;
use crate::governor::{Governor, Permit};
use crate::outcome::Outcome;
use crate::report::{failure_report, ReportHook, RunReport, RunSummary, Termination};
use crate::shaper::RateShaper;
use crate::task::{Task, TaskSource};
use crate::time_box::TimeBox;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Upper bound on buffered, not yet collected outcomes.
const MAX_CHANNEL_BUFFER: usize = 10_000;

pub struct Dispatcher<P> {
    run: RunConfig,
    shaping: Option<ShapingConfig>,
    executor: Arc<dyn CallExecutor<P>>,
    hooks: Vec<Arc<dyn ReportHook>>,
}

impl<P> Dispatcher<P>
where
    P: Clone + Send + Sync + 'static,
{
    pub fn new(
        run: RunConfig,
        shaping: Option<ShapingConfig>,
        executor: Arc<dyn CallExecutor<P>>,
    ) -> Self {
        Self {
            run,
            shaping,
            executor,
            hooks: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn ReportHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn validate(&self) -> DispatchResult<()> {
        self.run.validate()?;
        if let Some(shaping) = &self.shaping {
            shaping.validate()?;
        }
        Ok(())
    }

    /// Dispatch every task the source produces, within the configured
    /// limits. Only misconfiguration is an error; per-task failures end up
    /// in the report.
    pub async fn run(&self, mut source: TaskSource<P>) -> DispatchResult<RunReport> {
        self.validate()?;
        if source.is_empty() {
            return Err(DispatchError::EmptySource);
        }

        let planned = source.len();
        let governor = Governor::new(self.run.concurrency);
        info!(
            "Dispatching {} tasks ({} distinct inputs, {} cycles) via {}: concurrency={} shaping={} budget={} closure={:?}",
            planned,
            source.distinct_inputs(),
            source.cycles(),
            self.executor.name(),
            governor.capacity(),
            self.shaping
                .map(|s| format!("{}/{}ms", s.burst, s.tick_ms))
                .unwrap_or_else(|| "off".to_string()),
            self.run
                .max_time_ms
                .map(|ms| format!("{ms}ms"))
                .unwrap_or_else(|| "none".to_string()),
            self.run.closure,
        );

        let time_box = TimeBox::start(self.run.max_time());
        let collector = CollectorHandle::spawn(
            planned,
            (planned as usize).min(MAX_CHANNEL_BUFFER),
            self.run.progress_every(),
        );

        let mut launcher = Launcher {
            executor: self.executor.clone(),
            call_timeout: self.run.call_timeout(),
            outcomes: collector.sender(),
            in_flight: JoinSet::new(),
            admitted: 0,
        };

        let mut termination = match self.shaping {
            Some(shaping) => {
                admit_shaped(&mut source, &mut launcher, &governor, &time_box, shaping).await
            }
            None => admit_unshaped(&mut source, &mut launcher, &governor, &time_box).await,
        };

        if termination == Termination::TimeLimit {
            info!(
                "Reached time limit of {}ms with {} of {} tasks admitted",
                time_box.budget().unwrap_or_default().as_millis(),
                launcher.admitted,
                planned
            );
        }

        let Launcher {
            outcomes,
            mut in_flight,
            admitted,
            ..
        } = launcher;
        drop(outcomes);

        match self.run.closure {
            ClosurePolicy::Drain => {
                if !in_flight.is_empty() {
                    info!("Waiting for {} in-flight requests to complete...", in_flight.len());
                }
                drain(&mut in_flight).await;
            }
            ClosurePolicy::HardCutoff => {
                let drained = match time_box.deadline() {
                    Some(deadline) => timeout_at(deadline, drain(&mut in_flight)).await.is_ok(),
                    None => {
                        drain(&mut in_flight).await;
                        true
                    }
                };
                if !drained {
                    warn!("Hard cutoff: abandoning {} in-flight requests", in_flight.len());
                    in_flight.shutdown().await;
                    termination = Termination::TimeLimit;
                }
            }
        }

        self.executor.flush().await;
        let outcomes = collector.finish().await;
        let wall_clock = time_box.elapsed();
        let summary = RunSummary::from_outcomes(planned, admitted, &outcomes, wall_clock, termination);
        let failure_report = failure_report(&outcomes, self.run.report_samples);

        info!(
            "Run finished: processed={}/{} successful={} failed={} transport={} status={} decode={} upstream={} wall_clock={}ms throughput={:.2}/s time_limit_reached={}",
            summary.processed,
            summary.planned,
            summary.successful,
            summary.failed,
            summary.errors.transport,
            summary.errors.status,
            summary.errors.decode,
            summary.errors.upstream_semantic,
            summary.wall_clock_ms,
            summary.throughput_per_sec,
            summary.time_limit_reached
        );

        let report = RunReport {
            summary,
            outcomes,
            failure_report,
        };

        for hook in &self.hooks {
            if let Err(e) = hook.on_complete(&report) {
                warn!(hook = hook.name(), "report hook failed: {e}");
            }
        }

        Ok(report)
    }
}

/// Spawns admitted tasks and keeps their handles.
struct Launcher<P> {
    executor: Arc<dyn CallExecutor<P>>,
    call_timeout: Duration,
    outcomes: mpsc::Sender<Outcome>,
    in_flight: JoinSet<()>,
    admitted: u64,
}

impl<P> Launcher<P>
where
    P: Send + Sync + 'static,
{
    fn launch(&mut self, task: Task<P>, permit: Permit) {
        let executor = self.executor.clone();
        let outcomes = self.outcomes.clone();
        let call_timeout = self.call_timeout;
        self.admitted += 1;
        debug!(task_id = task.id, cycle = task.cycle, "admitted");

        self.in_flight.spawn(async move {
            let outcome = execute_one(executor.as_ref(), &task, call_timeout).await;
            // The permit is held until the outcome is handed to the collector.
            let _ = outcomes.send(outcome).await;
            drop(permit);
        });
    }
}

async fn admit_unshaped<P>(
    source: &mut TaskSource<P>,
    launcher: &mut Launcher<P>,
    governor: &Governor,
    time_box: &TimeBox,
) -> Termination
where
    P: Clone + Send + Sync + 'static,
{
    loop {
        if source.remaining() == 0 {
            return Termination::Exhausted;
        }
        if time_box.is_closed() {
            return Termination::TimeLimit;
        }
        let permit = tokio::select! {
            biased;
            _ = time_box.closed() => return Termination::TimeLimit,
            permit = governor.admit() => permit,
        };
        match source.next() {
            Some(task) => launcher.launch(task, permit),
            None => return Termination::Exhausted,
        }
    }
}

async fn admit_shaped<P>(
    source: &mut TaskSource<P>,
    launcher: &mut Launcher<P>,
    governor: &Governor,
    time_box: &TimeBox,
    shaping: ShapingConfig,
) -> Termination
where
    P: Clone + Send + Sync + 'static,
{
    let mut shaper = RateShaper::new(shaping);
    debug!(
        "Shaping admissions to at most {} every {}ms",
        shaper.burst(),
        shaper.tick().as_millis()
    );
    loop {
        if source.remaining() == 0 {
            return Termination::Exhausted;
        }
        if time_box.is_closed() {
            return Termination::TimeLimit;
        }
        let allowance = tokio::select! {
            biased;
            _ = time_box.closed() => return Termination::TimeLimit,
            allowance = shaper.next_tick() => allowance,
        };

        let mut released = 0u32;
        while released < allowance {
            let Some(permit) = governor.try_admit() else {
                break;
            };
            let Some(task) = source.next() else {
                break;
            };
            launcher.launch(task, permit);
            released += 1;
        }
        debug!(
            tick = shaper.ticks(),
            released,
            in_flight = governor.in_flight(),
            remaining = source.remaining(),
            "tick"
        );
    }
}

async fn drain(in_flight: &mut JoinSet<()>) {
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            warn!("dispatch task ended abnormally: {e}");
        }
    }
}

/// One attempt under the per-call timeout. Timeouts and executor panics
/// become transport failures.
async fn execute_one<P>(executor: &dyn CallExecutor<P>, task: &Task<P>, call_timeout: Duration) -> Outcome
where
    P: Sync,
{
    let start = Instant::now();
    let call = AssertUnwindSafe(executor.execute(task)).catch_unwind();
    match timeout(call_timeout, call).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(panic)) => {
            let detail = format!("call executor panicked: {}", panic_message(panic.as_ref()));
            warn!(task_id = task.id, "{detail}");
            Outcome::transport(task.id, start.elapsed(), detail)
        }
        Err(_) => Outcome::transport(
            task.id,
            start.elapsed(),
            format!("call timed out after {}ms", call_timeout.as_millis()),
        ),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockExecutor;
    use crate::outcome::ErrorKind;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::sleep;

    /// Records how many calls overlap and when each one starts.
    struct CountingExecutor {
        delay: Duration,
        current: AtomicUsize,
        max: AtomicUsize,
        started: Mutex<Vec<Instant>>,
        origin: Instant,
    }

    impl CountingExecutor {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                current: AtomicUsize::new(0),
                max: AtomicUsize::new(0),
                started: Mutex::new(Vec::new()),
                origin: Instant::now(),
            })
        }

        fn max_concurrent(&self) -> usize {
            self.max.load(Ordering::SeqCst)
        }

        fn starts_per_window(&self, window: Duration) -> Vec<usize> {
            let started = self.started.lock().unwrap();
            let mut counts = Vec::new();
            for at in started.iter() {
                let idx = (at.duration_since(self.origin).as_millis() / window.as_millis()) as usize;
                if counts.len() <= idx {
                    counts.resize(idx + 1, 0);
                }
                counts[idx] += 1;
            }
            counts
        }
    }

    impl CallExecutor<u32> for CountingExecutor {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn execute<'a>(&'a self, task: &'a Task<u32>) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
            Box::pin(async move {
                self.started.lock().unwrap().push(Instant::now());
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.max.fetch_max(now, Ordering::SeqCst);
                sleep(self.delay).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Outcome::success(task.id, 200, self.delay, None)
            })
        }
    }

    struct PanickingExecutor;

    impl CallExecutor<u32> for PanickingExecutor {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn execute<'a>(&'a self, task: &'a Task<u32>) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
            Box::pin(async move {
                if task.id % 2 == 0 {
                    panic!("executor bug on task {}", task.id);
                }
                Outcome::success(task.id, 200, Duration::ZERO, None)
            })
        }
    }

    fn inputs(n: u32) -> Vec<u32> {
        (0..n).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_cap() {
        let executor = CountingExecutor::new(Duration::from_millis(100));
        let dispatcher: Dispatcher<u32> = Dispatcher::new(RunConfig::new(5), None, executor.clone());

        let report = dispatcher.run(TaskSource::single_pass(inputs(50))).await.unwrap();
        assert_eq!(executor.max_concurrent(), 5);
        assert_eq!(report.outcomes.len(), 50);
        assert_eq!(report.summary.submitted, 50);
        assert_eq!(report.summary.termination, Termination::Exhausted);
        assert!(!report.summary.time_limit_reached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_without_budget_collects_everything() {
        let executor = CountingExecutor::new(Duration::from_millis(30));
        let dispatcher: Dispatcher<u32> = Dispatcher::new(RunConfig::new(8), None, executor);

        let report = dispatcher.run(TaskSource::cycling(inputs(3), 40)).await.unwrap();
        assert_eq!(report.summary.planned, 40);
        assert_eq!(report.summary.processed, 40);
        assert_eq!(report.summary.successful, 40);
        assert!(report.failure_report.is_none());

        let mut ids: Vec<_> = report.outcomes.iter().map(|o| o.task_id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=40).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shaper_limits_admissions_per_tick() {
        let executor = CountingExecutor::new(Duration::from_millis(250));
        let shaping = ShapingConfig { burst: 3, tick_ms: 100 };
        let dispatcher: Dispatcher<u32> = Dispatcher::new(RunConfig::new(100), Some(shaping), executor.clone());

        let report = dispatcher.run(TaskSource::single_pass(inputs(10))).await.unwrap();
        assert_eq!(report.summary.processed, 10);

        let per_tick = executor.starts_per_window(Duration::from_millis(100));
        assert_eq!(per_tick, vec![3, 3, 3, 1]);
        // Calls outlive the tick, so more than one burst is in flight at once.
        assert!(executor.max_concurrent() > 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shaper_bounded_by_available_permits() {
        let executor = CountingExecutor::new(Duration::from_millis(150));
        let shaping = ShapingConfig { burst: 10, tick_ms: 100 };
        let dispatcher: Dispatcher<u32> = Dispatcher::new(RunConfig::new(2), Some(shaping), executor.clone());

        let report = dispatcher.run(TaskSource::single_pass(inputs(6))).await.unwrap();
        assert_eq!(report.summary.processed, 6);
        assert_eq!(executor.max_concurrent(), 2);
        assert!(executor.starts_per_window(Duration::from_millis(100)).iter().all(|&n| n <= 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_cutoff_abandons_slow_calls() {
        let executor = CountingExecutor::new(Duration::from_secs(5));
        let run = RunConfig::new(1000).with_budget(Duration::from_secs(2), ClosurePolicy::HardCutoff);
        let dispatcher: Dispatcher<u32> = Dispatcher::new(run, Some(ShapingConfig::per_second(100)), executor);

        let report = dispatcher.run(TaskSource::single_pass(inputs(1000))).await.unwrap();
        let summary = &report.summary;
        assert!(summary.processed < 100);
        assert!(summary.time_limit_reached);
        assert_eq!(summary.termination, Termination::TimeLimit);
        assert!(summary.submitted >= 100);
        assert!(summary.submitted <= 300);
        assert!(summary.wall_clock_ms < 5000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_awaits_in_flight_after_deadline() {
        let executor = CountingExecutor::new(Duration::from_secs(5));
        let run = RunConfig::new(1000).with_budget(Duration::from_secs(2), ClosurePolicy::Drain);
        let dispatcher: Dispatcher<u32> = Dispatcher::new(run, Some(ShapingConfig::per_second(100)), executor);

        let report = dispatcher.run(TaskSource::single_pass(inputs(1000))).await.unwrap();
        let summary = &report.summary;
        assert!(summary.time_limit_reached);
        assert_eq!(summary.processed, summary.submitted);
        assert!(summary.submitted < 1000);
        assert!(summary.wall_clock_ms >= 5000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_cutoff_abandons_in_flight_after_source_runs_out() {
        let executor = CountingExecutor::new(Duration::from_secs(5));
        let run = RunConfig::new(10).with_budget(Duration::from_secs(2), ClosurePolicy::HardCutoff);
        let dispatcher: Dispatcher<u32> = Dispatcher::new(run, None, executor.clone());

        let report = dispatcher.run(TaskSource::single_pass(inputs(3))).await.unwrap();
        let summary = &report.summary;
        assert_eq!(summary.submitted, 3);
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.termination, Termination::TimeLimit);
        assert!(summary.time_limit_reached);
        assert_eq!(summary.wall_clock_ms, 2000);
        assert_eq!(executor.started.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_cutoff_not_triggered_when_work_finishes_early() {
        let executor = CountingExecutor::new(Duration::from_millis(10));
        let run = RunConfig::new(4).with_budget(Duration::from_secs(60), ClosurePolicy::HardCutoff);
        let dispatcher: Dispatcher<u32> = Dispatcher::new(run, None, executor);

        let report = dispatcher.run(TaskSource::single_pass(inputs(20))).await.unwrap();
        assert_eq!(report.summary.processed, 20);
        assert!(!report.summary.time_limit_reached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unshaped_deadline_stops_admission() {
        let executor = CountingExecutor::new(Duration::from_secs(1));
        let run = RunConfig::new(2).with_budget(Duration::from_millis(2500), ClosurePolicy::Drain);
        let dispatcher: Dispatcher<u32> = Dispatcher::new(run, None, executor);

        let report = dispatcher.run(TaskSource::single_pass(inputs(100))).await.unwrap();
        // Admissions at 0s, 1s and 2s, two slots each.
        assert_eq!(report.summary.submitted, 6);
        assert_eq!(report.summary.processed, 6);
        assert!(report.summary.time_limit_reached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_timeout_is_transport_failure() {
        let executor = Arc::new(MockExecutor::new(Duration::from_secs(10)));
        let run = RunConfig::new(2).with_call_timeout(Duration::from_secs(1));
        let dispatcher: Dispatcher<String> = Dispatcher::new(run, None, executor);

        let report = dispatcher
            .run(TaskSource::single_pass(vec!["slow".to_string()]))
            .await
            .unwrap();
        let outcome = &report.outcomes[0];
        assert!(!outcome.is_success());
        assert_eq!(outcome.error_kind(), ErrorKind::Transport);
        assert_eq!(outcome.status_code(), None);
        assert_eq!(outcome.elapsed(), Duration::from_secs(1));
        assert_eq!(report.summary.errors.transport, 1);
        assert!(report.failure_report.unwrap().contains("call timed out after 1000ms"));
    }

    #[tokio::test]
    async fn test_panicking_executor_still_yields_outcome() {
        let dispatcher: Dispatcher<u32> = Dispatcher::new(RunConfig::new(3), None, Arc::new(PanickingExecutor));

        let report = dispatcher.run(TaskSource::single_pass(inputs(6))).await.unwrap();
        assert_eq!(report.outcomes.len(), 6);
        assert_eq!(report.summary.successful, 3);
        assert_eq!(report.summary.errors.transport, 3);
        assert!(report
            .outcomes
            .iter()
            .filter(|o| !o.is_success())
            .all(|o| o.error_detail().unwrap().contains("panicked")));
    }

    #[tokio::test]
    async fn test_empty_source_is_rejected() {
        let dispatcher: Dispatcher<u32> = Dispatcher::new(RunConfig::new(1), None, CountingExecutor::new(Duration::ZERO));
        let err = dispatcher.run(TaskSource::single_pass(Vec::new())).await.unwrap_err();
        assert!(matches!(err, DispatchError::EmptySource));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_admission() {
        let executor = CountingExecutor::new(Duration::ZERO);
        let dispatcher: Dispatcher<u32> = Dispatcher::new(RunConfig::new(0), None, executor.clone());
        let err = dispatcher.run(TaskSource::single_pass(inputs(3))).await.unwrap_err();
        assert!(matches!(err, DispatchError::ConfigValidation { .. }));
        assert!(executor.started.lock().unwrap().is_empty());

        let shaping = ShapingConfig { burst: 0, tick_ms: 1000 };
        let dispatcher: Dispatcher<u32> = Dispatcher::new(RunConfig::new(1), Some(shaping), executor);
        assert!(dispatcher.run(TaskSource::single_pass(inputs(3))).await.is_err());
    }

    struct RecordingHook {
        seen: Mutex<Option<RunSummary>>,
    }

    impl ReportHook for RecordingHook {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn on_complete(&self, report: &RunReport) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            *self.seen.lock().unwrap() = Some(report.summary.clone());
            Ok(())
        }
    }

    struct FailingHook;

    impl ReportHook for FailingHook {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn on_complete(&self, _report: &RunReport) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("disk full".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hooks_receive_report_and_failures_are_ignored() {
        let recording = Arc::new(RecordingHook { seen: Mutex::new(None) });
        let executor = Arc::new(MockExecutor::failing(Duration::from_millis(5), ErrorKind::UpstreamSemantic));
        let dispatcher: Dispatcher<String> = Dispatcher::new(RunConfig::new(2), None, executor)
            .with_hook(Arc::new(FailingHook))
            .with_hook(recording.clone());

        let report = dispatcher
            .run(TaskSource::repeated("answer yes.".to_string(), 4))
            .await
            .unwrap();
        assert_eq!(report.summary.errors.upstream_semantic, 4);
        assert!(report.failure_report.is_some());

        let seen = recording.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen, report.summary);
    }
}
