use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use stampede_metrics::MetricKind;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::error::{ConfigError, Error};
use crate::options::{Options, Stage};
use crate::runner::{Runner, Vu};
use crate::sample::{Sample, SampleSink, builtin};
use crate::schedule::StageSchedule;
use crate::shutdown::Shutdown;

/// How long in-flight iterations get to finish once the run is over.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Supervisor cadence: envelope refresh, end-condition checks, pool top-up.
const TICK: Duration = Duration::from_millis(100);

/// Parked workers recheck at least this often even without a wake-up.
const PARK_RECHECK: Duration = Duration::from_millis(50);

/// init -> running <-> paused -> terminating -> done. External shutdown
/// forces terminating from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Init = 0,
    Running = 1,
    Paused = 2,
    Terminating = 3,
    Done = 4,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::Init,
            1 => Phase::Running,
            2 => Phase::Paused,
            3 => Phase::Terminating,
            _ => Phase::Done,
        }
    }
}

/// The elapsed-run-time clock. Pausing stops it entirely, so a test paused
/// for T seconds finishes T seconds later than it otherwise would.
#[derive(Debug, Default)]
struct Clock {
    started: Option<Instant>,
    paused_since: Option<Instant>,
    paused_total: Duration,
}

impl Clock {
    /// Starts the clock, or resumes it after a pause.
    fn start(&mut self, now: Instant) {
        if self.started.is_none() {
            self.started = Some(now);
        } else if let Some(since) = self.paused_since.take() {
            self.paused_total += now.saturating_duration_since(since);
        }
    }

    fn pause(&mut self, now: Instant) {
        if self.started.is_some() && self.paused_since.is_none() {
            self.paused_since = Some(now);
        }
    }

    fn elapsed(&self, now: Instant) -> Duration {
        let Some(started) = self.started else {
            return Duration::ZERO;
        };
        let mut paused = self.paused_total;
        if let Some(since) = self.paused_since {
            paused += now.saturating_duration_since(since);
        }
        now.saturating_duration_since(started).saturating_sub(paused)
    }
}

struct Inner {
    runner: Arc<dyn Runner>,
    sink: SampleSink,

    phase: AtomicU8,
    clock: Mutex<Clock>,
    wake: Notify,

    /// Target VU count when no stages are configured; mutated by `set_vus`.
    manual_vus: AtomicU64,
    vus_max: AtomicU64,
    /// The resolved target the workers obey, refreshed every tick.
    current_target: AtomicU64,
    schedule: RwLock<Arc<StageSchedule>>,

    start_paused: bool,
    end_time: Option<Duration>,
    end_iterations: Option<u64>,

    iters_started: AtomicU64,
    iters_done: AtomicU64,
    in_flight: AtomicU64,
    dropped: AtomicU64,
}

impl Inner {
    fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
        self.wake.notify_waiters();
    }

    fn elapsed(&self) -> Duration {
        self.clock.lock().elapsed(Instant::now())
    }

    fn has_stages(&self) -> bool {
        !self.schedule.read().stages().is_empty()
    }

    fn resolve_target(&self, elapsed: Duration) -> u64 {
        let vus_max = self.vus_max.load(Ordering::Relaxed);
        let target = if self.has_stages() {
            self.schedule.read().target_at(elapsed)
        } else {
            self.manual_vus.load(Ordering::Relaxed)
        };
        target.min(vus_max)
    }

    fn refresh_target(&self) {
        let target = self.resolve_target(self.elapsed());
        let previous = self.current_target.swap(target, Ordering::Relaxed);
        if previous != target {
            self.wake.notify_waiters();
        }
    }

    /// Atomically hands out the next iteration, or refuses once the global
    /// bound is reached.
    fn claim_iteration(&self) -> bool {
        match self.end_iterations {
            Some(limit) => {
                let mut current = self.iters_started.load(Ordering::Relaxed);
                loop {
                    if current >= limit {
                        return false;
                    }
                    match self.iters_started.compare_exchange_weak(
                        current,
                        current + 1,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return true,
                        Err(actual) => current = actual,
                    }
                }
            }
            None => {
                self.iters_started.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    fn unclaim_iteration(&self) {
        self.iters_started.fetch_sub(1, Ordering::Relaxed);
    }

    fn complete_iteration(&self, duration: Duration, error: Option<Error>) {
        self.iters_done.fetch_add(1, Ordering::Relaxed);
        self.sink
            .emit(Sample::now(builtin::ITERATIONS, MetricKind::Counter, 1.0));
        self.sink.emit(Sample::now(
            builtin::ITERATION_DURATION,
            MetricKind::Trend,
            duration.as_secs_f64() * 1_000.0,
        ));

        if let Some(err) = error {
            tracing::warn!(error = %err, "iteration failed");
            self.sink.emit(
                Sample::now(builtin::ERRORS, MetricKind::Counter, 1.0)
                    .with_tag("kind", err.kind_label()),
            );
        }
    }

    async fn wait_wake(&self) {
        let _ = tokio::time::timeout(PARK_RECHECK, self.wake.notified()).await;
    }
}

/// Keeps the live VU count on the target dictated by the static VU value or
/// the staged envelope, terminates on whichever of the iteration and time
/// bounds fires first, and supports pause/resume and live adjustment.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    /// Expects normalized options (see [`Options::normalize`]).
    pub fn new(runner: Arc<dyn Runner>, sink: SampleSink, options: &Options) -> Executor {
        let vus = options.vus.unwrap_or(1);
        let vus_max = options.vus_max.unwrap_or(vus);
        let schedule = Arc::new(StageSchedule::new(vus, options.stages.clone()));

        Executor {
            inner: Arc::new(Inner {
                runner,
                sink,
                phase: AtomicU8::new(Phase::Init as u8),
                clock: Mutex::new(Clock::default()),
                wake: Notify::new(),
                manual_vus: AtomicU64::new(vus),
                vus_max: AtomicU64::new(vus_max),
                current_target: AtomicU64::new(vus.min(vus_max)),
                schedule: RwLock::new(schedule),
                start_paused: options.paused.unwrap_or(false),
                end_time: options.duration,
                end_iterations: options.iterations,
                iters_started: AtomicU64::new(0),
                iters_done: AtomicU64::new(0),
                in_flight: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    // Observables. All reads are lock-free or take short internal locks;
    // safe to call from the API server while the run mutates state.

    pub fn time(&self) -> Duration {
        self.inner.elapsed()
    }

    pub fn iterations(&self) -> u64 {
        self.inner.iters_done.load(Ordering::Relaxed)
    }

    pub fn end_time(&self) -> Option<Duration> {
        self.inner.end_time
    }

    pub fn end_iterations(&self) -> Option<u64> {
        self.inner.end_iterations
    }

    pub fn vus(&self) -> u64 {
        self.inner.current_target.load(Ordering::Relaxed)
    }

    pub fn vus_max(&self) -> u64 {
        self.inner.vus_max.load(Ordering::Relaxed)
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.inner.schedule.read().stages().to_vec()
    }

    pub fn dropped_iterations(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.phase() == Phase::Paused
    }

    pub fn is_running(&self) -> bool {
        matches!(self.inner.phase(), Phase::Running | Phase::Paused)
    }

    // Mutators, shared by the control API and the run orchestrator.

    /// Rejects targets above `vus-max`; a parked VU stays allocated against
    /// the cap, so the cap is the hard limit.
    pub fn set_vus(&self, vus: u64) -> Result<(), ConfigError> {
        let vus_max = self.inner.vus_max.load(Ordering::Relaxed);
        if vus > vus_max {
            return Err(ConfigError::VusExceedMax { vus, vus_max });
        }
        self.inner.manual_vus.store(vus, Ordering::Relaxed);
        if !self.inner.has_stages() {
            self.inner.current_target.store(vus, Ordering::Relaxed);
        }
        self.inner.wake.notify_waiters();
        Ok(())
    }

    /// Raising the cap lets the supervisor mint more workers on its next
    /// tick; lowering it below the current VU count lowers the count to
    /// match.
    pub fn set_vus_max(&self, vus_max: u64) {
        self.inner.vus_max.store(vus_max, Ordering::Relaxed);
        let _ = self
            .inner
            .manual_vus
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                (v > vus_max).then_some(vus_max)
            });
        let _ = self
            .inner
            .current_target
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                (v > vus_max).then_some(vus_max)
            });
        self.inner.wake.notify_waiters();
    }

    /// Pausing freezes envelope progression and blocks new iterations;
    /// mid-flight iterations run to completion. Resuming restarts the clock,
    /// so a pause of T extends the run's natural end by T.
    pub fn set_paused(&self, paused: bool) {
        let now = Instant::now();
        match (self.inner.phase(), paused) {
            (Phase::Running, true) => {
                self.inner.clock.lock().pause(now);
                self.inner.set_phase(Phase::Paused);
            }
            (Phase::Paused, false) => {
                self.inner.clock.lock().start(now);
                self.inner.set_phase(Phase::Running);
            }
            _ => {}
        }
    }

    /// Drives the run to completion. Consumes this handle; clones stay valid
    /// for observation and control.
    pub async fn run(self, shutdown: Arc<Shutdown>) -> Result<(), Error> {
        let inner = self.inner;

        if inner.start_paused {
            inner.set_phase(Phase::Paused);
        } else {
            inner.clock.lock().start(Instant::now());
            inner.set_phase(Phase::Running);
        }
        inner.refresh_target();

        let mut workers: JoinSet<()> = JoinSet::new();
        let mut spawned: u64 = 0;

        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Top up the pool: one worker per slot up to the (possibly
            // raised) cap. VU instances themselves are minted lazily, on a
            // slot's first active iteration, and retained after that.
            let vus_max = inner.vus_max.load(Ordering::Relaxed);
            while spawned < vus_max {
                workers.spawn(worker_loop(inner.clone(), shutdown.clone(), spawned));
                spawned += 1;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => break,
            }

            inner.refresh_target();

            let elapsed = inner.elapsed();
            if let Some(end) = inner.end_time
                && elapsed >= end
            {
                break;
            }
            if let Some(limit) = inner.end_iterations
                && inner.iters_done.load(Ordering::Relaxed) >= limit
            {
                break;
            }

            // Reap finished workers; if the whole pool has wound down (every
            // iteration claimed, or no VU could be minted), the run is over.
            while workers.try_join_next().is_some() {}
            if spawned > 0 && workers.is_empty() {
                break;
            }
        }

        inner.set_phase(Phase::Terminating);

        // In-flight iterations get a bounded grace window; anything still
        // running after that is abandoned and counted.
        let drained = tokio::time::timeout(GRACE_PERIOD, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            let abandoned = inner.in_flight.load(Ordering::Relaxed);
            if abandoned > 0 {
                tracing::warn!(abandoned, "iterations exceeded the shutdown grace window");
                inner.dropped.fetch_add(abandoned, Ordering::Relaxed);
                inner.sink.emit(Sample::now(
                    builtin::DROPPED_ITERATIONS,
                    MetricKind::Counter,
                    abandoned as f64,
                ));
            }
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }

        inner.set_phase(Phase::Done);
        Ok(())
    }
}

async fn worker_loop(inner: Arc<Inner>, shutdown: Arc<Shutdown>, slot: u64) {
    // VU ids are 1-based; slot k runs when the target exceeds k.
    let id = slot + 1;
    let mut vu: Option<Box<dyn Vu>> = None;

    loop {
        if shutdown.is_fired() {
            break;
        }
        match inner.phase() {
            Phase::Init | Phase::Paused => {
                inner.wait_wake().await;
                continue;
            }
            Phase::Terminating | Phase::Done => break,
            Phase::Running => {}
        }

        if slot >= inner.current_target.load(Ordering::Relaxed) {
            inner.wait_wake().await;
            continue;
        }

        if !inner.claim_iteration() {
            break;
        }

        if vu.is_none() {
            match mint_vu(&inner, id) {
                Ok(minted) => vu = Some(minted),
                Err(err) => {
                    tracing::error!(vu = id, error = %err, "failed to mint VU, parking worker");
                    inner.unclaim_iteration();
                    break;
                }
            }
        }
        let Some(active) = vu.as_mut() else { break };

        inner.in_flight.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let outcome = tokio::select! {
            res = active.run_once() => Some(res),
            _ = shutdown.wait() => None,
        };
        inner.in_flight.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            Some(Ok(())) => inner.complete_iteration(started.elapsed(), None),
            Some(Err(err)) => inner.complete_iteration(started.elapsed(), Some(err)),
            // Cancelled mid-iteration; the run is shutting down.
            None => break,
        }
    }
}

fn mint_vu(inner: &Inner, id: u64) -> Result<Box<dyn Vu>, Error> {
    let mut vu = inner.runner.new_vu(inner.sink.clone())?;
    vu.reconfigure(id)?;
    Ok(vu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::Group;
    use std::future::Future;
    use std::pin::Pin;

    struct TestRunner {
        group: Arc<Group>,
        options: Mutex<Options>,
        delay: Duration,
        completed: Arc<AtomicU64>,
    }

    impl TestRunner {
        fn new(delay: Duration) -> (Arc<TestRunner>, Arc<AtomicU64>) {
            let completed = Arc::new(AtomicU64::new(0));
            let runner = Arc::new(TestRunner {
                group: Group::root(),
                options: Mutex::new(Options::default()),
                delay,
                completed: completed.clone(),
            });
            (runner, completed)
        }
    }

    impl Runner for TestRunner {
        fn new_vu(&self, _sink: SampleSink) -> Result<Box<dyn Vu>, Error> {
            Ok(Box::new(TestVu {
                delay: self.delay,
                completed: self.completed.clone(),
            }))
        }

        fn options(&self) -> Options {
            self.options.lock().clone()
        }

        fn set_options(&self, options: Options) {
            *self.options.lock() = options;
        }

        fn default_group(&self) -> Arc<Group> {
            self.group.clone()
        }
    }

    struct TestVu {
        delay: Duration,
        completed: Arc<AtomicU64>,
    }

    impl Vu for TestVu {
        fn reconfigure(&mut self, _id: u64) -> Result<(), Error> {
            Ok(())
        }

        fn run_once(&mut self) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>> {
            let delay = self.delay;
            let completed = self.completed.clone();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                completed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        }
    }

    fn executor_for(
        runner: Arc<TestRunner>,
        options: Options,
    ) -> (Executor, tokio::sync::mpsc::UnboundedReceiver<Sample>) {
        let (sink, rx) = SampleSink::channel();
        let options = options.normalize().unwrap_or_else(|e| panic!("{e}"));
        (Executor::new(runner, sink, &options), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn iteration_bound_is_exact() {
        let (runner, completed) = TestRunner::new(Duration::from_millis(10));
        let (executor, _rx) = executor_for(
            runner,
            Options {
                vus: Some(5),
                iterations: Some(10),
                ..Default::default()
            },
        );

        let shutdown = Arc::new(Shutdown::new());
        executor
            .clone()
            .run(shutdown)
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        assert_eq!(executor.iterations(), 10);
        assert_eq!(completed.load(Ordering::Relaxed), 10);
        assert!(!executor.is_running());
        assert_eq!(executor.dropped_iterations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duration_bound_fires_on_time() {
        let (runner, _) = TestRunner::new(Duration::from_millis(10));
        let (executor, _rx) = executor_for(
            runner,
            Options {
                vus: Some(2),
                duration: Some(Duration::from_millis(500)),
                ..Default::default()
            },
        );

        let shutdown = Arc::new(Shutdown::new());
        executor
            .clone()
            .run(shutdown)
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        let elapsed = executor.time();
        assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(800), "{elapsed:?}");
        assert!(executor.iterations() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_extends_the_run_by_the_paused_time() {
        let (runner, _) = TestRunner::new(Duration::from_millis(10));
        let (executor, _rx) = executor_for(
            runner,
            Options {
                vus: Some(1),
                duration: Some(Duration::from_secs(1)),
                ..Default::default()
            },
        );

        let shutdown = Arc::new(Shutdown::new());
        let handle = tokio::spawn(executor.clone().run(shutdown));

        tokio::time::sleep(Duration::from_millis(300)).await;
        executor.set_paused(true);
        assert!(executor.is_paused());

        // Five virtual seconds go by; the run clock must not move.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(executor.is_running());
        let frozen = executor.time();
        assert!(frozen <= Duration::from_millis(400), "{frozen:?}");

        executor.set_paused(false);
        handle
            .await
            .unwrap_or_else(|e| panic!("{e}"))
            .unwrap_or_else(|e| panic!("{e}"));

        let elapsed = executor.time();
        assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1300), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn paused_start_waits_for_resume() {
        let (runner, completed) = TestRunner::new(Duration::from_millis(1));
        let (executor, _rx) = executor_for(
            runner,
            Options {
                vus: Some(1),
                iterations: Some(1),
                paused: Some(true),
                ..Default::default()
            },
        );

        let shutdown = Arc::new(Shutdown::new());
        let handle = tokio::spawn(executor.clone().run(shutdown));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(executor.is_paused());
        assert_eq!(completed.load(Ordering::Relaxed), 0);
        assert_eq!(executor.time(), Duration::ZERO);

        executor.set_paused(false);
        handle
            .await
            .unwrap_or_else(|e| panic!("{e}"))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(executor.iterations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn vus_setters_enforce_the_cap() {
        let (runner, _) = TestRunner::new(Duration::from_millis(10));
        let (executor, _rx) = executor_for(
            runner,
            Options {
                vus: Some(5),
                vus_max: Some(50),
                duration: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        );

        assert!(executor.set_vus(51).is_err());
        executor.set_vus(20).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(executor.vus(), 20);

        // Lowering the cap below the current count drags the count down.
        executor.set_vus_max(10);
        assert_eq!(executor.vus_max(), 10);
        assert_eq!(executor.vus(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn envelope_ramps_the_live_target() {
        let (runner, _) = TestRunner::new(Duration::from_millis(5));
        let (executor, _rx) = executor_for(
            runner,
            Options {
                vus: Some(0),
                stages: vec![Stage {
                    duration: Duration::from_secs(1),
                    target: 10,
                }],
                ..Default::default()
            },
        );

        let shutdown = Arc::new(Shutdown::new());
        let handle = tokio::spawn(executor.clone().run(shutdown));

        tokio::time::sleep(Duration::from_millis(520)).await;
        let mid = executor.vus();
        assert!((4..=6).contains(&mid), "target at half-ramp was {mid}");

        handle
            .await
            .unwrap_or_else(|e| panic!("{e}"))
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(executor.iterations() > 0);
        assert_eq!(executor.vus_max(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn overlong_iterations_are_dropped_at_shutdown() {
        let (runner, _) = TestRunner::new(Duration::from_secs(120));
        let (executor, mut rx) = executor_for(
            runner,
            Options {
                vus: Some(2),
                duration: Some(Duration::from_millis(200)),
                ..Default::default()
            },
        );

        let shutdown = Arc::new(Shutdown::new());
        executor
            .clone()
            .run(shutdown)
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        assert_eq!(executor.iterations(), 0);
        assert_eq!(executor.dropped_iterations(), 2);

        let mut saw_dropped_sample = false;
        while let Ok(sample) = rx.try_recv() {
            if sample.metric == builtin::DROPPED_ITERATIONS {
                saw_dropped_sample = true;
                assert_eq!(sample.value, 2.0);
            }
        }
        assert!(saw_dropped_sample);
    }

    #[tokio::test(start_paused = true)]
    async fn external_shutdown_terminates_early() {
        let (runner, _) = TestRunner::new(Duration::from_millis(10));
        let (executor, _rx) = executor_for(
            runner,
            Options {
                vus: Some(2),
                duration: Some(Duration::from_secs(30)),
                ..Default::default()
            },
        );

        let shutdown = Arc::new(Shutdown::new());
        let handle = tokio::spawn(executor.clone().run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(3)).await;
        shutdown.fire();
        handle
            .await
            .unwrap_or_else(|e| panic!("{e}"))
            .unwrap_or_else(|e| panic!("{e}"));

        assert!(!executor.is_running());
        assert!(executor.time() < Duration::from_secs(30));
    }
}
