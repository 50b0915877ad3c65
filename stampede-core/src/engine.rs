use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use stampede_metrics::{MetricKind, Registry};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::MissedTickBehavior;

use crate::collector::Collector;
use crate::error::Error;
use crate::executor::Executor;
use crate::options::Options;
use crate::runner::Runner;
use crate::sample::{Sample, SampleSink, builtin};
use crate::shutdown::Shutdown;
use crate::thresholds::{Threshold, parse_thresholds};

/// Cadence for threshold re-evaluation, gauge emission and collector
/// flushes.
const TICK: Duration = Duration::from_secs(1);

/// How long to keep draining stray samples once the executor is done.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdStatus {
    pub metric: String,
    pub source: String,
    pub last_result: Option<bool>,
    pub tainted: bool,
}

/// Wraps an executor: multiplexes the sample stream into metric sinks,
/// evaluates thresholds on a fixed tick, forwards batches to the collector,
/// and reports the tainted/clean outcome.
pub struct Engine {
    executor: Executor,
    runner: Arc<dyn Runner>,
    registry: Arc<Registry>,
    sink: SampleSink,
    rx: Mutex<Option<UnboundedReceiver<Sample>>>,
    thresholds: Mutex<Vec<Threshold>>,
    collector: Mutex<Option<Box<dyn Collector>>>,
    no_thresholds: bool,
    tainted: AtomicBool,
}

impl Engine {
    /// Expects normalized options (see [`Options::normalize`]).
    pub fn new(runner: Arc<dyn Runner>, options: &Options) -> Result<Engine, Error> {
        let (sink, rx) = SampleSink::channel();
        let executor = Executor::new(runner.clone(), sink.clone(), options);

        let registry = Arc::new(Registry::default());
        register_builtins(&registry);
        let thresholds = parse_thresholds(&options.thresholds)?;

        // Submetric series exist only where thresholds declare them; the
        // registry routes matching samples automatically from then on.
        for threshold in &thresholds {
            if !threshold.selector.is_empty() {
                let kind = registry
                    .kind_of(&threshold.metric)
                    .unwrap_or(MetricKind::Trend);
                registry.add_submetric(&threshold.metric, kind, &threshold.selector);
            }
        }

        Ok(Engine {
            executor,
            runner,
            registry,
            sink,
            rx: Mutex::new(Some(rx)),
            thresholds: Mutex::new(thresholds),
            collector: Mutex::new(None),
            no_thresholds: options.no_thresholds.unwrap_or(false),
            tainted: AtomicBool::new(false),
        })
    }

    pub fn set_collector(&self, collector: Box<dyn Collector>) {
        *self.collector.lock() = Some(collector);
    }

    pub fn collector_link(&self) -> Option<String> {
        self.collector
            .lock()
            .as_ref()
            .map(|c| c.link())
            .filter(|l| !l.is_empty())
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn runner(&self) -> &Arc<dyn Runner> {
        &self.runner
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// True iff any threshold has ever evaluated false.
    pub fn is_tainted(&self) -> bool {
        self.tainted.load(Ordering::Acquire)
    }

    pub fn thresholds_snapshot(&self) -> Vec<ThresholdStatus> {
        self.thresholds
            .lock()
            .iter()
            .map(|t| ThresholdStatus {
                metric: t.metric.clone(),
                source: t.source.clone(),
                last_result: t.last_result,
                tainted: t.tainted,
            })
            .collect()
    }

    pub async fn run(&self, shutdown: Arc<Shutdown>) -> Result<(), Error> {
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| Error::Runtime("engine already ran".to_string()))?;

        let mut collector = self.collector.lock().take();
        if let Some(c) = collector.as_mut()
            && let Err(err) = c.init()
        {
            tracing::warn!(error = %err, "collector init failed, disabling output");
            collector = None;
        }

        let mut exec_task = tokio::spawn(self.executor.clone().run(shutdown.clone()));
        let mut exec_done = false;
        let mut shutdown_seen = false;
        let mut buffer: Vec<Sample> = Vec::new();

        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The immediate first tick carries no new data.
        ticker.tick().await;

        while !exec_done {
            tokio::select! {
                res = &mut exec_task => {
                    exec_done = true;
                    match res {
                        Ok(Ok(())) => tracing::debug!("executor finished"),
                        Ok(Err(err)) => tracing::error!(error = %err, "executor failed"),
                        Err(err) => tracing::error!(error = %err, "executor task panicked"),
                    }
                }
                Some(sample) = rx.recv() => {
                    self.apply_sample(&sample);
                    if collector.is_some() {
                        buffer.push(sample);
                    }
                }
                _ = ticker.tick() => {
                    self.on_tick(&mut buffer, &mut collector);
                }
                _ = shutdown.wait(), if !shutdown_seen => {
                    // The executor sees the same signal; keep consuming
                    // samples until it winds down.
                    shutdown_seen = true;
                    tracing::debug!("shutdown requested, draining");
                }
            }
        }

        // The executor is done; drain whatever is still in the channel.
        let drain_deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        loop {
            match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                Ok(Some(sample)) => {
                    self.apply_sample(&sample);
                    if collector.is_some() {
                        buffer.push(sample);
                    }
                }
                Ok(None) | Err(_) => break,
            }

            if rx.is_empty() {
                break;
            }
        }

        self.emit_vu_gauges(&mut buffer, collector.is_some());
        self.evaluate_thresholds(true);

        if let Some(c) = collector.as_mut() {
            if !buffer.is_empty()
                && let Err(err) = c.collect(&buffer)
            {
                tracing::warn!(error = %err, "collector write failed");
            }
            if let Err(err) = c.close() {
                tracing::warn!(error = %err, "collector close failed");
            }
        }

        Ok(())
    }

    fn apply_sample(&self, sample: &Sample) {
        self.registry
            .apply(&sample.metric, sample.kind, sample.value, &sample.tags);
    }

    fn on_tick(&self, buffer: &mut Vec<Sample>, collector: &mut Option<Box<dyn Collector>>) {
        self.emit_vu_gauges(buffer, collector.is_some());
        self.evaluate_thresholds(false);

        if let Some(c) = collector.as_mut()
            && !buffer.is_empty()
        {
            if let Err(err) = c.collect(buffer) {
                tracing::warn!(error = %err, "collector write failed");
            }
            buffer.clear();
        }
    }

    fn emit_vu_gauges(&self, buffer: &mut Vec<Sample>, keep_for_collector: bool) {
        let vus = Sample::now(builtin::VUS, MetricKind::Gauge, self.executor.vus() as f64);
        let vus_max = Sample::now(
            builtin::VUS_MAX,
            MetricKind::Gauge,
            self.executor.vus_max() as f64,
        );
        self.apply_sample(&vus);
        self.apply_sample(&vus_max);
        if keep_for_collector {
            buffer.push(vus);
            buffer.push(vus_max);
        }
    }

    fn evaluate_thresholds(&self, strict: bool) {
        if self.no_thresholds {
            return;
        }

        let mut thresholds = self.thresholds.lock();
        if thresholds.is_empty() {
            return;
        }

        let summaries = self.registry.summarize();
        let mut any_tainted = false;
        for threshold in thresholds.iter_mut() {
            threshold.evaluate(&summaries, strict);
            any_tainted |= threshold.tainted;
        }

        if any_tainted {
            self.tainted.store(true, Ordering::Release);
        }
    }

    /// The sample sink feeding this engine; used by the orchestrator for
    /// out-of-band events (e.g. the usage beacon's failure counter).
    pub fn sink(&self) -> &SampleSink {
        &self.sink
    }
}

/// Registers the engine's built-in metrics up front so their kinds are fixed
/// before the first sample or submetric declaration arrives.
fn register_builtins(registry: &Registry) {
    let builtins = [
        (builtin::ITERATIONS, MetricKind::Counter),
        (builtin::ITERATION_DURATION, MetricKind::Trend),
        (builtin::DROPPED_ITERATIONS, MetricKind::Counter),
        (builtin::ERRORS, MetricKind::Counter),
        (builtin::CHECKS, MetricKind::Rate),
        (builtin::VUS, MetricKind::Gauge),
        (builtin::VUS_MAX, MetricKind::Gauge),
        (builtin::DATA_SENT, MetricKind::Counter),
        (builtin::DATA_RECEIVED, MetricKind::Counter),
        (builtin::HTTP_REQS, MetricKind::Counter),
        (builtin::HTTP_REQ_DURATION, MetricKind::Trend),
        (builtin::HTTP_REQ_FAILED, MetricKind::Rate),
    ];
    for (name, kind) in builtins {
        registry.register(name, kind);
    }
}
