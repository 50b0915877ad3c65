use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use stampede_core::http::HttpRequest;
use stampede_core::{Engine, HttpClient, Runner as _, Shutdown, collector, read_source};

use crate::api::ApiServer;
use crate::cli::{ArchiveArgs, RunArgs};
use crate::config;
use crate::exit_codes::ExitCode;
use crate::run_error::RunError;
use crate::runtime;
use crate::summary;

const USAGE_REPORT_URL: &str = "https://telemetry.stampede.dev/report";

pub async fn run(args: RunArgs) -> Result<ExitCode, RunError> {
    let cwd = std::env::current_dir()
        .context("failed to resolve current working directory")
        .map_err(RunError::RuntimeError)?;

    // Resolve the source and build the runner.
    let loader_client = HttpClient::default();
    let src = read_source(&args.script, &cwd, &mut std::io::stdin(), &loader_client)
        .await
        .map_err(|err| RunError::InvalidInput(anyhow::Error::new(err)))?;

    let declared = runtime::declared_type(args.source_type)?;
    let env_vars = config::merged_env(&args.env).map_err(RunError::InvalidInput)?;
    let runner = runtime::create_runner(&src, declared, env_vars)?;

    // Merge CLI / env / script / file options, apply the invariants, and
    // push the effective set back so script-visible config is consistent.
    let conf = config::resolve(&args, &runner.options())
        .map_err(RunError::InvalidInput)?
        .normalize()
        .map_err(|err| RunError::InvalidInput(anyhow::Error::new(err)))?;
    runner.set_options(conf.clone());

    let engine = Arc::new(
        Engine::new(runner, &conf)
            .context("failed to build engine")
            .map_err(RunError::InvalidInput)?,
    );

    if let Some(out) = conf.out.as_deref() {
        let c = collector::from_descriptor(out)
            .map_err(|err| RunError::InvalidInput(anyhow::Error::new(err)))?;
        engine.set_collector(c);
    }

    let shutdown = Arc::new(Shutdown::new());
    spawn_signal_handler(shutdown.clone());

    // The control API lives for the whole run; a bind failure is not fatal.
    let api = match ApiServer::start(args.address, engine.clone()).await {
        Ok(api) => {
            tracing::debug!(url = %api.url(), "control API listening");
            Some(api)
        }
        Err(err) => {
            tracing::warn!(error = %err, "control API unavailable");
            None
        }
    };

    print_banner(&args, &engine, &conf);

    if !conf.no_usage_report.unwrap_or(false) {
        let vus_max = engine.executor().vus_max();
        let duration = engine.executor().end_time();
        let iterations = engine.executor().end_iterations();
        tokio::spawn(send_usage_report(vus_max, duration, iterations));
    }

    let progress = (!args.quiet).then(|| spawn_progress_logger(engine.clone()));

    let run_result = engine.run(shutdown.clone()).await;
    let interrupted = shutdown.is_fired();

    if let Some(progress) = progress {
        progress.abort();
    }

    if !args.quiet {
        summary::print(&engine);
    }

    if conf.linger.unwrap_or(false) && !shutdown.is_fired() {
        tracing::info!("linger set; waiting for interrupt");
        shutdown.wait().await;
    }

    if let Some(api) = api {
        api.shutdown().await;
    }

    run_result
        .context("engine run failed")
        .map_err(RunError::RuntimeError)?;

    if engine.is_tainted() {
        tracing::error!("some thresholds have failed");
        return Ok(ExitCode::ThresholdsFailed);
    }
    if interrupted {
        return Ok(ExitCode::Interrupted);
    }
    Ok(ExitCode::Success)
}

/// `stampede archive <script>`: compile the script, seal its declared
/// options, and write the deterministic bundle.
pub fn archive(args: ArchiveArgs) -> Result<(), RunError> {
    let data = std::fs::read(&args.script)
        .with_context(|| format!("failed to read {}", args.script.display()))
        .map_err(RunError::InvalidInput)?;
    let filename = args
        .script
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| args.script.display().to_string());

    let src = stampede_core::SourceData {
        filename: filename.clone(),
        data: data.clone(),
    };
    let runner = stampede_lua::LuaRunner::new(&src, Vec::new())
        .with_context(|| format!("failed to compile {filename}"))
        .map_err(RunError::ScriptError)?;

    let mut archive = stampede_core::Archive::new("lua", &filename, runner.options());
    archive.files.insert(filename, data);

    let bytes = archive
        .write()
        .context("failed to serialize archive")
        .map_err(RunError::RuntimeError)?;
    std::fs::write(&args.output, bytes)
        .with_context(|| format!("failed to write {}", args.output.display()))
        .map_err(RunError::RuntimeError)?;

    tracing::info!(output = %args.output.display(), "archive written");
    Ok(())
}

fn print_banner(args: &RunArgs, engine: &Engine, conf: &stampede_core::Options) {
    let output = conf.out.as_deref().unwrap_or("-");
    let link = engine
        .collector_link()
        .map(|l| format!(" ({l})"))
        .unwrap_or_default();

    tracing::info!("  execution: local");
    tracing::info!("     output: {output}{link}");
    tracing::info!("     script: {}", args.script);

    let duration = conf
        .duration
        .map(|d| humantime::format_duration(d).to_string())
        .unwrap_or_else(|| "-".to_string());
    let iterations = conf
        .iterations
        .map(|i| i.to_string())
        .unwrap_or_else(|| "-".to_string());
    tracing::info!("   duration: {duration}, iterations: {iterations}");
    tracing::info!(
        "        vus: {}, max: {}",
        conf.vus.unwrap_or(1),
        engine.executor().vus_max()
    );
}

fn spawn_progress_logger(engine: Arc<Engine>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let executor = engine.executor();
            let t = humantime::format_duration(Duration::from_secs(executor.time().as_secs()));
            let i = executor.iterations();
            if executor.is_paused() {
                tracing::info!(%t, i, vus = executor.vus(), "paused");
            } else {
                tracing::info!(%t, i, vus = executor.vus(), "running");
            }
        }
    })
}

fn spawn_signal_handler(shutdown: Arc<Shutdown>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if wait_for_signal().await.is_err() {
            return;
        }
        tracing::info!("interrupt received, shutting down");
        shutdown.fire();

        // A second interrupt skips the graceful drain entirely.
        if wait_for_signal().await.is_err() {
            return;
        }
        tracing::error!("second interrupt, exiting immediately");
        std::process::exit(ExitCode::RuntimeError.as_i32());
    })
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// One best-effort POST at run start. Failures are logged at debug and never
/// block or fail the run.
async fn send_usage_report(
    vus_max: u64,
    duration: Option<Duration>,
    iterations: Option<u64>,
) {
    let body = serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "vus_max": vus_max,
        "duration_ms": duration.map(|d| d.as_millis() as u64),
        "iterations": iterations,
    });
    let payload = match serde_json::to_vec(&body) {
        Ok(p) => p,
        Err(_) => return,
    };

    let mut request = HttpRequest::post(USAGE_REPORT_URL, Bytes::from(payload));
    request
        .headers
        .push(("content-type".to_string(), "application/json".to_string()));
    request.timeout = Some(Duration::from_secs(10));

    let client = HttpClient::default();
    if let Err(err) = client.request(request).await {
        tracing::debug!(error = %err, "couldn't send usage report");
    }
}
