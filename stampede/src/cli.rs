use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::runtime::RunnerType;

/// Accepts `<number><unit>` with units ms/s/m/h; a bare number means
/// seconds, so `-d 0` still reads as "no deadline".
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let bad = || format!("invalid duration `{input}` (examples: 30s, 500ms, 2m, 1h)");

    let src = input.trim();
    let digits = src.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return Err(bad());
    }

    let (number, unit) = src.split_at(digits);
    let value: u64 = number.parse().map_err(|_| bad())?;
    let unit_millis: u64 = match unit {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60 * 1_000,
        "h" => 60 * 60 * 1_000,
        _ => return Err(bad()),
    };

    value
        .checked_mul(unit_millis)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration `{input}` is too large"))
}

/// One `-s/--stage` occurrence: `DURATION[:TARGET]`. An omitted target holds
/// the previous stage's target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageArg {
    pub duration: Duration,
    pub target: Option<u64>,
}

pub fn parse_stage(input: &str) -> Result<StageArg, String> {
    let (duration_str, target_str) = match input.split_once(':') {
        Some((d, t)) => (d, Some(t)),
        None => (input, None),
    };

    let duration = parse_duration(duration_str)?;
    let target = match target_str {
        None | Some("") => None,
        Some(t) => Some(
            t.parse::<u64>()
                .map_err(|_| format!("invalid stage target '{t}' (expected an integer)"))?,
        ),
    };

    Ok(StageArg { duration, target })
}

#[derive(Debug, Parser)]
#[command(
    name = "stampede",
    author,
    version,
    about = "A programmable load-testing tool",
    long_about = "stampede drives a scripted load test against a target system.\n\nA test script declares an `options` table (vus/duration/iterations/stages/thresholds) and a `Default()` function executed per virtual-user iteration. While a test runs, a REST API on --address allows live inspection and control."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a load test
    #[command(
        long_about = "Start a load test.\n\nCLI flags override environment variables, script options and the config file, in that order of precedence."
    )]
    Run(RunArgs),

    /// Bundle a script and its options into a sealed archive
    Archive(ArchiveArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Script file, archive, URL, or `-` for stdin
    pub script: String,

    /// Initial number of virtual users
    #[arg(short = 'u', long)]
    pub vus: Option<u64>,

    /// Hard cap on the VU pool
    #[arg(short = 'm', long = "max")]
    pub vus_max: Option<u64>,

    /// Total number of iterations across all VUs
    #[arg(short = 'i', long)]
    pub iterations: Option<u64>,

    /// Test duration (e.g. 10s, 250ms, 1m); 0 runs until stopped
    #[arg(short = 'd', long, value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// VU ramp stage, repeatable: DURATION[:TARGET]; empty target holds
    #[arg(short = 's', long = "stage", value_name = "DURATION[:TARGET]", value_parser = parse_stage)]
    pub stages: Vec<StageArg>,

    /// Collector for metric samples: TYPE[=ARG], e.g. json=samples.ndjson
    #[arg(short = 'o', long = "out", value_name = "TYPE[=ARG]")]
    pub out: Option<String>,

    /// Override source type detection
    #[arg(short = 't', long = "type", value_enum)]
    pub source_type: Option<RunnerType>,

    /// Start the test paused; resume via the REST API
    #[arg(long)]
    pub paused: bool,

    /// Keep the process (and API) alive after the test until interrupted
    #[arg(long)]
    pub linger: bool,

    /// Store thresholds but never evaluate them
    #[arg(long)]
    pub no_thresholds: bool,

    /// Skip the anonymous usage report
    #[arg(long)]
    pub no_usage_report: bool,

    /// Suppress progress output and the end-of-test summary
    #[arg(long)]
    pub quiet: bool,

    /// Bind address for the REST control API
    #[arg(long, default_value = "127.0.0.1:6565")]
    pub address: SocketAddr,

    /// JSON config file merged below env vars and CLI flags
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Add/override env vars visible to the script (repeatable, KEY=VALUE)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ArchiveArgs {
    /// Script file to bundle
    pub script: PathBuf,

    /// Where to write the archive
    #[arg(short = 'O', long, default_value = "archive.tar")]
    pub output: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_accepts_common_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("1m"), Ok(Duration::from_secs(60)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(2 * 60 * 60)));
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn parse_stage_supports_held_targets() {
        assert_eq!(
            parse_stage("10s:100"),
            Ok(StageArg {
                duration: Duration::from_secs(10),
                target: Some(100),
            })
        );
        assert_eq!(
            parse_stage("60s"),
            Ok(StageArg {
                duration: Duration::from_secs(60),
                target: None,
            })
        );
        assert!(parse_stage("10s:abc").is_err());
    }

    #[test]
    fn cli_parses_a_full_run_invocation() {
        let parsed = Cli::try_parse_from([
            "stampede",
            "run",
            "bench.lua",
            "-u",
            "0",
            "-m",
            "200",
            "-s",
            "10s:100",
            "-s",
            "60s",
            "-s",
            "10s:0",
            "-o",
            "json=samples.ndjson",
            "--paused",
            "--address",
            "127.0.0.1:7777",
        ]);

        let cli = match parsed {
            Ok(v) => v,
            Err(err) => panic!("failed to parse args: {err}"),
        };

        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.script, "bench.lua");
                assert_eq!(args.vus, Some(0));
                assert_eq!(args.vus_max, Some(200));
                assert_eq!(args.stages.len(), 3);
                assert_eq!(args.stages[1].target, None);
                assert_eq!(args.out.as_deref(), Some("json=samples.ndjson"));
                assert!(args.paused);
                assert_eq!(args.address.port(), 7777);
            }
            Command::Archive(_) => panic!("expected run command"),
        }
    }

    #[test]
    fn cli_parses_archive_defaults() {
        let parsed = Cli::try_parse_from(["stampede", "archive", "bench.lua"]);
        let cli = match parsed {
            Ok(v) => v,
            Err(err) => panic!("failed to parse args: {err}"),
        };

        match cli.command {
            Command::Archive(args) => {
                assert_eq!(args.script, PathBuf::from("bench.lua"));
                assert_eq!(args.output, PathBuf::from("archive.tar"));
            }
            Command::Run(_) => panic!("expected archive command"),
        }
    }
}
