use std::path::Path;

use anyhow::Context as _;
use stampede_core::{Options, Stage};

use crate::cli::RunArgs;

pub const ENV_PREFIX: &str = "STAMPEDE_";

/// Merges every configuration layer into one `Options` value. Precedence,
/// lowest to highest: defaults, config file, script-declared options,
/// `STAMPEDE_*` environment variables, CLI flags.
pub fn resolve(args: &RunArgs, script_options: &Options) -> anyhow::Result<Options> {
    let file = match args.config.as_deref() {
        Some(path) => read_file_config(path)?,
        None => Options::default(),
    };
    let env = env_config(std::env::vars())?;
    let cli = options_from_args(args);

    Ok(Options::default()
        .apply(&file)
        .apply(script_options)
        .apply(&env)
        .apply(&cli))
}

fn read_file_config(path: &Path) -> anyhow::Result<Options> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Reads the `STAMPEDE_*` mirror of the run flags from an iterator of env
/// pairs (injected for tests).
pub fn env_config(
    vars: impl Iterator<Item = (String, String)>,
) -> anyhow::Result<Options> {
    let mut out = Options::default();

    for (key, value) in vars {
        let Some(name) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }

        match name {
            "VUS" => out.vus = Some(parse_int(&key, &value)?),
            "VUS_MAX" => out.vus_max = Some(parse_int(&key, &value)?),
            "ITERATIONS" => out.iterations = Some(parse_int(&key, &value)?),
            "DURATION" => {
                out.duration = Some(
                    humantime::parse_duration(&value)
                        .with_context(|| format!("invalid duration in {key}: {value}"))?,
                );
            }
            "PAUSED" => out.paused = Some(parse_bool(&key, &value)?),
            "LINGER" => out.linger = Some(parse_bool(&key, &value)?),
            "NO_THRESHOLDS" => out.no_thresholds = Some(parse_bool(&key, &value)?),
            "NO_USAGE_REPORT" => out.no_usage_report = Some(parse_bool(&key, &value)?),
            "OUT" => out.out = Some(value),
            "MAX_REDIRECTS" => out.max_redirects = Some(parse_int(&key, &value)? as u32),
            "INSECURE_SKIP_TLS_VERIFY" => {
                out.insecure_skip_tls_verify = Some(parse_bool(&key, &value)?);
            }
            "USER_AGENT" => out.user_agent = Some(value),
            // STAMPEDE_TYPE and unrelated variables are handled elsewhere.
            _ => {}
        }
    }

    Ok(out)
}

fn parse_int(key: &str, value: &str) -> anyhow::Result<u64> {
    value
        .parse()
        .with_context(|| format!("invalid integer in {key}: {value}"))
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    match value {
        "1" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "false" | "FALSE" | "False" => Ok(false),
        _ => anyhow::bail!("invalid boolean in {key}: {value}"),
    }
}

/// The CLI layer of the merge. Boolean flags only speak when given, so a
/// missing `--paused` cannot override `STAMPEDE_PAUSED=true`.
fn options_from_args(args: &RunArgs) -> Options {
    Options {
        vus: args.vus,
        vus_max: args.vus_max,
        duration: args.duration,
        iterations: args.iterations,
        stages: resolve_stages(args),
        paused: args.paused.then_some(true),
        linger: args.linger.then_some(true),
        no_thresholds: args.no_thresholds.then_some(true),
        no_usage_report: args.no_usage_report.then_some(true),
        out: args.out.clone(),
        ..Default::default()
    }
}

/// An omitted stage target holds the previous stage's target; the first
/// stage falls back to the initial VU count.
fn resolve_stages(args: &RunArgs) -> Vec<Stage> {
    let mut previous = args.vus.unwrap_or(1);
    args.stages
        .iter()
        .map(|s| {
            let target = s.target.unwrap_or(previous);
            previous = target;
            Stage {
                duration: s.duration,
                target,
            }
        })
        .collect()
}

/// Process env plus `--env KEY=VALUE` overrides; the snapshot scripts see.
pub fn merged_env(overrides: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    let mut map: std::collections::BTreeMap<String, String> = std::env::vars().collect();

    for raw in overrides {
        let (k, v) = raw
            .split_once('=')
            .with_context(|| format!("invalid --env (expected KEY=VALUE): {raw}"))?;
        if k.is_empty() {
            anyhow::bail!("invalid --env (empty KEY): {raw}");
        }
        map.insert(k.to_string(), v.to_string());
    }

    Ok(map.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::StageArg;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn run_args() -> RunArgs {
        RunArgs {
            script: "test.lua".to_string(),
            vus: None,
            vus_max: None,
            iterations: None,
            duration: None,
            stages: Vec::new(),
            out: None,
            source_type: None,
            paused: false,
            linger: false,
            no_thresholds: false,
            no_usage_report: false,
            quiet: false,
            address: "127.0.0.1:6565".parse::<SocketAddr>().unwrap(),
            config: None,
            env: Vec::new(),
        }
    }

    fn env(vars: &[(&str, &str)]) -> Options {
        env_config(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
        .unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn precedence_is_file_script_env_cli() {
        let file = Options {
            vus: Some(1),
            iterations: Some(1),
            duration: Some(Duration::from_secs(1)),
            out: Some("json=file.ndjson".to_string()),
            ..Default::default()
        };
        let script = Options {
            vus: Some(2),
            iterations: Some(2),
            duration: Some(Duration::from_secs(2)),
            ..Default::default()
        };
        let env = env(&[("STAMPEDE_VUS", "3"), ("STAMPEDE_ITERATIONS", "3")]);
        let mut args = run_args();
        args.vus = Some(4);

        let merged = Options::default()
            .apply(&file)
            .apply(&script)
            .apply(&env)
            .apply(&options_from_args(&args));

        // CLI beats env beats script beats file; unset layers fall through.
        assert_eq!(merged.vus, Some(4));
        assert_eq!(merged.iterations, Some(3));
        assert_eq!(merged.duration, Some(Duration::from_secs(2)));
        assert_eq!(merged.out.as_deref(), Some("json=file.ndjson"));
    }

    #[test]
    fn env_layer_parses_every_mirrored_field() {
        let opts = env(&[
            ("STAMPEDE_VUS", "5"),
            ("STAMPEDE_VUS_MAX", "50"),
            ("STAMPEDE_DURATION", "90s"),
            ("STAMPEDE_PAUSED", "true"),
            ("STAMPEDE_NO_USAGE_REPORT", "1"),
            ("STAMPEDE_OUT", "json"),
            ("UNRELATED", "ignored"),
        ]);

        assert_eq!(opts.vus, Some(5));
        assert_eq!(opts.vus_max, Some(50));
        assert_eq!(opts.duration, Some(Duration::from_secs(90)));
        assert_eq!(opts.paused, Some(true));
        assert_eq!(opts.no_usage_report, Some(true));
        assert_eq!(opts.out.as_deref(), Some("json"));
    }

    #[test]
    fn env_layer_rejects_garbage() {
        let err = env_config(
            [("STAMPEDE_VUS".to_string(), "lots".to_string())].into_iter(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn unset_cli_booleans_do_not_override() {
        let args = run_args();
        let cli = options_from_args(&args);
        assert_eq!(cli.paused, None);

        let merged = env(&[("STAMPEDE_PAUSED", "true")]).apply(&cli);
        assert_eq!(merged.paused, Some(true));
    }

    #[test]
    fn held_stage_targets_resolve_to_the_previous_stage() {
        let mut args = run_args();
        args.vus = Some(0);
        args.stages = vec![
            StageArg {
                duration: Duration::from_secs(10),
                target: Some(100),
            },
            StageArg {
                duration: Duration::from_secs(60),
                target: None,
            },
            StageArg {
                duration: Duration::from_secs(10),
                target: Some(0),
            },
        ];

        let stages = resolve_stages(&args);
        assert_eq!(stages[0].target, 100);
        assert_eq!(stages[1].target, 100);
        assert_eq!(stages[2].target, 0);
    }

    #[test]
    fn merged_env_applies_overrides() {
        let merged = merged_env(&["STAMPEDE_TEST_CONFIG_KEY=value".to_string()])
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(
            merged
                .iter()
                .any(|(k, v)| k == "STAMPEDE_TEST_CONFIG_KEY" && v == "value")
        );
        assert!(merged_env(&["=x".to_string()]).is_err());
        assert!(merged_env(&["novalue".to_string()]).is_err());
    }
}
