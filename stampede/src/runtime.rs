use std::sync::Arc;

use anyhow::Context as _;
use stampede_core::{Archive, Runner, SourceData, looks_like_archive};
use stampede_lua::LuaRunner;

use crate::run_error::RunError;

pub const TYPE_ENV_VAR: &str = "STAMPEDE_TYPE";

/// Source types the factory can dispatch on; `lua` is the script runtime,
/// `archive` a sealed bundle declaring its own embedded type.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    clap::ValueEnum,
    strum::EnumString,
    strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum RunnerType {
    Lua,
    Archive,
}

/// Builds the runner for a resolved source. With no declared type the source
/// is sniffed: a parsable tar header means archive, anything else is a
/// script. Deterministic for a given (data, type) pair.
pub fn create_runner(
    src: &SourceData,
    declared: Option<RunnerType>,
    env: Vec<(String, String)>,
) -> Result<Arc<dyn Runner>, RunError> {
    let runner_type = declared.unwrap_or_else(|| {
        if looks_like_archive(&src.data) {
            RunnerType::Archive
        } else {
            RunnerType::Lua
        }
    });

    match runner_type {
        RunnerType::Lua => {
            let runner = LuaRunner::new(src, env)
                .with_context(|| format!("failed to compile {}", src.filename))
                .map_err(RunError::ScriptError)?;
            Ok(Arc::new(runner))
        }
        RunnerType::Archive => {
            let archive = Archive::read(&src.data)
                .with_context(|| format!("failed to read archive {}", src.filename))
                .map_err(RunError::InvalidInput)?;

            match archive.archive_type.as_str() {
                "lua" => {
                    let runner = LuaRunner::from_archive(&archive, env)
                        .with_context(|| {
                            format!("failed to compile archived script {}", archive.filename)
                        })
                        .map_err(RunError::ScriptError)?;
                    Ok(Arc::new(runner))
                }
                other => Err(RunError::InvalidInput(anyhow::anyhow!(
                    "archive requests unsupported runner type `{other}`"
                ))),
            }
        }
    }
}

/// The declared type: the `-t/--type` flag, then the env default.
pub fn declared_type(flag: Option<RunnerType>) -> Result<Option<RunnerType>, RunError> {
    if flag.is_some() {
        return Ok(flag);
    }
    match std::env::var(TYPE_ENV_VAR) {
        Ok(raw) if !raw.is_empty() => raw
            .parse::<RunnerType>()
            .map(Some)
            .map_err(|_| {
                RunError::InvalidInput(anyhow::anyhow!(
                    "unknown {TYPE_ENV_VAR} value `{raw}` (expected `lua` or `archive`)"
                ))
            }),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_core::Options;

    fn lua_source(script: &str) -> SourceData {
        SourceData {
            filename: "test.lua".to_string(),
            data: script.as_bytes().to_vec(),
        }
    }

    #[test]
    fn auto_detection_builds_a_script_runner() {
        let src = lua_source("options = { vus = 2 }\nfunction Default() end");
        let runner = create_runner(&src, None, Vec::new()).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(runner.options().vus, Some(2));
    }

    #[test]
    fn auto_detection_builds_an_archive_runner() {
        let mut archive = Archive::new(
            "lua",
            "inner.lua",
            Options {
                vus: Some(7),
                ..Default::default()
            },
        );
        archive
            .files
            .insert("inner.lua".to_string(), b"function Default() end".to_vec());
        let data = archive.write().unwrap_or_else(|e| panic!("{e}"));

        let src = SourceData {
            filename: "bundle.tar".to_string(),
            data,
        };
        let runner = create_runner(&src, None, Vec::new()).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(runner.options().vus, Some(7));
    }

    #[test]
    fn unsupported_embedded_type_is_invalid_input() {
        let archive = Archive::new("python", "inner.py", Options::default());
        let data = archive.write().unwrap_or_else(|e| panic!("{e}"));

        let src = SourceData {
            filename: "bundle.tar".to_string(),
            data,
        };
        let err = create_runner(&src, Some(RunnerType::Archive), Vec::new())
            .expect_err("expected unsupported type");
        assert!(matches!(err, RunError::InvalidInput(_)));
    }

    #[test]
    fn declared_lua_type_skips_detection() {
        // Valid tar bytes, but the user insists it is a script.
        let archive = Archive::new("lua", "inner.lua", Options::default());
        let data = archive.write().unwrap_or_else(|e| panic!("{e}"));

        let src = SourceData {
            filename: "bundle.tar".to_string(),
            data,
        };
        let err = create_runner(&src, Some(RunnerType::Lua), Vec::new())
            .expect_err("tar bytes are not a valid script");
        assert!(matches!(err, RunError::ScriptError(_)));
    }

    #[test]
    fn runner_type_parses_from_strings() {
        assert_eq!("lua".parse::<RunnerType>(), Ok(RunnerType::Lua));
        assert_eq!("archive".parse::<RunnerType>(), Ok(RunnerType::Archive));
        assert!("js".parse::<RunnerType>().is_err());
    }
}
