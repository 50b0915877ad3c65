use mlua::{Lua, Table, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use stampede_core::{Options, Stage};

use crate::{Error, Result};

/// Executes the script in a throwaway Lua state and reads its `options`
/// table. Only the option shapes the engine understands are accepted;
/// anything malformed fails loudly instead of being silently ignored.
pub fn parse_script_options(script: &str, chunk_name: &str) -> Result<Options> {
    let lua = Lua::new();
    lua.load(script).set_name(chunk_name).exec()?;
    read_options_table(&lua)
}

/// Reads the `options` table from an already-executed script state.
pub(crate) fn read_options_table(lua: &Lua) -> Result<Options> {
    let globals = lua.globals();
    let options: Option<Table> = globals.get("options").ok();

    let mut out = Options::default();
    let Some(options) = options else {
        return Ok(out);
    };

    out.vus = get_u64(&options, "vus", true)?.map_err_kind(Error::InvalidVus)?;
    out.vus_max = get_u64(&options, "vus_max", true)?.map_err_kind(Error::InvalidVus)?;
    out.iterations =
        get_u64(&options, "iterations", false)?.map_err_kind(Error::InvalidIterations)?;
    out.duration = get_duration(&options, "duration")?;
    out.stages = get_stages(&options)?;
    out.paused = get_bool(&options, "paused")?;
    out.thresholds = get_thresholds(&options)?;

    out.max_redirects = get_u64(&options, "max_redirects", true)?
        .map_err_kind(Error::InvalidMaxRedirects)?
        .map(|v| v as u32);
    out.insecure_skip_tls_verify = get_bool(&options, "insecure_skip_tls_verify")?;
    out.user_agent = match options.get::<Value>("user_agent") {
        Ok(Value::String(s)) => Some(s.to_string_lossy().to_string()),
        _ => None,
    };

    Ok(out)
}

/// Wrapper so `get_u64` can report the field-specific error variant.
enum Parsed<T> {
    Ok(Option<T>),
    Invalid,
}

impl<T> Parsed<T> {
    fn map_err_kind(self, err: Error) -> Result<Option<T>> {
        match self {
            Parsed::Ok(v) => Ok(v),
            Parsed::Invalid => Err(err),
        }
    }
}

fn get_u64(t: &Table, key: &str, allow_zero: bool) -> Result<Parsed<u64>> {
    let v = match t.get::<Value>(key) {
        Ok(v) => v,
        Err(_) => return Ok(Parsed::Ok(None)),
    };
    Ok(match v {
        Value::Nil => Parsed::Ok(None),
        Value::Integer(i) if i > 0 || (allow_zero && i == 0) => Parsed::Ok(Some(i as u64)),
        Value::Number(n) if n.fract() == 0.0 && (n > 0.0 || (allow_zero && n == 0.0)) => {
            Parsed::Ok(Some(n as u64))
        }
        _ => Parsed::Invalid,
    })
}

fn get_bool(t: &Table, key: &str) -> Result<Option<bool>> {
    match t.get::<Value>(key) {
        Ok(Value::Boolean(b)) => Ok(Some(b)),
        _ => Ok(None),
    }
}

fn get_duration(t: &Table, key: &str) -> Result<Option<Duration>> {
    let v = match t.get::<Value>(key) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    match v {
        Value::Nil => Ok(None),
        Value::Integer(i) if i >= 0 => Ok(Some(Duration::from_secs(i as u64))),
        Value::Number(n) if n >= 0.0 => Ok(Some(Duration::from_secs_f64(n))),
        Value::String(s) => {
            let s = s.to_string_lossy();
            humantime::parse_duration(&s)
                .map(Some)
                .map_err(|_| Error::InvalidDuration)
        }
        _ => Err(Error::InvalidDuration),
    }
}

fn get_stages(t: &Table) -> Result<Vec<Stage>> {
    let v = match t.get::<Value>("stages") {
        Ok(v) => v,
        Err(_) => return Ok(Vec::new()),
    };

    let tbl = match v {
        Value::Nil => return Ok(Vec::new()),
        Value::Table(t) => t,
        _ => return Err(Error::InvalidStages),
    };

    let mut out = Vec::new();
    for value in tbl.sequence_values::<Value>() {
        let stage_tbl = match value? {
            Value::Table(t) => t,
            _ => return Err(Error::InvalidStages),
        };

        let duration = get_duration(&stage_tbl, "duration")?.ok_or(Error::InvalidStages)?;

        // Stage targets allow 0 (ramping down to idle).
        let target = get_u64(&stage_tbl, "target", true)?
            .map_err_kind(Error::InvalidStages)?
            .ok_or(Error::InvalidStages)?;

        out.push(Stage { duration, target });
    }

    Ok(out)
}

fn get_thresholds(t: &Table) -> Result<BTreeMap<String, Vec<String>>> {
    let v = match t.get::<Value>("thresholds") {
        Ok(v) => v,
        Err(_) => return Ok(BTreeMap::new()),
    };

    let tbl = match v {
        Value::Nil => return Ok(BTreeMap::new()),
        Value::Table(t) => t,
        _ => return Err(Error::InvalidThresholds),
    };

    let mut out = BTreeMap::new();
    for pair in tbl.pairs::<Value, Value>() {
        let (k, v) = pair?;
        let metric = match k {
            Value::String(s) => s.to_string_lossy().to_string(),
            _ => continue,
        };

        let expressions: Vec<String> = match v {
            Value::String(s) => vec![s.to_string_lossy().to_string()],
            Value::Table(list) => {
                let mut exprs = Vec::new();
                for item in list.sequence_values::<Value>() {
                    match item? {
                        Value::String(s) => exprs.push(s.to_string_lossy().to_string()),
                        _ => return Err(Error::InvalidThresholds),
                    }
                }
                exprs
            }
            _ => return Err(Error::InvalidThresholds),
        };

        if expressions.is_empty() {
            return Err(Error::InvalidThresholds);
        }

        out.insert(metric, expressions);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_options_table_is_all_unset() {
        let opts = parse_script_options("function Default() end", "test.lua")
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(opts, Options::default());
    }

    #[test]
    fn full_options_table_parses() {
        let script = r#"
            options = {
                vus = 10,
                vus_max = 50,
                duration = "30s",
                paused = true,
                stages = {
                    { duration = "10s", target = 100 },
                    { duration = "5s", target = 0 },
                },
                thresholds = {
                    iteration_duration = "p(95)<200",
                    errors = { "count==0" },
                },
                max_redirects = 3,
                user_agent = "loadbot/1.0",
            }
            function Default() end
        "#;

        let opts = parse_script_options(script, "test.lua").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(opts.vus, Some(10));
        assert_eq!(opts.vus_max, Some(50));
        assert_eq!(opts.duration, Some(Duration::from_secs(30)));
        assert_eq!(opts.paused, Some(true));
        assert_eq!(opts.stages.len(), 2);
        assert_eq!(opts.stages[0].target, 100);
        assert_eq!(opts.stages[1].duration, Duration::from_secs(5));
        assert_eq!(
            opts.thresholds.get("iteration_duration"),
            Some(&vec!["p(95)<200".to_string()])
        );
        assert_eq!(opts.max_redirects, Some(3));
        assert_eq!(opts.user_agent.as_deref(), Some("loadbot/1.0"));
    }

    #[test]
    fn negative_vus_is_rejected() {
        let err = parse_script_options("options = { vus = -1 }", "test.lua")
            .expect_err("expected invalid vus");
        assert!(matches!(err, Error::InvalidVus));
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let err = parse_script_options("options = { iterations = 0 }", "test.lua")
            .expect_err("expected invalid iterations");
        assert!(matches!(err, Error::InvalidIterations));
    }

    #[test]
    fn bad_stage_shape_is_rejected() {
        let err = parse_script_options(r#"options = { stages = { "10s" } }"#, "test.lua")
            .expect_err("expected invalid stages");
        assert!(matches!(err, Error::InvalidStages));
    }
}
