use mlua::{Lua, Value};

use stampede_core::{Sample, builtin};
use stampede_metrics::MetricKind;

use super::RegisterContext;
use crate::Result;

fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Nil | Value::Boolean(false))
}

/// `check("name", ok)` or `check{ ["name"] = ok, ... }`. Records into the
/// current group's check counters, emits a `checks` rate sample per entry,
/// and returns whether everything passed.
pub(super) fn register(lua: &Lua, ctx: &RegisterContext) -> Result<()> {
    let sink = ctx.sink.clone();

    let loader = lua.create_function(move |lua, ()| {
        let sink = sink.clone();
        let check_fn = lua.create_function(move |lua, args: mlua::MultiValue| {
            let mut entries: Vec<(String, bool)> = Vec::new();
            let mut it = args.into_iter();

            match it.next() {
                Some(Value::Table(t)) => {
                    for pair in t.pairs::<Value, Value>() {
                        let (k, v) = pair?;
                        let name = match k {
                            Value::String(s) => s.to_string_lossy().to_string(),
                            other => format!("{other:?}"),
                        };
                        entries.push((name, truthy(&v)));
                    }
                }
                Some(Value::String(name)) => {
                    let ok = it.next().map(|v| truthy(&v)).unwrap_or(false);
                    entries.push((name.to_string_lossy().to_string(), ok));
                }
                _ => {
                    return Err(mlua::Error::RuntimeError(
                        "check() expects a table or a name and a value".to_string(),
                    ));
                }
            }

            let group = super::current_group(lua);
            let group_path = super::group_tag(lua);

            let mut all_ok = true;
            for (name, ok) in entries {
                all_ok &= ok;

                if let Some(group) = group.as_ref() {
                    group.check(&name).record(ok);
                }

                let mut sample = Sample::now(
                    builtin::CHECKS,
                    MetricKind::Rate,
                    if ok { 1.0 } else { 0.0 },
                )
                .with_tag("check", &name);
                if let Some(path) = group_path.as_deref() {
                    sample = sample.with_tag("group", path);
                }
                sink.emit(sample);
            }

            Ok(all_ok)
        })?;
        Ok(Value::Function(check_fn))
    })?;

    super::preload_set(lua, "stampede/check", loader)
}
