use mlua::{Lua, Table, UserData, UserDataMethods, Value};

use stampede_core::{Sample, SampleSink};
use stampede_metrics::MetricKind;

use super::RegisterContext;
use crate::{Error, Result};

/// A custom metric handle. `:add(value, tags?)` emits one sample; rates
/// accept booleans.
#[derive(Clone)]
struct LuaMetric {
    name: String,
    kind: MetricKind,
    sink: SampleSink,
}

fn parse_tags(tags: Option<Table>) -> mlua::Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    let Some(tags) = tags else {
        return Ok(out);
    };

    for pair in tags.pairs::<Value, Value>() {
        let (k, v) = pair?;
        let k = match k {
            Value::String(s) => s.to_string_lossy().to_string(),
            _ => continue,
        };
        let v = match v {
            Value::String(s) => s.to_string_lossy().to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Boolean(b) => b.to_string(),
            _ => continue,
        };
        out.push((k, v));
    }

    Ok(out)
}

impl UserData for LuaMetric {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("add", |lua, this, (value, tags): (Value, Option<Table>)| {
            let value = match (this.kind, &value) {
                (MetricKind::Rate, Value::Boolean(b)) => {
                    if *b {
                        1.0
                    } else {
                        0.0
                    }
                }
                (_, Value::Integer(i)) => *i as f64,
                (_, Value::Number(n)) => *n,
                _ => return Err(mlua::Error::external(Error::InvalidMetricValue)),
            };

            let mut sample = Sample::now(&this.name, this.kind, value);
            sample.tags = parse_tags(tags)?;
            if let Some(group) = super::group_tag(lua)
                && !sample.tags.iter().any(|(k, _)| k == "group")
            {
                sample.tags.push(("group".to_string(), group));
            }

            this.sink.emit(sample);
            Ok(())
        });
    }
}

pub(super) fn register(lua: &Lua, ctx: &RegisterContext) -> Result<()> {
    let sink = ctx.sink.clone();

    let loader = lua.create_function(move |lua, ()| {
        let t = lua.create_table()?;

        let mk = |kind: MetricKind| {
            let sink = sink.clone();
            lua.create_function(move |lua, name: String| {
                if name.trim().is_empty() {
                    return Err(mlua::Error::external(Error::InvalidMetricName));
                }
                lua.create_userdata(LuaMetric {
                    name,
                    kind,
                    sink: sink.clone(),
                })
            })
        };

        t.set("Counter", mk(MetricKind::Counter)?)?;
        t.set("Gauge", mk(MetricKind::Gauge)?)?;
        t.set("Rate", mk(MetricKind::Rate)?)?;
        t.set("Trend", mk(MetricKind::Trend)?)?;

        Ok(t)
    })?;

    super::preload_set(lua, "stampede/metrics", loader)
}
