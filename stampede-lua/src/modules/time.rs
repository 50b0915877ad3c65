use mlua::{Lua, Value};
use std::time::Duration;

use crate::Result;

/// `time.sleep(seconds)`: a cooperative suspension point, cancellable when
/// the run context is torn down.
pub(super) fn register(lua: &Lua) -> Result<()> {
    let loader = lua.create_function(move |lua, ()| {
        let t = lua.create_table()?;

        let sleep = lua.create_async_function(|_, seconds: f64| async move {
            if seconds > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
            }
            Ok(Value::Nil)
        })?;
        t.set("sleep", sleep)?;

        Ok(t)
    })?;

    super::preload_set(lua, "stampede/time", loader)
}
