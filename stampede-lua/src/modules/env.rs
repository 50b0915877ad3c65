use mlua::{Lua, Value};

use super::RegisterContext;
use crate::Result;

/// `env.get(name)`: the resolved environment snapshot taken at startup.
/// Scripts never read ambient process state directly.
pub(super) fn register(lua: &Lua, ctx: &RegisterContext) -> Result<()> {
    let env = ctx.env.clone();

    let loader = lua.create_function(move |lua, ()| {
        let t = lua.create_table()?;

        let get = {
            let env = env.clone();
            lua.create_function(move |_, name: String| {
                Ok(env
                    .iter()
                    .find(|(k, _)| *k == name)
                    .map(|(_, v)| v.clone()))
            })?
        };
        t.set("get", get)?;

        Ok::<Value, mlua::Error>(Value::Table(t))
    })?;

    super::preload_set(lua, "stampede/env", loader)
}
