use mlua::{Lua, Value};

use super::RegisterContext;
use crate::Result;

/// `vu.id()`: this VU's 1-based index, re-bound on every reconfigure.
pub(super) fn register(lua: &Lua, ctx: &RegisterContext) -> Result<()> {
    let vu_id = ctx.vu_id;

    let loader = lua.create_function(move |lua, ()| {
        let t = lua.create_table()?;
        let id = lua.create_function(move |_, ()| Ok(vu_id))?;
        t.set("id", id)?;
        Ok::<Value, mlua::Error>(Value::Table(t))
    })?;

    super::preload_set(lua, "stampede/vu", loader)
}
