use std::sync::Arc;

use mlua::{Lua, Table};

use stampede_core::{Group, HttpClient, SampleSink};

use crate::Result;

mod check;
mod env;
mod group;
mod http;
mod metrics;
mod time;
mod vu;

/// Everything a script state needs access to, bound at registration time.
#[derive(Clone)]
pub(crate) struct RegisterContext {
    pub vu_id: u64,
    pub sink: SampleSink,
    pub client: Arc<HttpClient>,
    pub root: Arc<Group>,
    pub env: Arc<Vec<(String, String)>>,
}

/// The group scope stack for one Lua state. The innermost group tags every
/// sample the script emits.
pub(crate) struct GroupStack(pub Vec<Arc<Group>>);

pub(crate) fn current_group(lua: &Lua) -> Option<Arc<Group>> {
    lua.app_data_ref::<GroupStack>()
        .and_then(|stack| stack.0.last().cloned())
}

/// Tags a sample with the current group path, if the script is inside one.
pub(crate) fn group_tag(lua: &Lua) -> Option<String> {
    current_group(lua)
        .map(|g| g.path().to_string())
        .filter(|p| !p.is_empty())
}

fn preload_set(lua: &Lua, name: &str, loader: mlua::Function) -> Result<()> {
    let package: Table = lua.globals().get("package")?;
    let preload: Table = package.get("preload")?;
    preload.set(name, loader)?;
    Ok(())
}

/// Registers the script-facing API behind `require("stampede/...")`.
pub(crate) fn register(lua: &Lua, ctx: RegisterContext) -> Result<()> {
    lua.set_app_data(GroupStack(vec![ctx.root.clone()]));

    http::register(lua, &ctx)?;
    check::register(lua, &ctx)?;
    group::register(lua)?;
    metrics::register(lua, &ctx)?;
    time::register(lua)?;
    env::register(lua, &ctx)?;
    vu::register(lua, &ctx)?;
    Ok(())
}
