use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use mlua::Lua;

use stampede_core::{Error as CoreError, Group, HttpClient, SampleSink, Vu};

use crate::modules::{self, RegisterContext};
use crate::{Error, Result};

/// One Lua state with the script loaded and the entry function resolved.
pub(crate) struct ScriptState {
    pub lua: Lua,
    pub entry: mlua::Function,
}

/// Builds a fresh state: registers the script API, executes the script top
/// level, and looks up the `Default` entry function.
pub(crate) fn build_script_state(
    script: &str,
    chunk_name: &str,
    ctx: RegisterContext,
) -> Result<ScriptState> {
    let lua = Lua::new();
    modules::register(&lua, ctx)?;
    lua.load(script).set_name(chunk_name).exec()?;

    let entry: mlua::Function = match lua.globals().get("Default") {
        Ok(mlua::Value::Function(f)) => f,
        _ => return Err(Error::MissingDefault),
    };

    Ok(ScriptState { lua, entry })
}

/// One virtual user: a private interpreter, never shared across concurrent
/// iterations. `reconfigure` rebuilds the interpreter from scratch, which is
/// what resets script-side per-VU state.
pub struct LuaVu {
    pub(crate) script: Arc<str>,
    pub(crate) chunk_name: Arc<str>,
    pub(crate) client: Arc<HttpClient>,
    pub(crate) root: Arc<Group>,
    pub(crate) env: Arc<Vec<(String, String)>>,
    pub(crate) sink: SampleSink,
    pub(crate) state: Option<ScriptState>,
}

impl Vu for LuaVu {
    fn reconfigure(&mut self, id: u64) -> std::result::Result<(), CoreError> {
        let ctx = RegisterContext {
            vu_id: id,
            sink: self.sink.clone(),
            client: self.client.clone(),
            root: self.root.clone(),
            env: self.env.clone(),
        };
        let state = build_script_state(&self.script, &self.chunk_name, ctx)
            .map_err(|err| CoreError::Compile(err.to_string()))?;
        self.state = Some(state);
        Ok(())
    }

    fn run_once(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<(), CoreError>> + Send + '_>> {
        Box::pin(async move {
            let Some(state) = self.state.as_ref() else {
                return Err(CoreError::Runtime(
                    "VU used before reconfigure".to_string(),
                ));
            };
            state
                .entry
                .call_async::<()>(())
                .await
                .map_err(|err| CoreError::Runtime(err.to_string()))
        })
    }
}
