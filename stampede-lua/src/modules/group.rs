use mlua::{Lua, Value};

use super::GroupStack;
use crate::Result;

/// `group("name", fn)`: runs `fn` inside a nested metric scope. Samples
/// emitted while inside carry the group's path; nesting is unlimited.
pub(super) fn register(lua: &Lua) -> Result<()> {
    let loader = lua.create_function(move |lua, ()| {
        let group_fn =
            lua.create_async_function(move |lua, (name, f): (String, mlua::Function)| async move {
                let child = {
                    let stack = lua.app_data_ref::<GroupStack>();
                    stack.and_then(|stack| stack.0.last().map(|current| current.child(&name)))
                };

                let Some(child) = child else {
                    return f.call_async::<Value>(()).await;
                };

                if let Some(mut stack) = lua.app_data_mut::<GroupStack>() {
                    stack.0.push(child);
                }

                let result = f.call_async::<Value>(()).await;

                if let Some(mut stack) = lua.app_data_mut::<GroupStack>() {
                    stack.0.pop();
                }

                result
            })?;
        Ok(Value::Function(group_fn))
    })?;

    super::preload_set(lua, "stampede/group", loader)
}
