use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Index of an interned metric or tag name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub(crate) u32);

impl From<u32> for KeyId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<KeyId> for u32 {
    fn from(v: KeyId) -> Self {
        v.0
    }
}

/// Maps metric and tag names to small copyable ids, so series keys never
/// carry strings. Name churn is low (a registry sees a few dozen distinct
/// names per run), so a single lock over both directions is plenty.
#[derive(Debug, Default)]
pub struct Interner {
    state: Mutex<InternerState>,
}

#[derive(Debug, Default)]
struct InternerState {
    ids: HashMap<Arc<str>, KeyId>,
    names: Vec<Arc<str>>,
}

impl Interner {
    pub fn get_or_intern(&self, name: &str) -> KeyId {
        let mut state = self.state.lock();
        if let Some(&id) = state.ids.get(name) {
            return id;
        }

        let id = KeyId(state.names.len() as u32);
        let name: Arc<str> = Arc::from(name);
        state.names.push(name.clone());
        state.ids.insert(name, id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<KeyId> {
        self.state.lock().ids.get(name).copied()
    }

    pub fn resolve(&self, id: KeyId) -> Option<Arc<str>> {
        self.state.lock().names.get(id.0 as usize).cloned()
    }
}
