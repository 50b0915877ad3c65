use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A named scope annotating samples. Groups form a tree rooted at the
/// runner's default group; checks live inside groups and count pass/fail.
#[derive(Debug)]
pub struct Group {
    name: String,
    path: String,
    children: Mutex<BTreeMap<String, Arc<Group>>>,
    checks: Mutex<BTreeMap<String, Arc<Check>>>,
}

impl Group {
    pub fn root() -> Arc<Group> {
        Arc::new(Group {
            name: String::new(),
            path: String::new(),
            children: Mutex::new(BTreeMap::new()),
            checks: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the group from the root, `::`-separated. Empty for the root.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the named child group, creating it on first use. Safe to call
    /// from concurrently running VUs.
    pub fn child(self: &Arc<Self>, name: &str) -> Arc<Group> {
        let mut children = self.children.lock();
        children
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Group {
                    name: name.to_string(),
                    path: format!("{}::{}", self.path, name),
                    children: Mutex::new(BTreeMap::new()),
                    checks: Mutex::new(BTreeMap::new()),
                })
            })
            .clone()
    }

    pub fn check(&self, name: &str) -> Arc<Check> {
        let mut checks = self.checks.lock();
        checks
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Check {
                    name: name.to_string(),
                    passes: AtomicU64::new(0),
                    fails: AtomicU64::new(0),
                })
            })
            .clone()
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            name: self.name.clone(),
            path: self.path.clone(),
            groups: self
                .children
                .lock()
                .values()
                .map(|g| g.snapshot())
                .collect(),
            checks: self
                .checks
                .lock()
                .values()
                .map(|c| CheckSnapshot {
                    name: c.name.clone(),
                    passes: c.passes.load(Ordering::Relaxed),
                    fails: c.fails.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }
}

#[derive(Debug)]
pub struct Check {
    name: String,
    passes: AtomicU64,
    fails: AtomicU64,
}

impl Check {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record(&self, ok: bool) {
        if ok {
            self.passes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fails.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn fails(&self) -> u64 {
        self.fails.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub name: String,
    pub path: String,
    pub groups: Vec<GroupSnapshot>,
    pub checks: Vec<CheckSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckSnapshot {
    pub name: String,
    pub passes: u64,
    pub fails: u64,
}
