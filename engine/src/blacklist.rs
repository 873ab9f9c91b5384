//! Process-wide set of task ids whose execution must be skipped.
//!
//! A task lands here the moment `Dispatcher::cancel` is called. Anything that
//! later dequeues the same id — a race with the worker queue, a recovered row
//! from a previous run — must check this before invoking a handler.

use std::collections::HashSet;
use std::sync::RwLock;

use shared::TaskId;

#[derive(Default)]
pub struct Blacklist {
    ids: RwLock<HashSet<TaskId>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Blacklist::default()
    }

    pub fn insert(&self, id: TaskId) {
        self.ids.write().expect("blacklist lock poisoned").insert(id);
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.ids.read().expect("blacklist lock poisoned").contains(id)
    }

    pub fn remove(&self, id: &TaskId) {
        self.ids.write().expect("blacklist lock poisoned").remove(id);
    }
}
