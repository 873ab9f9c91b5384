//! Per-task cancellation composition.
//!
//! A task's effective cancellation signal is "any of": service shutdown, a
//! user-initiated cancel, or a per-task timeout. `tokio_util`'s
//! `CancellationToken` supports exactly this via child tokens chained off a
//! shared root — cancelling the root cancels every child, and cancelling one
//! child never affects its siblings.
//!
//! `Reason` is recorded on a side channel rather than inferred from which
//! token fired, since a child token's `is_cancelled()` also reports true after
//! its parent cancels.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use shared::TaskId;

/// Why a task's cancellation token was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    User,
    ServiceStopped,
    Timeout,
}

struct Entry {
    token: CancellationToken,
    reason: Mutex<Option<CancelReason>>,
}

/// Concurrent map from `TaskId` to its in-flight cancellation handle.
///
/// Entries exist only for the duration of execution; see `CancellationGuard`
/// for the RAII removal that makes this true even across panics and early
/// returns.
#[derive(Default)]
pub struct CancellationRegistry {
    entries: Mutex<HashMap<TaskId, Entry>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        CancellationRegistry::default()
    }

    /// Register a fresh child token for `task_id`, derived from `shutdown`.
    /// Returns the token the executor should pass to the handler.
    pub fn register(&self, task_id: TaskId, shutdown: &CancellationToken) -> CancellationToken {
        let token = shutdown.child_token();
        let mut entries = self.entries.lock().expect("cancellation registry lock poisoned");
        entries.insert(
            task_id,
            Entry {
                token: token.clone(),
                reason: Mutex::new(None),
            },
        );
        token
    }

    /// Cancel the task's token (if registered) with the given reason. A
    /// reason set earlier is never overwritten — first cancellation wins.
    pub fn cancel(&self, task_id: &TaskId, reason: CancelReason) -> bool {
        let entries = self.entries.lock().expect("cancellation registry lock poisoned");
        match entries.get(task_id) {
            Some(entry) => {
                let mut stored_reason = entry.reason.lock().expect("cancel reason lock poisoned");
                if stored_reason.is_none() {
                    *stored_reason = Some(reason);
                }
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn reason(&self, task_id: &TaskId) -> Option<CancelReason> {
        let entries = self.entries.lock().expect("cancellation registry lock poisoned");
        entries
            .get(task_id)
            .and_then(|entry| *entry.reason.lock().expect("cancel reason lock poisoned"))
    }

    pub fn remove(&self, task_id: &TaskId) {
        self.entries.lock().expect("cancellation registry lock poisoned").remove(task_id);
    }
}

/// RAII guard that removes a task's cancellation registry entry on drop, so
/// every exit path (success, failure, cancellation, panic unwind) cleans up.
pub struct CancellationGuard<'a> {
    registry: &'a CancellationRegistry,
    task_id: TaskId,
}

impl<'a> CancellationGuard<'a> {
    pub fn new(registry: &'a CancellationRegistry, task_id: TaskId, shutdown: &CancellationToken) -> (Self, CancellationToken) {
        let token = registry.register(task_id, shutdown);
        (CancellationGuard { registry, task_id }, token)
    }
}

impl Drop for CancellationGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.task_id);
    }
}
