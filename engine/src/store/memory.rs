//! In-memory reference `TaskStore`.
//!
//! Used by tests and as the default for embedders that have not configured a
//! database. Each entity kind gets its own lock rather than one giant lock
//! over a single struct, so a log append never blocks a status read.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use shared::{ExecutionLogEntry, PersistedTask, RunAudit, StatusAudit, TaskId, TaskStatus};

use crate::error::StoreError;
use super::{Page, TaskStore};

#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<TaskId, PersistedTask>>,
    status_audits: RwLock<HashMap<TaskId, Vec<StatusAudit>>>,
    run_audits: RwLock<HashMap<TaskId, Vec<RunAudit>>>,
    logs: RwLock<HashMap<TaskId, Vec<ExecutionLogEntry>>>,
    skipped_occurrences: RwLock<HashMap<TaskId, Vec<DateTime<Utc>>>>,
    task_keys: RwLock<HashMap<String, TaskId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn persist(&self, task: PersistedTask) -> Result<(), StoreError> {
        if let Some(key) = &task.task_key {
            let mut task_keys = self.task_keys.write().expect("task_keys lock poisoned");
            if let Some(existing_id) = task_keys.get(key) {
                let tasks = self.tasks.read().expect("tasks lock poisoned");
                if let Some(existing) = tasks.get(existing_id) {
                    if !existing.status.is_terminal() {
                        return Err(StoreError::DuplicateTaskKey(key.clone()));
                    }
                }
            }
            task_keys.insert(key.clone(), task.id);
        }

        self.tasks.write().expect("tasks lock poisoned").insert(task.id, task);
        Ok(())
    }

    async fn set_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        exception: Option<String>,
    ) -> Result<(), StoreError> {
        let (audit_level, is_error) = {
            let mut tasks = self.tasks.write().expect("tasks lock poisoned");
            let task = tasks.get_mut(&task_id).ok_or(StoreError::NotFound(task_id))?;
            task.status = status;
            task.exception = exception.clone();
            let is_error = matches!(status, TaskStatus::Failed) || exception.is_some();
            if status.is_terminal() || status == TaskStatus::InProgress {
                task.last_execution_utc = Some(Utc::now());
            }
            (task.audit_level, is_error)
        };

        if audit_level.records_status(is_error) {
            let audit = StatusAudit {
                task_id,
                new_status: status,
                updated_at_utc: Utc::now(),
                exception,
            };
            self.status_audits
                .write()
                .expect("status_audits lock poisoned")
                .entry(task_id)
                .or_default()
                .push(audit);
        }
        Ok(())
    }

    async fn update_current_run(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        duration_ms: Option<u64>,
        next_run_utc: Option<DateTime<Utc>>,
        exception: Option<String>,
    ) -> Result<(), StoreError> {
        let (audit_level, is_error) = {
            let mut tasks = self.tasks.write().expect("tasks lock poisoned");
            let task = tasks.get_mut(&task_id).ok_or(StoreError::NotFound(task_id))?;
            task.current_run_count += 1;
            task.next_run_utc = next_run_utc;
            task.status = status;
            task.exception = exception.clone();
            task.last_execution_utc = Some(Utc::now());
            let is_error = matches!(status, TaskStatus::Failed) || exception.is_some();
            (task.audit_level, is_error)
        };

        if audit_level.records_run(is_error) {
            let audit = RunAudit {
                task_id,
                status,
                executed_at_utc: Utc::now(),
                exception,
                duration_ms,
            };
            self.run_audits
                .write()
                .expect("run_audits lock poisoned")
                .entry(task_id)
                .or_default()
                .push(audit);
        }
        Ok(())
    }

    async fn retrieve_pending(
        &self,
        cursor: Option<(DateTime<Utc>, TaskId)>,
        take: usize,
    ) -> Result<Page<PersistedTask>, StoreError> {
        let tasks = self.tasks.read().expect("tasks lock poisoned");
        let mut eligible: Vec<PersistedTask> = tasks
            .values()
            .filter(|t| t.status.is_recovery_eligible())
            .cloned()
            .collect();
        eligible.sort_by_key(|t| (t.created_at_utc, t.id));

        let start = match cursor {
            Some((created_at, id)) => eligible
                .iter()
                .position(|t| (t.created_at_utc, t.id) > (created_at, id))
                .unwrap_or(eligible.len()),
            None => 0,
        };

        let page: Vec<PersistedTask> = eligible.iter().skip(start).take(take).cloned().collect();
        let next_cursor = page.last().map(|t| (t.created_at_utc, t.id));

        Ok(Page { items: page, next_cursor })
    }

    async fn get_by_task_key(&self, task_key: &str) -> Result<Option<PersistedTask>, StoreError> {
        let task_keys = self.task_keys.read().expect("task_keys lock poisoned");
        let tasks = self.tasks.read().expect("tasks lock poisoned");
        Ok(task_keys.get(task_key).and_then(|id| tasks.get(id)).cloned())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<PersistedTask>, StoreError> {
        Ok(self.tasks.read().expect("tasks lock poisoned").get(&task_id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<PersistedTask>, StoreError> {
        Ok(self.tasks.read().expect("tasks lock poisoned").values().cloned().collect())
    }

    async fn remove(&self, task_id: TaskId) -> Result<(), StoreError> {
        self.tasks.write().expect("tasks lock poisoned").remove(&task_id);
        self.status_audits.write().expect("status_audits lock poisoned").remove(&task_id);
        self.run_audits.write().expect("run_audits lock poisoned").remove(&task_id);
        self.logs.write().expect("logs lock poisoned").remove(&task_id);
        self.skipped_occurrences.write().expect("skipped_occurrences lock poisoned").remove(&task_id);
        Ok(())
    }

    async fn save_execution_logs(&self, entries: Vec<ExecutionLogEntry>) -> Result<(), StoreError> {
        let mut logs = self.logs.write().expect("logs lock poisoned");
        for entry in entries {
            logs.entry(entry.task_id).or_default().push(entry);
        }
        Ok(())
    }

    async fn get_execution_logs(&self, task_id: TaskId) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        Ok(self.logs.read().expect("logs lock poisoned").get(&task_id).cloned().unwrap_or_default())
    }

    async fn record_skipped_occurrences(
        &self,
        task_id: TaskId,
        occurrences: Vec<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.skipped_occurrences
            .write()
            .expect("skipped_occurrences lock poisoned")
            .entry(task_id)
            .or_default()
            .extend(occurrences);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::AuditLevel;
    use serde_json::json;

    fn sample_task(task_key: Option<&str>) -> PersistedTask {
        PersistedTask {
            id: TaskId::new(),
            task_key: task_key.map(str::to_string),
            request_payload: json!({}),
            request_type_name: "Req".into(),
            handler_type_name: "Handler".into(),
            queue_name: "default".into(),
            status: TaskStatus::WaitingQueue,
            scheduled_execution_utc: None,
            is_recurring: false,
            recurring_spec: None,
            max_runs: None,
            run_until_utc: None,
            current_run_count: 0,
            next_run_utc: None,
            audit_level: AuditLevel::Full,
            created_at_utc: Utc::now(),
            last_execution_utc: None,
            exception: None,
        }
    }

    #[tokio::test]
    async fn persist_then_get_round_trips() {
        let store = MemoryStore::new();
        let task = sample_task(None);
        let id = task.id;
        store.persist(task).await.unwrap();

        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.id, id);
    }

    #[tokio::test]
    async fn duplicate_task_key_on_non_terminal_task_is_rejected() {
        let store = MemoryStore::new();
        let first = sample_task(Some("idempotency-key"));
        store.persist(first).await.unwrap();

        let second = sample_task(Some("idempotency-key"));
        let result = store.persist(second).await;
        assert!(matches!(result, Err(StoreError::DuplicateTaskKey(_))));
    }

    #[tokio::test]
    async fn duplicate_task_key_after_terminal_is_allowed() {
        let store = MemoryStore::new();
        let first = sample_task(Some("idempotency-key"));
        let first_id = first.id;
        store.persist(first).await.unwrap();
        store.set_status(first_id, TaskStatus::Completed, None).await.unwrap();

        let second = sample_task(Some("idempotency-key"));
        store.persist(second).await.unwrap();
    }

    #[tokio::test]
    async fn status_audit_rows_are_appended_in_order() {
        let store = MemoryStore::new();
        let task = sample_task(None);
        let id = task.id;
        store.persist(task).await.unwrap();

        store.set_status(id, TaskStatus::Queued, None).await.unwrap();
        store.set_status(id, TaskStatus::InProgress, None).await.unwrap();
        store.set_status(id, TaskStatus::Completed, None).await.unwrap();

        let audits = store.status_audits.read().unwrap().get(&id).cloned().unwrap();
        assert_eq!(audits.len(), 3);
        assert_eq!(audits.last().unwrap().new_status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn retrieve_pending_pages_in_created_at_order() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let task = sample_task(None);
            ids.push(task.id);
            store.persist(task).await.unwrap();
        }

        let page1 = store.retrieve_pending(None, 2).await.unwrap();
        assert_eq!(page1.items.len(), 2);
        let page2 = store.retrieve_pending(page1.next_cursor, 2).await.unwrap();
        assert_eq!(page2.items.len(), 2);
        assert_ne!(page1.items[0].id, page2.items[0].id);
    }

    #[tokio::test]
    async fn execution_logs_accumulate_per_task() {
        let store = MemoryStore::new();
        let task_id = TaskId::new();
        store
            .save_execution_logs(vec![ExecutionLogEntry {
                task_id,
                timestamp_utc: Utc::now(),
                level: shared::LogLevel::Information,
                message: "started".into(),
                exception_details: None,
                sequence_number: 0,
            }])
            .await
            .unwrap();

        let logs = store.get_execution_logs(task_id).await.unwrap();
        assert_eq!(logs.len(), 1);
    }
}
