// In-process task store for tests and database-less single-node runs

use crate::db::TaskStore;
use crate::errors::DatabaseError;
use crate::models::ScheduledTask;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// `TaskStore` kept in memory with the same uniqueness rules as the table
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<Vec<ScheduledTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with rows; later duplicates are ignored
    pub fn with_tasks(tasks: impl IntoIterator<Item = ScheduledTask>) -> Self {
        let mut rows: Vec<ScheduledTask> = Vec::new();
        for task in tasks {
            if !rows.iter().any(|t| t.id == task.id || t.name == task.name) {
                rows.push(task);
            }
        }
        Self {
            tasks: RwLock::new(rows),
        }
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

fn not_found(id: &str) -> DatabaseError {
    DatabaseError::NotFound(format!("Task {} not found", id))
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn list_all(&self) -> Result<Vec<ScheduledTask>, DatabaseError> {
        Ok(self.tasks.read().await.clone())
    }

    async fn list_enabled(&self) -> Result<Vec<ScheduledTask>, DatabaseError> {
        Ok(self
            .tasks
            .read()
            .await
            .iter()
            .filter(|t| t.is_enabled)
            .cloned()
            .collect())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<ScheduledTask>, DatabaseError> {
        Ok(self.tasks.read().await.iter().find(|t| t.id == id).cloned())
    }

    async fn exists_for_func(&self, func_name: &str) -> Result<bool, DatabaseError> {
        Ok(self
            .tasks
            .read()
            .await
            .iter()
            .any(|t| t.func_name == func_name))
    }

    async fn insert(&self, task: &ScheduledTask) -> Result<bool, DatabaseError> {
        let mut tasks = self.tasks.write().await;
        if tasks.iter().any(|t| t.id == task.id || t.name == task.name) {
            return Ok(false);
        }
        tasks.push(task.clone());
        Ok(true)
    }

    async fn update(&self, task: &ScheduledTask) -> Result<(), DatabaseError> {
        let mut tasks = self.tasks.write().await;
        if tasks.iter().any(|t| t.id != task.id && t.name == task.name) {
            return Err(DatabaseError::DuplicateKey(format!(
                "Task name '{}' already exists",
                task.name
            )));
        }
        let row = tasks
            .iter_mut()
            .find(|t| t.id == task.id)
            .ok_or_else(|| not_found(&task.id))?;

        row.name = task.name.clone();
        row.func_name = task.func_name.clone();
        row.trigger_kind = task.trigger_kind.clone();
        row.trigger_args = task.trigger_args.clone();
        row.args = task.args.clone();
        row.kwargs = task.kwargs.clone();
        row.is_enabled = task.is_enabled;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), DatabaseError> {
        let mut tasks = self.tasks.write().await;
        let row = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| not_found(id))?;
        row.is_enabled = enabled;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, DatabaseError> {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|t| t.id != id);
        Ok(tasks.len() != before)
    }

    async fn record_run_times(
        &self,
        id: &str,
        last_run_time: Option<DateTime<Utc>>,
        next_run_time: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let mut tasks = self.tasks.write().await;
        if let Some(row) = tasks.iter_mut().find(|t| t.id == id) {
            if last_run_time.is_some() {
                row.last_run_time = last_run_time;
            }
            row.next_run_time = next_run_time;
        }
        Ok(())
    }
}
