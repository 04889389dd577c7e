// Task administration: store-first mutations followed by a live-engine resync

use crate::db::TaskStore;
use crate::errors::{DatabaseError, SchedulerError};
use crate::models::ScheduledTask;
use crate::scheduler::SchedulerCore;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument};

fn default_args() -> Value {
    Value::Array(Vec::new())
}

fn default_kwargs() -> Value {
    Value::Object(serde_json::Map::new())
}

fn default_enabled() -> bool {
    true
}

/// Request body for creating a task
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub func_name: String,
    pub trigger_kind: String,
    #[serde(default = "default_kwargs")]
    pub trigger_args: Value,
    #[serde(default = "default_args")]
    pub args: Value,
    #[serde(default = "default_kwargs")]
    pub kwargs: Value,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

/// Partial update; absent fields keep their stored value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub func_name: Option<String>,
    pub trigger_kind: Option<String>,
    pub trigger_args: Option<Value>,
    pub args: Option<Value>,
    pub kwargs: Option<Value>,
    pub is_enabled: Option<bool>,
}

impl TaskPatch {
    fn apply(self, task: &mut ScheduledTask) {
        if let Some(name) = self.name {
            task.name = name;
        }
        if let Some(func_name) = self.func_name {
            task.func_name = func_name;
        }
        if let Some(kind) = self.trigger_kind {
            task.trigger_kind = kind;
        }
        if let Some(trigger_args) = self.trigger_args {
            task.trigger_args = trigger_args;
        }
        if let Some(args) = self.args {
            task.args = args;
        }
        if let Some(kwargs) = self.kwargs {
            task.kwargs = kwargs;
        }
        if let Some(enabled) = self.is_enabled {
            task.is_enabled = enabled;
        }
        task.updated_at = Utc::now();
    }
}

/// Administrative operations over persisted tasks and the live engine
#[derive(Clone)]
pub struct TaskAdmin {
    store: Arc<dyn TaskStore>,
    scheduler: Arc<SchedulerCore>,
}

impl TaskAdmin {
    pub fn new(scheduler: Arc<SchedulerCore>) -> Self {
        Self {
            store: scheduler.store().clone(),
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &Arc<SchedulerCore> {
        &self.scheduler
    }

    async fn load(&self, id: &str) -> Result<ScheduledTask, SchedulerError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))
    }

    /// Overlay the live next fire time on a stored row
    async fn with_live_state(&self, mut task: ScheduledTask) -> ScheduledTask {
        if let Some(info) = self.scheduler.get_job_info(&task.id).await {
            task.next_run_time = info.next_run_time;
        }
        task
    }

    #[instrument(skip(self, new), fields(task_name = %new.name))]
    pub async fn create(&self, new: NewTask) -> Result<ScheduledTask, SchedulerError> {
        let id = new
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let task = ScheduledTask::new(id, new.name, new.func_name, new.trigger_kind, new.trigger_args)
            .with_args(new.args)
            .with_kwargs(new.kwargs)
            .enabled(new.is_enabled);

        self.scheduler.validate(&task)?;
        if !self.store.insert(&task).await? {
            return Err(DatabaseError::DuplicateKey(format!(
                "Task with id '{}' or name '{}' already exists",
                task.id, task.name
            ))
            .into());
        }
        self.scheduler.add_or_update_job(&task).await?;

        info!(task_id = %task.id, "Task created");
        Ok(self.with_live_state(task).await)
    }

    #[instrument(skip(self, patch))]
    pub async fn update(&self, id: &str, patch: TaskPatch) -> Result<ScheduledTask, SchedulerError> {
        let mut task = self.load(id).await?;
        patch.apply(&mut task);

        self.scheduler.validate(&task)?;
        self.store.update(&task).await?;
        self.scheduler.add_or_update_job(&task).await?;

        info!("Task updated");
        Ok(self.with_live_state(task).await)
    }

    /// Persist the flag, then pause or resume the live job without
    /// rebuilding its trigger
    #[instrument(skip(self))]
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<ScheduledTask, SchedulerError> {
        let mut task = self.load(id).await?;
        self.store.set_enabled(id, enabled).await?;
        task.is_enabled = enabled;

        let live = self.scheduler.get_job_info(id).await.is_some();
        match (live, enabled) {
            (true, true) => {
                self.scheduler.resume_job(id).await;
            }
            (true, false) => {
                self.scheduler.pause_job(id).await;
            }
            (false, _) => {
                self.scheduler.add_or_update_job(&task).await?;
            }
        }

        info!(enabled, "Task enabled flag changed");
        Ok(self.with_live_state(task).await)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<(), SchedulerError> {
        self.scheduler.remove_job(id).await;
        if !self.store.delete(id).await? {
            return Err(SchedulerError::JobNotFound(id.to_string()));
        }
        info!("Task deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_once(&self, id: &str) -> Result<(), SchedulerError> {
        let task = self.load(id).await?;
        self.scheduler.run_once(&task).await
    }

    pub async fn get(&self, id: &str) -> Result<ScheduledTask, SchedulerError> {
        let task = self.load(id).await?;
        Ok(self.with_live_state(task).await)
    }

    pub async fn list(&self) -> Result<Vec<ScheduledTask>, SchedulerError> {
        let status = self.scheduler.get_status().await;
        let mut tasks = self.store.list_all().await?;
        for task in &mut tasks {
            if let Some(job) = status.job(&task.id) {
                task.next_run_time = job.next_run_time;
            }
        }
        Ok(tasks)
    }
}
