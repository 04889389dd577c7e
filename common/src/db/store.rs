// Persistence seam for scheduled task definitions

use crate::errors::DatabaseError;
use crate::models::ScheduledTask;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Storage of `ScheduledTask` rows
///
/// Rows are unique by `id` and by `name`. The scheduler reads definitions at
/// startup and writes back run times after each dispatch.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn list_all(&self) -> Result<Vec<ScheduledTask>, DatabaseError>;

    async fn list_enabled(&self) -> Result<Vec<ScheduledTask>, DatabaseError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<ScheduledTask>, DatabaseError>;

    /// Whether any row, enabled or not, references `func_name`
    async fn exists_for_func(&self, func_name: &str) -> Result<bool, DatabaseError>;

    /// Insert-or-ignore. Returns `Ok(false)` when a uniqueness constraint
    /// rejected the row.
    async fn insert(&self, task: &ScheduledTask) -> Result<bool, DatabaseError>;

    /// Replace every mutable column of an existing row
    async fn update(&self, task: &ScheduledTask) -> Result<(), DatabaseError>;

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), DatabaseError>;

    /// Returns `Ok(false)` when no row had this id
    async fn delete(&self, id: &str) -> Result<bool, DatabaseError>;

    async fn record_run_times(
        &self,
        id: &str,
        last_run_time: Option<DateTime<Utc>>,
        next_run_time: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;
}
