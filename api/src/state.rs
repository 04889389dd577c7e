use std::sync::Arc;

use common::auth::JwtService;
use common::broadcast::{BroadcastBus, ConnectionRegistry};
use common::config::Settings;
use common::db::DbPool;
use common::scheduler::{SchedulerCore, TaskAdmin};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::handlers::ErrorResponse;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub bus: Arc<BroadcastBus>,
    pub connections: Arc<ConnectionRegistry>,
    pub jwt: JwtService,
    /// Present only in the process that runs the scheduler
    pub scheduler: Option<Arc<SchedulerCore>>,
    pub admin: Option<TaskAdmin>,
    pub db_pool: Option<DbPool>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    /// State for a process that only serves notifications
    pub fn new(config: Settings, bus: Arc<BroadcastBus>) -> Self {
        let jwt = JwtService::new(&config.auth.jwt_secret, config.auth.jwt_expiration_hours);
        Self {
            connections: bus.connections().clone(),
            config: Arc::new(config),
            bus,
            jwt,
            scheduler: None,
            admin: None,
            db_pool: None,
            metrics_handle: None,
        }
    }

    /// Attach the scheduler and its backing pool
    pub fn with_scheduler(mut self, scheduler: Arc<SchedulerCore>, db_pool: Option<DbPool>) -> Self {
        self.admin = Some(TaskAdmin::new(scheduler.clone()));
        self.scheduler = Some(scheduler);
        self.db_pool = db_pool;
        self
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub fn admin(&self) -> Result<&TaskAdmin, ErrorResponse> {
        self.admin.as_ref().ok_or_else(scheduler_disabled)
    }

    pub fn scheduler(&self) -> Result<&Arc<SchedulerCore>, ErrorResponse> {
        self.scheduler.as_ref().ok_or_else(scheduler_disabled)
    }
}

fn scheduler_disabled() -> ErrorResponse {
    ErrorResponse::new(
        "service_unavailable",
        "The scheduler is not enabled in this process",
    )
}
