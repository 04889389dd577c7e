use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// Scheduled Task Models
// ============================================================================

/// Persisted job definition, the scheduler's source of truth
///
/// `trigger_kind` is kept as stored text: an unknown kind is only an error
/// once the task is installed, not when it is read back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub func_name: String,
    pub trigger_kind: String,
    pub trigger_args: serde_json::Value,
    pub args: serde_json::Value,
    pub kwargs: serde_json::Value,
    pub is_enabled: bool,
    pub last_run_time: Option<DateTime<Utc>>,
    pub next_run_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// Build a new task row with empty invocation arguments
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        func_name: impl Into<String>,
        trigger_kind: impl Into<String>,
        trigger_args: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            func_name: func_name.into(),
            trigger_kind: trigger_kind.into(),
            trigger_args,
            args: serde_json::Value::Array(Vec::new()),
            kwargs: serde_json::Value::Object(serde_json::Map::new()),
            is_enabled: true,
            last_run_time: None,
            next_run_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Disabled placeholder row created for a registry entry that has no
    /// backing task yet
    pub fn placeholder(func_name: &str, interval_seconds: u64) -> Self {
        let mut task = Self::new(
            uuid::Uuid::new_v4().to_string(),
            format!("{}-example", func_name),
            func_name,
            "interval",
            serde_json::json!({ "seconds": interval_seconds }),
        );
        task.is_enabled = false;
        task
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: serde_json::Value) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn enabled(mut self, is_enabled: bool) -> Self {
        self.is_enabled = is_enabled;
        self
    }

    /// Positional arguments; `null` means none, a scalar is a single argument
    pub fn positional_args(&self) -> Vec<serde_json::Value> {
        match &self.args {
            serde_json::Value::Null => Vec::new(),
            serde_json::Value::Array(values) => values.clone(),
            other => vec![other.clone()],
        }
    }

    /// Keyword arguments; anything but an object is treated as empty
    pub fn keyword_args(&self) -> serde_json::Map<String, serde_json::Value> {
        match &self.kwargs {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        }
    }
}

/// Whether the dispatch loop is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Running,
    Stopped,
}

/// One live job as reported by `get_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: String,
    pub name: String,
    pub next_run_time: Option<DateTime<Utc>>,
    pub trigger: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub status: SchedulerState,
    pub jobs: Vec<JobStatus>,
}

impl SchedulerStatus {
    pub fn job(&self, id: &str) -> Option<&JobStatus> {
        self.jobs.iter().find(|job| job.id == id)
    }
}

/// Detailed view of one live job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub func_name: String,
    pub next_run_time: Option<DateTime<Utc>>,
    pub trigger: String,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub paused: bool,
}

// ============================================================================
// Notification Models
// ============================================================================

/// Envelope carried on the shared pub/sub topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    pub channel: String,
    pub payload: serde_json::Value,
}

/// Typed application event pushed to WebSocket clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

impl Notification {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "type": self.kind, "data": self.data })
    }
}

/// JWT claims carried by WebSocket and admin callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserClaims {
    pub sub: String,              // Subject (identity)
    #[serde(default)]
    pub permissions: Vec<String>, // Granted permissions
    pub exp: i64,                 // Expiration time (Unix timestamp)
    pub iat: i64,                 // Issued at (Unix timestamp)
}
