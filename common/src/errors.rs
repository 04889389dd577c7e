// Error handling framework for the scheduler and the notification bus

use thiserror::Error;

/// Trigger configuration errors
///
/// Raised synchronously while building a trigger from a persisted
/// `(trigger_kind, trigger_args)` pair. A task carrying one of these cannot be
/// installed in the live engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("Unknown trigger kind: {0}")]
    UnknownTriggerKind(String),

    #[error("Invalid trigger arguments: {0}")]
    InvalidArguments(String),

    #[error("Invalid trigger argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid date '{value}': {reason}")]
    InvalidDate { value: String, reason: String },
}

/// Live scheduler errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ScheduleError),

    #[error("Job function not registered: {func_name}")]
    RegistryMiss { func_name: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {job_id} failed: {reason}")]
    ExecutionFailed { job_id: String, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Notification bus errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BroadcastError {
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Failed to publish message: {0}")]
    PublishFailed(String),

    #[error("Publish timed out after {0} ms")]
    PublishTimeout(u64),

    #[error("Failed to subscribe: {0}")]
    SubscribeFailed(String),

    #[error("Message serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send queue full")]
    SendQueueFull,
}

/// Authentication and authorization errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid JWT token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Insufficient permissions: required {0}")]
    InsufficientPermissions(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
}

/// API response error type for HTTP responses
#[derive(Debug, serde::Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<ScheduleError> for ApiError {
    fn from(err: ScheduleError) -> Self {
        ApiError::new("validation_error", err.to_string())
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        let code = match &err {
            SchedulerError::Configuration(_) | SchedulerError::RegistryMiss { .. } => {
                "validation_error"
            }
            SchedulerError::JobNotFound(_) => "not_found",
            SchedulerError::ExecutionFailed { .. } => "execution_error",
            SchedulerError::Store(DatabaseError::NotFound(_)) => "not_found",
            SchedulerError::Store(DatabaseError::DuplicateKey(_)) => "conflict",
            SchedulerError::Store(_) => "database_error",
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let code = match err {
            AuthError::InvalidToken(_) | AuthError::TokenExpired => "unauthorized",
            AuthError::InsufficientPermissions(_) => "forbidden",
            AuthError::AuthenticationFailed(_) => "unauthorized",
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<BroadcastError> for ApiError {
    fn from(err: BroadcastError) -> Self {
        ApiError::new("broadcast_error", err.to_string())
    }
}

// Implement From for common external errors
impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => DatabaseError::DuplicateKey(db_err.message().to_string()),
                        _ => DatabaseError::QueryFailed(db_err.message().to_string()),
                    }
                } else {
                    DatabaseError::QueryFailed(db_err.message().to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DatabaseError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DatabaseError::MigrationFailed(err.to_string())
    }
}

impl From<redis::RedisError> for BroadcastError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            BroadcastError::TransportUnavailable(err.to_string())
        } else {
            BroadcastError::PublishFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BroadcastError {
    fn from(err: serde_json::Error) -> Self {
        BroadcastError::SerializationFailed(err.to_string())
    }
}
