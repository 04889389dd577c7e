// Configuration management with layered configuration (file, env)

use chrono_tz::Tz;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub broadcast: BroadcastConfig,
    pub scheduler: SchedulerSettings,
    pub auth: AuthConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Redis connection used as the cross-process pub/sub transport.
///
/// An empty `url` runs the notification bus in local-only mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// The single pub/sub topic carrying every channel's traffic
    pub topic: String,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Per-connection outbound queue length
    pub outbound_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Run the scheduler in this process. Exactly one instance sharing a
    /// store should enable it.
    pub enabled: bool,
    pub timezone: String,
    pub misfire_grace_seconds: u64,
    #[serde(default = "default_true")]
    pub auto_register: bool,
    #[serde(default = "default_placeholder_interval")]
    pub placeholder_interval_seconds: u64,
    #[serde(default = "default_max_idle")]
    pub max_idle_seconds: u64,
    #[serde(default = "default_true")]
    pub wait_on_shutdown: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_expiration_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    pub tracing_endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

fn default_true() -> bool {
    true
}

fn default_publish_timeout_ms() -> u64 {
    2_000
}

fn default_placeholder_interval() -> u64 {
    60
}

fn default_max_idle() -> u64 {
    60
}

impl SchedulerSettings {
    /// Parsed scheduler timezone
    pub fn tz(&self) -> Result<Tz, String> {
        Tz::from_str(&self.timezone).map_err(|e| format!("Invalid timezone '{}': {}", self.timezone, e))
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let defaults = Config::try_from(&Settings::default())?;

        let builder = Config::builder()
            .add_source(defaults)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port must be greater than 0".to_string());
        }

        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        if self.broadcast.topic.is_empty() {
            return Err("Broadcast topic cannot be empty".to_string());
        }
        if self.broadcast.reconnect_base_delay_ms == 0 {
            return Err("Broadcast reconnect_base_delay_ms must be greater than 0".to_string());
        }
        if self.broadcast.reconnect_max_delay_ms < self.broadcast.reconnect_base_delay_ms {
            return Err(
                "Broadcast reconnect_max_delay_ms must not be below reconnect_base_delay_ms"
                    .to_string(),
            );
        }
        if self.broadcast.outbound_buffer == 0 {
            return Err("Broadcast outbound_buffer must be greater than 0".to_string());
        }

        self.scheduler.tz()?;
        if self.scheduler.misfire_grace_seconds == 0 {
            return Err("Scheduler misfire_grace_seconds must be greater than 0".to_string());
        }
        if self.scheduler.max_idle_seconds == 0 {
            return Err("Scheduler max_idle_seconds must be greater than 0".to_string());
        }

        if self.auth.jwt_secret.is_empty() {
            return Err("JWT secret cannot be empty".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "postgresql://localhost/chronocast".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
                run_migrations: true,
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
                publish_timeout_ms: default_publish_timeout_ms(),
            },
            broadcast: BroadcastConfig {
                topic: "ws_broadcast".to_string(),
                reconnect_base_delay_ms: 500,
                reconnect_max_delay_ms: 30_000,
                outbound_buffer: 64,
            },
            scheduler: SchedulerSettings {
                enabled: true,
                timezone: "Asia/Shanghai".to_string(),
                misfire_grace_seconds: 60,
                auto_register: true,
                placeholder_interval_seconds: default_placeholder_interval(),
                max_idle_seconds: default_max_idle(),
                wait_on_shutdown: true,
            },
            auth: AuthConfig {
                jwt_secret: "change-me-in-production".to_string(),
                jwt_expiration_hours: 24,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                log_format: LogFormat::Json,
                metrics_enabled: true,
                tracing_endpoint: None,
            },
        }
    }
}
