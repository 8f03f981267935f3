/// Configuration management for the flowpilot engine
///
/// Handles server configuration, the definition database and engine tuning.
/// Every value can be overridden through a `FLOWPILOT_*` environment variable.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Engine tuning
    pub engine: EngineSettings,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Storage for workflow definitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL (default: "sqlite://data/flowpilot.db")
    pub url: String,
}

/// Runtime limits and policies of the workflow engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Completed steps after which an instance is failed as runaway
    pub max_steps_per_instance: usize,
    /// Whether webhook/script/custom failures fail the instance when the
    /// node does not decide for itself
    pub halt_on_error: bool,
    /// Capacity of the lifecycle event channel
    pub event_buffer: usize,
    pub script_timeout_secs: u64,
    /// Lua heap limit in bytes
    pub script_memory_limit: usize,
    pub webhook_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_steps_per_instance: 1000,
            halt_on_error: false,
            event_buffer: 1024,
            script_timeout_secs: 5,
            script_memory_limit: 16 * 1024 * 1024,
            webhook_timeout_secs: 30,
        }
    }
}

impl EngineSettings {
    /// Defaults overridden by whatever `FLOWPILOT_*` variables are set
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_steps_per_instance: env_or("FLOWPILOT_MAX_STEPS", defaults.max_steps_per_instance),
            halt_on_error: env_or("FLOWPILOT_HALT_ON_ERROR", defaults.halt_on_error),
            event_buffer: env_or("FLOWPILOT_EVENT_BUFFER", defaults.event_buffer),
            script_timeout_secs: env_or("FLOWPILOT_SCRIPT_TIMEOUT_SECS", defaults.script_timeout_secs),
            script_memory_limit: env_or("FLOWPILOT_SCRIPT_MEMORY_LIMIT", defaults.script_memory_limit),
            webhook_timeout_secs: env_or("FLOWPILOT_WEBHOOK_TIMEOUT_SECS", defaults.webhook_timeout_secs),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("FLOWPILOT_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("FLOWPILOT_PORT", 3004),
            },
            database: DatabaseConfig {
                url: std::env::var("FLOWPILOT_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/flowpilot.db".to_string()),
            },
            engine: EngineSettings::from_env(),
        }
    }
}

/// Parse an environment variable, falling back on absence or parse failure
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}
