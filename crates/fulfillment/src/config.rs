//! Application configuration loaded from environment variables.

use std::time::Duration;

use runtime::RuntimeOptions;

use crate::workflows::ORDER_TASK_QUEUE;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Worker configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `json` for structured output, anything else for plain text
/// - `DATABASE_URL`: PostgreSQL connection string; history is kept in
///   memory when unset
/// - `WORKFLOW_WORKERS`: concurrent workflow passes (default: `4`)
/// - `MAX_CONCURRENT_ACTIVITIES`: concurrent activity attempts (default: `10`)
/// - `RETENTION_SECS`: seconds closed executions are kept (default: forever)
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub workflow_workers: usize,
    pub max_concurrent_activities: usize,
    pub retention: Option<Duration>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from `lookup`, falling back to defaults for
    /// missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT").as_deref() {
                Some(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            workflow_workers: lookup("WORKFLOW_WORKERS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.workflow_workers),
            max_concurrent_activities: lookup("MAX_CONCURRENT_ACTIVITIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_concurrent_activities),
            retention: lookup("RETENTION_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
        }
    }

    /// Runtime options polling the order queue.
    pub fn runtime_options(&self) -> RuntimeOptions {
        let options = RuntimeOptions::new()
            .workflow_workers(self.workflow_workers)
            .max_concurrent_activities(self.max_concurrent_activities)
            .activity_queues([ORDER_TASK_QUEUE]);
        match self.retention {
            Some(retention) => options.retention(retention),
            None => options,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            workflow_workers: 4,
            max_concurrent_activities: 10,
            retention: None,
        }
    }
}
