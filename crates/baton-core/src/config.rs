//! Node configuration.
//!
//! Durations are plain integer fields (`_secs` / `_ms`) with `Duration`
//! accessors. Every field has a default so a minimal file only lists the
//! task types.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::app::backoff::{BackoffPolicy, PollPolicy};
use crate::ports::dispatch::Route;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("task type '{0}' is configured more than once")]
    DuplicateTaskType(String),

    #[error("task type '{task_type}': {reason}")]
    InvalidTaskType { task_type: String, reason: String },

    #[error("task type '{task_type}' routes to service '{service}', which discovery does not watch")]
    UnwatchedService { task_type: String, service: String },

    #[error("{0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BatonConfig {
    /// Prefix of every coordination path.
    #[serde(default = "default_root_path")]
    pub root_path: String,
    /// Value published while holding the election path.
    #[serde(default = "default_identity")]
    pub identity: String,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub task_types: Vec<TaskTypeConfig>,
    #[serde(default)]
    pub compensator: CompensatorConfig,
}

fn default_root_path() -> String {
    "/baton".to_string()
}

fn default_identity() -> String {
    "baton-node".to_string()
}

impl Default for BatonConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
            identity: default_identity(),
            discovery: DiscoveryConfig::default(),
            task_types: Vec::new(),
            compensator: CompensatorConfig::default(),
        }
    }
}

impl BatonConfig {
    /// Fail-fast checks done before anything is spawned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.root_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "root_path must be absolute, got '{}'",
                self.root_path
            )));
        }
        if self.compensator.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "compensator.interval_secs must be positive".to_string(),
            ));
        }
        if self.compensator.scan_limit == 0 {
            return Err(ConfigError::Invalid(
                "compensator.scan_limit must be positive".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for task_type in &self.task_types {
            if !seen.insert(task_type.name.as_str()) {
                return Err(ConfigError::DuplicateTaskType(task_type.name.clone()));
            }
            task_type.validate()?;
            if !self.discovery.services.contains(&task_type.route.service) {
                return Err(ConfigError::UnwatchedService {
                    task_type: task_type.name.clone(),
                    service: task_type.route.service.clone(),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Service types to watch.
    #[serde(default)]
    pub services: Vec<String>,
    /// Delay before re-watching a service path that does not exist yet.
    #[serde(default = "default_no_node_backoff_ms")]
    pub no_node_backoff_ms: u64,
    /// Delay before re-watching after a connection or session error.
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    /// Delay between failed campaigns.
    #[serde(default = "default_election_retry_ms")]
    pub election_retry_ms: u64,
}

fn default_no_node_backoff_ms() -> u64 {
    1_000
}

fn default_error_backoff_ms() -> u64 {
    10_000
}

fn default_election_retry_ms() -> u64 {
    3_000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            no_node_backoff_ms: default_no_node_backoff_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            election_retry_ms: default_election_retry_ms(),
        }
    }
}

impl DiscoveryConfig {
    pub fn no_node_backoff(&self) -> Duration {
        Duration::from_millis(self.no_node_backoff_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn election_retry(&self) -> Duration {
        Duration::from_millis(self.election_retry_ms)
    }
}

// ---------------------------------------------------------------------------
// Task types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TaskTypeConfig {
    pub name: String,
    pub route: Route,
    /// Retries after the first attempt of a sub-task call.
    #[serde(default = "default_retry")]
    pub retry: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Attempts for each task-store write made while executing a task.
    #[serde(default = "default_db_retry")]
    pub db_retry: u32,
    #[serde(default)]
    pub poll: PollConfig,
}

fn default_retry() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    1_000
}

fn default_lock_ttl_secs() -> u64 {
    600
}

fn default_batch_size() -> usize {
    20
}

fn default_db_retry() -> u32 {
    3
}

impl TaskTypeConfig {
    pub fn new(name: impl Into<String>, route: Route) -> Self {
        Self {
            name: name.into(),
            route,
            retry: default_retry(),
            retry_interval_ms: default_retry_interval_ms(),
            lock_ttl_secs: default_lock_ttl_secs(),
            batch_size: default_batch_size(),
            db_retry: default_db_retry(),
            poll: PollConfig::default(),
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidTaskType {
            task_type: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.route.service.trim().is_empty() {
            return Err(invalid("route.service must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be positive"));
        }
        if self.lock_ttl_secs == 0 {
            return Err(invalid("lock_ttl_secs must be positive"));
        }
        if self.db_retry == 0 {
            return Err(invalid("db_retry must be at least 1"));
        }
        if let Err(reason) = self.poll.policy().validate() {
            return Err(invalid(reason.as_str()));
        }
        Ok(())
    }
}

/// One poll delay. `multiplier` 1.0 (the default) keeps it fixed.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BackoffConfig {
    pub base_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub max_ms: Option<u64>,
}

fn default_multiplier() -> f64 {
    1.0
}

impl BackoffConfig {
    fn fixed_ms(base_ms: u64) -> Self {
        Self {
            base_ms,
            multiplier: 1.0,
            max_ms: None,
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.base_ms),
            multiplier: self.multiplier,
            max: self.max_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_not_leader")]
    pub not_leader: BackoffConfig,
    #[serde(default = "default_idle")]
    pub idle: BackoffConfig,
    #[serde(default = "default_fetch_error")]
    pub fetch_error: BackoffConfig,
}

fn default_not_leader() -> BackoffConfig {
    BackoffConfig::fixed_ms(60_000)
}

fn default_idle() -> BackoffConfig {
    BackoffConfig::fixed_ms(5_000)
}

fn default_fetch_error() -> BackoffConfig {
    BackoffConfig::fixed_ms(10_000)
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            not_leader: default_not_leader(),
            idle: default_idle(),
            fetch_error: default_fetch_error(),
        }
    }
}

impl PollConfig {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy {
            not_leader: self.not_leader.policy(),
            idle: self.idle.policy(),
            fetch_error: self.fetch_error.policy(),
        }
    }
}

// ---------------------------------------------------------------------------
// Compensator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CompensatorConfig {
    #[serde(default = "default_compensate_interval_secs")]
    pub interval_secs: u64,
    /// Executing tasks untouched for longer than this are considered orphaned.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,
}

fn default_compensate_interval_secs() -> u64 {
    600
}

fn default_stale_after_secs() -> u64 {
    1_200
}

fn default_scan_limit() -> usize {
    200
}

impl Default for CompensatorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_compensate_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            scan_limit: default_scan_limit(),
        }
    }
}

impl CompensatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        i64::try_from(self.stale_after_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}
