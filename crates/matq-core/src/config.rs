//! Configuration system for matq.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MATQ_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/matq/config.toml
//!   3. ~/.config/matq/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::partition::DEFAULT_MAX_ELEMENTS;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatqConfig {
    pub queue: QueueConfig,
    pub workers: WorkerConfig,
    pub collector: CollectorConfig,
    pub retry: RetryConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Prepended to every queue name, e.g. "run7-" → "run7-queue0".
    pub name_prefix: String,
    /// How long a received message stays hidden before redelivery.
    pub visibility_timeout_ms: u64,
    /// Deliveries before a message is dead-lettered. 0 = never.
    pub max_receive_count: u32,
    /// Messages older than this are discarded. 0 = keep forever.
    pub retention_secs: u64,
    /// Purge slot queues before dispatching a new run.
    pub purge_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker slots (N). Each owns one input and one result queue.
    pub slots: usize,
    /// Bounded wait for a single receive on the input queue.
    pub poll_wait_ms: u64,
    /// Max task messages taken per receive.
    pub receive_batch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Overall wait budget per collect call. 0 = derive from result size.
    pub budget_secs: u64,
    /// Bounded wait for one receive on each result queue.
    pub poll_wait_ms: u64,
    /// Max completion messages taken per receive.
    pub receive_batch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// HTTP API port on 127.0.0.1.
    pub port: u16,
    /// Largest operand or result a submitted run may have, in cells.
    pub max_elements: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name_prefix: String::new(),
            visibility_timeout_ms: 30_000,
            max_receive_count: 5,
            retention_secs: 86_400,
            purge_on_start: true,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            slots: 4,
            poll_wait_ms: 1_000,
            receive_batch: 1,
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            budget_secs: 0,
            poll_wait_ms: 250,
            receive_batch: 10,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 9101,
            max_elements: DEFAULT_MAX_ELEMENTS,
        }
    }
}

// ── Duration accessors ────────────────────────────────────────────────────────

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn retention(&self) -> Option<Duration> {
        (self.retention_secs > 0).then(|| Duration::from_secs(self.retention_secs))
    }
}

impl WorkerConfig {
    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }
}

impl CollectorConfig {
    /// Explicit budget, if configured.
    pub fn budget(&self) -> Option<Duration> {
        (self.budget_secs > 0).then(|| Duration::from_secs(self.budget_secs))
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("matq")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MatqConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a config file, or return defaults if it does not exist.
    pub fn load_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(MatqConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MATQ_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MatqConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MATQ_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MATQ_QUEUE__NAME_PREFIX") {
            self.queue.name_prefix = v;
        }
        if let Some(p) = lookup("MATQ_QUEUE__VISIBILITY_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.queue.visibility_timeout_ms = p;
        }
        if let Some(p) = lookup("MATQ_QUEUE__MAX_RECEIVE_COUNT").and_then(|v| v.parse().ok()) {
            self.queue.max_receive_count = p;
        }
        if let Some(v) = lookup("MATQ_QUEUE__PURGE_ON_START") {
            self.queue.purge_on_start = v == "true" || v == "1";
        }
        if let Some(p) = lookup("MATQ_WORKERS__SLOTS").and_then(|v| v.parse().ok()) {
            self.workers.slots = p;
        }
        if let Some(p) = lookup("MATQ_WORKERS__POLL_WAIT_MS").and_then(|v| v.parse().ok()) {
            self.workers.poll_wait_ms = p;
        }
        if let Some(p) = lookup("MATQ_COLLECTOR__BUDGET_SECS").and_then(|v| v.parse().ok()) {
            self.collector.budget_secs = p;
        }
        if let Some(p) = lookup("MATQ_RETRY__MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.retry.max_attempts = p;
        }
        if let Some(p) = lookup("MATQ_API__PORT").and_then(|v| v.parse().ok()) {
            self.api.port = p;
        }
        if let Some(p) = lookup("MATQ_API__MAX_ELEMENTS").and_then(|v| v.parse().ok()) {
            self.api.max_elements = p;
        }
    }
}
