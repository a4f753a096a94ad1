//! Scheduler and worker pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable prefix read by [`SchedulerConfig::from_env`].
pub const ENV_PREFIX: &str = "MODEL_MUTEX_";

/// Scheduler configuration.
///
/// The worker pool keeps `core_worker_count` threads alive and grows up to
/// `max_worker_count` while jobs are waiting and no worker is idle. Workers
/// beyond the core size exit after `keep_alive_secs` without work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Threads kept alive even when idle.
    pub core_worker_count: usize,
    /// Upper bound on worker threads.
    pub max_worker_count: usize,
    /// Idle time after which a surplus worker exits, in seconds.
    pub keep_alive_secs: u64,
    /// Jobs that may wait for a worker before submissions are rejected.
    pub max_queue_depth: usize,
    /// Stack size of each worker thread, in bytes.
    pub thread_stack_size: usize,
    /// Worker thread name prefix.
    pub thread_name_prefix: String,
}

const DEFAULT_MAX_WORKERS: usize = 512;

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            core_worker_count: num_cpus::get().clamp(4, DEFAULT_MAX_WORKERS),
            max_worker_count: DEFAULT_MAX_WORKERS,
            keep_alive_secs: 60,
            max_queue_depth: 10_000,
            thread_stack_size: 2 * 1024 * 1024,
            thread_name_prefix: "model-worker".into(),
        }
    }
}

impl SchedulerConfig {
    /// Configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of core worker threads.
    #[must_use]
    pub const fn with_core_worker_count(mut self, count: usize) -> Self {
        self.core_worker_count = count;
        self
    }

    /// Set the maximum number of worker threads.
    #[must_use]
    pub const fn with_max_worker_count(mut self, count: usize) -> Self {
        self.max_worker_count = count;
        self
    }

    /// Set the idle keep-alive of surplus workers, rounded up to whole
    /// seconds.
    #[must_use]
    pub const fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        let secs = keep_alive.as_secs();
        self.keep_alive_secs = if keep_alive.subsec_nanos() > 0 {
            secs.saturating_add(1)
        } else {
            secs
        };
        self
    }

    /// Set the worker queue depth.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Keep-alive as a [`Duration`].
    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.core_worker_count == 0 {
            return Err("core_worker_count must be greater than 0".into());
        }
        if self.max_worker_count < self.core_worker_count {
            return Err(format!(
                "max_worker_count ({}) must be at least core_worker_count ({})",
                self.max_worker_count, self.core_worker_count
            ));
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.keep_alive_secs == 0 {
            return Err("keep_alive_secs must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        if self.thread_name_prefix.trim().is_empty() {
            return Err("thread_name_prefix must not be empty".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate. Missing fields
    /// take their defaults.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from `MODEL_MUTEX_*` environment variables, after
    /// loading a `.env` file if one is present.
    ///
    /// Recognized variables: `MODEL_MUTEX_CORE_WORKERS`,
    /// `MODEL_MUTEX_MAX_WORKERS`, `MODEL_MUTEX_KEEP_ALIVE_SECS`,
    /// `MODEL_MUTEX_MAX_QUEUE_DEPTH`, `MODEL_MUTEX_THREAD_STACK_SIZE`,
    /// `MODEL_MUTEX_THREAD_NAME_PREFIX`.
    ///
    /// # Errors
    ///
    /// Returns a message naming the malformed variable or the failed check.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup, over defaults.
    ///
    /// # Errors
    ///
    /// Returns a message naming the malformed variable or the failed check.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            target: &mut T,
        ) -> Result<(), String> {
            let name = format!("{ENV_PREFIX}{key}");
            if let Some(raw) = lookup(&name) {
                *target = raw
                    .trim()
                    .parse()
                    .map_err(|_| format!("{name}: cannot parse `{raw}`"))?;
            }
            Ok(())
        }

        let mut cfg = Self::default();
        parse(&lookup, "CORE_WORKERS", &mut cfg.core_worker_count)?;
        parse(&lookup, "MAX_WORKERS", &mut cfg.max_worker_count)?;
        parse(&lookup, "KEEP_ALIVE_SECS", &mut cfg.keep_alive_secs)?;
        parse(&lookup, "MAX_QUEUE_DEPTH", &mut cfg.max_queue_depth)?;
        parse(&lookup, "THREAD_STACK_SIZE", &mut cfg.thread_stack_size)?;
        if let Some(prefix) = lookup(&format!("{ENV_PREFIX}THREAD_NAME_PREFIX")) {
            cfg.thread_name_prefix = prefix;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}
