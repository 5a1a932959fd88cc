//! Runtime-configurable settings for the synchronizer.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `SHARDSYNC_`) or by constructing a custom `SyncConfig`.

use std::time::Duration;

/// Signal raised by profilers that interrupts communicator initialization.
#[cfg(unix)]
pub const DEFAULT_MASK_SIGNAL: Option<i32> = Some(libc::SIGPROF);
#[cfg(not(unix))]
pub const DEFAULT_MASK_SIGNAL: Option<i32> = None;

/// Settings shared by the channel, the executor and the TCP messaging layer.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Allow per-device work to fan out across the worker pool. When false,
    /// every per-device step runs sequentially on the caller's thread.
    pub parallel: bool,

    /// Signal blocked on the calling thread and process while communicators
    /// are being initialized. `None` disables masking.
    pub mask_signal: Option<i32>,

    /// How long a non-zero process rank keeps retrying its connection to
    /// process rank 0 during TCP bootstrap.
    pub connect_timeout: Duration,

    /// Prefix for worker-pool thread names. The host backend names its stream
    /// threads after it when built with `HostBackend::from_config`.
    pub thread_name_prefix: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            mask_signal: DEFAULT_MASK_SIGNAL,
            connect_timeout: Duration::from_secs(60),
            thread_name_prefix: "shardsync".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `SHARDSYNC_PARALLEL` (`0`/`false` forces sequential dispatch)
    /// - `SHARDSYNC_MASK_SIGNAL` (signal number, `0`/`off` disables)
    /// - `SHARDSYNC_CONNECT_TIMEOUT_SECS`
    /// - `SHARDSYNC_THREAD_PREFIX`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("SHARDSYNC_PARALLEL") {
            if let Some(b) = parse_bool(&v) {
                cfg.parallel = b;
            }
        }
        if let Ok(v) = std::env::var("SHARDSYNC_MASK_SIGNAL") {
            cfg.mask_signal = parse_signal(&v, cfg.mask_signal);
        }
        if let Ok(v) = std::env::var("SHARDSYNC_CONNECT_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.connect_timeout = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("SHARDSYNC_THREAD_PREFIX") {
            if !v.is_empty() {
                cfg.thread_name_prefix = v;
            }
        }

        cfg
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_mask_signal(mut self, signal: Option<i32>) -> Self {
        self.mask_signal = signal;
        self
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_signal(v: &str, fallback: Option<i32>) -> Option<i32> {
    match v.trim() {
        "0" | "off" | "none" => None,
        s => s.parse::<i32>().ok().filter(|&n| n > 0).or(fallback),
    }
}
