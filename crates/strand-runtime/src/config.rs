//! Runtime configuration
//!
//! Options come from code (`Default` plus `with_*` builders) or from the
//! environment via [`RuntimeOptions::from_env`].

use crate::error::ConfigError;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Worker count; 0 means one worker per CPU
pub const DEFAULT_WORKERS: usize = 0;

/// How often idle workers re-check parked tasks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Prefix for worker thread names
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "strand-worker";

/// Environment variable overriding the worker count
pub const WORKERS_ENV: &str = "STRAND_WORKERS";

/// Environment variable overriding the poll interval, in milliseconds
pub const POLL_INTERVAL_ENV: &str = "STRAND_POLL_INTERVAL_MS";

/// Scheduler options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Number of worker threads (0 = number of CPUs)
    pub workers: usize,

    /// Upper bound on how long a parked task waits for its condition to be
    /// re-checked when nobody calls `notify()`
    pub poll_interval: Duration,

    /// Worker threads are named `<prefix>-<n>`
    pub thread_name_prefix: String,

    /// Keep terminal tasks until `take_finished` collects them. When off,
    /// finished tasks are dropped as soon as they are counted.
    pub retain_finished: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            retain_finished: true,
        }
    }
}

impl RuntimeOptions {
    /// Defaults overridden by `STRAND_WORKERS` and `STRAND_POLL_INTERVAL_MS`.
    ///
    /// Values that do not parse are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`RuntimeOptions::from_env`], reading variables through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::default();

        if let Some(raw) = lookup(WORKERS_ENV) {
            match parse_var::<usize>(WORKERS_ENV, &raw) {
                Ok(workers) => options.workers = workers,
                Err(err) => warn!(error = %err, "ignoring worker count"),
            }
        }
        if let Some(raw) = lookup(POLL_INTERVAL_ENV) {
            match parse_var::<u64>(POLL_INTERVAL_ENV, &raw) {
                Ok(0) => warn!(var = POLL_INTERVAL_ENV, "ignoring zero poll interval"),
                Ok(ms) => options.poll_interval = Duration::from_millis(ms),
                Err(err) => warn!(error = %err, "ignoring poll interval"),
            }
        }
        options
    }

    /// Set the worker count (0 = number of CPUs)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the worker thread name prefix
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Keep or drop terminal tasks
    pub fn with_retain_finished(mut self, retain: bool) -> Self {
        self.retain_finished = retain;
        self
    }

    /// Worker count with 0 resolved to the number of CPUs
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}

fn parse_var<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            var,
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: FxHashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let options = RuntimeOptions::default();
        assert_eq!(options.workers, 0);
        assert_eq!(options.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(options.worker_count(), num_cpus::get());
        assert_eq!(options.thread_name_prefix, "strand-worker");
        assert!(options.retain_finished);
    }

    #[test]
    fn test_builders() {
        let options = RuntimeOptions::default()
            .with_workers(3)
            .with_poll_interval(Duration::from_millis(2))
            .with_thread_name_prefix("io")
            .with_retain_finished(false);
        assert_eq!(options.worker_count(), 3);
        assert!(!options.retain_finished);
        assert_eq!(options.poll_interval, Duration::from_millis(2));
        assert_eq!(options.thread_name_prefix, "io");
    }

    #[test]
    fn test_from_lookup() {
        let options = RuntimeOptions::from_lookup(lookup_from(&[
            (WORKERS_ENV, " 4 "),
            (POLL_INTERVAL_ENV, "25"),
        ]));
        assert_eq!(options.workers, 4);
        assert_eq!(options.poll_interval, Duration::from_millis(25));
    }

    #[test]
    fn test_invalid_values_ignored() {
        let options = RuntimeOptions::from_lookup(lookup_from(&[
            (WORKERS_ENV, "many"),
            (POLL_INTERVAL_ENV, "0"),
        ]));
        assert_eq!(options, RuntimeOptions::default());
    }

    #[test]
    fn test_parse_error_message() {
        let err = parse_var::<usize>(WORKERS_ENV, "-1").unwrap_err();
        assert!(err.to_string().starts_with("Invalid value '-1' for STRAND_WORKERS"));
    }
}
