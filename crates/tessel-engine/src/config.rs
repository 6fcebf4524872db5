//! Server configuration, validation, and error types.
//!
//! [`ServerConfig`] is the input for constructing a
//! [`ServerProcess`](crate::server::ServerProcess).
//! [`validate()`](ServerConfig::validate) checks invariants at startup;
//! [`from_env()`](ServerConfig::from_env) applies the process-level
//! overrides for tick rate and dispatcher thread count.

use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Environment variable overriding [`ServerConfig::tick_rate_hz`].
pub const ENV_TICKS_PER_SECOND: &str = "TESSEL_TICKS_PER_SECOND";

/// Environment variable overriding [`ServerConfig::worker_threads`].
pub const ENV_DISPATCHER_THREADS: &str = "TESSEL_DISPATCHER_THREADS";

/// Highest accepted tick rate.
pub const MAX_TICK_RATE_HZ: u32 = 1000;

// ── ConfigError ────────────────────────────────────────────────────

/// Errors detected while building or validating a [`ServerConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// `tick_rate_hz` is zero or above [`MAX_TICK_RATE_HZ`].
    InvalidTickRate {
        /// The invalid value.
        value: u32,
    },
    /// `worker_threads` was explicitly set to zero.
    ZeroWorkers,
    /// An environment override could not be parsed.
    InvalidEnv {
        /// The variable name.
        key: String,
        /// Its raw value.
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTickRate { value } => {
                write!(
                    f,
                    "tick_rate_hz must be in 1..={MAX_TICK_RATE_HZ}, got {value}"
                )
            }
            Self::ZeroWorkers => write!(f, "worker_threads must be at least 1"),
            Self::InvalidEnv { key, value } => {
                write!(f, "environment variable {key} has invalid value {value:?}")
            }
        }
    }
}

impl Error for ConfigError {}

// ── ServerConfig ───────────────────────────────────────────────────

/// Tick rate, pool size and shutdown behaviour of a server process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Ticks per second. Default: 20.
    pub tick_rate_hz: u32,
    /// Dispatcher worker threads. `None` = auto-detect
    /// (`available_parallelism`, clamped to `[1, 16]`).
    pub worker_threads: Option<usize>,
    /// Ticks the loop may run back-to-back to catch up after an
    /// overrun. Default: 0, i.e. late ticks are skipped, not replayed.
    pub max_tick_catch_up: u32,
    /// How long `stop()` waits for the tick thread. Default: 1000.
    pub stop_timeout_ms: u64,
    /// Capture a final snapshot during `stop()`. Default: false.
    pub snapshot_on_stop: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 20,
            worker_threads: None,
            max_tick_catch_up: 0,
            stop_timeout_ms: 1000,
            snapshot_on_stop: false,
        }
    }
}

impl ServerConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults with overrides read through `lookup`.
    ///
    /// Same rules as [`from_env`](Self::from_env) without touching the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_TICKS_PER_SECOND) {
            config.tick_rate_hz = parse_env(ENV_TICKS_PER_SECOND, &raw)?;
        }
        if let Some(raw) = lookup(ENV_DISPATCHER_THREADS) {
            config.worker_threads = Some(parse_env(ENV_DISPATCHER_THREADS, &raw)?);
        }
        config.validate()?;
        Ok(config)
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate_hz == 0 || self.tick_rate_hz > MAX_TICK_RATE_HZ {
            return Err(ConfigError::InvalidTickRate {
                value: self.tick_rate_hz,
            });
        }
        if self.worker_threads == Some(0) {
            return Err(ConfigError::ZeroWorkers);
        }
        Ok(())
    }

    /// Resolve the worker count, applying auto-detection if `None`.
    ///
    /// Explicit values are clamped to `[1, 64]`.
    pub fn resolved_worker_threads(&self) -> usize {
        match self.worker_threads {
            Some(n) => n.clamp(1, 64),
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .clamp(1, 16),
        }
    }

    /// Length of one tick.
    pub fn tick_period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.tick_rate_hz.max(1)))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_owned(),
        value: raw.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_validate() {
        let c = ServerConfig::default();
        c.validate().unwrap();
        assert_eq!(c.tick_period(), Duration::from_millis(50));
        assert!(c.resolved_worker_threads() >= 1);
    }

    #[test]
    fn env_overrides_apply() {
        let c = ServerConfig::from_lookup(lookup(&[
            (ENV_TICKS_PER_SECOND, "40"),
            (ENV_DISPATCHER_THREADS, " 3 "),
        ]))
        .unwrap();
        assert_eq!(c.tick_rate_hz, 40);
        assert_eq!(c.worker_threads, Some(3));
        assert_eq!(c.resolved_worker_threads(), 3);
    }

    #[test]
    fn malformed_env_is_rejected() {
        let err = ServerConfig::from_lookup(lookup(&[(ENV_DISPATCHER_THREADS, "many")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidEnv {
                key: ENV_DISPATCHER_THREADS.into(),
                value: "many".into()
            }
        );
    }

    #[test]
    fn invalid_values_fail_validation() {
        let zero_rate = ServerConfig {
            tick_rate_hz: 0,
            ..ServerConfig::default()
        };
        assert_eq!(
            zero_rate.validate(),
            Err(ConfigError::InvalidTickRate { value: 0 })
        );
        let zero_workers = ServerConfig {
            worker_threads: Some(0),
            ..ServerConfig::default()
        };
        assert_eq!(zero_workers.validate(), Err(ConfigError::ZeroWorkers));
        assert!(ServerConfig::from_lookup(lookup(&[(ENV_DISPATCHER_THREADS, "0")])).is_err());
    }

    #[test]
    fn explicit_threads_are_clamped() {
        let c = ServerConfig {
            worker_threads: Some(500),
            ..ServerConfig::default()
        };
        assert_eq!(c.resolved_worker_threads(), 64);
    }
}
