//! Daemon configuration.
//!
//! Validated at load time, with defaults that suit a supervised
//! production daemon. Durations are human-readable in TOML
//! (`loop_interval = "500ms"`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Daemon name (identifier charset).
    pub name: String,

    /// Cadence of the main loop. Zero means free-running with the
    /// idle-probability policy.
    #[serde(default, with = "humantime_serde")]
    pub loop_interval: Duration,

    /// Probability of dispatching `idle` after a tick when
    /// `loop_interval` is zero. Must lie in `[0, 1]`.
    #[serde(default = "default_idle_probability")]
    pub idle_probability: f64,

    /// Detach from the terminal at init (double fork + setsid).
    #[serde(default)]
    pub daemonize: bool,

    /// Restart the daemon after running this long. Only honored when
    /// daemonized; minimum 10 s.
    #[serde(default, with = "humantime_serde_opt")]
    pub auto_restart_interval: Option<Duration>,

    /// A fatal error only triggers a self-restart when the daemon has
    /// been up at least this long.
    #[serde(default = "default_min_restart_threshold", with = "humantime_serde")]
    pub min_restart_threshold: Duration,

    /// Treat `SIGINT` as a shutdown request (it is always counted).
    #[serde(default = "default_true")]
    pub shutdown_on_interrupt: bool,

    /// Dump statistics when `SIGUSR1` arrives.
    #[serde(default = "default_true")]
    pub dump_on_signal: bool,

    /// Target file of the write-through log channel.
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Echo log-channel writes to stderr as well.
    #[serde(default)]
    pub log_echo: bool,

    /// Minimum CPU yield after an over-run tick.
    #[serde(default = "default_loop_sleep_min", with = "humantime_serde")]
    pub loop_sleep_min: Duration,

    /// Record a debug message when a tick over-runs the interval.
    #[serde(default = "default_true")]
    pub log_overruns: bool,
}

fn default_idle_probability() -> f64 {
    0.5
}

fn default_min_restart_threshold() -> Duration {
    Duration::from_secs(120)
}

fn default_loop_sleep_min() -> Duration {
    Duration::from_micros(10)
}

fn default_true() -> bool {
    true
}

/// Floor for [`DaemonConfig::auto_restart_interval`].
pub const MIN_AUTO_RESTART_INTERVAL: Duration = Duration::from_secs(10);

impl DaemonConfig {
    /// Creates a configuration with defaults for everything but the name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            loop_interval: Duration::ZERO,
            idle_probability: default_idle_probability(),
            daemonize: false,
            auto_restart_interval: None,
            min_restart_threshold: default_min_restart_threshold(),
            shutdown_on_interrupt: true,
            dump_on_signal: true,
            log_path: None,
            log_echo: false,
            loop_sleep_min: default_loop_sleep_min(),
            log_overruns: true,
        }
    }

    /// Sets the loop interval.
    #[must_use]
    pub const fn with_loop_interval(mut self, interval: Duration) -> Self {
        self.loop_interval = interval;
        self
    }

    /// Sets the idle probability for free-running loops.
    #[must_use]
    pub const fn with_idle_probability(mut self, p: f64) -> Self {
        self.idle_probability = p;
        self
    }

    /// Enables daemonizing at init.
    #[must_use]
    pub const fn with_daemonize(mut self, on: bool) -> Self {
        self.daemonize = on;
        self
    }

    /// Sets the auto-restart interval.
    #[must_use]
    pub const fn with_auto_restart_interval(mut self, interval: Duration) -> Self {
        self.auto_restart_interval = Some(interval);
        self
    }

    /// Sets the log-channel target.
    #[must_use]
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns a configuration error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CoreError::config("name cannot be empty"));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CoreError::config(
                "name must contain only alphanumerics, hyphens, and underscores",
            ));
        }
        if !(0.0..=1.0).contains(&self.idle_probability) {
            return Err(CoreError::config(format!(
                "idle_probability {} outside [0, 1]",
                self.idle_probability
            )));
        }
        if let Some(interval) = self.auto_restart_interval {
            if interval < MIN_AUTO_RESTART_INTERVAL {
                return Err(CoreError::config(format!(
                    "auto_restart_interval must be at least {}s",
                    MIN_AUTO_RESTART_INTERVAL.as_secs()
                )));
            }
        }
        if self.loop_sleep_min.is_zero() {
            return Err(CoreError::config("loop_sleep_min must be nonzero"));
        }
        Ok(())
    }

    /// Loads and validates a TOML configuration file.
    ///
    /// # Errors
    /// Read, parse, or validation failures.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CoreError::config(format!("failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CoreError::config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

/// Serde helper for humantime durations.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde helper for optional humantime durations.
mod humantime_serde_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
