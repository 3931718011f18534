//! Configuration management for the Axon runtime
//!
//! Settings come from defaults, an optional TOML file, and `AXON_*`
//! environment variables, in that order of precedence (lowest first).

use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::events::DEFAULT_EVENT_CAPACITY;
pub use crate::types::ConfigError;

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub tasks: TaskManagerConfig,
    pub scheduler: SchedulerConfig,
    pub plugins: PluginConfig,
    pub events: EventBusConfig,
    pub flow: FlowConfig,
    pub logging: LoggingConfig,
}

/// Task manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskManagerConfig {
    /// Maximum number of tasks running at once
    pub max_concurrency: usize,
    /// Timeout applied to tasks that do not set their own
    #[serde(with = "humantime_serde")]
    pub default_timeout: Option<Duration>,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            default_timeout: None,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the tick loop looks for due tasks
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// IANA timezone cron expressions are evaluated in
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            timezone: "UTC".to_string(),
        }
    }
}

/// What `init_all` does when a plugin fails to initialize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PluginInitPolicy {
    /// Mark the plugin failed and keep initializing the rest
    #[default]
    Isolate,
    /// Abort the batch on the first failure
    Strict,
}

impl FromStr for PluginInitPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "isolate" => Ok(Self::Isolate),
            "strict" => Ok(Self::Strict),
            other => Err(ConfigError::InvalidValue {
                key: "plugins.init_policy".to_string(),
                reason: format!("unknown policy '{other}', expected isolate or strict"),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub init_policy: PluginInitPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Broadcast buffer size per subscriber
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Defaults for logic points that enable retry without tuning it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub default_max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub default_retry_delay: Duration,
    /// Finished async nodes kept for `take_async_result`; the oldest are
    /// evicted beyond this
    pub async_result_retention: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            default_retry_delay: Duration::from_secs(1),
            async_result_retention: 256,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
    /// Colored output for pretty/compact formats
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            ansi: true,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(ConfigError::InvalidValue {
                key: "logging.format".to_string(),
                reason: format!("unknown format '{other}'"),
            }),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables and defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    /// File (when given), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `AXON_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = env_parse::<usize>("AXON_MAX_CONCURRENCY")? {
            self.tasks.max_concurrency = value;
        }
        if let Some(ms) = env_parse::<u64>("AXON_TASK_TIMEOUT_MS")? {
            self.tasks.default_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse::<u64>("AXON_TICK_INTERVAL_MS")? {
            self.scheduler.tick_interval = Duration::from_millis(ms);
        }
        if let Ok(tz) = env::var("AXON_TIMEZONE") {
            self.scheduler.timezone = tz;
        }
        if let Ok(policy) = env::var("AXON_PLUGIN_POLICY") {
            self.plugins.init_policy = policy.parse()?;
        }
        if let Some(capacity) = env_parse::<usize>("AXON_EVENT_CAPACITY")? {
            self.events.capacity = capacity;
        }
        if let Ok(level) = env::var("AXON_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("AXON_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tasks.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "tasks.max_concurrency".to_string(),
                reason: "must be > 0".to_string(),
            });
        }

        if self.scheduler.tick_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.tick_interval".to_string(),
                reason: "must be > 0".to_string(),
            });
        }

        if self.scheduler.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.timezone".to_string(),
                reason: format!("unknown timezone '{}'", self.scheduler.timezone),
            });
        }

        if self.flow.async_result_retention == 0 {
            return Err(ConfigError::InvalidValue {
                key: "flow.async_result_retention".to_string(),
                reason: "must be > 0".to_string(),
            });
        }

        if self.events.capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "events.capacity".to_string(),
                reason: "must be > 0".to_string(),
            });
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "logging.level".to_string(),
                reason: format!("Must be one of: {}", valid_levels.join(", ")),
            });
        }

        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("cannot parse '{raw}'"),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.tasks.max_concurrency, 10);
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(1));
        assert_eq!(config.plugins.init_policy, PluginInitPolicy::Isolate);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        env::set_var("AXON_MAX_CONCURRENCY", "3");
        env::set_var("AXON_TICK_INTERVAL_MS", "250");
        env::set_var("AXON_PLUGIN_POLICY", "strict");
        env::set_var("AXON_LOG_LEVEL", "debug");

        let config = RuntimeConfig::from_env().unwrap();
        assert_eq!(config.tasks.max_concurrency, 3);
        assert_eq!(config.scheduler.tick_interval, Duration::from_millis(250));
        assert_eq!(config.plugins.init_policy, PluginInitPolicy::Strict);
        assert_eq!(config.logging.level, "debug");

        env::remove_var("AXON_MAX_CONCURRENCY");
        env::remove_var("AXON_TICK_INTERVAL_MS");
        env::remove_var("AXON_PLUGIN_POLICY");
        env::remove_var("AXON_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_invalid_env_value() {
        env::set_var("AXON_MAX_CONCURRENCY", "lots");
        let result = RuntimeConfig::from_env();
        env::remove_var("AXON_MAX_CONCURRENCY");

        match result {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "AXON_MAX_CONCURRENCY"),
            other => panic!("expected invalid value, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[tasks]
max_concurrency = 4
default_timeout = "30s"

[scheduler]
tick_interval = "500ms"
timezone = "Europe/Berlin"

[plugins]
init_policy = "strict"

[logging]
level = "warn"
format = "json"
"#
        )
        .unwrap();

        let config = RuntimeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.tasks.max_concurrency, 4);
        assert_eq!(config.tasks.default_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.scheduler.tick_interval, Duration::from_millis(500));
        assert_eq!(config.scheduler.timezone, "Europe/Berlin");
        assert_eq!(config.plugins.init_policy, PluginInitPolicy::Strict);
        assert_eq!(config.logging.format, LogFormat::Json);
        // Untouched sections keep their defaults.
        assert_eq!(config.events.capacity, DEFAULT_EVENT_CAPACITY);
    }

    #[test]
    fn test_missing_file() {
        let result = RuntimeConfig::from_file("/definitely/not/here.toml");
        assert!(matches!(result, Err(ConfigError::IoError { .. })));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = RuntimeConfig::default();
        config.tasks.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.scheduler.timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.flow.async_result_retention = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("STRICT".parse::<PluginInitPolicy>().unwrap(), PluginInitPolicy::Strict);
        assert!("lenient".parse::<PluginInitPolicy>().is_err());
    }
}
