//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// A missing or malformed configuration value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("Invalid value '{value}' for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// How the occurrence counter guards concurrent updates of one name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterDiscipline {
    /// Conditional writes, handlers may overlap.
    Optimistic,
    /// Key-affinity dispatch, one writer per name.
    SingleWriter,
}

impl FromStr for CounterDiscipline {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "optimistic" => Ok(CounterDiscipline::Optimistic),
            "single-writer" | "single_writer" => Ok(CounterDiscipline::SingleWriter),
            other => Err(format!(
                "unknown discipline '{other}', expected 'optimistic' or 'single-writer'"
            )),
        }
    }
}

/// Server and pipeline configuration.
///
/// Reads from environment variables:
/// - `HOST` (default `0.0.0.0`) and `APP_PORT` (default `3006`)
/// - `RUST_LOG` tracing filter (default `info`)
/// - `CONSUMER_GROUP` consumer group id (required)
/// - `BUS_PARTITIONS`, `MANDATES_TOPIC`, `NAMES_TOPIC`
/// - `STORE_NAME`, `COUNTER_STORE_NAME`, `ID_PARAM`, `STORE_TIMEOUT_MS`
/// - `COUNTER_DISCIPLINE`, `CONSUMER_CONCURRENCY`, `FAIL_FAST`, `DEDUPE_WINDOW`
/// - `PUBLISH_INTERVAL_MS`, `PUBLISH_COUNT`, `GREETINGS_URL`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub consumer_group: String,
    pub bus_partitions: u32,
    pub mandates_topic: String,
    pub names_topic: String,
    pub store_name: String,
    pub counter_store_name: String,
    pub id_param: String,
    pub store_timeout: Duration,
    pub counter_discipline: CounterDiscipline,
    pub consumer_concurrency: usize,
    pub fail_fast: bool,
    pub dedupe_window: usize,
    pub publish_interval: Duration,
    pub publish_count: u64,
    pub greetings_url: Option<String>,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |name: &str, default: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let consumer_group = lookup("CONSUMER_GROUP")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("CONSUMER_GROUP"))?;

        let config = Self {
            host: text("HOST", &defaults.host),
            port: parse(&lookup, "APP_PORT", defaults.port)?,
            log_level: text("RUST_LOG", &defaults.log_level),
            consumer_group,
            bus_partitions: parse(&lookup, "BUS_PARTITIONS", defaults.bus_partitions)?,
            mandates_topic: text("MANDATES_TOPIC", &defaults.mandates_topic),
            names_topic: text("NAMES_TOPIC", &defaults.names_topic),
            store_name: text("STORE_NAME", &defaults.store_name),
            counter_store_name: text("COUNTER_STORE_NAME", &defaults.counter_store_name),
            id_param: text("ID_PARAM", &defaults.id_param),
            store_timeout: Duration::from_millis(parse(
                &lookup,
                "STORE_TIMEOUT_MS",
                defaults.store_timeout.as_millis() as u64,
            )?),
            counter_discipline: parse(&lookup, "COUNTER_DISCIPLINE", defaults.counter_discipline)?,
            consumer_concurrency: parse(
                &lookup,
                "CONSUMER_CONCURRENCY",
                defaults.consumer_concurrency,
            )?,
            fail_fast: parse(&lookup, "FAIL_FAST", defaults.fail_fast)?,
            dedupe_window: parse(&lookup, "DEDUPE_WINDOW", defaults.dedupe_window)?,
            publish_interval: Duration::from_millis(parse(
                &lookup,
                "PUBLISH_INTERVAL_MS",
                defaults.publish_interval.as_millis() as u64,
            )?),
            publish_count: parse(&lookup, "PUBLISH_COUNT", defaults.publish_count)?,
            greetings_url: lookup("GREETINGS_URL").filter(|v| !v.trim().is_empty()),
        };

        if let Err(error) = EnvFilter::try_new(&config.log_level) {
            return Err(ConfigError::Invalid {
                name: "RUST_LOG",
                value: config.log_level,
                reason: error.to_string(),
            });
        }
        if config.bus_partitions == 0 {
            return Err(ConfigError::Invalid {
                name: "BUS_PARTITIONS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if config.consumer_concurrency == 0 {
            return Err(ConfigError::Invalid {
                name: "CONSUMER_CONCURRENCY",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(config)
    }

    /// Tracing filter built from `RUST_LOG`.
    pub fn log_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name).filter(|v| !v.trim().is_empty()) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3006,
            log_level: "info".to_string(),
            consumer_group: String::new(),
            bus_partitions: 3,
            mandates_topic: "connection-mandates-topic".to_string(),
            names_topic: "names".to_string(),
            store_name: "statestore".to_string(),
            counter_store_name: "occurrences".to_string(),
            id_param: "connectionId".to_string(),
            store_timeout: Duration::from_millis(2000),
            counter_discipline: CounterDiscipline::Optimistic,
            consumer_concurrency: 4,
            fail_fast: false,
            dedupe_window: 1024,
            publish_interval: Duration::from_millis(700),
            publish_count: 0,
            greetings_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = load(&[("CONSUMER_GROUP", "iot-platform")]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3006);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.consumer_group, "iot-platform");
        assert_eq!(config.mandates_topic, "connection-mandates-topic");
        assert_eq!(config.id_param, "connectionId");
        assert_eq!(config.store_timeout, Duration::from_secs(2));
        assert_eq!(config.counter_discipline, CounterDiscipline::Optimistic);
        assert_eq!(config.publish_count, 0);
        assert_eq!(config.greetings_url, None);
    }

    #[test]
    fn test_consumer_group_is_required() {
        assert_eq!(load(&[]), Err(ConfigError::Missing("CONSUMER_GROUP")));
        assert_eq!(
            load(&[("CONSUMER_GROUP", "  ")]),
            Err(ConfigError::Missing("CONSUMER_GROUP"))
        );
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("CONSUMER_GROUP", "blueTeam"),
            ("APP_PORT", "8080"),
            ("COUNTER_DISCIPLINE", "single-writer"),
            ("FAIL_FAST", "true"),
            ("STORE_TIMEOUT_MS", "250"),
            ("GREETINGS_URL", "http://localhost/greetings.json"),
        ])
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.counter_discipline, CounterDiscipline::SingleWriter);
        assert!(config.fail_fast);
        assert_eq!(config.store_timeout, Duration::from_millis(250));
        assert_eq!(
            config.greetings_url.as_deref(),
            Some("http://localhost/greetings.json")
        );
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        let err = load(&[("CONSUMER_GROUP", "g"), ("APP_PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "APP_PORT", .. }));

        let err = load(&[("CONSUMER_GROUP", "g"), ("COUNTER_DISCIPLINE", "yolo")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "COUNTER_DISCIPLINE",
                ..
            }
        ));

        let err = load(&[("CONSUMER_GROUP", "g"), ("BUS_PARTITIONS", "0")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "BUS_PARTITIONS",
                ..
            }
        ));
    }

    #[test]
    fn test_log_level_must_be_a_valid_filter() {
        let config = load(&[("CONSUMER_GROUP", "g"), ("RUST_LOG", "api=debug,warn")]).unwrap();
        assert_eq!(config.log_level, "api=debug,warn");
        assert_eq!(config.log_filter().to_string(), EnvFilter::new("api=debug,warn").to_string());

        let err = load(&[("CONSUMER_GROUP", "g"), ("RUST_LOG", "api=loudest")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "RUST_LOG", .. }));
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }
}
