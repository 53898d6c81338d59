// Runtime configuration shared by the API and the worker.
// Every knob is an environment variable with a default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_LANGUAGES_CONFIG: &str = "config/languages.json";

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    /// Budget for compile + run of one job
    pub execution_timeout: Duration,
    /// Bound on artifact removal, independent of the execution budget
    pub cleanup_timeout: Duration,
    /// Bound on any single queue operation issued at submission time
    pub queue_timeout: Duration,
    /// How long job records are retained in Redis
    pub result_ttl: Duration,
    pub languages_config: PathBuf,
    /// Directory inside each environment where artifacts are written
    pub workdir: String,
    pub api_addr: String,
    pub worker_concurrency: usize,
    pub worker_health_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            execution_timeout: Duration::from_secs(30),
            cleanup_timeout: Duration::from_secs(5),
            queue_timeout: Duration::from_secs(60),
            result_ttl: Duration::from_secs(86400),
            languages_config: PathBuf::from(DEFAULT_LANGUAGES_CONFIG),
            workdir: "/tmp".to_string(),
            api_addr: "0.0.0.0:7000".to_string(),
            worker_concurrency: 4,
            worker_health_addr: "0.0.0.0:7001".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; `from_env` passes the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let secs = |name: &str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(name) {
                Some(raw) => {
                    let value: u64 = parse(name, &raw)?;
                    if value == 0 {
                        return Err(invalid(name, &raw, "must be greater than zero"));
                    }
                    Ok(Duration::from_secs(value))
                }
                None => Ok(default),
            }
        };

        let worker_concurrency = match lookup("WORKER_CONCURRENCY") {
            Some(raw) => {
                let value: usize = parse("WORKER_CONCURRENCY", &raw)?;
                if value == 0 {
                    return Err(invalid("WORKER_CONCURRENCY", &raw, "must be greater than zero"));
                }
                value
            }
            None => defaults.worker_concurrency,
        };

        // Recipe commands splice the workdir in unquoted
        let workdir = match lookup("SANDRUN_WORKDIR") {
            Some(raw) if !raw.starts_with('/') || raw.chars().any(char::is_whitespace) => {
                return Err(invalid("SANDRUN_WORKDIR", &raw, "must be an absolute path without whitespace"));
            }
            Some(raw) => raw,
            None => defaults.workdir,
        };

        Ok(Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            execution_timeout: secs("SANDRUN_EXECUTION_TIMEOUT_SECS", defaults.execution_timeout)?,
            cleanup_timeout: secs("SANDRUN_CLEANUP_TIMEOUT_SECS", defaults.cleanup_timeout)?,
            queue_timeout: secs("SANDRUN_QUEUE_TIMEOUT_SECS", defaults.queue_timeout)?,
            result_ttl: secs("SANDRUN_RESULT_TTL_SECS", defaults.result_ttl)?,
            languages_config: lookup("SANDRUN_LANGUAGES_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.languages_config),
            workdir,
            api_addr: lookup("SANDRUN_API_ADDR").unwrap_or(defaults.api_addr),
            worker_concurrency,
            worker_health_addr: lookup("WORKER_HEALTH_ADDR").unwrap_or(defaults.worker_health_addr),
        })
    }
}

fn parse<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| invalid(name, raw, &e.to_string()))
}

fn invalid(name: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.execution_timeout, Duration::from_secs(30));
        assert_eq!(config.cleanup_timeout, Duration::from_secs(5));
        assert_eq!(config.queue_timeout, Duration::from_secs(60));
        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(config.workdir, "/tmp");
        assert_eq!(config.worker_concurrency, 4);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("SANDRUN_EXECUTION_TIMEOUT_SECS", "10"),
            ("SANDRUN_CLEANUP_TIMEOUT_SECS", " 2 "),
            ("REDIS_URL", "redis://queue:6379/0"),
            ("WORKER_CONCURRENCY", "8"),
        ]))
        .unwrap();
        assert_eq!(config.execution_timeout, Duration::from_secs(10));
        assert_eq!(config.cleanup_timeout, Duration::from_secs(2));
        assert_eq!(config.redis_url, "redis://queue:6379/0");
        assert_eq!(config.worker_concurrency, 8);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = Config::from_lookup(lookup_from(&[("SANDRUN_EXECUTION_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("SANDRUN_EXECUTION_TIMEOUT_SECS"));

        assert!(Config::from_lookup(lookup_from(&[("SANDRUN_CLEANUP_TIMEOUT_SECS", "0")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("WORKER_CONCURRENCY", "0")])).is_err());
    }

    #[test]
    fn test_workdir_must_be_absolute_without_whitespace() {
        let config = Config::from_lookup(lookup_from(&[("SANDRUN_WORKDIR", "/var/sandrun")])).unwrap();
        assert_eq!(config.workdir, "/var/sandrun");

        assert!(Config::from_lookup(lookup_from(&[("SANDRUN_WORKDIR", "/work dir")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("SANDRUN_WORKDIR", "tmp")])).is_err());
    }
}
