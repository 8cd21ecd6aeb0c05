//! Worker pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Maximum number of concurrent workers
    pub capacity: usize,

    /// Maximum number of queued jobs (None = unbounded)
    pub max_queue_len: Option<usize>,

    /// How long a submitter waits for its job before giving up (None = forever)
    #[serde(with = "option_duration_millis")]
    pub job_timeout: Option<Duration>,

    /// Interval between health checks run by the health monitor
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,

    /// Upper bound for a single worker health probe
    #[serde(with = "duration_millis")]
    pub health_probe_timeout: Duration,

    /// Start a replacement when a worker is found unhealthy
    pub replace_unhealthy: bool,

    /// Buffer size of the coordinator command channel
    pub command_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            max_queue_len: None,
            job_timeout: None,
            health_check_interval: Duration::from_secs(30),
            health_probe_timeout: Duration::from_secs(10),
            replace_unhealthy: true,
            command_buffer: 512,
        }
    }
}

impl PoolConfig {
    /// Create a new configuration with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `AWAP_POOL_CAPACITY`: Maximum number of workers (default: 4)
    /// - `AWAP_POOL_MAX_QUEUE`: Maximum queued jobs (default: unbounded)
    /// - `AWAP_JOB_TIMEOUT_SECS`: Per-job timeout (default: none)
    /// - `AWAP_HEALTH_INTERVAL_SECS`: Health check interval (default: 30)
    /// - `AWAP_HEALTH_PROBE_TIMEOUT_SECS`: Single probe timeout (default: 10)
    /// - `AWAP_REPLACE_UNHEALTHY`: Replace unhealthy workers ("false" to disable)
    pub fn from_env() -> Result<Self, PoolError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PoolError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            capacity: parse_var(&lookup, "AWAP_POOL_CAPACITY")?.unwrap_or(defaults.capacity),
            max_queue_len: parse_var(&lookup, "AWAP_POOL_MAX_QUEUE")?,
            job_timeout: parse_var(&lookup, "AWAP_JOB_TIMEOUT_SECS")?.map(Duration::from_secs),
            health_check_interval: parse_var(&lookup, "AWAP_HEALTH_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.health_check_interval),
            health_probe_timeout: parse_var(&lookup, "AWAP_HEALTH_PROBE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.health_probe_timeout),
            replace_unhealthy: lookup("AWAP_REPLACE_UNHEALTHY")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(defaults.replace_unhealthy),
            command_buffer: defaults.command_buffer,
        };

        config.validate()?;
        Ok(config)
    }

    /// Set the maximum queue length
    pub fn with_max_queue_len(mut self, max: usize) -> Self {
        self.max_queue_len = Some(max);
        self
    }

    /// Set the per-job timeout
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Set the health check interval
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the health probe timeout
    pub fn with_health_probe_timeout(mut self, timeout: Duration) -> Self {
        self.health_probe_timeout = timeout;
        self
    }

    /// Enable or disable replacement of unhealthy workers
    pub fn with_replace_unhealthy(mut self, replace: bool) -> Self {
        self.replace_unhealthy = replace;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "capacity must be at least 1".into(),
            ));
        }
        if self.max_queue_len == Some(0) {
            return Err(PoolError::InvalidConfig(
                "max_queue_len must be at least 1 when set".into(),
            ));
        }
        if self.command_buffer == 0 {
            return Err(PoolError::InvalidConfig(
                "command_buffer must be at least 1".into(),
            ));
        }
        if self.health_probe_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "health_probe_timeout must be non-zero".into(),
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "health_check_interval must be non-zero".into(),
            ));
        }
        if self.job_timeout.is_some_and(|t| t.is_zero()) {
            return Err(PoolError::InvalidConfig(
                "job_timeout must be non-zero when set".into(),
            ));
        }
        Ok(())
    }
}

/// Parse an optional variable from a key lookup
pub fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, PoolError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PoolError::InvalidConfig(format!("{key}: cannot parse {raw:?}"))),
    }
}

/// Serde support for Duration as milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
pub mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.capacity, 4);
        assert!(config.max_queue_len.is_none());
        assert!(config.job_timeout.is_none());
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert!(config.replace_unhealthy);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PoolConfig::new(8)
            .with_max_queue_len(100)
            .with_job_timeout(Duration::from_secs(120))
            .with_health_check_interval(Duration::from_secs(5))
            .with_replace_unhealthy(false);

        assert_eq!(config.capacity, 8);
        assert_eq!(config.max_queue_len, Some(100));
        assert_eq!(config.job_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.health_check_interval, Duration::from_secs(5));
        assert!(!config.replace_unhealthy);
    }

    #[test]
    fn test_config_validation() {
        assert!(PoolConfig::new(0).validate().is_err());
        assert!(PoolConfig::new(1).with_max_queue_len(0).validate().is_err());
        assert!(PoolConfig::new(1)
            .with_health_probe_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(PoolConfig::new(1)
            .with_health_check_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(PoolConfig::new(1)
            .with_job_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_from_lookup() {
        let config = PoolConfig::from_lookup(lookup_from(&[
            ("AWAP_POOL_CAPACITY", "3"),
            ("AWAP_POOL_MAX_QUEUE", "50"),
            ("AWAP_JOB_TIMEOUT_SECS", "90"),
            ("AWAP_REPLACE_UNHEALTHY", "FALSE"),
        ]))
        .unwrap();

        assert_eq!(config.capacity, 3);
        assert_eq!(config.max_queue_len, Some(50));
        assert_eq!(config.job_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert!(!config.replace_unhealthy);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = PoolConfig::from_lookup(lookup_from(&[("AWAP_POOL_CAPACITY", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("AWAP_POOL_CAPACITY"));

        let err =
            PoolConfig::from_lookup(lookup_from(&[("AWAP_POOL_CAPACITY", "0")])).unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));

        let err = PoolConfig::from_lookup(lookup_from(&[("AWAP_HEALTH_INTERVAL_SECS", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("health_check_interval"));

        let err = PoolConfig::from_lookup(lookup_from(&[("AWAP_JOB_TIMEOUT_SECS", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("job_timeout"));
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let config = PoolConfig::new(2).with_job_timeout(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["job_timeout"], 1500);
        assert_eq!(json["health_check_interval"], 30_000);

        let decoded: PoolConfig = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, config);
    }
}
