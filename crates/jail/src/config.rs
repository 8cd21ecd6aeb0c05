//! Jail process configuration

use std::time::Duration;

use awap_pool::config::{duration_millis, option_duration_millis, parse_var};
use awap_pool::PoolError;
use serde::{Deserialize, Serialize};

/// Image used when no jail command is configured
pub const DEFAULT_IMAGE: &str = "awap-ai-jail:latest";

/// How to launch one sandboxed worker process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JailConfig {
    /// Program to run
    pub command: String,

    /// Arguments passed to the program
    pub args: Vec<String>,

    /// Upper bound for a single job (None = no limit)
    #[serde(with = "option_duration_millis")]
    pub execute_timeout: Option<Duration>,

    /// How long an idle worker has to answer a ping
    #[serde(with = "duration_millis")]
    pub ping_timeout: Duration,

    /// How long a worker has to exit after a shutdown message before it is killed
    #[serde(with = "duration_millis")]
    pub shutdown_grace: Duration,
}

impl Default for JailConfig {
    fn default() -> Self {
        Self::podman(DEFAULT_IMAGE)
    }
}

impl JailConfig {
    /// Run an arbitrary program as the worker
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            execute_timeout: None,
            ping_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    /// Run `image` in a locked-down podman container
    ///
    /// No network, read-only root filesystem, no capabilities and a 4 GiB
    /// memory cap. The container talks to the pool over stdin/stdout only.
    pub fn podman(image: &str) -> Self {
        let args = [
            "run",
            "-i",
            "--rm",
            "--network=none",
            "--read-only",
            "--cap-drop=ALL",
            "--security-opt=no-new-privileges",
            "--memory=4g",
            image,
        ]
        .into_iter()
        .map(String::from)
        .collect();

        Self::new("podman", args)
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `AWAP_JAIL_COMMAND`: Program to run (default: podman)
    /// - `AWAP_JAIL_ARGS`: Whitespace-separated arguments (default: podman sandbox flags)
    /// - `AWAP_JAIL_IMAGE`: Image for the default podman command (default: awap-ai-jail:latest)
    /// - `AWAP_JAIL_EXECUTE_TIMEOUT_SECS`: Per-job limit inside the driver (default: none)
    pub fn from_env() -> Result<Self, PoolError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PoolError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let image = lookup("AWAP_JAIL_IMAGE").unwrap_or_else(|| DEFAULT_IMAGE.to_string());
        let args = lookup("AWAP_JAIL_ARGS")
            .map(|raw| raw.split_whitespace().map(String::from).collect::<Vec<_>>());

        let mut config = match lookup("AWAP_JAIL_COMMAND") {
            Some(command) => Self::new(command, args.unwrap_or_default()),
            None => {
                let mut config = Self::podman(&image);
                if let Some(args) = args {
                    config.args = args;
                }
                config
            }
        };
        config.execute_timeout =
            parse_var(&lookup, "AWAP_JAIL_EXECUTE_TIMEOUT_SECS")?.map(Duration::from_secs);

        config.validate()?;
        Ok(config)
    }

    /// Set the per-job limit
    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = Some(timeout);
        self
    }

    /// Set the ping timeout
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.command.trim().is_empty() {
            return Err(PoolError::InvalidConfig(
                "jail command must not be empty".into(),
            ));
        }
        if self.ping_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "ping_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
