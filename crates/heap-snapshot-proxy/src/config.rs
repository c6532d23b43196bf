use std::{env, path::PathBuf, time::Duration};

use thiserror::Error;

pub const DEFAULT_LONG_RUNNING_CHECK_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid HEAP_SNAPSHOT_PROXY_POLL_INTERVAL_MS: {0}")]
    InvalidPollIntervalMs(String),
    #[error("invalid HEAP_SNAPSHOT_PROXY_WATCH_LONG_RUNNING: {0}")]
    InvalidWatchLongRunning(String),
    #[error("HEAP_SNAPSHOT_WORKER_BIN is not set")]
    MissingWorkerBin,
}

/// Client-side proxy settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Polling period of the long-running-call monitor.
    pub long_running_check_interval: Duration,
    /// Arm the monitor on the first call instead of waiting for an explicit start.
    pub watch_long_running_calls: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            long_running_check_interval: DEFAULT_LONG_RUNNING_CHECK_INTERVAL,
            watch_long_running_calls: false,
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        parse_proxy_config_from_env(|key| env::var(key).ok())
    }
}

/// How to launch an out-of-process worker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerProcessConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl WorkerProcessConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        parse_worker_process_config_from_env(|key| env::var(key).ok())
    }
}

pub fn parse_proxy_config_from_env<F>(lookup: F) -> Result<ProxyConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = ProxyConfig::default();

    let long_running_check_interval = match non_empty(lookup("HEAP_SNAPSHOT_PROXY_POLL_INTERVAL_MS"))
    {
        Some(value) => {
            let millis = value
                .parse::<u64>()
                .map_err(|error| ConfigError::InvalidPollIntervalMs(error.to_string()))?;
            if millis == 0 {
                return Err(ConfigError::InvalidPollIntervalMs(
                    "must be greater than zero".to_string(),
                ));
            }
            Duration::from_millis(millis)
        }
        None => defaults.long_running_check_interval,
    };

    let watch_long_running_calls =
        match non_empty(lookup("HEAP_SNAPSHOT_PROXY_WATCH_LONG_RUNNING")) {
            Some(value) => parse_bool(&value).ok_or(ConfigError::InvalidWatchLongRunning(value))?,
            None => defaults.watch_long_running_calls,
        };

    Ok(ProxyConfig {
        long_running_check_interval,
        watch_long_running_calls,
    })
}

pub fn parse_worker_process_config_from_env<F>(
    lookup: F,
) -> Result<WorkerProcessConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let program = non_empty(lookup("HEAP_SNAPSHOT_WORKER_BIN"))
        .map(PathBuf::from)
        .ok_or(ConfigError::MissingWorkerBin)?;
    let args = non_empty(lookup("HEAP_SNAPSHOT_WORKER_ARGS"))
        .map(|value| value.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    Ok(WorkerProcessConfig {
        program,
        args,
        cwd: None,
        env: Vec::new(),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn proxy_config_defaults_when_env_is_empty() {
        let config = parse_proxy_config_from_env(|_| None).expect("defaults parse");
        assert_eq!(config, ProxyConfig::default());
        assert_eq!(config.long_running_check_interval, Duration::from_millis(300));
    }

    #[test]
    fn proxy_config_applies_env_overrides() {
        let values = HashMap::from([
            ("HEAP_SNAPSHOT_PROXY_POLL_INTERVAL_MS", "50"),
            ("HEAP_SNAPSHOT_PROXY_WATCH_LONG_RUNNING", "yes"),
        ]);
        let config = parse_proxy_config_from_env(|key| values.get(key).map(ToString::to_string))
            .expect("config parse");
        assert_eq!(config.long_running_check_interval, Duration::from_millis(50));
        assert!(config.watch_long_running_calls);
    }

    #[test]
    fn proxy_config_rejects_invalid_env_values() {
        let values = HashMap::from([("HEAP_SNAPSHOT_PROXY_POLL_INTERVAL_MS", "0")]);
        let error = parse_proxy_config_from_env(|key| values.get(key).map(ToString::to_string))
            .expect_err("zero interval should fail");
        assert!(matches!(error, ConfigError::InvalidPollIntervalMs(_)));

        let values = HashMap::from([("HEAP_SNAPSHOT_PROXY_WATCH_LONG_RUNNING", "maybe")]);
        let error = parse_proxy_config_from_env(|key| values.get(key).map(ToString::to_string))
            .expect_err("bad flag should fail");
        assert_eq!(
            error,
            ConfigError::InvalidWatchLongRunning("maybe".to_string())
        );
    }

    #[test]
    fn worker_process_config_requires_program_and_splits_args() {
        let error = parse_worker_process_config_from_env(|_| None)
            .expect_err("missing program should fail");
        assert_eq!(error, ConfigError::MissingWorkerBin);

        let values = HashMap::from([
            ("HEAP_SNAPSHOT_WORKER_BIN", "/opt/worker/bin/snapshot-worker"),
            ("HEAP_SNAPSHOT_WORKER_ARGS", "--stdio  --quiet"),
        ]);
        let config =
            parse_worker_process_config_from_env(|key| values.get(key).map(ToString::to_string))
                .expect("worker config parse");
        assert_eq!(
            config.program,
            PathBuf::from("/opt/worker/bin/snapshot-worker")
        );
        assert_eq!(config.args, vec!["--stdio".to_string(), "--quiet".to_string()]);
    }
}
