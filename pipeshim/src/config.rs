//! Bridge configuration: FIFO paths and transport timings.

use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_REQUEST_PIPE: &str = "/tmp/pipeshim_request_pipe";
pub const DEFAULT_RESPONSE_PIPE: &str = "/tmp/pipeshim_response_pipe";

pub const REQUEST_PIPE_ENV: &str = "PIPESHIM_REQUEST_PIPE";
pub const RESPONSE_PIPE_ENV: &str = "PIPESHIM_RESPONSE_PIPE";
pub const REOPEN_BACKOFF_ENV: &str = "PIPESHIM_REOPEN_BACKOFF_MS";
pub const RESPONSE_TIMEOUT_ENV: &str = "PIPESHIM_RESPONSE_TIMEOUT_MS";

const REQUEST_PIPE_NAME: &str = "pipeshim_request_pipe";
const RESPONSE_PIPE_NAME: &str = "pipeshim_response_pipe";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a whole number of milliseconds")]
    InvalidDuration { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// FIFO the controller writes requests to.
    pub request_path: PathBuf,
    /// FIFO the bridge writes responses to.
    pub response_path: PathBuf,
    /// Pause before reopening the request FIFO after a read fault.
    pub reopen_backoff: Duration,
    /// How long to keep trying to open the response FIFO while no controller
    /// is reading it. The response is dropped afterwards.
    pub response_open_timeout: Duration,
    pub response_open_poll: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self {
            request_path: PathBuf::from(DEFAULT_REQUEST_PIPE),
            response_path: PathBuf::from(DEFAULT_RESPONSE_PIPE),
            reopen_backoff: Duration::from_millis(1000),
            response_open_timeout: Duration::from_secs(30),
            response_open_poll: Duration::from_millis(25),
        }
    }

    /// Default file names placed under `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::new()
            .with_request_path(dir.join(REQUEST_PIPE_NAME))
            .with_response_path(dir.join(RESPONSE_PIPE_NAME))
    }

    /// Defaults overridden by `PIPESHIM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::new();

        if let Some(path) = lookup(REQUEST_PIPE_ENV).filter(|p| !p.is_empty()) {
            config.request_path = PathBuf::from(path);
        }
        if let Some(path) = lookup(RESPONSE_PIPE_ENV).filter(|p| !p.is_empty()) {
            config.response_path = PathBuf::from(path);
        }
        if let Some(ms) = lookup(REOPEN_BACKOFF_ENV) {
            config.reopen_backoff = parse_millis(REOPEN_BACKOFF_ENV, &ms)?;
        }
        if let Some(ms) = lookup(RESPONSE_TIMEOUT_ENV) {
            config.response_open_timeout = parse_millis(RESPONSE_TIMEOUT_ENV, &ms)?;
        }

        Ok(config)
    }

    pub fn with_request_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.request_path = path.into();
        self
    }

    pub fn with_response_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.response_path = path.into();
        self
    }

    pub fn with_reopen_backoff(mut self, backoff: Duration) -> Self {
        self.reopen_backoff = backoff;
        self
    }

    pub fn with_response_open_timeout(mut self, timeout: Duration) -> Self {
        self.response_open_timeout = timeout;
        self
    }

    pub fn with_response_open_poll(mut self, poll: Duration) -> Self {
        self.response_open_poll = poll;
        self
    }
}

fn parse_millis(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::InvalidDuration {
            var,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var: &str| vars.get(var).cloned()
    }

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.request_path, PathBuf::from("/tmp/pipeshim_request_pipe"));
        assert_eq!(config.response_path, PathBuf::from("/tmp/pipeshim_response_pipe"));
        assert_eq!(config.reopen_backoff, Duration::from_secs(1));
        assert_eq!(config.response_open_timeout, Duration::from_secs(30));
    }

    #[test]
    fn in_dir_keeps_file_names() {
        let config = BridgeConfig::in_dir("/run/shim");
        assert_eq!(config.request_path, PathBuf::from("/run/shim/pipeshim_request_pipe"));
        assert_eq!(config.response_path, PathBuf::from("/run/shim/pipeshim_response_pipe"));
    }

    #[test]
    fn env_overrides() {
        let config = BridgeConfig::from_lookup(lookup(&[
            (REQUEST_PIPE_ENV, "/tmp/a"),
            (RESPONSE_PIPE_ENV, ""),
            (REOPEN_BACKOFF_ENV, "250"),
            (RESPONSE_TIMEOUT_ENV, " 5000 "),
        ]))
        .unwrap();

        assert_eq!(config.request_path, PathBuf::from("/tmp/a"));
        assert_eq!(config.response_path, PathBuf::from(DEFAULT_RESPONSE_PIPE));
        assert_eq!(config.reopen_backoff, Duration::from_millis(250));
        assert_eq!(config.response_open_timeout, Duration::from_secs(5));
    }

    #[test]
    fn bad_duration_is_an_error() {
        let err = BridgeConfig::from_lookup(lookup(&[(REOPEN_BACKOFF_ENV, "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidDuration {
                var: REOPEN_BACKOFF_ENV,
                value: "soon".to_string()
            }
        );
        assert_eq!(
            err.to_string(),
            "PIPESHIM_REOPEN_BACKOFF_MS=\"soon\" is not a whole number of milliseconds"
        );
    }
}
