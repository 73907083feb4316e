//! Runtime configuration read from the process environment.

use std::{env, error::Error, fmt, path::PathBuf, time::Duration};

use comms::DEFAULT_MAX_MESSAGE_BYTES;

use crate::device::AcquirePolicy;

pub const SOCKET_VAR: &str = "NPU_BROKER_SOCKET";
pub const SOCKET_MODE_VAR: &str = "NPU_BROKER_SOCKET_MODE";
pub const SOCKET_GROUP_VAR: &str = "NPU_BROKER_SOCKET_GROUP";
pub const MAX_MESSAGE_VAR: &str = "NPU_BROKER_MAX_MESSAGE_BYTES";
pub const DEVICE_VAR: &str = "NPU_BROKER_DEVICE";
pub const ACQUIRE_VAR: &str = "NPU_BROKER_DEVICE_ACQUIRE";
pub const MAX_QUEUE_WAIT_VAR: &str = "NPU_BROKER_MAX_QUEUE_WAIT_MS";

pub const DEFAULT_SOCKET: &str = "/run/npu-broker/broker.sock";
pub const DEFAULT_SOCKET_MODE: u32 = 0o660;
pub const DEFAULT_DEVICE: &str = "/dev/npu0";

/// Snapshot of configuration values consumed by the daemon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
    pub socket_path: PathBuf,
    pub socket_mode: u32,
    /// Group name or numeric gid owning the socket file.
    pub socket_group: Option<String>,
    pub max_message_bytes: usize,
    pub device_path: PathBuf,
    pub acquire: AcquirePolicy,
    /// Unset means a queued request waits for as long as it takes.
    pub max_queue_wait: Option<Duration>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET),
            socket_mode: DEFAULT_SOCKET_MODE,
            socket_group: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            device_path: PathBuf::from(DEFAULT_DEVICE),
            acquire: AcquirePolicy::Eager,
            max_queue_wait: None,
        }
    }
}

impl BrokerConfig {
    /// Create a configuration snapshot from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create a configuration snapshot reading each variable through `lookup`.
    ///
    /// Empty values count as unset.
    ///
    /// # Errors
    /// Returns `ConfigError` naming the first variable holding an invalid value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut cfg = Self::default();

        if let Some(path) = get(SOCKET_VAR) {
            cfg.socket_path = PathBuf::from(path);
        }

        if let Some(mode) = get(SOCKET_MODE_VAR) {
            cfg.socket_mode = parse_mode(&mode).ok_or_else(|| {
                ConfigError::new(SOCKET_MODE_VAR, &mode, "expected an octal file mode")
            })?;
        }

        cfg.socket_group = get(SOCKET_GROUP_VAR);

        if let Some(max) = get(MAX_MESSAGE_VAR) {
            cfg.max_message_bytes = match max.trim().parse::<usize>() {
                Ok(n) if n > 0 && n <= u32::MAX as usize => n,
                _ => {
                    return Err(ConfigError::new(
                        MAX_MESSAGE_VAR,
                        &max,
                        "expected a byte count between 1 and 4294967295",
                    ));
                }
            };
        }

        if let Some(path) = get(DEVICE_VAR) {
            cfg.device_path = PathBuf::from(path);
        }

        if let Some(policy) = get(ACQUIRE_VAR) {
            cfg.acquire = match policy.trim().to_ascii_lowercase().as_str() {
                "eager" => AcquirePolicy::Eager,
                "lazy" => AcquirePolicy::Lazy,
                _ => return Err(ConfigError::new(ACQUIRE_VAR, &policy, "expected eager or lazy")),
            };
        }

        if let Some(wait) = get(MAX_QUEUE_WAIT_VAR) {
            let ms = wait.trim().parse::<u64>().map_err(|_| {
                ConfigError::new(MAX_QUEUE_WAIT_VAR, &wait, "expected milliseconds")
            })?;
            cfg.max_queue_wait = Some(Duration::from_millis(ms));
        }

        Ok(cfg)
    }
}

fn parse_mode(value: &str) -> Option<u32> {
    let digits = value.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);

    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
}

/// An environment variable holding a value the daemon cannot use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: &'static str,
}

impl ConfigError {
    fn new(var: &'static str, value: &str, reason: &'static str) -> Self {
        Self {
            var,
            value: value.to_string(),
            reason,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}={:?}: {}", self.var, self.value, self.reason)
    }
}

impl Error for ConfigError {}
