//! Pool configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::worker::WorkerCommand;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{0}")]
    Invalid(String),
}

/// How documents map to workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolMode {
    /// One worker per open document
    #[default]
    PerDocument,
    /// Long-lived workers, each hosting several documents
    Shared,
}

/// What an open does when the pool is saturated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Wait up to `acquire_timeout` for capacity
    #[default]
    Block,
    /// Fail immediately
    Reject,
}

/// Where a worker's engine runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    #[default]
    Thread,
    Process,
}

macro_rules! parse_words {
    ($ty:ty, $name:literal, { $($word:literal => $value:expr),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($word => Ok($value),)+
                    _ => Err(ConfigError::InvalidValue {
                        name: $name,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

parse_words!(PoolMode, "PDF_POOL_MODE", {
    "per-document" => PoolMode::PerDocument,
    "shared" => PoolMode::Shared,
});

parse_words!(AdmissionPolicy, "PDF_POOL_ADMISSION", {
    "block" => AdmissionPolicy::Block,
    "reject" => AdmissionPolicy::Reject,
});

parse_words!(Isolation, "PDF_POOL_ISOLATION", {
    "thread" => Isolation::Thread,
    "process" => Isolation::Process,
});

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub mode: PoolMode,
    /// Upper bound on live workers
    pub max_workers: usize,
    /// Shared mode only; `None` is unlimited
    pub max_documents_per_worker: Option<usize>,
    pub admission: AdmissionPolicy,
    #[serde(with = "millis")]
    pub acquire_timeout: Duration,
    /// Deadline for calls sent without one
    #[serde(with = "millis")]
    pub call_timeout: Duration,
    pub isolation: Isolation,
    /// Child command for process isolation; this executable when unset
    pub worker_command: Option<WorkerCommand>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            mode: PoolMode::PerDocument,
            max_workers: 4,
            max_documents_per_worker: None,
            admission: AdmissionPolicy::Block,
            acquire_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            isolation: Isolation::Thread,
            worker_command: None,
        }
    }
}

fn parse<T: FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { name, value })
}

impl PoolConfig {
    /// Read `PDF_POOL_*` variables over the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`PoolConfig::from_env`] with a custom variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup("PDF_POOL_MODE") {
            config.mode = value.parse()?;
        }
        if let Some(value) = lookup("PDF_POOL_MAX_WORKERS") {
            config.max_workers = parse("PDF_POOL_MAX_WORKERS", value)?;
        }
        if let Some(value) = lookup("PDF_POOL_MAX_DOCUMENTS_PER_WORKER") {
            config.max_documents_per_worker =
                Some(parse("PDF_POOL_MAX_DOCUMENTS_PER_WORKER", value)?);
        }
        if let Some(value) = lookup("PDF_POOL_ADMISSION") {
            config.admission = value.parse()?;
        }
        if let Some(value) = lookup("PDF_POOL_ACQUIRE_TIMEOUT_MS") {
            config.acquire_timeout =
                Duration::from_millis(parse("PDF_POOL_ACQUIRE_TIMEOUT_MS", value)?);
        }
        if let Some(value) = lookup("PDF_POOL_CALL_TIMEOUT_MS") {
            config.call_timeout = Duration::from_millis(parse("PDF_POOL_CALL_TIMEOUT_MS", value)?);
        }
        if let Some(value) = lookup("PDF_POOL_ISOLATION") {
            config.isolation = value.parse()?;
        }
        if let Some(value) = lookup("PDF_POOL_WORKER_COMMAND") {
            config.worker_command = Some(WorkerCommand::parse(&value).ok_or(
                ConfigError::InvalidValue {
                    name: "PDF_POOL_WORKER_COMMAND",
                    value,
                },
            )?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.max_documents_per_worker == Some(0) {
            return Err(ConfigError::Invalid(
                "max_documents_per_worker must be at least 1".into(),
            ));
        }
        if self.acquire_timeout.is_zero() && self.admission == AdmissionPolicy::Block {
            return Err(ConfigError::Invalid(
                "blocking admission needs a non-zero acquire timeout".into(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
