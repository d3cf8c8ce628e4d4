use std::fmt;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use qdo_common::partition::PartitionName;

use crate::error::ConfigError;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(from = "HOSTNAME", default = "localhost")]
    pub hostname: String,

    /// Optional suffix appended to the worker identity.
    pub worker_name: Option<String>,

    /// Base of the idle backoff, in seconds.
    #[envconfig(default = "5")]
    pub wait_interval: EnvSecsDuration,

    #[envconfig(default = "manual")]
    pub partition_policy: PartitionPolicy,

    #[envconfig(default = "")]
    pub partition_ids: PartitionIds,

    #[envconfig(default = "log")]
    pub job: String,

    #[envconfig(default = "log")]
    pub job_failure: FailurePolicy,

    #[envconfig(nested = true)]
    pub queuey: QueueyConfig,

    #[envconfig(nested = true)]
    pub coordination: CoordinationConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn identity(&self) -> WorkerIdentity {
        WorkerIdentity::new(
            &self.hostname,
            std::process::id(),
            self.worker_name.as_deref(),
        )
    }

    /// Check the options that depend on each other. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wait_interval.0.is_zero() {
            return Err(ConfigError::ZeroWaitInterval);
        }
        if self.partition_policy == PartitionPolicy::Manual && self.partition_ids.0.is_empty() {
            return Err(ConfigError::MissingPartitionIds);
        }
        Ok(())
    }
}

#[derive(Envconfig, Clone)]
pub struct QueueyConfig {
    #[envconfig(default = "http://127.0.0.1:5000")]
    pub queuey_url: String,

    #[envconfig(default = "queuey")]
    pub queuey_application: String,

    #[envconfig(default = "")]
    pub queuey_app_key: String,

    #[envconfig(default = "5000")]
    pub queuey_timeout: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct CoordinationConfig {
    #[envconfig(default = "http://127.0.0.1:2379")]
    pub etcd_hosts: String,

    #[envconfig(default = "/qdo/worker/")]
    pub etcd_prefix: String,

    #[envconfig(default = "10")]
    pub etcd_lease_ttl: i64,

    /// How long membership must stay unchanged before partitions are split,
    /// and how long the worker blocks waiting for an assignment.
    #[envconfig(default = "10")]
    pub party_wait: EnvSecsDuration,
}

impl CoordinationConfig {
    pub fn endpoints(&self) -> Vec<String> {
        self.etcd_hosts
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

/// Name this worker goes by: `<hostname>-<pid>[-<suffix>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity(String);

impl WorkerIdentity {
    pub fn new(hostname: &str, pid: u32, suffix: Option<&str>) -> Self {
        match suffix.filter(|s| !s.is_empty()) {
            Some(suffix) => Self(format!("{hostname}-{pid}-{suffix}")),
            None => Self(format!("{hostname}-{pid}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which partitions a worker consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPolicy {
    /// The configured `PARTITION_IDS`.
    Manual,
    /// Every partition the queue service reports at startup.
    All,
    /// A share of every partition, negotiated with the other workers.
    Dynamic,
}

impl FromStr for PartitionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "manual" => Ok(PartitionPolicy::Manual),
            "all" => Ok(PartitionPolicy::All),
            "dynamic" | "automatic" => Ok(PartitionPolicy::Dynamic),
            invalid => Err(ConfigError::ParsePolicyError(invalid.to_owned())),
        }
    }
}

/// What happens to a message whose job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Log,
    Archive,
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "log" => Ok(FailurePolicy::Log),
            "archive" => Ok(FailurePolicy::Archive),
            invalid => Err(ConfigError::ParseFailurePolicyError(invalid.to_owned())),
        }
    }
}

/// Comma separated list of partition names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionIds(pub Vec<PartitionName>);

impl FromStr for PartitionIds {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ids = s
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(PartitionName::from_str)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PartitionIds(ids))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvSecsDuration(pub time::Duration);

impl FromStr for EnvSecsDuration {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs = s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(|secs| time::Duration::try_from_secs_f64(secs).ok())
            .ok_or_else(|| ConfigError::ParseSecondsError(s.to_owned()))?;

        Ok(EnvSecsDuration(secs))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
