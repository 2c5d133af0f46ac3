//! Configuration for the Cybernode agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use cybernode_id::NodeId;
use tracing::warn;

/// Shortest lease a node will ask an orchestrator for.
pub const MIN_LEASE_DURATION: Duration = Duration::from_secs(10);

/// Shortest period for capacity sampling and health probes.
pub const MIN_JOB_INTERVAL: Duration = Duration::from_secs(1);

/// Cybernode configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Address other hosts use to reach services on this node.
    pub host_address: String,

    /// Address the instantiation API listens on.
    pub listen_addr: SocketAddr,

    /// Base URLs of statically configured provision managers.
    pub provision_managers: Vec<String>,

    /// Maximum number of service instances this node runs at once.
    pub service_limit: usize,

    /// Lease duration requested from provision managers.
    pub provisioner_lease_duration: Duration,

    /// Total registration attempts per provision manager.
    pub provisioner_retry_count: u32,

    /// Delay between registration attempts.
    pub provisioner_retry_delay: Duration,

    /// Directory for durable service statements; transient when unset.
    pub record_dir: Option<PathBuf>,

    /// Statement retention in days. Zero keeps statements forever.
    pub record_age_days: u64,

    /// Terminate local services once every provision manager connection
    /// has been lost.
    pub service_termination_on_unregister: bool,

    /// Register with provision managers at startup.
    pub provision_enabled: bool,

    /// Interval between capacity samples.
    pub capacity_interval: Duration,

    /// Memory utilization (0.0 - 1.0) above which the node reports a breach.
    pub memory_high_threshold: f64,

    /// Interval between service health probes.
    pub health_check_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(),
            host_address: "127.0.0.1".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9810)),
            provision_managers: Vec::new(),
            service_limit: 500,
            provisioner_lease_duration: Duration::from_secs(30 * 60),
            provisioner_retry_count: 3,
            provisioner_retry_delay: Duration::from_secs(1),
            record_dir: None,
            record_age_days: 30,
            service_termination_on_unregister: true,
            provision_enabled: true,
            capacity_interval: Duration::from_secs(60),
            memory_high_threshold: 0.95,
            health_check_interval: Duration::from_secs(10),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `CYBERNODE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let node_id = match std::env::var("CYBERNODE_NODE_ID") {
            Ok(raw) => raw.parse::<NodeId>().context("CYBERNODE_NODE_ID")?,
            Err(_) => defaults.node_id,
        };

        let provision_managers = std::env::var("CYBERNODE_PROVISION_MANAGERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let record_dir = std::env::var("CYBERNODE_RECORD_DIR")
            .ok()
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);

        let config = Self {
            node_id,
            host_address: std::env::var("CYBERNODE_HOST_ADDRESS")
                .unwrap_or(defaults.host_address),
            listen_addr: env_or("CYBERNODE_LISTEN_ADDR", defaults.listen_addr)?,
            provision_managers,
            service_limit: env_or("CYBERNODE_SERVICE_LIMIT", defaults.service_limit)?,
            provisioner_lease_duration: Duration::from_secs(env_or(
                "CYBERNODE_PROVISIONER_LEASE_DURATION_SECS",
                defaults.provisioner_lease_duration.as_secs(),
            )?),
            provisioner_retry_count: env_or(
                "CYBERNODE_PROVISIONER_RETRY_COUNT",
                defaults.provisioner_retry_count,
            )?,
            provisioner_retry_delay: Duration::from_millis(env_or(
                "CYBERNODE_PROVISIONER_RETRY_DELAY_MS",
                defaults.provisioner_retry_delay.as_millis() as u64,
            )?),
            record_dir,
            record_age_days: env_or("CYBERNODE_RECORD_AGE_DAYS", defaults.record_age_days)?,
            service_termination_on_unregister: env_flag(
                "CYBERNODE_SERVICE_TERMINATION_ON_UNREGISTER",
                defaults.service_termination_on_unregister,
            ),
            provision_enabled: env_flag(
                "CYBERNODE_PROVISION_ENABLED",
                defaults.provision_enabled,
            ),
            capacity_interval: Duration::from_secs(env_or(
                "CYBERNODE_CAPACITY_INTERVAL_SECS",
                defaults.capacity_interval.as_secs(),
            )?),
            memory_high_threshold: env_or(
                "CYBERNODE_MEMORY_HIGH_THRESHOLD",
                defaults.memory_high_threshold,
            )?,
            health_check_interval: Duration::from_secs(env_or(
                "CYBERNODE_HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval.as_secs(),
            )?),
            log_level: std::env::var("CYBERNODE_LOG_LEVEL").unwrap_or(defaults.log_level),
        };

        Ok(config.normalized())
    }

    /// Clamp values that have hard lower bounds.
    pub fn normalized(mut self) -> Self {
        if self.provisioner_lease_duration < MIN_LEASE_DURATION {
            warn!(
                requested_secs = self.provisioner_lease_duration.as_secs(),
                min_secs = MIN_LEASE_DURATION.as_secs(),
                "Provisioner lease duration below minimum, clamping"
            );
            self.provisioner_lease_duration = MIN_LEASE_DURATION;
        }
        self.capacity_interval = at_least_min_interval("capacity", self.capacity_interval);
        self.health_check_interval =
            at_least_min_interval("health_check", self.health_check_interval);
        self.provisioner_retry_count = self.provisioner_retry_count.max(1);
        self.memory_high_threshold = self.memory_high_threshold.clamp(0.0, 1.0);
        self
    }

    /// Statement retention window, `None` when statements never expire.
    pub fn record_retention(&self) -> Option<Duration> {
        (self.record_age_days > 0)
            .then(|| Duration::from_secs(self.record_age_days.saturating_mul(24 * 3600)))
    }
}

fn at_least_min_interval(job: &str, interval: Duration) -> Duration {
    if interval < MIN_JOB_INTERVAL {
        warn!(
            job,
            requested_ms = interval.as_millis() as u64,
            min_secs = MIN_JOB_INTERVAL.as_secs(),
            "Job interval below minimum, clamping"
        );
        return MIN_JOB_INTERVAL;
    }
    interval
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}
