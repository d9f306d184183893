use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;

/// Invalid driver settings.
#[derive(Clone, Debug, Error)]
#[error("invalid driver settings: {0}")]
pub struct SettingsError(pub String);

/// Where reads are routed in a replicated store.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReadPreference {
    /// Always read from the primary.
    #[default]
    Primary,
    /// Prefer the primary, fall back to secondaries.
    PrimaryPreferred,
    /// Always read from a secondary.
    Secondary,
    /// Prefer secondaries, fall back to the primary.
    SecondaryPreferred,
    /// Read from the lowest-latency member.
    Nearest,
}

/// How much acknowledgement a write waits for.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WriteSafety {
    /// Fire and forget.
    Ignore,
    /// Acknowledged by the node written to.
    #[default]
    Normal,
    /// Acknowledged by all replicas, optionally after a journal commit.
    WaitForAll {
        /// Also wait for the journal commit.
        journal: bool,
    },
}

/// Connection-level settings consumed opaquely by drivers.
///
/// The core never retries or pools; these settings tell the driver how to.
#[derive(Clone, Debug)]
pub struct DriverSettings {
    /// Retries on transient network errors before a failure surfaces.
    pub retry_count: u32,
    /// Pause between retries.
    pub retry_pause: Duration,
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
    /// Timeout for a single socket operation.
    pub socket_timeout: Duration,
    /// Interval between server liveness checks.
    pub heartbeat_frequency: Duration,
    /// Minimum pooled connections.
    pub min_pool_size: u32,
    /// Maximum pooled connections.
    pub max_pool_size: u32,
    /// Read routing.
    pub read_preference: ReadPreference,
    /// Write acknowledgement level.
    pub write_safety: WriteSafety,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            retry_count: 2,
            retry_pause: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(10),
            socket_timeout: Duration::from_secs(30),
            heartbeat_frequency: Duration::from_secs(1),
            min_pool_size: 1,
            max_pool_size: 100,
            read_preference: ReadPreference::default(),
            write_safety: WriteSafety::default(),
        }
    }
}

impl DriverSettings {
    /// Validates the settings.
    ///
    /// # Errors
    /// Returns an error when retries are disabled entirely, the retry
    /// pause is shorter than 100ms, or the pool bounds are inverted.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.retry_count < 1 {
            return Err(SettingsError("retry_count must be at least 1".into()));
        }
        if self.retry_pause < Duration::from_millis(100) {
            return Err(SettingsError("retry_pause must be at least 100ms".into()));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(SettingsError(
                "min_pool_size must not exceed max_pool_size".into(),
            ));
        }
        Ok(())
    }
}

/// Shared cluster configuration.
///
/// One instance is shared by reference between the messaging engine and
/// the cluster monitor. The host seed is only ever mutated through the
/// monitor's reconciliation; everything else reads it.
#[derive(Debug)]
pub struct ClusterConfig {
    host_seed: RwLock<Vec<String>>,
    replicaset_monitoring: AtomicBool,
}

impl ClusterConfig {
    /// Creates a config with the given initial host seed.
    #[must_use]
    pub fn new(host_seed: Vec<String>) -> Self {
        Self {
            host_seed: RwLock::new(host_seed),
            replicaset_monitoring: AtomicBool::new(true),
        }
    }

    /// The current host seed list.
    #[must_use]
    pub fn host_seed(&self) -> Vec<String> {
        self.host_seed.read().map(|hosts| hosts.clone()).unwrap_or_default()
    }

    /// Replaces the host seed list.
    pub fn set_host_seed(&self, hosts: Vec<String>) {
        if let Ok(mut seed) = self.host_seed.write() {
            *seed = hosts;
        }
    }

    /// Whether replica-set monitoring is currently enabled.
    #[must_use]
    pub fn monitoring_enabled(&self) -> bool {
        self.replicaset_monitoring.load(Ordering::SeqCst)
    }

    /// Permanently disables replica-set monitoring.
    ///
    /// One-way: there is no re-enable, matching the monitor's terminal
    /// escalation.
    pub fn disable_monitoring(&self) {
        self.replicaset_monitoring.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(DriverSettings::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_disabled_retries() {
        let settings = DriverSettings {
            retry_count: 0,
            ..DriverSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_short_retry_pause() {
        let settings = DriverSettings {
            retry_pause: Duration::from_millis(50),
            ..DriverSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_pool_bounds() {
        let settings = DriverSettings {
            min_pool_size: 10,
            max_pool_size: 5,
            ..DriverSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
