//! Configuration for the bus client, persisters and write-back caches.
//!
//! Every struct deserializes with serde and falls back to the same defaults
//! as its [`Default`] impl, so a partial file or env-derived map is enough.
//!
//! # Example
//!
//! ```
//! use event_persister::PersisterConfig;
//! use std::time::Duration;
//!
//! // Minimal config (uses defaults)
//! let config = PersisterConfig::default();
//! assert_eq!(config.flush_size, 100);
//! assert_eq!(config.flush_interval(), Duration::from_secs(60));
//!
//! // Tuned for a chatty topic
//! let config = PersisterConfig {
//!     max_mps: 5_000,
//!     num_workers: 4,
//!     flush_size: 500,
//!     flush_interval_ms: 2_000,
//!     ..Default::default()
//! };
//! assert_eq!(config.puller_config().max_outstanding_messages, 1000);
//! ```

use serde::Deserialize;
use std::time::Duration;

/// Environment variable whose presence marks a local pub/sub emulator.
pub const EMULATOR_HOST_ENV: &str = "PUBSUB_EMULATOR_HOST";

/// Bus client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Project / namespace the topics live in
    #[serde(default = "default_project")]
    pub project: String,

    /// Talking to an emulator: topics are created eagerly since nothing is pre-provisioned
    #[serde(default)]
    pub emulator: bool,

    /// Provisioning attempts before giving up (startup is fatal after this)
    #[serde(default = "default_provision_max_attempts")]
    pub provision_max_attempts: usize,
    #[serde(default = "default_provision_initial_backoff_ms")]
    pub provision_initial_backoff_ms: u64,
    #[serde(default = "default_provision_max_backoff_ms")]
    pub provision_max_backoff_ms: u64,

    /// Overall deadline for one provisioning call, across all attempts
    #[serde(default = "default_provision_timeout_ms")]
    pub provision_timeout_ms: u64,

    /// Ack deadline given to newly created subscriptions
    #[serde(default = "default_ack_deadline_ms")]
    pub ack_deadline_ms: u64,
}

fn default_project() -> String { "local".to_string() }
fn default_provision_max_attempts() -> usize { 5 }
fn default_provision_initial_backoff_ms() -> u64 { 500 }
fn default_provision_max_backoff_ms() -> u64 { 10_000 }
fn default_provision_timeout_ms() -> u64 { 60_000 }
fn default_ack_deadline_ms() -> u64 { 10_000 }

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            project: default_project(),
            emulator: false,
            provision_max_attempts: default_provision_max_attempts(),
            provision_initial_backoff_ms: default_provision_initial_backoff_ms(),
            provision_max_backoff_ms: default_provision_max_backoff_ms(),
            provision_timeout_ms: default_provision_timeout_ms(),
            ack_deadline_ms: default_ack_deadline_ms(),
        }
    }
}

impl BusConfig {
    /// Defaults, with `emulator` set when [`EMULATOR_HOST_ENV`] is present.
    ///
    /// Read once at process wiring time; the client never consults the environment itself.
    #[must_use]
    pub fn from_env(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            emulator: std::env::var_os(EMULATOR_HOST_ENV).is_some(),
            ..Default::default()
        }
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_millis(self.provision_timeout_ms)
    }

    pub fn ack_deadline(&self) -> Duration {
        Duration::from_millis(self.ack_deadline_ms)
    }
}

/// Flow control for a [`Puller`](crate::bus::Puller).
#[derive(Debug, Clone, Deserialize)]
pub struct PullerConfig {
    /// Concurrent receive loops against the bus
    #[serde(default = "default_num_goroutines")]
    pub num_goroutines: usize,
    /// Messages pulled but not yet acked/nacked
    #[serde(default = "default_max_outstanding_messages")]
    pub max_outstanding_messages: usize,
    /// Payload bytes pulled but not yet acked/nacked
    #[serde(default = "default_max_outstanding_bytes")]
    pub max_outstanding_bytes: usize,
    /// How long a message's deadline keeps being extended before the bus may redeliver it
    #[serde(default = "default_max_extension_ms")]
    pub max_extension_ms: u64,
}

fn default_num_goroutines() -> usize { 1 }
fn default_max_outstanding_messages() -> usize { 1000 }
fn default_max_outstanding_bytes() -> usize { 1_000_000_000 }
fn default_max_extension_ms() -> u64 { 60 * 60 * 1000 }

impl Default for PullerConfig {
    fn default() -> Self {
        Self {
            num_goroutines: default_num_goroutines(),
            max_outstanding_messages: default_max_outstanding_messages(),
            max_outstanding_bytes: default_max_outstanding_bytes(),
            max_extension_ms: default_max_extension_ms(),
        }
    }
}

impl PullerConfig {
    pub fn max_extension(&self) -> Duration {
        Duration::from_millis(self.max_extension_ms)
    }
}

/// Settings for a [`Publisher`](crate::bus::Publisher).
#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    /// Concurrent in-flight publish calls
    #[serde(default = "default_publisher_goroutines")]
    pub num_goroutines: usize,
    /// Longest a single publish may block
    #[serde(default = "default_publish_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_publisher_goroutines() -> usize { 4 }
fn default_publish_timeout_ms() -> u64 { 60_000 }

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            num_goroutines: default_publisher_goroutines(),
            timeout_ms: default_publish_timeout_ms(),
        }
    }
}

impl PublisherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// What to do with a message that cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// Nack right away; the bus decides whether to redeliver or dead-letter
    #[default]
    Nack,
    /// Ack and drop, so a poison message cannot loop forever
    Ack,
}

/// Worker-pool settings shared by every concrete persister.
#[derive(Debug, Clone, Deserialize)]
pub struct PersisterConfig {
    /// Messages per second across the whole pool (0 = unlimited)
    #[serde(default = "default_max_mps")]
    pub max_mps: u32,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Batch flush settings
    #[serde(default = "default_flush_size")]
    pub flush_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    /// Puller flow control
    #[serde(default = "default_num_goroutines")]
    pub puller_num_goroutines: usize,
    #[serde(default = "default_max_outstanding_messages")]
    pub puller_max_outstanding_messages: usize,
    #[serde(default = "default_max_outstanding_bytes")]
    pub puller_max_outstanding_bytes: usize,
    #[serde(default = "default_max_extension_ms")]
    pub puller_max_extension_ms: u64,

    /// Health: consecutive failed flushes before `check()` reports unhealthy
    #[serde(default = "default_unhealthy_flush_failures")]
    pub unhealthy_flush_failures: u32,
    /// Health: worker panics tolerated before `check()` reports unhealthy
    #[serde(default = "default_max_worker_restarts")]
    pub max_worker_restarts: u32,

    /// Delay between starting successive workers
    #[serde(default)]
    pub worker_startup_interval_ms: u64,

    /// Ack messages without an `id` attribute instead of batching them
    #[serde(default)]
    pub require_id_attribute: bool,

    #[serde(default)]
    pub malformed_policy: MalformedPolicy,
}

fn default_max_mps() -> u32 { 1000 }
fn default_num_workers() -> usize { 1 }
fn default_flush_size() -> usize { 100 }
fn default_flush_interval_ms() -> u64 { 60_000 }
fn default_flush_timeout_ms() -> u64 { 30_000 }
fn default_unhealthy_flush_failures() -> u32 { 10 }
fn default_max_worker_restarts() -> u32 { 3 }

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            max_mps: default_max_mps(),
            num_workers: default_num_workers(),
            flush_size: default_flush_size(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_timeout_ms: default_flush_timeout_ms(),
            puller_num_goroutines: default_num_goroutines(),
            puller_max_outstanding_messages: default_max_outstanding_messages(),
            puller_max_outstanding_bytes: default_max_outstanding_bytes(),
            puller_max_extension_ms: default_max_extension_ms(),
            unhealthy_flush_failures: default_unhealthy_flush_failures(),
            max_worker_restarts: default_max_worker_restarts(),
            worker_startup_interval_ms: 0,
            require_id_attribute: false,
            malformed_policy: MalformedPolicy::default(),
        }
    }
}

impl PersisterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn worker_startup_interval(&self) -> Duration {
        Duration::from_millis(self.worker_startup_interval_ms)
    }

    /// Puller flow-control settings carried by this config.
    #[must_use]
    pub fn puller_config(&self) -> PullerConfig {
        PullerConfig {
            num_goroutines: self.puller_num_goroutines,
            max_outstanding_messages: self.puller_max_outstanding_messages,
            max_outstanding_bytes: self.puller_max_outstanding_bytes,
            max_extension_ms: self.puller_max_extension_ms,
        }
    }
}

/// Write-back cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WriteBackConfig {
    #[serde(default = "default_write_back_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_write_back_flush_interval_ms() -> u64 { 60_000 }

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_write_back_flush_interval_ms(),
        }
    }
}

impl WriteBackConfig {
    /// Never zero; a ticker cannot run with an empty period.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PersisterConfig =
            serde_json::from_str(r#"{"flush_size": 5, "malformed_policy": "ack"}"#).unwrap();
        assert_eq!(config.flush_size, 5);
        assert_eq!(config.max_mps, 1000);
        assert_eq!(config.flush_interval(), Duration::from_secs(60));
        assert_eq!(config.malformed_policy, MalformedPolicy::Ack);
    }

    #[test]
    fn test_puller_config_projection() {
        let config = PersisterConfig {
            puller_num_goroutines: 3,
            puller_max_outstanding_messages: 10,
            puller_max_outstanding_bytes: 4096,
            ..Default::default()
        };
        let puller = config.puller_config();
        assert_eq!(puller.num_goroutines, 3);
        assert_eq!(puller.max_outstanding_messages, 10);
        assert_eq!(puller.max_outstanding_bytes, 4096);
        assert_eq!(puller.max_extension(), Duration::from_secs(3600));
    }

    #[test]
    fn test_bus_config_defaults() {
        let config: BusConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.project, "local");
        assert!(!config.emulator);
        assert_eq!(config.provision_max_attempts, 5);
        assert_eq!(config.ack_deadline(), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_write_back_interval_is_clamped() {
        let config: WriteBackConfig = serde_json::from_str(r#"{"flush_interval_ms": 0}"#).unwrap();
        assert_eq!(config.flush_interval(), Duration::from_millis(1));
    }
}
