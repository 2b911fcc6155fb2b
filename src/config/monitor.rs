//! `[monitor]` and `[network]` tables.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Port probed on a host other than the broker: DNS over TCP.
pub const DEFAULT_PROBE_PORT: u16 = 53;

/// How the state buffer is filled before the first published state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrefillMode {
    /// Take `buffer_size` real readings first.
    #[default]
    Samples,
    /// Start from a buffer full of OFF.
    Off,
}

/// What is published on the shared trigger topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPayload {
    /// The same JSON payload as the status topic.
    #[default]
    Event,
    /// Only the machine id, as plain text.
    MachineId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MonitorConfig {
    /// JSON calibration profile.
    #[validate(custom(function = "validate_non_empty_path"))]
    pub calibration_path: PathBuf,

    /// Append-only outage log.
    #[validate(custom(function = "validate_non_empty_path"))]
    pub queue_path: PathBuf,

    /// Where readings come from: `-` for stdin, otherwise a file or FIFO path.
    #[validate(length(min = 1, message = "sample_source must not be empty"))]
    pub sample_source: String,

    #[validate(range(
        min = 10,
        max = 10000,
        message = "sample_interval_ms must be between 10 and 10000"
    ))]
    pub sample_interval_ms: u64,

    /// A reading slower than this counts as a read failure.
    #[validate(range(
        min = 10,
        max = 60000,
        message = "read_timeout_ms must be between 10 and 60000"
    ))]
    pub read_timeout_ms: u64,

    /// How long a state change waits for the broker before it is queued.
    #[validate(range(
        max = 60000,
        message = "reconnect_grace_ms must not exceed 60000"
    ))]
    pub reconnect_grace_ms: u64,

    /// How long a replay waits for the broker to acknowledge the queued
    /// changes before the queue file is removed. On timeout the file is kept.
    #[validate(range(
        min = 100,
        max = 60000,
        message = "ack_timeout_ms must be between 100 and 60000"
    ))]
    pub ack_timeout_ms: u64,

    /// Per-device topic. `{machine_id}` is substituted.
    #[validate(length(min = 1, message = "status_topic must not be empty"))]
    pub status_topic: String,

    #[validate(length(min = 1, message = "trigger_topic must not be empty"))]
    pub trigger_topic: String,

    pub trigger_payload: TriggerPayload,

    /// Nest the payload under a `"message"` key.
    pub wrap_message: bool,

    pub prefill: PrefillMode,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            calibration_path: PathBuf::from("/etc/stacklight/calibrazione.json"),
            queue_path: PathBuf::from("/var/lib/stacklight/offline_queue.jsonl"),
            sample_source: "-".to_string(),
            sample_interval_ms: 100,
            read_timeout_ms: 1000,
            reconnect_grace_ms: 2000,
            ack_timeout_ms: 5000,
            status_topic: "bma/{machine_id}/semaforo/stato".to_string(),
            trigger_topic: "bma/cambiostato".to_string(),
            trigger_payload: TriggerPayload::default(),
            wrap_message: true,
            prefill: PrefillMode::default(),
        }
    }
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_grace_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Reachability probe settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NetworkConfig {
    pub enabled: bool,

    /// Probe target. Falls back to the calibration `probe_host`, then to the broker host.
    pub host: Option<String>,

    /// TCP port to probe. Defaults to the broker port when probing the broker
    /// host, and to [`DEFAULT_PROBE_PORT`] otherwise.
    pub port: Option<u16>,

    #[validate(range(
        min = 1,
        max = 3600,
        message = "interval_secs must be between 1 and 3600"
    ))]
    pub interval_secs: u64,

    #[validate(range(
        min = 100,
        max = 60000,
        message = "timeout_ms must be between 100 and 60000"
    ))]
    pub timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            enabled: true,
            host: None,
            port: None,
            interval_secs: 30,
            timeout_ms: 2000,
        }
    }
}

impl NetworkConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Host and port the probe connects to.
    ///
    /// The host is `host`, then `probe_host`, then the broker host. The broker
    /// port is only used when the probe targets the broker itself.
    pub fn probe_target(
        &self,
        probe_host: Option<&str>,
        broker_host: &str,
        broker_port: u16,
    ) -> (String, u16) {
        let host = self
            .host
            .as_deref()
            .filter(|h| !h.is_empty())
            .or(probe_host)
            .unwrap_or(broker_host);

        let port = match self.port {
            Some(port) => port,
            None if host == broker_host => broker_port,
            None => DEFAULT_PROBE_PORT,
        };
        (host.to_string(), port)
    }
}

fn validate_non_empty_path(path: &PathBuf) -> Result<(), ValidationError> {
    if path.as_os_str().is_empty() {
        let mut err = ValidationError::new("empty_path");
        err.message = Some("path must not be empty".into());
        return Err(err);
    }
    Ok(())
}
