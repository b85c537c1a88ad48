//! Sink configuration
//!
//! Configuration is plain data: it is validated once, before the worker is
//! started, and then handed to the worker by value.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::SampleSpec;
use crate::constants::{
    DEFAULT_LATENCY_MSEC, SMOOTHER_WINDOW_SECS, UDP_TIMING_PACKET_DISCONNECT_CYCLE,
    UDP_TIMING_PACKET_LOSS_MAX_SECS,
};
use crate::error::ConfigError;
use crate::network::{ClientParams, Codec, Encryption, Transport};

/// Timing-packet watchdog settings (datagram transport only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Silence on the timing channel after which a reconnect is forced
    pub loss_max_secs: u64,
    /// Number of escalation steps within `loss_max_secs`
    pub disconnect_cycle: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            loss_max_secs: UDP_TIMING_PACKET_LOSS_MAX_SECS,
            disconnect_cycle: UDP_TIMING_PACKET_DISCONNECT_CYCLE,
        }
    }
}

impl TimingConfig {
    pub fn loss_max(&self) -> Duration {
        Duration::from_secs(self.loss_max_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Receiver address
    pub server: String,

    #[serde(default)]
    pub transport: Transport,

    #[serde(default)]
    pub encryption: Encryption,

    #[serde(default)]
    pub codec: Codec,

    /// Reconnect after failures instead of giving up. Also keeps consuming
    /// audio at the nominal rate while the receiver is unreachable.
    #[serde(default)]
    pub autoreconnect: bool,

    /// Fixed receiver-side latency in milliseconds
    #[serde(default = "default_latency_msec")]
    pub latency_msec: u32,

    #[serde(default)]
    pub password: Option<String>,

    /// Sink name, used verbatim
    #[serde(default)]
    pub sink_name: Option<String>,

    /// Short name, expanded to `raop_client.<name>`
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub sample_spec: SampleSpec,

    /// Delay subtracted from the write cursor before it reaches the latency estimator
    #[serde(default)]
    pub device_delay_usec: u64,

    #[serde(default)]
    pub timing: TimingConfig,

    /// Smoothing window of the latency estimator
    #[serde(default = "default_smoother_window_secs")]
    pub smoother_window_secs: u64,
}

fn default_latency_msec() -> u32 {
    DEFAULT_LATENCY_MSEC
}

fn default_smoother_window_secs() -> u64 {
    SMOOTHER_WINDOW_SECS
}

impl SinkConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            transport: Transport::default(),
            encryption: Encryption::default(),
            codec: Codec::default(),
            autoreconnect: false,
            latency_msec: DEFAULT_LATENCY_MSEC,
            password: None,
            sink_name: None,
            name: None,
            description: None,
            sample_spec: SampleSpec::default(),
            device_delay_usec: 0,
            timing: TimingConfig::default(),
            smoother_window_secs: SMOOTHER_WINDOW_SECS,
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: SinkConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Per-user configuration file location
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "raop-sink")
            .map(|dirs| dirs.config_dir().join("sink.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.trim().is_empty() {
            return Err(ConfigError::MissingServer);
        }
        self.sample_spec.validate()?;
        if self.timing.disconnect_cycle == 0 {
            return Err(ConfigError::InvalidTiming("disconnect_cycle must be at least 1".into()));
        }
        if self.timing.loss_max_secs == 0 {
            return Err(ConfigError::InvalidTiming("loss_max_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn sink_name(&self) -> String {
        if let Some(name) = &self.sink_name {
            return name.clone();
        }
        format!("raop_client.{}", self.name.as_deref().unwrap_or(&self.server))
    }

    pub fn description(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| format!("RAOP sink '{}'", self.server))
    }

    /// Whether the sink keeps eating audio while the receiver is unreachable.
    /// Tied to `autoreconnect`.
    pub fn silent_sink(&self) -> bool {
        self.autoreconnect
    }

    pub fn baseline_latency(&self) -> Duration {
        Duration::from_millis(self.latency_msec as u64)
    }

    pub fn device_delay(&self) -> Duration {
        Duration::from_micros(self.device_delay_usec)
    }

    pub fn smoother_window(&self) -> Duration {
        Duration::from_secs(self.smoother_window_secs.max(1))
    }

    /// Parameters handed to the protocol client factory
    pub fn client_params(&self) -> ClientParams {
        ClientParams {
            server: self.server.clone(),
            transport: self.transport,
            encryption: self.encryption,
            codec: self.codec,
            autoreconnect: self.autoreconnect,
        }
    }
}
