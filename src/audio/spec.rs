//! Sample specification and byte/time conversion
//!
//! The sink always renders signed 16-bit little-endian interleaved PCM, so a
//! specification is fully described by its rate and channel count.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};
use crate::error::ConfigError;

const USEC_PER_SEC: u64 = 1_000_000;

/// Bytes per sample (s16le)
const SAMPLE_BYTES: usize = 2;

/// Maximum channel count accepted by the sink
pub const MAX_CHANNELS: u8 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleSpec {
    /// Sample rate in Hz
    pub rate: u32,
    /// Interleaved channel count
    pub channels: u8,
}

impl Default for SampleSpec {
    fn default() -> Self {
        Self {
            rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
        }
    }
}

impl SampleSpec {
    pub fn new(rate: u32, channels: u8) -> Self {
        Self { rate, channels }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate == 0 {
            return Err(ConfigError::InvalidSampleSpec("sample rate is zero".into()));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(ConfigError::InvalidSampleSpec(format!(
                "unsupported channel count: {}",
                self.channels
            )));
        }
        Ok(())
    }

    /// Size of one frame (one sample for every channel) in bytes
    pub fn frame_size(&self) -> usize {
        SAMPLE_BYTES * self.channels as usize
    }

    /// Duration covered by `bytes` of audio. Partial frames are ignored.
    pub fn bytes_to_duration(&self, bytes: u64) -> Duration {
        let frames = bytes / self.frame_size() as u64;
        Duration::from_micros(frames * USEC_PER_SEC / self.rate as u64)
    }

    /// Number of whole-frame bytes covering `duration`
    pub fn duration_to_bytes(&self, duration: Duration) -> u64 {
        let frames = duration.as_micros() as u64 * self.rate as u64 / USEC_PER_SEC;
        frames * self.frame_size() as u64
    }
}
