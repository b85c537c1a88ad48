//! Volume and mute mapping
//!
//! RAOP receivers accept a single volume for the whole stream. The host asks
//! for one volume per channel, so the loudest channel is programmed as the
//! hardware volume and every channel gets a software attenuation factor that
//! restores the requested balance: `software * hardware == requested`.

use std::fmt;

/// Volume on the host's scale, `NORM` is unity gain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Volume(pub u32);

impl Volume {
    pub const MUTED: Volume = Volume(0);
    pub const NORM: Volume = Volume(0x10000);
    pub const MAX: Volume = Volume(u32::MAX / 2);

    pub fn is_muted(self) -> bool {
        self == Self::MUTED
    }

    /// Product of two volumes, as applied when chaining gain stages
    pub fn multiply(self, other: Volume) -> Volume {
        let norm = Self::NORM.0 as u64;
        let v = (self.0 as u64 * other.0 as u64 + norm / 2) / norm;
        Volume(v.min(Self::MAX.0 as u64) as u32)
    }

    /// Gain that, multiplied by `other`, yields `self`. Zero if `other` is muted.
    pub fn divide(self, other: Volume) -> Volume {
        if other.is_muted() {
            return Self::MUTED;
        }
        let norm = Self::NORM.0 as u64;
        let v = (self.0 as u64 * norm + other.0 as u64 / 2) / other.0 as u64;
        Volume(v.min(Self::MAX.0 as u64) as u32)
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.0}%", self.0 as f64 * 100.0 / Self::NORM.0 as f64)
    }
}

/// Per-channel volumes, one entry per interleaved channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelVolumes(Vec<Volume>);

impl ChannelVolumes {
    /// Same volume on every channel
    pub fn uniform(channels: u8, volume: Volume) -> Self {
        Self(vec![volume; channels as usize])
    }

    pub fn from_vec(volumes: Vec<Volume>) -> Self {
        Self(volumes)
    }

    pub fn as_slice(&self) -> &[Volume] {
        &self.0
    }

    /// Loudest channel, muted if there are no channels
    pub fn max(&self) -> Volume {
        self.0.iter().copied().max().unwrap_or(Volume::MUTED)
    }

    /// Divide every channel by a single volume
    pub fn divide(&self, by: Volume) -> Self {
        Self(self.0.iter().map(|v| v.divide(by)).collect())
    }

    /// Multiply every channel by a single volume
    pub fn multiply(&self, by: Volume) -> Self {
        Self(self.0.iter().map(|v| v.multiply(by)).collect())
    }
}

impl fmt::Display for ChannelVolumes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}: {}", i, v)?;
        }
        Ok(())
    }
}

/// Hardware volume plus the software residual that preserves channel balance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSplit {
    /// Single value to program on the receiver
    pub hardware: Volume,
    /// Per-channel attenuation applied while rendering
    pub software: ChannelVolumes,
}

/// What the device should be told after a volume or mute change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeCommand {
    /// Program `hardware` and apply `software` locally
    Apply(VolumeSplit),
    /// Program silence
    Silence,
}

/// Split a requested channel volume into hardware and software parts.
///
/// `adjust` maps the candidate hardware volume through the receiver's own
/// volume curve.
pub fn split_volume(requested: &ChannelVolumes, adjust: impl FnOnce(Volume) -> Volume) -> VolumeSplit {
    let candidate = requested.max();
    let hardware = adjust(candidate);

    tracing::debug!("Volume adjusted: orig={} adjusted={}", candidate.0, hardware.0);

    let software = requested.divide(hardware);

    tracing::debug!("Requested volume: {}", requested);
    tracing::debug!("Got hardware volume: {}", hardware);
    tracing::debug!("Calculated software volume: {}", software);

    VolumeSplit { hardware, software }
}

/// Latest logical volume and mute state received from the host
#[derive(Debug, Clone)]
pub struct VolumeControl {
    requested: ChannelVolumes,
    muted: bool,
}

impl VolumeControl {
    pub fn new(channels: u8) -> Self {
        Self {
            requested: ChannelVolumes::uniform(channels, Volume::NORM),
            muted: false,
        }
    }

    pub fn requested(&self) -> &ChannelVolumes {
        &self.requested
    }

    /// Record a new volume. Nothing is programmed while muted.
    pub fn set_volume(
        &mut self,
        requested: ChannelVolumes,
        adjust: impl FnOnce(Volume) -> Volume,
    ) -> Option<VolumeSplit> {
        self.requested = requested;
        if self.muted {
            return None;
        }
        Some(split_volume(&self.requested, adjust))
    }

    /// Record a new mute state
    pub fn set_mute(&mut self, muted: bool, adjust: impl FnOnce(Volume) -> Volume) -> VolumeCommand {
        self.muted = muted;
        self.command(adjust)
    }

    /// Command reflecting the current state, used when a session (re)starts
    pub fn command(&self, adjust: impl FnOnce(Volume) -> Volume) -> VolumeCommand {
        if self.muted {
            VolumeCommand::Silence
        } else {
            VolumeCommand::Apply(split_volume(&self.requested, adjust))
        }
    }
}
