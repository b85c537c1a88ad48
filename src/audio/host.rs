//! The host pipeline as seen from the streaming worker

use crate::audio::chunk::Chunk;
use crate::audio::volume::ChannelVolumes;

/// Rendering side of the host audio pipeline.
///
/// Owned by the streaming worker and only called from its thread. The host
/// keeps buffering, mixing and clocking of raw samples; the worker only pulls
/// rendered blocks out of it.
pub trait SinkIo: Send {
    /// Render exactly `len` bytes of audio
    fn render(&mut self, len: usize) -> Chunk;

    /// Whether upstream asked for already-rendered audio to be rewritten
    fn rewind_requested(&self) -> bool {
        false
    }

    /// Service a pending rewind request
    fn process_rewind(&mut self) {}

    /// Per-channel attenuation to apply while rendering
    fn set_soft_volume(&mut self, volumes: &ChannelVolumes);
}
