//! Audio-side building blocks: formats, rendered chunks, volume mapping

pub mod chunk;
pub mod host;
pub mod spec;
pub mod volume;

pub use chunk::Chunk;
pub use host::SinkIo;
pub use spec::SampleSpec;
pub use volume::{split_volume, ChannelVolumes, Volume, VolumeCommand, VolumeControl, VolumeSplit};
