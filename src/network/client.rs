//! Protocol client interface
//!
//! The client performs the RTSP handshake, encryption, encoding and all
//! socket I/O. The sink drives it as an opaque service: it issues session
//! commands, hands it rendered audio and forwards control packets, and
//! learns about session changes through the state callback.

use serde::{Deserialize, Serialize};
use std::io;
use std::os::fd::RawFd;

use crate::audio::{Chunk, Volume};
use crate::error::ProtocolError;
use crate::network::poll::PollSlot;

/// Audio transport used by the receiver session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Stream-based: audio pacing follows socket write readiness
    Tcp,
    /// Datagram-based: audio pacing follows a timer, with separate
    /// control and timing sockets
    #[default]
    Udp,
}

impl Transport {
    pub fn is_datagram(self) -> bool {
        matches!(self, Transport::Udp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    #[default]
    None,
    Rsa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Pcm,
    Alac,
}

/// Session lifecycle notifications emitted by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Authenticated,
    Connected,
    Recording,
    Disconnected,
    /// Session is unusable, handled like `Disconnected`
    Invalid,
}

/// Everything the client factory needs to build a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientParams {
    pub server: String,
    pub transport: Transport,
    pub encryption: Encryption,
    pub codec: Codec,
    pub autoreconnect: bool,
}

/// Sockets the client wants watched by the worker's multiplexer
pub struct Registration {
    pub slots: Vec<PollSlot>,
    /// True when audio is paced by the timer and the slots carry
    /// out-of-band control/timing traffic
    pub oob: bool,
}

/// Callback invoked by the client on every session state change.
///
/// May be called from any thread, including synchronously from inside a
/// command the worker just issued.
pub type StateCallback = Box<dyn Fn(SessionState) + Send + Sync>;

pub trait ProtocolClient: Send {
    /// Start (or restart) the handshake. `None` reuses the stored credential.
    fn authenticate(&mut self, credential: Option<&str>) -> Result<(), ProtocolError>;

    /// Announce a new session; the receiver answers with RECORD
    fn announce(&mut self) -> Result<(), ProtocolError>;

    /// Start streaming on a session whose RECORD was already sent
    fn stream(&mut self) -> Result<(), ProtocolError>;

    /// Graceful session teardown
    fn teardown(&mut self) -> Result<(), ProtocolError>;

    /// Drop buffered audio on the receiver
    fn flush(&mut self) -> Result<(), ProtocolError>;

    /// Close the session sockets
    fn disconnect(&mut self) -> Result<(), ProtocolError>;

    fn is_alive(&self) -> bool;

    fn is_recording(&self) -> bool;

    fn is_authenticated(&self) -> bool;

    fn can_stream(&self) -> bool;

    /// Hand over the session sockets for readiness polling
    fn register_readiness(&mut self) -> Registration;

    /// Parse a control or timing packet read from `fd`
    fn handle_control_packet(&mut self, fd: RawFd, packet: &[u8]);

    fn is_timing_channel(&self, fd: RawFd) -> bool;

    /// Transmit audio from `chunk`. `offset` is the chunk's index when it
    /// was rendered. Returns the number of bytes consumed.
    fn send_audio(&mut self, chunk: &Chunk, offset: usize) -> io::Result<usize>;

    /// Map a volume through the receiver's volume curve
    fn adjust_volume(&self, volume: Volume) -> Volume;

    fn set_volume(&mut self, volume: Volume) -> Result<(), ProtocolError>;

    /// Frames per audio packet, fixed by the protocol
    fn frames_per_block(&self) -> usize;

    fn set_state_callback(&mut self, callback: StateCallback);
}
