//! # RAOP Sink
//!
//! Streaming sink driver for RAOP (AirPlay audio) receivers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── HOST THREAD ────────────────────────────┐
//! │  RaopSink (sink::RaopSink)                                          │
//! │    set_state / latency ──── sync Call ─────────┐                    │
//! │    set_volume / set_mute ── async Event ───────┤                    │
//! │    process_requests ◄────── HostRequest ───────┼──────┐             │
//! └────────────────────────────────────────────────┼──────┼─────────────┘
//!                                                  ▼      │
//! ┌──────────────────────────── WORKER THREAD ─────────────┼────────────┐
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┴─┐           │
//! │  │ FdPoller     │──►│ Worker loop  │──►│ ProtocolClient │──► RAOP   │
//! │  │ sockets,     │   │ state machine│   │ (RTSP, RTP,    │  receiver │
//! │  │ timer, waker │   │ pacing       │   │  encryption)   │           │
//! │  └──────────────┘   └──┬────────┬──┘   └───────┬────────┘           │
//! │                        │        │              │ state callback     │
//! │              LatencyEstimator  TimingWatchdog  └──► async Event     │
//! │                        │                                            │
//! │                 SinkIo::render (host pipeline)                      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod sink;

pub use config::SinkConfig;
pub use error::{Error, Result};
pub use sink::{HostRequest, RaopSink, SinkState};

/// Application-wide constants
pub mod constants {
    /// Default sample rate of the rendered stream
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u8 = 2;

    /// Fixed receiver-side latency reported on top of the transport delay
    pub const DEFAULT_LATENCY_MSEC: u32 = 2000;

    /// Silence on the timing channel after which the session is dropped
    pub const UDP_TIMING_PACKET_LOSS_MAX_SECS: u64 = 30;

    /// Warning steps before the timing watchdog forces a reconnect
    pub const UDP_TIMING_PACKET_DISCONNECT_CYCLE: u32 = 3;

    /// Smoothing window of the latency estimator
    pub const SMOOTHER_WINDOW_SECS: u64 = 5;

    /// Upper bound on a control or timing packet
    pub const CONTROL_PACKET_MAX: usize = 32;
}
