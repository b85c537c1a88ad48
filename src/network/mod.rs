//! Network side of the sink: the protocol client interface and the
//! readiness multiplexer its sockets are polled with

pub mod client;
pub mod poll;

pub use client::{
    ClientParams, Codec, Encryption, ProtocolClient, Registration, SessionState, StateCallback,
    Transport,
};
pub use poll::{FdPoller, PollItem, PollSlot, Readiness, Timer, Wait, Waker};
