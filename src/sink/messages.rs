//! Messages exchanged between the host, the protocol client and the worker
//!
//! Two classes of message reach the worker over two separate channels:
//! asynchronous [`Event`]s, fire-and-forget and processed in FIFO order, and
//! synchronous [`Call`]s, which carry a reply channel the caller blocks on.
//! The worker talks back to the host only through [`HostRequest`]s.

use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::ChannelVolumes;
use crate::error::WorkerError;
use crate::network::{SessionState, StateCallback, Waker};
use crate::sink::state::SinkState;

/// Asynchronous messages for the worker
#[derive(Debug)]
pub enum Event {
    /// Session state change reported by the protocol client
    Session(SessionState),
    Volume(ChannelVolumes),
    Mute(bool),
    /// Start the handshake with the given credential
    Authenticate(Option<String>),
    /// Drop the session and restart the handshake
    Reconnect,
}

/// Synchronous requests; the caller waits for the reply
#[derive(Debug)]
pub enum Call {
    SetState { state: SinkState, ack: Sender<()> },
    Latency { reply: Sender<Duration> },
    Shutdown { ack: Sender<()> },
}

/// Requests from the worker to whoever owns the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRequest {
    /// Tear the session down and authenticate again
    Disconnect,
    /// The sink cannot continue and should be removed
    Unload,
}

/// Sending side of the worker's inbox
#[derive(Clone)]
pub struct Mailbox {
    pub(crate) events: Sender<Event>,
    pub(crate) calls: Sender<Call>,
    waker: Arc<Waker>,
}

/// Receiving side of the worker's inbox, owned by the worker
pub struct Inbox {
    pub(crate) events: Receiver<Event>,
    pub(crate) calls: Receiver<Call>,
}

pub fn channel(waker: Arc<Waker>) -> (Mailbox, Inbox) {
    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let (calls_tx, calls_rx) = crossbeam_channel::unbounded();
    (
        Mailbox {
            events: events_tx,
            calls: calls_tx,
            waker,
        },
        Inbox {
            events: events_rx,
            calls: calls_rx,
        },
    )
}

impl Mailbox {
    pub fn post(&self, event: Event) -> Result<(), WorkerError> {
        self.events.send(event).map_err(|_| WorkerError::Gone)?;
        self.waker.wake();
        Ok(())
    }

    pub fn call<R>(&self, make: impl FnOnce(Sender<R>) -> Call) -> Result<R, WorkerError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.calls.send(make(tx)).map_err(|_| WorkerError::Gone)?;
        self.waker.wake();
        rx.recv().map_err(|_| WorkerError::Gone)
    }

    /// Callback for the protocol client. State changes are re-posted as
    /// events, never acted on in the caller's context.
    pub fn state_callback(&self) -> StateCallback {
        let events = self.events.clone();
        let waker = self.waker.clone();
        Box::new(move |state| {
            tracing::debug!("State change received ({:?}), informing worker...", state);
            if events.send(Event::Session(state)).is_ok() {
                waker.wake();
            }
        })
    }
}
