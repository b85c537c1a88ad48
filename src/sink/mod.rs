//! RAOP sink driver
//!
//! [`RaopSink`] is the host-side handle. It owns nothing the worker touches:
//! the protocol client, the session sockets and the streaming state all live
//! on the worker thread and are reached through the worker's inbox.

pub mod latency;
pub mod messages;
pub mod state;
pub mod watchdog;
mod worker;

use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::{ChannelVolumes, SinkIo};
use crate::clock::{Clock, MonotonicClock};
use crate::config::SinkConfig;
use crate::error::{ProtocolError, Result, WorkerError};
use crate::network::{ClientParams, FdPoller, ProtocolClient};

pub use latency::LatencyEstimator;
pub use messages::{Call, Event, HostRequest, Mailbox};
pub use state::SinkState;
pub use watchdog::{TimingWatchdog, Verdict};

use worker::{Worker, WorkerParts};

/// Host-side handle of one RAOP sink
pub struct RaopSink {
    name: String,
    description: String,
    server: String,
    state: SinkState,
    block_size: usize,
    mailbox: Mailbox,
    requests: Receiver<HostRequest>,
    thread: Option<JoinHandle<()>>,
}

impl RaopSink {
    /// Validate `config`, build the protocol client with `connect` and start
    /// the streaming worker.
    ///
    /// Nothing is created when the configuration is invalid.
    pub fn new<F>(config: SinkConfig, io: Box<dyn SinkIo>, connect: F) -> Result<Self>
    where
        F: FnOnce(&ClientParams) -> std::result::Result<Box<dyn ProtocolClient>, ProtocolError>,
    {
        config.validate()?;

        let mut client = connect(&config.client_params())?;
        let block_size = client.frames_per_block() * config.sample_spec.frame_size();
        if block_size == 0 {
            return Err(ProtocolError::Creation("client reported an empty audio block".into()).into());
        }

        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let (poller, waker) = FdPoller::new(clock.clone())?;
        let (mailbox, inbox) = messages::channel(waker);
        client.set_state_callback(mailbox.state_callback());

        let (requests_tx, requests) = crossbeam_channel::unbounded();
        let worker = Worker::new(
            &config,
            block_size,
            WorkerParts {
                client,
                io,
                waiter: Box::new(poller),
                clock,
                inbox,
                requests: requests_tx,
            },
        );

        let thread = thread::Builder::new()
            .name(format!("raop-sink-{}", config.server))
            .spawn(move || worker.run())
            .map_err(WorkerError::Spawn)?;

        let mut sink = Self {
            name: config.sink_name(),
            description: config.description(),
            server: config.server.clone(),
            state: SinkState::Init,
            block_size,
            mailbox,
            requests,
            thread: Some(thread),
        };

        tracing::info!(
            "Created {} ({}), block size {} bytes",
            sink.name,
            sink.description,
            block_size
        );

        sink.set_state(SinkState::Idle)?;
        sink.mailbox.post(Event::Authenticate(config.password.clone()))?;

        Ok(sink)
    }

    /// Change the operational mode; returns once the worker has applied it
    pub fn set_state(&mut self, state: SinkState) -> Result<()> {
        self.mailbox.call(|ack| Call::SetState { state, ack })?;
        self.state = state;
        Ok(())
    }

    pub fn set_volume(&self, volumes: ChannelVolumes) -> Result<()> {
        Ok(self.mailbox.post(Event::Volume(volumes))?)
    }

    pub fn set_mute(&self, muted: bool) -> Result<()> {
        Ok(self.mailbox.post(Event::Mute(muted))?)
    }

    /// Current end-to-end latency estimate
    pub fn latency(&self) -> Result<Duration> {
        Ok(self.mailbox.call(|reply| Call::Latency { reply })?)
    }

    /// Requests raised by the worker
    pub fn requests(&self) -> &Receiver<HostRequest> {
        &self.requests
    }

    /// Handle pending worker requests. Returns true when the worker asked to
    /// be unloaded.
    pub fn process_requests(&mut self) -> Result<bool> {
        let mut unload = false;

        while let Ok(request) = self.requests.try_recv() {
            match request {
                HostRequest::Disconnect => {
                    if self.state == SinkState::Running {
                        tracing::info!("Reconnecting to {}", self.server);
                        self.mailbox.post(Event::Reconnect)?;
                    } else {
                        tracing::debug!("Ignoring disconnect request while {}", self.state);
                    }
                }
                HostRequest::Unload => {
                    tracing::warn!("Worker of {} requested unload", self.name);
                    unload = true;
                }
            }
        }

        Ok(unload)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    /// Stop the worker and wait for it to exit
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            if self.mailbox.call(|ack| Call::Shutdown { ack }).is_err() {
                tracing::debug!("Worker of {} already gone", self.name);
            }
            let _ = handle.join();
            self.state = SinkState::Unlinked;
        }
    }
}

impl Drop for RaopSink {
    fn drop(&mut self) {
        self.stop();
    }
}
