//! Realtime streaming worker
//!
//! One dedicated thread owns the protocol client, the session sockets and
//! all streaming state. Each loop iteration blocks once in [`Wait::wait`],
//! then processes the inbox and, depending on what woke it, either drains
//! control traffic or moves audio from the host pipeline to the client.
//!
//! Two pacing modes exist. With a stream transport the loop is driven by
//! socket write readiness. With a datagram transport ("out-of-band" mode) a
//! deadline timer paces audio at the nominal rate, and socket readiness only
//! means a control or timing packet has arrived.

use crossbeam_channel::Sender;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::audio::{ChannelVolumes, Chunk, SampleSpec, SinkIo, Volume, VolumeCommand, VolumeControl};
use crate::clock::Clock;
use crate::config::SinkConfig;
use crate::constants::CONTROL_PACKET_MAX;
use crate::error::ProtocolError;
use crate::network::poll::read_packet;
use crate::network::{PollItem, ProtocolClient, Readiness, SessionState, Timer, Wait};
use crate::sink::latency::LatencyEstimator;
use crate::sink::messages::{Call, Event, HostRequest, Inbox};
use crate::sink::state::SinkState;
use crate::sink::watchdog::{TimingWatchdog, Verdict};

/// What the run loop should do after an iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    /// Clean shutdown requested by the host
    Quit,
    /// Unrecoverable error; ask for unload and wait for shutdown
    Fail,
}

/// Everything the worker takes ownership of
pub(crate) struct WorkerParts {
    pub client: Box<dyn ProtocolClient>,
    pub io: Box<dyn SinkIo>,
    pub waiter: Box<dyn Wait>,
    pub clock: Arc<dyn Clock>,
    pub inbox: Inbox,
    pub requests: Sender<HostRequest>,
}

pub(crate) struct Worker {
    /// Receiver address, used in log lines
    server: String,

    /// Protocol client, owned exclusively by this thread
    client: Box<dyn ProtocolClient>,

    /// Host pipeline we render from
    io: Box<dyn SinkIo>,

    /// Readiness multiplexer
    waiter: Box<dyn Wait>,

    /// Monotonic time source for pacing and the estimator
    clock: Arc<dyn Clock>,

    /// Events and calls from the host and the client callback
    inbox: Inbox,

    /// Requests back to the host
    requests: Sender<HostRequest>,

    /// Format of the rendered stream
    spec: SampleSpec,

    /// Reconnect after failures instead of unloading
    autoreconnect: bool,

    /// Keep consuming audio while the receiver is unreachable
    silent_sink: bool,

    /// Bytes rendered per block
    block_size: usize,

    /// Playback time of one block
    block_duration: Duration,

    /// Configured delay subtracted from the cursor before it reaches the estimator
    device_delay: Duration,

    /// Host operational mode, as last set through a call
    state: SinkState,

    /// Session sockets, present between Connected and Disconnected
    item: Option<PollItem>,

    /// Datagram pacing: audio follows the timer, sockets carry control traffic
    oob: bool,

    /// Deadline of the next audio send
    timer: Timer,

    /// Rendered audio not yet fully handed to the client
    chunk: Option<Chunk>,

    /// Chunk index at render time, handed to the client with every send
    offset: usize,

    /// Bytes consumed since the stream (re)started
    write_count: u64,

    /// Time the write cursor was last reset
    start: Duration,

    /// When the next block is due
    next_send: Duration,

    /// First running iteration since Recording
    first: bool,

    /// Transport latency model
    latency: LatencyEstimator,

    /// Timing-packet loss detection
    watchdog: TimingWatchdog,

    /// Latest volume and mute from the host
    volume: VolumeControl,
}

impl Worker {
    pub fn new(config: &SinkConfig, block_size: usize, parts: WorkerParts) -> Self {
        let spec = config.sample_spec;
        Self {
            server: config.server.clone(),
            client: parts.client,
            io: parts.io,
            waiter: parts.waiter,
            clock: parts.clock,
            inbox: parts.inbox,
            requests: parts.requests,

            spec,
            autoreconnect: config.autoreconnect,
            silent_sink: config.silent_sink(),
            block_size,
            block_duration: spec.bytes_to_duration(block_size as u64),
            device_delay: config.device_delay(),

            state: SinkState::Init,
            item: None,
            oob: config.transport.is_datagram(),
            timer: Timer::default(),

            chunk: None,
            offset: 0,
            write_count: 0,
            start: Duration::ZERO,
            next_send: Duration::ZERO,
            first: false,

            latency: LatencyEstimator::new(spec, config.smoother_window(), config.baseline_latency()),
            watchdog: TimingWatchdog::new(&config.timing),
            volume: VolumeControl::new(spec.channels),
        }
    }

    pub fn run(mut self) {
        let span = tracing::info_span!("raop_sink", server = %self.server);
        let _enter = span.enter();

        debug!("Thread starting up");
        self.latency.reset(self.clock.now());

        loop {
            match self.step() {
                Flow::Continue => {}
                Flow::Quit => break,
                Flow::Fail => {
                    self.fail();
                    break;
                }
            }
        }

        debug!("Thread shutting down");
    }

    /// One loop iteration
    pub fn step(&mut self) -> Flow {
        if let Err(e) = self.waiter.wait(self.item.as_mut(), self.timer.deadline()) {
            error!("Readiness wait failed: {}", e);
            return Flow::Fail;
        }

        let on_timeout = self.timer.take_elapsed(self.clock.now());

        if self.process_inbox() == Flow::Quit {
            return Flow::Quit;
        }

        if self.state.is_opened() && self.io.rewind_requested() {
            self.io.process_rewind();
        }

        if let Some(item) = self.item.as_mut() {
            // Stream transport woke without readiness: wait for the socket
            if !self.oob && !item.has_revents() {
                item.arm_write();
                return Flow::Continue;
            }
            // Datagram transport woke by a socket: control traffic only
            if self.oob && !on_timeout {
                return self.drain_control_packets();
            }
        }

        if self.state != SinkState::Running {
            return Flow::Continue;
        }

        if self.first {
            self.watchdog.clear();
            self.next_send = Duration::ZERO;
            self.first = false;
        }

        let can_stream = self.client.can_stream();

        if self.oob && self.autoreconnect && on_timeout && self.check_timing(can_stream) {
            return Flow::Continue;
        }

        if !self.silent_sink && !can_stream {
            debug!("Can't stream, connection not established yet...");
            self.retry_later(on_timeout);
            return Flow::Continue;
        }

        if self.chunk.is_none() && self.next_send < self.clock.now() + self.block_duration {
            let chunk = self.io.render(self.block_size);
            self.offset = chunk.index();
            self.chunk = Some(chunk);
        }

        if self.chunk.is_none() {
            self.retry_later(on_timeout);
            return Flow::Continue;
        }

        self.deliver(can_stream, on_timeout)
    }

    /// Replace a deadline that was consumed without sending anything
    fn retry_later(&mut self, on_timeout: bool) {
        if on_timeout && !self.timer.is_armed() {
            self.timer.set_absolute(self.clock.now() + self.block_duration);
        }
    }

    /// Returns true when a reconnect was requested and the iteration should end
    fn check_timing(&mut self, can_stream: bool) -> bool {
        if !can_stream {
            self.watchdog.clear();
            return false;
        }

        match self.watchdog.check(self.clock.now()) {
            Verdict::Quiet => false,
            Verdict::Warn { step, since } => {
                warn!(
                    "UDP Timing Packets Warn #{}/{} - Nothing received since {} seconds from {}",
                    step,
                    self.watchdog.cycle() - 1,
                    since.as_secs(),
                    self.server
                );
                false
            }
            Verdict::Reconnect { since } => {
                if !self.client.is_alive() {
                    return false;
                }
                warn!(
                    "UDP Timing Packets Warn limit reached ({} seconds without timing) - Requesting reconnect",
                    since.as_secs()
                );
                request(&self.requests, HostRequest::Disconnect);
                // Keep pacing until the new session reports Recording
                self.timer.set_absolute(self.next_send);
                true
            }
        }
    }

    fn deliver(&mut self, can_stream: bool, on_timeout: bool) -> Flow {
        let Some(chunk) = self.chunk.as_mut() else {
            return Flow::Continue;
        };

        if !self.silent_sink || can_stream {
            match self.client.send_audio(chunk, self.offset) {
                Ok(n) => self.write_count += chunk.consume(n) as u64,
                Err(e) => return self.on_send_error(e),
            }
        } else {
            // Nobody is listening: consume at the nominal rate
            self.write_count += chunk.consume(chunk.len()) as u64;
        }

        let drained = chunk.is_empty();
        if drained {
            self.chunk = None;
        }

        let delay = self.spec.duration_to_bytes(self.device_delay);
        self.latency
            .put(self.clock.now(), self.write_count.saturating_sub(delay));

        if (self.silent_sink && !can_stream) || (self.oob && can_stream && on_timeout) {
            self.schedule_next_send();
        } else if !self.oob {
            if drained {
                self.schedule_next_send();
                if let Some(item) = self.item.as_mut() {
                    item.disarm();
                }
            } else if let Some(item) = self.item.as_mut() {
                item.arm_write();
            }
        }

        Flow::Continue
    }

    fn schedule_next_send(&mut self) {
        self.next_send = self.start + self.spec.bytes_to_duration(self.write_count);
        self.timer.set_absolute(self.next_send);
    }

    fn on_send_error(&mut self, err: io::Error) -> Flow {
        match err.kind() {
            io::ErrorKind::WouldBlock if !self.oob => {
                // Same chunk, same offset once the socket drains
                if let Some(item) = self.item.as_mut() {
                    item.arm_write();
                }
                Flow::Continue
            }
            io::ErrorKind::Interrupted => {
                debug!("Failed to write audio (interrupted)");
                self.recover()
            }
            _ => {
                error!("Failed to write audio: {}", err);
                self.recover()
            }
        }
    }

    fn recover(&mut self) -> Flow {
        if self.autoreconnect {
            request(&self.requests, HostRequest::Disconnect);
            Flow::Continue
        } else {
            Flow::Fail
        }
    }

    fn drain_control_packets(&mut self) -> Flow {
        let Some(item) = self.item.as_mut() else {
            return Flow::Continue;
        };

        let mut packet = [0u8; CONTROL_PACKET_MAX];
        for slot in item.slots_mut() {
            if slot.revents.is_error() {
                if self.autoreconnect && self.client.is_alive() {
                    warn!("Control socket {} reported an error, requesting reconnect", slot.raw_fd());
                    slot.revents = Readiness::EMPTY;
                    request(&self.requests, HostRequest::Disconnect);
                    continue;
                }
                error!("Control socket {} reported an error", slot.raw_fd());
                return Flow::Fail;
            }

            if !slot.revents.intersects(slot.events) {
                continue;
            }
            slot.revents = Readiness::EMPTY;

            let n = match read_packet(slot.fd(), &mut packet) {
                Ok(n) => n,
                Err(e) => {
                    debug!("Failed to read control packet: {}", e);
                    continue;
                }
            };

            let fd = slot.raw_fd();
            self.client.handle_control_packet(fd, &packet[..n]);
            if self.client.is_timing_channel(fd) {
                self.watchdog.on_timing_packet(self.clock.now());
            }
        }

        Flow::Continue
    }

    fn process_inbox(&mut self) -> Flow {
        while let Ok(event) = self.inbox.events.try_recv() {
            match event {
                Event::Session(state) => self.on_session_state(state),
                Event::Volume(volumes) => self.set_volume(volumes),
                Event::Mute(muted) => self.set_mute(muted),
                Event::Authenticate(credential) => {
                    log_failure("authenticate", self.client.authenticate(credential.as_deref()))
                }
                Event::Reconnect => {
                    info!("Reconnecting to {}", self.server);
                    log_failure("disconnect", self.client.disconnect());
                    log_failure("authenticate", self.client.authenticate(None));
                }
            }
        }

        while let Ok(call) = self.inbox.calls.try_recv() {
            match call {
                Call::SetState { state, ack } => {
                    self.set_state(state);
                    let _ = ack.send(());
                }
                Call::Latency { reply } => {
                    let _ = reply.send(self.latency());
                }
                Call::Shutdown { ack } => {
                    let _ = ack.send(());
                    return Flow::Quit;
                }
            }
        }

        Flow::Continue
    }

    fn on_session_state(&mut self, state: SessionState) {
        debug!("Session state: {:?}", state);

        match state {
            SessionState::Authenticated => {
                if !self.client.is_authenticated() {
                    error!("Authentication with {} failed, requesting unload", self.server);
                    request(&self.requests, HostRequest::Unload);
                    return;
                }

                debug!("RAOP host authenticated");
                if self.autoreconnect && self.state == SinkState::Running {
                    self.latency.reset(self.clock.now());
                    if !self.client.is_alive() {
                        log_failure("announce", self.client.announce());
                    }
                }
            }

            SessionState::Connected => {
                if let Some(stale) = self.item.take() {
                    warn!("Session connected with {} sockets still registered, releasing them", stale.len());
                }
                let registration = self.client.register_readiness();
                self.oob = registration.oob;
                self.item = Some(PollItem::new(registration.slots));
            }

            SessionState::Recording => {
                debug!("RAOP session ready to record");
                let now = self.clock.now();
                self.write_count = 0;
                self.start = now;
                self.first = true;
                self.timer.set_absolute(now);
                self.latency.reset(now);

                if self.state == SinkState::Suspended {
                    self.timer.disable();
                    log_failure("flush", self.client.flush());
                } else {
                    self.push_volume();
                }
            }

            SessionState::Disconnected | SessionState::Invalid => {
                debug!("RAOP session disconnected");
                if let Some(item) = self.item.take() {
                    debug!("Releasing {} session sockets", item.len());
                }
                self.watchdog.clear();

                if self.state == SinkState::Suspended {
                    self.timer.disable();
                    return;
                }
                if self.state == SinkState::Idle {
                    return;
                }

                if self.autoreconnect {
                    if !self.silent_sink {
                        self.timer.disable();
                    }
                    log_failure("authenticate", self.client.authenticate(None));
                } else {
                    error!("Lost connection to {}, requesting unload", self.server);
                    request(&self.requests, HostRequest::Unload);
                }
            }
        }
    }

    fn set_state(&mut self, new: SinkState) {
        if new == self.state {
            return;
        }

        match new {
            SinkState::Suspended => {
                debug!("RAOP: SUSPENDED");
                if !self.state.is_opened() {
                    warn!("Suspending a sink that is not opened ({})", self.state);
                }
                if self.client.is_alive() {
                    log_failure("teardown", self.client.teardown());
                }
            }

            SinkState::Idle => {
                debug!("RAOP: IDLE");
                if self.state == SinkState::Running {
                    self.timer.disable();
                    log_failure("flush", self.client.flush());
                }
            }

            SinkState::Running => {
                debug!("RAOP: RUNNING");
                let now = self.clock.now();
                self.latency.reset(now);

                if self.silent_sink {
                    self.start = now;
                    self.write_count = 0;
                    self.first = true;
                    self.timer.set_absolute(now);
                }

                if !self.client.is_alive() {
                    log_failure("announce", self.client.announce());
                } else if !self.client.is_recording() {
                    log_failure("stream", self.client.stream());
                    self.timer.set_absolute(now);
                    self.write_count = 0;
                    self.start = now;
                }
            }

            SinkState::Init | SinkState::Unlinked => {}
        }

        self.state = new;
    }

    /// Estimated end-to-end latency
    fn latency(&self) -> Duration {
        if self.silent_sink || self.client.can_stream() {
            self.latency.estimate(self.clock.now(), self.write_count)
        } else {
            Duration::ZERO
        }
    }

    fn set_volume(&mut self, volumes: ChannelVolumes) {
        let client = &self.client;
        if let Some(split) = self.volume.set_volume(volumes, |v| client.adjust_volume(v)) {
            self.apply_volume(VolumeCommand::Apply(split));
        }
    }

    fn set_mute(&mut self, muted: bool) {
        let client = &self.client;
        let command = self.volume.set_mute(muted, |v| client.adjust_volume(v));
        self.apply_volume(command);
    }

    /// Re-send the current volume or mute to a freshly started session
    fn push_volume(&mut self) {
        let client = &self.client;
        let command = self.volume.command(|v| client.adjust_volume(v));
        self.apply_volume(command);
    }

    fn apply_volume(&mut self, command: VolumeCommand) {
        match command {
            VolumeCommand::Apply(split) => {
                self.io.set_soft_volume(&split.software);
                log_failure("set volume", self.client.set_volume(split.hardware));
            }
            VolumeCommand::Silence => log_failure("set volume", self.client.set_volume(Volume::MUTED)),
        }
    }

    /// Ask the host to unload us, then stay responsive until it shuts us down
    fn fail(&mut self) {
        request(&self.requests, HostRequest::Unload);

        loop {
            crossbeam_channel::select! {
                recv(self.inbox.calls) -> call => match call {
                    Ok(Call::Shutdown { ack }) => {
                        let _ = ack.send(());
                        return;
                    }
                    Ok(Call::SetState { ack, .. }) => {
                        let _ = ack.send(());
                    }
                    Ok(Call::Latency { reply }) => {
                        let _ = reply.send(Duration::ZERO);
                    }
                    Err(_) => return,
                },
                recv(self.inbox.events) -> event => {
                    if event.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn request(requests: &Sender<HostRequest>, req: HostRequest) {
    if requests.send(req).is_err() {
        debug!("Host gone, dropping {:?} request", req);
    }
}

fn log_failure(what: &str, result: Result<(), ProtocolError>) {
    if let Err(e) = result {
        warn!("RAOP {} failed: {}", what, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::host::testing::SilenceIo;
    use crate::clock::ManualClock;
    use crate::network::{FdPoller, PollSlot, Registration, StateCallback, Transport};
    use crate::sink::messages::{self, Mailbox};
    use crossbeam_channel::Receiver;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::net::UdpSocket;
    use std::os::fd::{AsRawFd, OwnedFd, RawFd};
    use std::sync::Mutex;

    const FRAMES_PER_BLOCK: usize = 352;
    const BLOCK_SIZE: usize = FRAMES_PER_BLOCK * 4;

    #[derive(Default)]
    struct ClientState {
        alive: bool,
        recording: bool,
        authenticated: bool,
        can_stream: bool,
        commands: Vec<&'static str>,
        sends: Vec<(usize, usize)>,
        send_results: VecDeque<io::Result<usize>>,
        volumes: Vec<Volume>,
        packets: Vec<Vec<u8>>,
        timing_fd: Option<RawFd>,
        /// Peers of the registered sockets, for injecting packets
        peers: Vec<UdpSocket>,
        registrations: usize,
    }

    struct FakeClient {
        shared: Arc<Mutex<ClientState>>,
        oob: bool,
    }

    impl FakeClient {
        fn record(&self, command: &'static str) -> Result<(), ProtocolError> {
            self.shared.lock().unwrap().commands.push(command);
            Ok(())
        }
    }

    fn udp_pair() -> (UdpSocket, UdpSocket) {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        a.connect(b.local_addr().unwrap()).unwrap();
        b.connect(a.local_addr().unwrap()).unwrap();
        (a, b)
    }

    impl ProtocolClient for FakeClient {
        fn authenticate(&mut self, _credential: Option<&str>) -> Result<(), ProtocolError> {
            self.record("authenticate")
        }
        fn announce(&mut self) -> Result<(), ProtocolError> {
            self.record("announce")
        }
        fn stream(&mut self) -> Result<(), ProtocolError> {
            self.record("stream")
        }
        fn teardown(&mut self) -> Result<(), ProtocolError> {
            self.record("teardown")
        }
        fn flush(&mut self) -> Result<(), ProtocolError> {
            self.record("flush")
        }
        fn disconnect(&mut self) -> Result<(), ProtocolError> {
            self.record("disconnect")
        }
        fn is_alive(&self) -> bool {
            self.shared.lock().unwrap().alive
        }
        fn is_recording(&self) -> bool {
            self.shared.lock().unwrap().recording
        }
        fn is_authenticated(&self) -> bool {
            self.shared.lock().unwrap().authenticated
        }
        fn can_stream(&self) -> bool {
            self.shared.lock().unwrap().can_stream
        }

        fn register_readiness(&mut self) -> Registration {
            let mut shared = self.shared.lock().unwrap();
            shared.registrations += 1;
            shared.peers.clear();

            let events = if self.oob { Readiness::READABLE } else { Readiness::EMPTY };
            let count = if self.oob { 2 } else { 1 };
            let mut slots = Vec::new();
            for i in 0..count {
                let (local, peer) = udp_pair();
                if self.oob && i == 1 {
                    shared.timing_fd = Some(local.as_raw_fd());
                }
                shared.peers.push(peer);
                slots.push(PollSlot::new(OwnedFd::from(local), events));
            }
            Registration { slots, oob: self.oob }
        }

        fn handle_control_packet(&mut self, _fd: RawFd, packet: &[u8]) {
            self.shared.lock().unwrap().packets.push(packet.to_vec());
        }

        fn is_timing_channel(&self, fd: RawFd) -> bool {
            self.shared.lock().unwrap().timing_fd == Some(fd)
        }

        fn send_audio(&mut self, chunk: &Chunk, offset: usize) -> io::Result<usize> {
            let mut shared = self.shared.lock().unwrap();
            shared.sends.push((offset, chunk.len()));
            shared.send_results.pop_front().unwrap_or(Ok(chunk.len()))
        }

        fn adjust_volume(&self, volume: Volume) -> Volume {
            volume
        }

        fn set_volume(&mut self, volume: Volume) -> Result<(), ProtocolError> {
            self.shared.lock().unwrap().volumes.push(volume);
            Ok(())
        }

        fn frames_per_block(&self) -> usize {
            FRAMES_PER_BLOCK
        }

        fn set_state_callback(&mut self, _callback: StateCallback) {}
    }

    enum Step {
        /// Sleep until the armed deadline
        Tick,
        /// Sleep until an absolute time
        TickAt(Duration),
        /// Wake with readiness on the registered slots
        Ready(Vec<Readiness>),
        Fail,
    }

    struct ScriptedWait {
        clock: ManualClock,
        steps: Arc<Mutex<VecDeque<Step>>>,
    }

    impl Wait for ScriptedWait {
        fn wait(&mut self, item: Option<&mut PollItem>, deadline: Option<Duration>) -> io::Result<()> {
            let step = self.steps.lock().unwrap().pop_front();
            let mut revents = Vec::new();
            match step {
                Some(Step::Tick) => {
                    if let Some(at) = deadline {
                        if at > self.clock.now() {
                            self.clock.set(at);
                        }
                    }
                }
                Some(Step::TickAt(at)) => self.clock.set(at),
                Some(Step::Ready(ready)) => revents = ready,
                Some(Step::Fail) => return Err(io::Error::new(io::ErrorKind::Other, "poll failed")),
                None => {}
            }

            if let Some(item) = item {
                for (i, slot) in item.slots_mut().iter_mut().enumerate() {
                    slot.revents = revents.get(i).copied().unwrap_or(Readiness::EMPTY);
                }
            }
            Ok(())
        }
    }

    struct Harness {
        worker: Worker,
        _poller: FdPoller,
        mailbox: Mailbox,
        requests: Receiver<HostRequest>,
        clock: ManualClock,
        client: Arc<Mutex<ClientState>>,
        steps: Arc<Mutex<VecDeque<Step>>>,
        io: SilenceIo,
    }

    fn harness(config: SinkConfig) -> Harness {
        let clock = ManualClock::new(Duration::from_secs(100));
        let (poller, waker) = FdPoller::new(Arc::new(clock.clone())).unwrap();
        let (mailbox, inbox) = messages::channel(waker);
        let (requests_tx, requests) = crossbeam_channel::unbounded();
        let client = Arc::new(Mutex::new(ClientState::default()));
        let steps = Arc::new(Mutex::new(VecDeque::new()));
        let io = SilenceIo::default();

        let parts = WorkerParts {
            client: Box::new(FakeClient {
                shared: client.clone(),
                oob: config.transport.is_datagram(),
            }),
            io: Box::new(io.clone()),
            waiter: Box::new(ScriptedWait {
                clock: clock.clone(),
                steps: steps.clone(),
            }),
            clock: Arc::new(clock.clone()),
            inbox,
            requests: requests_tx,
        };

        Harness {
            worker: Worker::new(&config, BLOCK_SIZE, parts),
            _poller: poller,
            mailbox,
            requests,
            clock,
            client,
            steps,
            io,
        }
    }

    fn udp_config(autoreconnect: bool) -> SinkConfig {
        let mut config = SinkConfig::new("10.0.0.5");
        config.autoreconnect = autoreconnect;
        config
    }

    fn tcp_config() -> SinkConfig {
        let mut config = SinkConfig::new("10.0.0.5");
        config.transport = Transport::Tcp;
        config
    }

    impl Harness {
        fn client(&self) -> std::sync::MutexGuard<'_, ClientState> {
            self.client.lock().unwrap()
        }

        fn run(&mut self, step: Step) -> Flow {
            self.steps.lock().unwrap().push_back(step);
            self.worker.step()
        }

        fn requests(&self) -> Vec<HostRequest> {
            self.requests.try_iter().collect()
        }

        /// Running, connected and recording with a streamable session
        fn streaming(&mut self) {
            {
                let mut client = self.client();
                client.alive = true;
                client.recording = true;
                client.can_stream = true;
            }
            self.worker.set_state(SinkState::Running);
            self.worker.on_session_state(SessionState::Connected);
            self.worker.on_session_state(SessionState::Recording);
        }
    }

    #[test]
    fn test_connected_registers_once() {
        let mut h = harness(udp_config(false));
        h.worker.on_session_state(SessionState::Connected);
        assert_eq!(h.worker.item.as_ref().map(PollItem::len), Some(2));
        assert!(h.worker.oob);

        h.worker.on_session_state(SessionState::Connected);
        assert_eq!(h.worker.item.as_ref().map(PollItem::len), Some(2));
        assert_eq!(h.client().registrations, 2);

        h.worker.on_session_state(SessionState::Disconnected);
        assert!(h.worker.item.is_none());
    }

    #[test]
    fn test_running_announces_when_not_alive() {
        let mut h = harness(udp_config(false));
        h.worker.set_state(SinkState::Idle);
        h.worker.set_state(SinkState::Running);
        assert_eq!(h.client().commands, vec!["announce"]);

        // Already recording: nothing more to do
        let mut h = harness(udp_config(false));
        h.client().alive = true;
        h.client().recording = true;
        h.worker.set_state(SinkState::Running);
        assert!(h.client().commands.is_empty());

        // Alive but not recording: start the stream
        let mut h = harness(udp_config(false));
        h.client().alive = true;
        h.worker.set_state(SinkState::Running);
        assert_eq!(h.client().commands, vec!["stream"]);
        assert_eq!(h.worker.timer.deadline(), Some(h.clock.now()));
    }

    #[test]
    fn test_idle_from_running_flushes() {
        let mut h = harness(udp_config(false));
        h.streaming();
        h.worker.set_state(SinkState::Idle);

        assert_eq!(h.client().commands, vec!["flush"]);
        assert!(!h.worker.timer.is_armed());
    }

    #[test]
    fn test_suspend_tears_down_live_session() {
        let mut h = harness(udp_config(false));
        h.streaming();
        h.worker.set_state(SinkState::Suspended);
        assert_eq!(h.client().commands, vec!["teardown"]);

        // Recording while suspended flushes instead of arming the timer
        h.worker.on_session_state(SessionState::Recording);
        assert!(!h.worker.timer.is_armed());
        assert_eq!(h.client().commands, vec!["teardown", "flush"]);
    }

    #[test]
    fn test_disconnect_while_suspended_stays_quiet() {
        for lost in [SessionState::Disconnected, SessionState::Invalid] {
            let mut h = harness(udp_config(true));
            h.streaming();
            h.worker.set_state(SinkState::Suspended);
            assert!(h.worker.timer.is_armed());
            h.client().commands.clear();

            h.worker.on_session_state(lost);
            assert!(h.client().commands.is_empty());
            assert!(h.requests().is_empty());
            assert!(!h.worker.timer.is_armed());
            assert!(h.worker.item.is_none());
        }
    }

    #[test]
    fn test_recording_resets_cursor() {
        let mut h = harness(udp_config(false));
        h.streaming();

        for _ in 0..4 {
            assert_eq!(h.run(Step::Tick), Flow::Continue);
        }
        assert_eq!(h.worker.write_count, 4 * BLOCK_SIZE as u64);

        h.worker.on_session_state(SessionState::Recording);
        assert_eq!(h.worker.write_count, 0);
        assert_eq!(h.worker.start, h.clock.now());
        assert_eq!(h.worker.timer.deadline(), Some(h.clock.now()));
    }

    #[test]
    fn test_cursor_is_monotonic_while_streaming() {
        let mut h = harness(udp_config(false));
        h.streaming();

        let mut last = 0;
        for _ in 0..200 {
            h.run(Step::Tick);
            assert!(h.worker.write_count >= last);
            last = h.worker.write_count;
        }
        assert_eq!(last, 200 * BLOCK_SIZE as u64);

        // Audio is paced: the timer sits at the end of what was sent
        let sent = h.worker.spec.bytes_to_duration(last);
        assert_eq!(h.worker.timer.deadline(), Some(h.worker.start + sent));
        assert_eq!(h.client().sends.len(), 200);
    }

    #[test]
    fn test_recording_pushes_mute() {
        let mut h = harness(udp_config(false));
        h.worker.set_mute(true);
        assert_eq!(h.client().volumes, vec![Volume::MUTED]);

        h.worker.set_volume(ChannelVolumes::uniform(2, Volume(0x8000)));
        assert_eq!(h.client().volumes.len(), 1);

        h.worker.on_session_state(SessionState::Recording);
        assert_eq!(h.client().volumes, vec![Volume::MUTED, Volume::MUTED]);

        h.worker.set_mute(false);
        assert_eq!(h.client().volumes.last(), Some(&Volume(0x8000)));
    }

    #[test]
    fn test_inbox_events_processed_in_order() {
        let mut h = harness(udp_config(false));
        h.mailbox.post(Event::Authenticate(Some("secret".into()))).unwrap();
        h.mailbox.post(Event::Reconnect).unwrap();

        assert_eq!(h.run(Step::Tick), Flow::Continue);
        assert_eq!(h.client().commands, vec!["authenticate", "disconnect", "authenticate"]);
    }

    #[test]
    fn test_invalid_authentication_requests_unload() {
        let mut h = harness(udp_config(true));
        h.worker.on_session_state(SessionState::Authenticated);
        assert_eq!(h.requests(), vec![HostRequest::Unload]);
        assert!(h.client().commands.is_empty());
    }

    #[test]
    fn test_authenticated_reannounces_when_running() {
        let mut h = harness(udp_config(true));
        h.worker.set_state(SinkState::Running);
        h.client().commands.clear();
        h.client().authenticated = true;

        h.worker.on_session_state(SessionState::Authenticated);
        assert_eq!(h.client().commands, vec!["announce"]);
        assert!(h.requests().is_empty());
    }

    #[test]
    fn test_disconnect_without_autoreconnect() {
        let mut h = harness(udp_config(false));
        h.worker.set_state(SinkState::Idle);
        h.worker.on_session_state(SessionState::Disconnected);
        assert!(h.requests().is_empty());

        h.worker.set_state(SinkState::Running);
        h.worker.on_session_state(SessionState::Disconnected);
        assert_eq!(h.requests(), vec![HostRequest::Unload]);
    }

    #[test]
    fn test_disconnect_with_autoreconnect_reauthenticates() {
        let mut h = harness(udp_config(true));
        h.streaming();
        h.client().commands.clear();

        h.worker.on_session_state(SessionState::Disconnected);
        assert!(h.worker.item.is_none());
        assert_eq!(h.client().commands, vec!["authenticate"]);
        // Silent sink keeps its pacing timer
        assert!(h.worker.timer.is_armed());
        assert!(h.requests().is_empty());
    }

    #[test]
    fn test_silent_sink_discards_audio() {
        let mut h = harness(udp_config(true));
        h.worker.set_state(SinkState::Running);

        for _ in 0..10 {
            h.run(Step::Tick);
        }

        assert!(h.client().sends.is_empty());
        assert_eq!(h.worker.write_count, 10 * BLOCK_SIZE as u64);
        assert_eq!(
            h.io.rendered.load(std::sync::atomic::Ordering::SeqCst),
            10 * BLOCK_SIZE
        );
        let paced = h.worker.start + h.worker.spec.bytes_to_duration(h.worker.write_count);
        assert_eq!(h.worker.timer.deadline(), Some(paced));
    }

    #[test]
    fn test_not_streamable_without_silent_sink() {
        let mut h = harness(udp_config(false));
        h.worker.set_state(SinkState::Running);
        h.run(Step::Tick);

        assert_eq!(h.io.rendered.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(h.worker.latency(), Duration::ZERO);
    }

    #[test]
    fn test_latency_after_reset_is_baseline() {
        let mut h = harness(udp_config(false));
        h.streaming();
        for _ in 0..3 {
            h.run(Step::Tick);
        }
        h.worker.on_session_state(SessionState::Recording);
        assert_eq!(h.worker.latency(), Duration::from_millis(2000));

        h.run(Step::Tick);
        assert!(h.worker.latency() >= Duration::from_millis(2000));
    }

    #[test]
    fn test_device_delay_adds_to_latency() {
        let mut config = udp_config(false);
        config.device_delay_usec = 100_000;
        let mut h = harness(config);
        h.streaming();

        for _ in 0..100 {
            h.run(Step::Tick);
        }

        let expected = Duration::from_millis(2100);
        let diff = h.worker.latency().as_secs_f64() - expected.as_secs_f64();
        assert!(diff.abs() < 0.001, "latency {:?}", h.worker.latency());
    }

    #[test]
    fn test_unstreamable_tick_keeps_pacing() {
        let mut h = harness(udp_config(false));
        h.streaming();
        h.client().can_stream = false;

        // The consumed deadline is replaced, not dropped
        assert_eq!(h.run(Step::Tick), Flow::Continue);
        assert!(h.worker.timer.is_armed());
        assert!(h.client().sends.is_empty());

        h.client().can_stream = true;
        let base = h.clock.now();
        for k in 1..=20u64 {
            h.run(Step::TickAt(base + Duration::from_millis(10 * k)));
        }
        assert!(!h.client().sends.is_empty());
        assert!(h.worker.timer.is_armed());
    }

    #[test]
    fn test_timing_watchdog_requests_one_reconnect() {
        let mut h = harness(udp_config(true));
        h.streaming();

        // Consume the initial deadline, then receive a timing packet
        h.run(Step::Tick);
        h.client().peers[1].send(b"timing").unwrap();
        h.run(Step::Ready(vec![Readiness::EMPTY, Readiness::READABLE]));
        assert_eq!(h.client().packets, vec![b"timing".to_vec()]);
        assert_eq!(h.worker.watchdog.last_timing(), Some(h.clock.now()));

        let base = h.clock.now();
        for secs in 1..=60 {
            h.run(Step::TickAt(base + Duration::from_secs(secs)));
        }

        assert_eq!(h.requests(), vec![HostRequest::Disconnect]);
        assert_eq!(h.worker.watchdog.escalation(), 1);
        assert_eq!(h.worker.watchdog.last_timing(), None);
    }

    #[test]
    fn test_control_socket_error() {
        let mut h = harness(udp_config(true));
        h.streaming();
        h.run(Step::Tick);

        h.run(Step::Ready(vec![Readiness::ERROR, Readiness::EMPTY]));
        assert_eq!(h.requests(), vec![HostRequest::Disconnect]);

        let mut h = harness(udp_config(false));
        h.streaming();
        h.run(Step::Tick);
        assert_eq!(h.run(Step::Ready(vec![Readiness::ERROR, Readiness::EMPTY])), Flow::Fail);
    }

    #[test]
    fn test_stream_would_block_retries_same_chunk() {
        let mut h = harness(tcp_config());
        h.streaming();
        assert!(!h.worker.oob);
        h.client()
            .send_results
            .push_back(Err(io::Error::from(io::ErrorKind::WouldBlock)));

        assert_eq!(h.run(Step::Ready(vec![Readiness::WRITABLE])), Flow::Continue);
        assert!(h.requests().is_empty());
        assert_eq!(h.worker.write_count, 0);
        let slot_events = h.worker.item.as_ref().map(|i| i.slots()[0].events);
        assert_eq!(slot_events, Some(Readiness::WRITABLE));

        assert_eq!(h.run(Step::Ready(vec![Readiness::WRITABLE])), Flow::Continue);
        assert_eq!(h.worker.write_count, BLOCK_SIZE as u64);
        assert_eq!(h.client().sends, vec![(0, BLOCK_SIZE), (0, BLOCK_SIZE)]);
        assert_eq!(h.io.rendered.load(std::sync::atomic::Ordering::SeqCst), BLOCK_SIZE);
    }

    #[test]
    fn test_stream_partial_write_arms_socket() {
        let mut h = harness(tcp_config());
        h.streaming();
        h.client().send_results.push_back(Ok(100));

        h.run(Step::Ready(vec![Readiness::WRITABLE]));
        assert_eq!(h.worker.write_count, 100);
        assert_eq!(h.worker.chunk.as_ref().map(Chunk::len), Some(BLOCK_SIZE - 100));

        // Woken without readiness: keep waiting for the socket
        h.run(Step::Tick);
        assert_eq!(h.client().sends.len(), 1);

        h.run(Step::Ready(vec![Readiness::WRITABLE]));
        assert_eq!(h.worker.write_count, BLOCK_SIZE as u64);
        assert!(h.worker.chunk.is_none());
        let slot_events = h.worker.item.as_ref().map(|i| i.slots()[0].events);
        assert_eq!(slot_events, Some(Readiness::EMPTY));
    }

    #[test]
    fn test_send_failure_with_autoreconnect() {
        let mut h = harness(udp_config(true));
        h.streaming();
        h.client()
            .send_results
            .push_back(Err(io::Error::from(io::ErrorKind::ConnectionRefused)));

        assert_eq!(h.run(Step::Tick), Flow::Continue);
        assert_eq!(h.requests(), vec![HostRequest::Disconnect]);
    }

    #[test]
    fn test_interrupted_send_goes_to_recovery() {
        let mut h = harness(udp_config(true));
        h.streaming();
        h.client()
            .send_results
            .push_back(Err(io::Error::from(io::ErrorKind::Interrupted)));
        assert_eq!(h.run(Step::Tick), Flow::Continue);
        assert_eq!(h.requests(), vec![HostRequest::Disconnect]);

        let mut h = harness(udp_config(false));
        h.streaming();
        h.client()
            .send_results
            .push_back(Err(io::Error::from(io::ErrorKind::Interrupted)));
        assert_eq!(h.run(Step::Tick), Flow::Fail);
    }

    #[test]
    fn test_datagram_would_block_goes_to_recovery() {
        let mut h = harness(udp_config(true));
        h.streaming();
        h.client()
            .send_results
            .push_back(Err(io::Error::from(io::ErrorKind::WouldBlock)));

        assert_eq!(h.run(Step::Tick), Flow::Continue);
        assert_eq!(h.requests(), vec![HostRequest::Disconnect]);
        assert_eq!(h.worker.write_count, 0);
        let slot_events = h.worker.item.as_ref().map(|i| i.slots()[0].events);
        assert_eq!(slot_events, Some(Readiness::READABLE));
    }

    #[test]
    fn test_fatal_path_waits_for_shutdown() {
        let mut h = harness(udp_config(false));
        h.streaming();
        h.client()
            .send_results
            .push_back(Err(io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert_eq!(h.run(Step::Tick), Flow::Fail);

        let (latency_tx, latency_rx) = crossbeam_channel::bounded(1);
        let (state_tx, state_rx) = crossbeam_channel::bounded(1);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        h.mailbox.calls.send(Call::Latency { reply: latency_tx }).unwrap();
        h.mailbox
            .calls
            .send(Call::SetState {
                state: SinkState::Unlinked,
                ack: state_tx,
            })
            .unwrap();
        h.mailbox.calls.send(Call::Shutdown { ack: shutdown_tx }).unwrap();

        h.worker.fail();

        assert_eq!(h.requests(), vec![HostRequest::Unload]);
        assert_eq!(latency_rx.try_recv(), Ok(Duration::ZERO));
        assert_eq!(state_rx.try_recv(), Ok(()));
        assert_eq!(shutdown_rx.try_recv(), Ok(()));
    }

    #[test]
    fn test_wait_error_is_fatal() {
        let mut h = harness(udp_config(true));
        assert_eq!(h.run(Step::Fail), Flow::Fail);
    }

    #[test]
    fn test_shutdown_call_quits() {
        let mut h = harness(udp_config(false));
        let (ack, acked) = crossbeam_channel::bounded(1);
        h.mailbox.calls.send(Call::Shutdown { ack }).unwrap();
        assert_eq!(h.run(Step::Tick), Flow::Quit);
        assert_eq!(acked.try_recv(), Ok(()));
    }

    #[test]
    fn test_rewind_serviced_when_opened() {
        let mut h = harness(udp_config(false));
        h.io.rewind_pending = true;
        h.worker.io = Box::new(h.io.clone());

        h.run(Step::Tick);
        assert_eq!(h.io.rewinds.load(std::sync::atomic::Ordering::SeqCst), 0);

        h.worker.set_state(SinkState::Idle);
        h.run(Step::Tick);
        assert_eq!(h.io.rewinds.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    fn session_state() -> impl Strategy<Value = SessionState> {
        prop_oneof![
            Just(SessionState::Authenticated),
            Just(SessionState::Connected),
            Just(SessionState::Recording),
            Just(SessionState::Disconnected),
            Just(SessionState::Invalid),
        ]
    }

    proptest! {
        #[test]
        fn prop_at_most_one_registration(
            states in proptest::collection::vec(session_state(), 1..24),
            autoreconnect in any::<bool>(),
        ) {
            let mut h = harness(udp_config(autoreconnect));
            h.worker.set_state(SinkState::Running);

            let mut registered = false;
            for state in states {
                h.worker.on_session_state(state);
                match state {
                    SessionState::Connected => registered = true,
                    SessionState::Disconnected | SessionState::Invalid => registered = false,
                    _ => {}
                }
                prop_assert_eq!(h.worker.item.is_some(), registered);
                if let Some(item) = h.worker.item.as_ref() {
                    prop_assert_eq!(item.len(), 2);
                }
            }
        }
    }
}
