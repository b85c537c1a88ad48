//! Readiness multiplexer for the streaming worker
//!
//! The worker blocks in exactly one place: waiting for any of the session
//! sockets, the deadline timer or the inbox waker. Socket slots own their
//! descriptors, so releasing a registration closes every socket exactly once.

use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;

/// Readiness flags, used both for requested events and reported events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness(u8);

impl Readiness {
    pub const EMPTY: Readiness = Readiness(0);
    pub const READABLE: Readiness = Readiness(1);
    pub const WRITABLE: Readiness = Readiness(1 << 1);
    pub const ERROR: Readiness = Readiness(1 << 2);
    pub const HANGUP: Readiness = Readiness(1 << 3);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0 && !other.is_empty()
    }

    pub fn intersects(self, other: Readiness) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }

    fn to_poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.contains(Self::READABLE) {
            events |= libc::POLLIN;
        }
        if self.contains(Self::WRITABLE) {
            events |= libc::POLLOUT;
        }
        events
    }

    fn from_poll_events(revents: libc::c_short) -> Self {
        let mut r = Self::EMPTY;
        if revents & libc::POLLIN != 0 {
            r = r | Self::READABLE;
        }
        if revents & libc::POLLOUT != 0 {
            r = r | Self::WRITABLE;
        }
        if revents & libc::POLLERR != 0 {
            r = r | Self::ERROR;
        }
        if revents & libc::POLLHUP != 0 {
            r = r | Self::HANGUP;
        }
        r
    }
}

impl std::ops::BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

/// One watched socket
#[derive(Debug)]
pub struct PollSlot {
    fd: OwnedFd,
    pub events: Readiness,
    pub revents: Readiness,
}

impl PollSlot {
    pub fn new(fd: OwnedFd, events: Readiness) -> Self {
        Self {
            fd,
            events,
            revents: Readiness::EMPTY,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Wait for the socket to accept more data
    pub fn arm_write(&mut self) {
        self.events = Readiness::WRITABLE;
        self.revents = Readiness::EMPTY;
    }

    /// Stop watching the socket until re-armed
    pub fn disarm(&mut self) {
        self.events = Readiness::EMPTY;
        self.revents = Readiness::EMPTY;
    }
}

/// The set of sockets registered by the client for the current session
#[derive(Debug, Default)]
pub struct PollItem {
    slots: Vec<PollSlot>,
}

impl PollItem {
    pub fn new(slots: Vec<PollSlot>) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[PollSlot] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [PollSlot] {
        &mut self.slots
    }

    /// Whether the last wait reported anything on any slot
    pub fn has_revents(&self) -> bool {
        self.slots.iter().any(|s| !s.revents.is_empty())
    }

    pub fn arm_write(&mut self) {
        self.slots.iter_mut().for_each(PollSlot::arm_write);
    }

    pub fn disarm(&mut self) {
        self.slots.iter_mut().for_each(PollSlot::disarm);
    }
}

/// One-shot absolute deadline
#[derive(Debug, Default, Clone, Copy)]
pub struct Timer {
    deadline: Option<Duration>,
}

impl Timer {
    pub fn set_absolute(&mut self, at: Duration) {
        self.deadline = Some(at);
    }

    pub fn disable(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Report whether the deadline has passed, disarming it if so
    pub fn take_elapsed(&mut self, now: Duration) -> bool {
        match self.deadline {
            Some(at) if at <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Blocking readiness wait
pub trait Wait: Send {
    /// Block until a slot of `item` is ready, `deadline` passes or the inbox
    /// is signalled. Reported readiness is stored in each slot's `revents`.
    fn wait(&mut self, item: Option<&mut PollItem>, deadline: Option<Duration>) -> io::Result<()>;
}

/// Wakes the worker out of its wait when a message is posted
#[derive(Debug)]
pub struct Waker {
    tx: UnixDatagram,
}

impl Waker {
    pub fn wake(&self) {
        match self.tx.send(&[1]) {
            Ok(_) => {}
            // A full socket already guarantees a wakeup
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => tracing::debug!("Failed to wake worker: {}", e),
        }
    }
}

/// `poll(2)` based multiplexer
pub struct FdPoller {
    waker_rx: UnixDatagram,
    clock: Arc<dyn Clock>,
    fds: Vec<libc::pollfd>,
}

impl FdPoller {
    pub fn new(clock: Arc<dyn Clock>) -> io::Result<(Self, Arc<Waker>)> {
        let (tx, rx) = UnixDatagram::pair()?;
        tx.set_nonblocking(true)?;
        rx.set_nonblocking(true)?;

        let poller = Self {
            waker_rx: rx,
            clock,
            fds: Vec::with_capacity(4),
        };
        Ok((poller, Arc::new(Waker { tx })))
    }

    fn timeout_ms(&self, deadline: Option<Duration>) -> libc::c_int {
        match deadline {
            None => -1,
            Some(at) => {
                let left = at.saturating_sub(self.clock.now());
                // Round up so the deadline has passed when poll returns
                let ms = (left.as_micros() + 999) / 1000;
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        }
    }

    fn drain_waker(&self) {
        let mut buf = [0u8; 64];
        while self.waker_rx.recv(&mut buf).is_ok() {}
    }
}

impl Wait for FdPoller {
    fn wait(&mut self, mut item: Option<&mut PollItem>, deadline: Option<Duration>) -> io::Result<()> {
        self.fds.clear();
        self.fds.push(libc::pollfd {
            fd: self.waker_rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        if let Some(item) = item.as_deref() {
            for slot in item.slots() {
                self.fds.push(libc::pollfd {
                    fd: slot.raw_fd(),
                    events: slot.events.to_poll_events(),
                    revents: 0,
                });
            }
        }

        loop {
            let timeout = self.timeout_ms(deadline);
            // SAFETY: `fds` is a valid, exclusively borrowed array of pollfd
            // whose descriptors stay open for the duration of the call.
            let ret = unsafe {
                libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout)
            };
            if ret >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }

        if self.fds[0].revents != 0 {
            self.drain_waker();
        }

        if let Some(item) = item.as_deref_mut() {
            for (slot, pfd) in item.slots_mut().iter_mut().zip(&self.fds[1..]) {
                slot.revents = Readiness::from_poll_events(pfd.revents);
            }
        }

        Ok(())
    }
}

/// Read one bounded control packet from a session socket
pub fn read_packet(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    let sock = socket2::SockRef::from(&fd);
    let mut reader: &socket2::Socket = &sock;
    reader.read(buf)
}
