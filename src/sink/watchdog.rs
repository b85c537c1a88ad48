//! Timing-packet loss detection for datagram sessions
//!
//! Receivers send timing packets every few seconds. Silence on the timing
//! channel is reported in escalating steps of `loss_max / cycle`; after the
//! last step the session is presumed dead and a reconnect is requested, once.

use std::time::Duration;

use crate::config::TimingConfig;

/// Outcome of a watchdog check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Quiet,
    /// Escalation step `step` of `cycle - 1` passed
    Warn { step: u32, since: Duration },
    /// Silence exceeded the loss limit; history has been cleared
    Reconnect { since: Duration },
}

#[derive(Debug, Clone)]
pub struct TimingWatchdog {
    loss_max: Duration,
    cycle: u32,
    last_timing: Option<Duration>,
    escalation: u32,
}

impl TimingWatchdog {
    pub fn new(config: &TimingConfig) -> Self {
        Self {
            loss_max: config.loss_max(),
            cycle: config.disconnect_cycle.max(1),
            last_timing: None,
            escalation: 1,
        }
    }

    pub fn on_timing_packet(&mut self, now: Duration) {
        self.last_timing = Some(now);
        self.escalation = 1;
    }

    /// Back to "no timing data yet"
    pub fn clear(&mut self) {
        self.last_timing = None;
        self.escalation = 1;
    }

    pub fn last_timing(&self) -> Option<Duration> {
        self.last_timing
    }

    pub fn escalation(&self) -> u32 {
        self.escalation
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    fn threshold(&self) -> Duration {
        self.loss_max / self.cycle * self.escalation
    }

    pub fn check(&mut self, now: Duration) -> Verdict {
        let Some(last) = self.last_timing else {
            return Verdict::Quiet;
        };

        let since = now.saturating_sub(last);
        if since <= self.threshold() {
            return Verdict::Quiet;
        }

        if self.escalation < self.cycle {
            let step = self.escalation;
            self.escalation += 1;
            Verdict::Warn { step, since }
        } else {
            self.clear();
            Verdict::Reconnect { since }
        }
    }
}
