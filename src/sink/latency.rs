//! Transport latency estimation
//!
//! The worker reports how much audio the receiver should have played by a
//! given time (bytes sent minus the configured device delay). The estimator
//! fits a line through those samples: an anchor point that follows the most
//! recent observation and a playback rate smoothed over a fixed window. The
//! transport delay at any time is the distance between what was sent and what
//! the line says has been played.

use std::time::Duration;

use crate::audio::SampleSpec;

#[derive(Debug, Clone, Copy)]
struct Anchor {
    at: Duration,
    played: Duration,
}

#[derive(Debug, Clone)]
pub struct LatencyEstimator {
    spec: SampleSpec,
    window: Duration,
    baseline: Duration,
    /// Samples taken before the last reset are stale
    origin: Duration,
    anchor: Option<Anchor>,
    /// Seconds of audio played per second of wall time
    rate: f64,
}

impl LatencyEstimator {
    pub fn new(spec: SampleSpec, window: Duration, baseline: Duration) -> Self {
        Self {
            spec,
            window,
            baseline,
            origin: Duration::ZERO,
            anchor: None,
            rate: 1.0,
        }
    }

    /// Drop all history. The next sample at or after `at` starts a fresh line.
    pub fn reset(&mut self, at: Duration) {
        tracing::trace!("Latency estimator reset at {:?}", at);
        self.origin = at;
        self.anchor = None;
        self.rate = 1.0;
    }

    /// Record that `position` bytes should have been played at `at`
    pub fn put(&mut self, at: Duration, position: u64) {
        if at < self.origin {
            tracing::trace!("Ignoring latency sample from before reset at {:?}", at);
            return;
        }

        let played = self.spec.bytes_to_duration(position);

        let Some(anchor) = self.anchor else {
            self.anchor = Some(Anchor { at, played });
            return;
        };

        if at < anchor.at {
            tracing::trace!("Ignoring out-of-order latency sample at {:?}", at);
            return;
        }

        let dt = (at - anchor.at).as_secs_f64();
        if dt > 0.0 {
            let observed = (played.as_secs_f64() - anchor.played.as_secs_f64()) / dt;
            let weight = (dt / self.window.as_secs_f64()).min(1.0);
            self.rate += weight * (observed - self.rate);
            if self.rate < 0.0 {
                self.rate = 0.0;
            }
        }

        self.anchor = Some(Anchor { at, played });
    }

    /// Estimated audio played by `at`
    fn played(&self, at: Duration) -> Option<Duration> {
        let anchor = self.anchor?;
        let elapsed = at.saturating_sub(anchor.at).as_secs_f64();
        let extrapolated = anchor.played.as_secs_f64() + elapsed * self.rate;
        Some(Duration::from_secs_f64(extrapolated.max(0.0)))
    }

    /// Audio sent but not yet played, zero without history
    pub fn transport_delay(&self, at: Duration, sent: u64) -> Duration {
        match self.played(at) {
            Some(played) => self.spec.bytes_to_duration(sent).saturating_sub(played),
            None => Duration::ZERO,
        }
    }

    /// Total latency: transport delay plus the receiver's fixed latency
    pub fn estimate(&self, at: Duration, sent: u64) -> Duration {
        self.transport_delay(at, sent) + self.baseline
    }

    pub fn baseline(&self) -> Duration {
        self.baseline
    }
}
