//! Wall-clock sources and reconciliation against the room server's clock.
//!
//! All times are seconds since the Unix epoch as `f64`. Peers never share a
//! clock, so every timestamp put on the wire goes through [`ClockSync::now`].

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::constants::{CLOCK_PROBE_TIMEOUT, CLOCK_REPROBE_INTERVAL};
use crate::protocol::ClientCommand;

/// Source of local wall-clock time.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|dur| dur.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Hand-driven clock, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, secs: f64) {
        *self.now.lock() += secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ClockError {
    #[error("no time probe is outstanding")]
    NoProbePending,
    #[error("reply echoes client time {echoed}, outstanding probe was sent at {sent}")]
    StaleReply { echoed: f64, sent: f64 },
    #[error("reply arrived {0:.3}s before its probe was sent")]
    NegativeRoundTrip(f64),
}

#[derive(Debug, Clone, Copy)]
struct PendingProbe {
    sent_at: f64,
}

/// Estimates the offset between the local clock and the server's clock.
///
/// Until the first probe completes the correction is zero and every derived
/// position is only approximate.
#[derive(Debug, Clone)]
pub struct ClockSync {
    correction: f64,
    pending: Option<PendingProbe>,
    calibrated_at: Option<f64>,
    probe_timeout: f64,
    reprobe_interval: f64,
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new(CLOCK_PROBE_TIMEOUT, CLOCK_REPROBE_INTERVAL)
    }
}

impl ClockSync {
    pub fn new(probe_timeout: Duration, reprobe_interval: Duration) -> Self {
        Self {
            correction: 0.0,
            pending: None,
            calibrated_at: None,
            probe_timeout: probe_timeout.as_secs_f64(),
            reprobe_interval: reprobe_interval.as_secs_f64(),
        }
    }

    pub fn correction(&self) -> f64 {
        self.correction
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated_at.is_some()
    }

    /// Corrected time for a local clock reading.
    pub fn now(&self, local_now: f64) -> f64 {
        local_now - self.correction
    }

    /// Start a probe unless one is already in flight and not yet timed out.
    pub fn request_reference_time(&mut self, local_now: f64) -> Option<ClientCommand> {
        if let Some(pending) = self.pending {
            if local_now - pending.sent_at < self.probe_timeout {
                return None;
            }
            tracing::warn!(
                "Time probe sent at {:.3} went unanswered; sending a new one",
                pending.sent_at
            );
        }
        self.pending = Some(PendingProbe {
            sent_at: local_now,
        });
        Some(ClientCommand::ServerTimeRequest { time: local_now })
    }

    /// Apply the server's answer to the outstanding probe.
    ///
    /// One-way delay is taken as half the round trip; the server's reading is
    /// moved forward by it before being compared with the local clock.
    pub fn complete_probe(
        &mut self,
        client_time: f64,
        server_time: f64,
        local_now: f64,
    ) -> Result<f64, ClockError> {
        let pending = self.pending.ok_or(ClockError::NoProbePending)?;
        if (pending.sent_at - client_time).abs() > 1e-6 {
            return Err(ClockError::StaleReply {
                echoed: client_time,
                sent: pending.sent_at,
            });
        }
        let round_trip = local_now - client_time;
        if round_trip < 0.0 {
            return Err(ClockError::NegativeRoundTrip(round_trip));
        }

        let reference_now = server_time + round_trip / 2.0;
        self.correction = local_now - reference_now;
        self.pending = None;
        self.calibrated_at = Some(local_now);
        Ok(self.correction)
    }

    /// Whether a new probe should go out: the last one timed out, or the
    /// current estimate is older than the re-probe interval.
    pub fn probe_due(&self, local_now: f64) -> bool {
        match (self.pending, self.calibrated_at) {
            (Some(pending), _) => local_now - pending.sent_at >= self.probe_timeout,
            (None, Some(at)) => local_now - at >= self.reprobe_interval,
            (None, None) => false,
        }
    }
}
