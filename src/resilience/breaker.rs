//! Circuit breaker
//!
//! Closed → Open once the failure counter reaches the threshold. Open → HalfOpen
//! once the reset timeout has elapsed since the last failure. HalfOpen admits
//! a single probe: its success closes the circuit and zeroes the counter, its
//! failure re-opens it. Successes while closed leave the counter alone.
//!
//! Callers take a [`Permit`] and settle it with `success()` or `failure()`.
//! A probe permit dropped unsettled (served from cache, cancelled future)
//! hands the probe back, so the next caller may probe instead. Only the probe
//! itself can close a half-open circuit; a success from a call admitted
//! while the circuit was still closed does not.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

/// Outcome of asking the breaker for permission to call upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; call normally.
    Closed,
    /// Caller holds the single half-open probe.
    Probe,
    /// Circuit open (or a probe is already outstanding).
    Rejected,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    // id of the outstanding probe
    probe: Option<u64>,
    next_probe: u64,
    trips: u64,
}

impl BreakerInner {
    fn start_probe(&mut self) -> u64 {
        self.next_probe += 1;
        self.probe = Some(self.next_probe);
        self.next_probe
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.probe = None;
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Permission to make one upstream attempt.
///
/// Dropping an unsettled probe permit releases the probe.
#[must_use]
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    probe_id: u64,
    settled: bool,
}

impl Permit<'_> {
    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn is_probe(&self) -> bool {
        self.admission == Admission::Probe
    }

    pub fn success(mut self) {
        self.settled = true;
        if self.is_probe() {
            self.breaker.probe_succeeded(self.probe_id);
        }
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.is_probe() {
            self.breaker.release_probe_id(self.probe_id);
        }
    }
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg: BreakerConfig {
                failure_threshold: cfg.failure_threshold.max(1),
                reset_timeout: cfg.reset_timeout,
            },
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                probe: None,
                next_probe: 0,
                trips: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit_with_id(&self) -> (Admission, u64) {
        let reset = self.cfg.reset_timeout;
        let mut s = self.lock();
        match s.state {
            CircuitState::Closed => (Admission::Closed, 0),
            CircuitState::Open => {
                let cooled = s.last_failure.map_or(true, |t| t.elapsed() >= reset);
                if !cooled {
                    return (Admission::Rejected, 0);
                }
                s.state = CircuitState::HalfOpen;
                info!("circuit half-open; admitting probe");
                let id = s.start_probe();
                (Admission::Probe, id)
            }
            CircuitState::HalfOpen => {
                if s.probe.is_some() {
                    return (Admission::Rejected, 0);
                }
                let id = s.start_probe();
                (Admission::Probe, id)
            }
        }
    }

    /// Ask to call upstream; may move Open → HalfOpen.
    ///
    /// A `Probe` admission must be followed by `record_success`,
    /// `record_failure` or `release_probe`; prefer [`permit`](Self::permit).
    pub fn admit(&self) -> Admission {
        self.admit_with_id().0
    }

    /// Permit for one attempt, or `None` when the circuit rejects the call.
    pub fn permit(&self) -> Option<Permit<'_>> {
        let (admission, probe_id) = self.admit_with_id();
        (admission != Admission::Rejected).then_some(Permit {
            breaker: self,
            admission,
            probe_id,
            settled: false,
        })
    }

    /// True when a call may proceed. Same transition rules as [`admit`](Self::admit).
    pub fn is_closed(&self) -> bool {
        self.admit() != Admission::Rejected
    }

    pub fn record_success(&self) {
        let mut s = self.lock();
        if s.state == CircuitState::HalfOpen {
            s.close();
            info!("circuit closed after successful probe");
        }
    }

    pub fn record_failure(&self) {
        let threshold = self.cfg.failure_threshold;
        let mut s = self.lock();
        s.failures = s.failures.saturating_add(1);
        s.last_failure = Some(Instant::now());
        let reopen = s.state == CircuitState::HalfOpen;
        if s.state != CircuitState::Open && (reopen || s.failures >= threshold) {
            s.state = CircuitState::Open;
            s.probe = None;
            s.trips += 1;
            warn!(failures = s.failures, threshold, "circuit opened");
        }
    }

    /// Give back the outstanding probe without an outcome.
    pub fn release_probe(&self) {
        let mut s = self.lock();
        if s.state == CircuitState::HalfOpen {
            s.probe = None;
        }
    }

    fn probe_succeeded(&self, id: u64) {
        let mut s = self.lock();
        if s.state == CircuitState::HalfOpen && s.probe == Some(id) {
            s.close();
            info!("circuit closed after successful probe");
        } else {
            debug!(state = ?s.state, "stale probe success ignored");
        }
    }

    fn release_probe_id(&self, id: u64) {
        let mut s = self.lock();
        if s.state == CircuitState::HalfOpen && s.probe == Some(id) {
            s.probe = None;
        }
    }

    /// Force the circuit closed and forget all failures.
    pub fn reset(&self) {
        let mut s = self.lock();
        s.close();
        s.last_failure = None;
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// How many times the circuit has opened.
    pub fn trips(&self) -> u64 {
        self.lock().trips
    }

    pub fn config(&self) -> BreakerConfig {
        self.cfg
    }
}
