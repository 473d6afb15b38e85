//! Circuit breaker shared by every call to the memory worker.
//!
//! Capture sends and context reads go through the same instance: they hit the
//! same dependency, so they share its fate.
//!
//! ```text
//! CLOSED    --failure_threshold consecutive failures--> OPEN
//! OPEN      --recovery_timeout elapsed, next call-----> HALF_OPEN (that call probes)
//! HALF_OPEN --probe ok-------------------------------> CLOSED
//! HALF_OPEN --probe failed---------------------------> OPEN (open time reset)
//! ```
//!
//! Transitions happen under one mutex. Only one probe may be in flight while
//! HALF_OPEN; that guard is a compare-exchange on an atomic flag, released by a
//! drop guard so a cancelled probe cannot wedge the breaker.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::Config;
use crate::error::{CallError, RemoteError};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn as_u8(self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Breaker tuning
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,

    /// Time spent OPEN before a probe is allowed
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for BreakerConfig {
    fn from(config: &Config) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout(),
        }
    }
}

/// Point-in-time view for health reporting
#[derive(Debug, Clone, Copy)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,

    /// How long the breaker has been away from CLOSED in the current outage
    pub open_for: Option<Duration>,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    /// Last time the breaker (re)opened; drives the recovery timeout
    opened_at: Option<Instant>,
    /// First time it opened in this outage; survives failed probes
    open_since: Option<Instant>,
}

/// Shared three-state circuit breaker
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    /// Relaxed mirror of `inner.state` for lock-free reads
    state_hint: AtomicU8,
    probe_in_flight: AtomicBool,
}

enum Admission<'a> {
    Pass,
    Probe(ProbeGuard<'a>),
}

struct ProbeGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                open_since: None,
            }),
            state_hint: AtomicU8::new(BreakerState::Closed.as_u8()),
            probe_in_flight: AtomicBool::new(false),
        }
    }

    /// Run `op` if the breaker lets it through.
    ///
    /// Returns `CallError::ShortCircuited` without calling `op` when the
    /// breaker is open or another probe is already running. Short-circuits are
    /// not failures and never move the failure counter.
    ///
    /// Only transient errors count against the worker. A permanent error means
    /// the worker answered, so for the breaker it is a sign of life.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let admission = match self.admit() {
            Ok(admission) => admission,
            Err(err) => {
                tracing::debug!(state = %self.state(), "Call short-circuited");
                return Err(err);
            }
        };

        let result = op().await;
        match &result {
            Err(err) if err.is_transient() => self.on_failure(&admission, err),
            _ => self.on_success(&admission),
        }
        drop(admission);

        result.map_err(CallError::Remote)
    }

    /// Current state. May lag a concurrent transition by a moment.
    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state_hint.load(Ordering::Relaxed))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            open_for: inner.open_since.map(|since| since.elapsed()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut BreakerInner, state: BreakerState) {
        inner.state = state;
        self.state_hint.store(state.as_u8(), Ordering::Relaxed);
    }

    fn admit(&self) -> Result<Admission<'_>, CallError> {
        if self.state() == BreakerState::HalfOpen && self.probe_in_flight.load(Ordering::Acquire) {
            return Err(CallError::ShortCircuited);
        }

        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(Admission::Pass),
            BreakerState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout);
                if !cooled_down {
                    return Err(CallError::ShortCircuited);
                }
                self.set_state(&mut inner, BreakerState::HalfOpen);
                tracing::info!("Circuit breaker half-open, probing memory worker");
                self.try_probe()
            }
            BreakerState::HalfOpen => self.try_probe(),
        }
    }

    fn try_probe(&self) -> Result<Admission<'_>, CallError> {
        self.probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| {
                Admission::Probe(ProbeGuard {
                    flag: &self.probe_in_flight,
                })
            })
            .map_err(|_| CallError::ShortCircuited)
    }

    fn on_success(&self, admission: &Admission<'_>) {
        let mut inner = self.lock();
        match admission {
            Admission::Probe(_) => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.open_since = None;
                self.set_state(&mut inner, BreakerState::Closed);
                tracing::info!("Circuit breaker closed, memory worker recovered");
            }
            Admission::Pass => {
                if inner.state == BreakerState::Closed {
                    inner.consecutive_failures = 0;
                }
            }
        }
    }

    fn on_failure(&self, admission: &Admission<'_>, err: &RemoteError) {
        let mut inner = self.lock();
        match admission {
            Admission::Probe(_) => {
                inner.opened_at = Some(Instant::now());
                self.set_state(&mut inner, BreakerState::Open);
                tracing::warn!(error = %err, "Probe failed, circuit breaker re-opened");
            }
            Admission::Pass => {
                if inner.state != BreakerState::Closed {
                    return;
                }
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    let now = Instant::now();
                    inner.opened_at = Some(now);
                    inner.open_since = Some(now);
                    self.set_state(&mut inner, BreakerState::Open);
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        error = %err,
                        "Circuit breaker opened"
                    );
                }
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
