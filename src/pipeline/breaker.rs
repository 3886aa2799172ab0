//! Circuit breakers for the two external services
//!
//! Lock-free: state, consecutive-failure count, and last-failure time all
//! live in atomics. Closed counts failures; at the threshold the breaker
//! opens and calls fail fast until the recovery timeout elapses, then a
//! single half-open probe decides between closing and re-opening.

use crate::config::BreakerConfig;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn label(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

/// Failure-rate gate for one downstream service.
pub struct CircuitBreaker {
    service: &'static str,
    state: AtomicU8,
    failures: AtomicU32,
    /// Millis since `epoch` of the most recent failure.
    last_failure_ms: AtomicU64,
    epoch: Instant,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(service: &'static str, config: &BreakerConfig) -> Self {
        Self {
            service,
            state: AtomicU8::new(STATE_CLOSED),
            failures: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            failure_threshold: config.failure_threshold,
            recovery_timeout: Duration::from_millis(config.recovery_timeout_ms),
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Gate a call. `Err(())` means fail fast without touching the service.
    /// While open, the first caller past the recovery timeout flips the
    /// breaker to half-open and is let through as the probe.
    pub fn check(&self) -> Result<(), ()> {
        match self.state() {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let last = Duration::from_millis(self.last_failure_ms.load(Ordering::Acquire));
                if self.epoch.elapsed().saturating_sub(last) >= self.recovery_timeout {
                    // Single transition wins; losers keep failing fast.
                    if self
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        warn!(service = self.service, "circuit breaker half-open, probing");
                        return Ok(());
                    }
                    // Someone else became the probe.
                    if self.state() == BreakerState::HalfOpen {
                        return Ok(());
                    }
                    return Err(());
                }
                Err(())
            }
        }
    }

    pub fn record_success(&self) {
        let previous = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        self.failures.store(0, Ordering::Release);
        if previous != STATE_CLOSED {
            warn!(service = self.service, "circuit breaker closed after success");
        }
    }

    pub fn record_failure(&self) {
        self.last_failure_ms.store(
            self.epoch.elapsed().as_millis() as u64,
            Ordering::Release,
        );

        match self.state() {
            BreakerState::HalfOpen => {
                // Probe failed: straight back to open.
                self.state.store(STATE_OPEN, Ordering::Release);
                warn!(service = self.service, "circuit breaker re-opened after failed probe");
            }
            BreakerState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.failure_threshold {
                    self.state.store(STATE_OPEN, Ordering::Release);
                    warn!(
                        service = self.service,
                        failures, "circuit breaker opened"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }
}
