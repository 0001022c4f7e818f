//! Circuit breaker protecting a single subject (an information provider, a
//! chain lane) from cascade failures.
//!
//! Closed until `threshold` consecutive failures, then open for `cooldown`:
//! no request addressed to the subject proceeds until the next-retry time
//! has elapsed. After that, attempts pass through again and one success
//! closes the breaker and resets the counter.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct BreakerState {
    is_open: bool,
    consecutive_failures: u64,
    last_failure: Option<Instant>,
    next_retry: Option<Instant>,
    total_failures: u64,
    total_successes: u64,
    trips: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    subject: String,
    threshold: u64,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

/// Snapshot of breaker state for status reporting.
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub subject: String,
    pub is_open: bool,
    pub consecutive_failures: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub trips: u64,
    pub next_retry_in: Option<Duration>,
}

impl CircuitBreaker {
    pub fn new(subject: impl Into<String>, threshold: u64, cooldown: Duration) -> Self {
        Self {
            subject: subject.into(),
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState {
                is_open: false,
                consecutive_failures: 0,
                last_failure: None,
                next_retry: None,
                total_failures: 0,
                total_successes: 0,
                trips: 0,
            }),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Whether a request addressed to the subject may proceed right now.
    /// Once the cooldown has elapsed the gate opens for probe traffic; the
    /// breaker itself stays open until a success is recorded.
    pub async fn allows_request(&self) -> bool {
        let state = self.state.lock().await;
        if !state.is_open {
            return true;
        }
        match state.next_retry {
            Some(at) => Instant::now() >= at,
            None => true,
        }
    }

    /// True while the breaker is open, regardless of the retry gate. Used by
    /// selection filters that must not route ordinary traffic to a tripped
    /// subject.
    pub async fn is_open(&self) -> bool {
        self.state.lock().await.is_open
    }

    /// Record a failed call. Opens the breaker when the consecutive-failure
    /// count reaches the threshold; an already-open breaker pushes its
    /// next-retry time forward.
    ///
    /// Returns `true` when this call tripped the breaker open.
    pub async fn record_failure(&self) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.total_failures = state.total_failures.saturating_add(1);
        state.last_failure = Some(now);

        if state.consecutive_failures >= self.threshold {
            let newly_tripped = !state.is_open;
            if newly_tripped {
                state.trips = state.trips.saturating_add(1);
                warn!(
                    subject = %self.subject,
                    failures = state.consecutive_failures,
                    cooldown_secs = self.cooldown.as_secs(),
                    "circuit breaker opened"
                );
            } else {
                debug!(subject = %self.subject, "open breaker absorbed another failure");
            }
            state.is_open = true;
            state.next_retry = Some(now + self.cooldown);
            return newly_tripped;
        }
        false
    }

    /// Record a successful call: closes the breaker and resets the counter.
    ///
    /// Returns `true` when this call closed a previously open breaker.
    pub async fn record_success(&self) -> bool {
        let mut state = self.state.lock().await;
        state.total_successes = state.total_successes.saturating_add(1);
        state.consecutive_failures = 0;
        if state.is_open {
            state.is_open = false;
            state.next_retry = None;
            info!(subject = %self.subject, "circuit breaker closed");
            return true;
        }
        false
    }

    pub async fn stats(&self) -> BreakerStats {
        let state = self.state.lock().await;
        BreakerStats {
            subject: self.subject.clone(),
            is_open: state.is_open,
            consecutive_failures: state.consecutive_failures,
            total_failures: state.total_failures,
            total_successes: state.total_successes,
            trips: state.trips,
            next_retry_in: state
                .next_retry
                .and_then(|at| at.checked_duration_since(Instant::now())),
        }
    }
}
