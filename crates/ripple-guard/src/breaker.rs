//! Circuit breakers for external dependencies.
//!
//! Three states: CLOSED admits calls, OPEN fails them immediately,
//! HALF_OPEN probes with a limited number of calls after the reset
//! timeout. Failures are counted within a sliding window.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within the window that trip the breaker.
    pub failure_threshold: usize,
    /// Window over which failures are counted.
    pub failure_window: Duration,
    /// How long the breaker stays open before probing.
    pub reset_timeout: Duration,
    /// Successful probes needed to close again.
    pub success_threshold: usize,
    /// Per-call timeout.
    pub timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Failure surfaced by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker is open; the call was not attempted.
    #[error("circuit breaker '{0}' is open")]
    Open(String),

    /// The call exceeded the per-call timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The call itself failed.
    #[error("operation failed: {0}")]
    Inner(E),
}

struct State {
    state: BreakerState,
    failures: VecDeque<Instant>,
    half_open_successes: usize,
    opened_at: Option<Instant>,
}

/// A named three-state failure gate.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    /// Create a breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                half_open_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// The breaker's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, advancing OPEN to HALF_OPEN once the reset
    /// timeout has elapsed.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        self.advance_if_reset_elapsed(&mut state);
        state.state
    }

    fn advance_if_reset_elapsed(&self, state: &mut State) {
        if state.state == BreakerState::Open {
            let elapsed = state
                .opened_at
                .map(|at| at.elapsed() >= self.config.reset_timeout)
                .unwrap_or(true);
            if elapsed {
                debug!(breaker = %self.name, "Breaker half-open, probing");
                state.state = BreakerState::HalfOpen;
                state.half_open_successes = 0;
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match state.state {
            BreakerState::HalfOpen => {
                state.half_open_successes += 1;
                if state.half_open_successes >= self.config.success_threshold {
                    debug!(breaker = %self.name, "Breaker closed");
                    state.state = BreakerState::Closed;
                    state.failures.clear();
                    state.opened_at = None;
                }
            }
            _ => {
                state.failures.clear();
            }
        }
    }

    fn on_failure(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().expect("breaker lock poisoned");

        state.failures.push_back(now);
        let window = self.config.failure_window;
        while state
            .failures
            .front()
            .is_some_and(|at| now.duration_since(*at) > window)
        {
            state.failures.pop_front();
        }

        let trip = state.state == BreakerState::HalfOpen
            || state.failures.len() >= self.config.failure_threshold;
        if trip && state.state != BreakerState::Open {
            warn!(breaker = %self.name, failures = state.failures.len(), "Breaker opened");
            state.state = BreakerState::Open;
            state.opened_at = Some(now);
            state.half_open_successes = 0;
        }
    }

    /// Force the breaker closed and forget its failure history.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.state = BreakerState::Closed;
        state.failures.clear();
        state.half_open_successes = 0;
        state.opened_at = None;
    }

    /// Run an operation under the breaker.
    ///
    /// # Errors
    ///
    /// [`BreakerError::Open`] without attempting the call while the
    /// breaker is open; [`BreakerError::Timeout`] when the call
    /// exceeds the per-call timeout; [`BreakerError::Inner`] when it
    /// fails on its own.
    pub async fn execute<F, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        {
            let mut state = self.state.lock().expect("breaker lock poisoned");
            self.advance_if_reset_elapsed(&mut state);
            if state.state == BreakerState::Open {
                return Err(BreakerError::Open(self.name.clone()));
            }
        }

        match tokio::time::timeout(self.config.timeout, operation).await {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure();
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                self.on_failure();
                Err(BreakerError::Timeout(self.config.timeout))
            }
        }
    }
}

/// Named map of circuit breakers sharing one configuration.
pub struct BreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerManager {
    /// Create a manager.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Get or create the breaker for a named endpoint.
    #[must_use]
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Names of all known breakers.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(5),
            success_threshold: 2,
            timeout: Duration::from_millis(100),
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(async { Err::<(), _>("boom") })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("api", config());

        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Calls fail fast without running.
        let result = breaker.execute(async { Ok::<_, String>(1) }).await;
        assert!(matches!(result, Err(BreakerError::Open(name)) if name == "api"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovers_after_successes() {
        let breaker = CircuitBreaker::new("api", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        assert!(breaker.execute(async { Ok::<_, String>(()) }).await.is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.execute(async { Ok::<_, String>(()) }).await.is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("api", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }

        tokio::time::advance(Duration::from_secs(6)).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_failures_fall_out_of_window() {
        let breaker = CircuitBreaker::new("api", config());

        fail(&breaker).await;
        fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        fail(&breaker).await;

        // Only one failure remains inside the window.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new("api", config());

        let result = breaker
            .execute(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reset() {
        let breaker = CircuitBreaker::new("api", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.execute(async { Ok::<_, String>(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn test_manager_reuses_instances() {
        let manager = BreakerManager::new(config());
        let a = manager.get("webhook");
        let b = manager.get("webhook");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.names(), vec!["webhook".to_string()]);
    }
}
