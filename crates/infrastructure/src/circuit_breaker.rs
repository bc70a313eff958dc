//! Circuit breaker for collaborator calls.
//!
//! One breaker per logical downstream target. Opens after a run of
//! consecutive failures, short-circuits calls while open and transitions
//! half-open after a cooldown that backs off on repeated trips.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use dispatch_config::{CircuitBreakerConfig, CircuitState};
use dispatch_errors::{DispatchError, DispatchResult};

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub consecutive_successes: usize,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub last_state_change: Instant,
    pub current_recovery_timeout: Duration,
}

impl CircuitBreakerStats {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            last_state_change: Instant::now(),
            current_recovery_timeout: config.recovery_timeout,
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.failed_calls as f64 / self.total_calls as f64
        }
    }
}

pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    stats: Arc<RwLock<CircuitBreakerStats>>,
}

impl CircuitBreaker {
    pub fn new<S: Into<String>>(target: S) -> Self {
        Self::with_config(target, CircuitBreakerConfig::default())
    }

    pub fn with_config<S: Into<String>>(target: S, config: CircuitBreakerConfig) -> Self {
        let stats = CircuitBreakerStats::new(&config);
        Self {
            target: target.into(),
            config,
            stats: Arc::new(RwLock::new(stats)),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Run one call through the breaker with the configured call timeout.
    ///
    /// Open-circuit rejections and timeouts surface as fast
    /// `DownstreamUnavailable` / `Timeout` errors; the caller's own error
    /// is passed through untouched.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> DispatchResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = DispatchResult<T>>,
    {
        if !self.should_allow_call().await {
            return Err(DispatchError::downstream_unavailable(&self.target));
        }

        let result = tokio::time::timeout(self.config.call_timeout, operation()).await;

        match result {
            Ok(Ok(value)) => {
                self.record_success().await;
                Ok(value)
            }
            Ok(Err(error)) => {
                // Business-rule failures say nothing about downstream health
                if error.is_retryable() {
                    self.record_failure().await;
                } else {
                    self.record_success().await;
                }
                Err(error)
            }
            Err(_) => {
                self.record_failure().await;
                Err(DispatchError::Timeout(format!(
                    "{} call exceeded {:?}",
                    self.target, self.config.call_timeout
                )))
            }
        }
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        self.stats.read().await.clone()
    }

    pub async fn state(&self) -> CircuitState {
        self.stats.read().await.state
    }

    async fn should_allow_call(&self) -> bool {
        let stats = self.stats.read().await;
        match stats.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = Instant::now().duration_since(stats.last_state_change);
                if elapsed > stats.current_recovery_timeout {
                    drop(stats);
                    self.transition_to_half_open().await;
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn transition_to_half_open(&self) {
        let mut stats = self.stats.write().await;
        if stats.state == CircuitState::Open {
            stats.state = CircuitState::HalfOpen;
            stats.consecutive_successes = 0;
            stats.last_state_change = Instant::now();
            debug!(target = %self.target, "circuit breaker half-open, probing downstream");
        }
    }

    async fn record_success(&self) {
        let mut stats = self.stats.write().await;
        stats.total_calls += 1;
        stats.successful_calls += 1;
        stats.consecutive_successes += 1;
        stats.consecutive_failures = 0;

        if stats.state == CircuitState::HalfOpen
            && stats.consecutive_successes >= self.config.success_threshold
        {
            stats.state = CircuitState::Closed;
            stats.last_state_change = Instant::now();
            stats.current_recovery_timeout = self.config.recovery_timeout;
            debug!(target = %self.target, "circuit breaker closed");
        }
    }

    async fn record_failure(&self) {
        let mut stats = self.stats.write().await;
        stats.total_calls += 1;
        stats.failed_calls += 1;
        stats.consecutive_failures += 1;
        stats.consecutive_successes = 0;

        let should_open = match stats.state {
            CircuitState::Closed => stats.consecutive_failures >= self.config.failure_threshold,
            // A single probe failure re-opens the circuit
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if should_open {
            let reopened = stats.state == CircuitState::HalfOpen;
            stats.state = CircuitState::Open;
            stats.last_state_change = Instant::now();
            if reopened {
                let next = stats
                    .current_recovery_timeout
                    .mul_f64(self.config.backoff_multiplier);
                stats.current_recovery_timeout = next.min(self.config.max_recovery_timeout);
            }
            warn!(
                target = %self.target,
                recovery_timeout = ?stats.current_recovery_timeout,
                "circuit breaker opened"
            );
        }
    }
}
