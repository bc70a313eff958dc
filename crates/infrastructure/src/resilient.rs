//! 协作方调用的弹性包装
//!
//! 统一的重试 + 指数退避 + 熔断策略；所有打到协作方服务的调用
//! 都经过这里，重试耗尽或熔断打开一律以 DownstreamUnavailable
//! 上浮，绝不向上层泄漏原始传输错误。

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use dispatch_config::{CircuitBreakerConfig, RetryConfig};
use dispatch_errors::{DispatchError, DispatchResult};

use crate::circuit_breaker::CircuitBreaker;

pub struct ResilientCaller {
    target: String,
    retry: RetryConfig,
    breaker: CircuitBreaker,
}

impl ResilientCaller {
    pub fn new<S: Into<String>>(target: S) -> Self {
        Self::with_config(target, RetryConfig::default(), CircuitBreakerConfig::default())
    }

    pub fn with_config<S: Into<String>>(
        target: S,
        retry: RetryConfig,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        let target = target.into();
        Self {
            breaker: CircuitBreaker::with_config(target.clone(), breaker_config),
            target,
            retry,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// 执行一次协作方调用
    ///
    /// 仅基础设施类瞬时错误触发重试；业务错误立即返回。
    /// 熔断打开时的快速拒绝不计入重试预算，直接上浮。
    pub async fn call<F, Fut, T>(&self, operation: F) -> DispatchResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = DispatchResult<T>>,
    {
        let mut last_error: Option<DispatchError> = None;

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = self.backoff_delay(attempt);
                debug!(
                    target = %self.target,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "重试协作方调用"
                );
                tokio::time::sleep(delay).await;
            }

            match self.breaker.execute(&operation).await {
                Ok(value) => return Ok(value),
                Err(err @ DispatchError::DownstreamUnavailable { .. }) => {
                    // 熔断打开，没必要继续消耗重试预算
                    return Err(err);
                }
                Err(err) if err.is_retryable() || matches!(err, DispatchError::Timeout(_)) => {
                    warn!(target = %self.target, attempt, error = %err, "协作方调用失败");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        warn!(
            target = %self.target,
            attempts = self.retry.max_attempts,
            last_error = %last_error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default(),
            "重试耗尽，下游标记为不可用"
        );
        Err(DispatchError::downstream_unavailable(&self.target))
    }

    /// 第 attempt 次重试前的等待时间：base × multiplier^(attempt-1)，
    /// 封顶 max_delay，叠加 ±jitter_factor 的随机抖动
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .retry
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let capped = self
            .retry
            .base_delay
            .mul_f64(exp)
            .min(self.retry.max_delay);

        if self.retry.jitter_factor > 0.0 {
            let jitter = rand::rng()
                .random_range(-self.retry.jitter_factor..=self.retry.jitter_factor);
            capped.mul_f64((1.0 + jitter).max(0.0))
        } else {
            capped
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn fast_caller(max_attempts: u32) -> ResilientCaller {
        ResilientCaller::with_config(
            "driver-directory",
            RetryConfig {
                max_attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
                jitter_factor: 0.0,
            },
            CircuitBreakerConfig {
                failure_threshold: 100,
                call_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let caller = fast_caller(3);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result = caller
            .call(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_transient_errors_then_succeeds() {
        let caller = fast_caller(3);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result = caller
            .call(move || {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(DispatchError::Network("reset".to_string()))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_downstream_unavailable() {
        let caller = fast_caller(3);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let err = caller
            .call(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(DispatchError::Timeout("slow".to_string()))
                }
            })
            .await
            .unwrap_err();
        assert!(
            matches!(err, DispatchError::DownstreamUnavailable { ref target } if target == "driver-directory")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_business_errors_are_not_retried() {
        let caller = fast_caller(3);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let err = caller
            .call(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(DispatchError::booking_not_found("b-1"))
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::BookingNotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_stops_retrying() {
        let caller = ResilientCaller::with_config(
            "driver-directory",
            RetryConfig {
                max_attempts: 10,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                backoff_multiplier: 2.0,
                jitter_factor: 0.0,
            },
            CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
                call_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        );
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let err = caller
            .call(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(DispatchError::Network("down".to_string()))
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::DownstreamUnavailable { .. }));
        // 熔断在第 2 次失败后打开，第 3 次尝试被快速拒绝
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let caller = fast_caller(10);
        assert_eq!(caller.backoff_delay(1), Duration::from_millis(1));
        assert_eq!(caller.backoff_delay(2), Duration::from_millis(2));
        assert_eq!(caller.backoff_delay(3), Duration::from_millis(4));
        assert_eq!(caller.backoff_delay(4), Duration::from_millis(5));
        assert_eq!(caller.backoff_delay(8), Duration::from_millis(5));
    }
}
