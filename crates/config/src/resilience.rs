use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// 熔断器配置，按逻辑下游目标各持有一份
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// 连续失败多少次后熔断
    pub failure_threshold: usize,
    /// 熔断后的冷却时间（毫秒）
    #[serde(with = "duration_serde")]
    pub recovery_timeout: Duration,
    /// 半开状态下连续成功多少次后闭合
    pub success_threshold: usize,
    /// 单次调用超时（毫秒）
    #[serde(with = "duration_serde")]
    pub call_timeout: Duration,
    /// 反复熔断时冷却时间的退避倍数
    pub backoff_multiplier: f64,
    /// 冷却时间上限（毫秒）
    #[serde(with = "duration_serde")]
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            call_timeout: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::Validation(
                "success_threshold must be greater than 0".to_string(),
            ));
        }
        if self.backoff_multiplier <= 1.0 {
            return Err(ConfigError::Validation(
                "backoff_multiplier must be greater than 1.0".to_string(),
            ));
        }
        if self.recovery_timeout.is_zero() || self.call_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "recovery_timeout and call_timeout must be greater than 0".to_string(),
            ));
        }
        if self.recovery_timeout > self.max_recovery_timeout {
            return Err(ConfigError::Validation(
                "recovery_timeout must be less than or equal to max_recovery_timeout".to_string(),
            ));
        }
        Ok(())
    }
}

/// 协作方调用的重试策略
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 基础退避间隔（毫秒）
    #[serde(with = "duration_serde")]
    pub base_delay: Duration,
    /// 退避间隔上限（毫秒）
    #[serde(with = "duration_serde")]
    pub max_delay: Duration,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 随机抖动比例（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::Validation(
                "jitter_factor must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::Validation(
                "base_delay must be less than or equal to max_delay".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl ResilienceConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker_config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.recovery_timeout, Duration::from_secs(30));
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.call_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_circuit_breaker_config_rejects_zero_thresholds() {
        let config = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CircuitBreakerConfig {
            success_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_config_rejects_invalid_jitter() {
        let config = RetryConfig {
            jitter_factor: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
