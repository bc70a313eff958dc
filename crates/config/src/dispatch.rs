use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

fn default_search_radius_km() -> f64 {
    1.0
}
fn default_max_search_attempts() -> u32 {
    3
}
fn default_eligibility_ttl_seconds() -> u64 {
    7200
}
fn default_ready_window_seconds() -> u64 {
    120
}
fn default_search_cache_ttl_seconds() -> u64 {
    600
}
fn default_blocked_cache_ttl_seconds() -> u64 {
    3600
}
fn default_blocked_cancellation_threshold() -> u32 {
    3
}
fn default_blocked_window_days() -> u32 {
    30
}
fn default_history_window_days() -> u32 {
    90
}
fn default_history_limit() -> usize {
    50
}

/// 派单策略配置
///
/// 默认值即规格约定：搜索半径 1km，许可窗口 2 小时，
/// 广播新鲜度窗口 2 分钟，重新撮合最多 3 轮。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_search_radius_km")]
    pub search_radius_km: f64,
    #[serde(default = "default_max_search_attempts")]
    pub max_search_attempts: u32,
    #[serde(default = "default_eligibility_ttl_seconds")]
    pub eligibility_ttl_seconds: u64,
    /// drivers_ready 广播的新鲜度窗口，超时未有人接单则触发重新撮合
    #[serde(default = "default_ready_window_seconds")]
    pub ready_window_seconds: u64,
    #[serde(default = "default_search_cache_ttl_seconds")]
    pub search_cache_ttl_seconds: u64,
    #[serde(default = "default_blocked_cache_ttl_seconds")]
    pub blocked_cache_ttl_seconds: u64,
    /// 近 N 天内被同一司机取消多少次后对该客户拉黑该司机
    #[serde(default = "default_blocked_cancellation_threshold")]
    pub blocked_cancellation_threshold: u32,
    #[serde(default = "default_blocked_window_days")]
    pub blocked_window_days: u32,
    #[serde(default = "default_history_window_days")]
    pub history_window_days: u32,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            search_radius_km: default_search_radius_km(),
            max_search_attempts: default_max_search_attempts(),
            eligibility_ttl_seconds: default_eligibility_ttl_seconds(),
            ready_window_seconds: default_ready_window_seconds(),
            search_cache_ttl_seconds: default_search_cache_ttl_seconds(),
            blocked_cache_ttl_seconds: default_blocked_cache_ttl_seconds(),
            blocked_cancellation_threshold: default_blocked_cancellation_threshold(),
            blocked_window_days: default_blocked_window_days(),
            history_window_days: default_history_window_days(),
            history_limit: default_history_limit(),
        }
    }
}

impl DispatchConfig {
    pub fn eligibility_ttl(&self) -> Duration {
        Duration::from_secs(self.eligibility_ttl_seconds)
    }
    pub fn ready_window(&self) -> Duration {
        Duration::from_secs(self.ready_window_seconds)
    }
    pub fn search_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.search_cache_ttl_seconds)
    }
    pub fn blocked_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.blocked_cache_ttl_seconds)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.search_radius_km <= 0.0 {
            return Err(ConfigError::Validation(
                "search_radius_km must be greater than 0".to_string(),
            ));
        }
        if self.max_search_attempts == 0 {
            return Err(ConfigError::Validation(
                "max_search_attempts must be greater than 0".to_string(),
            ));
        }
        if self.eligibility_ttl_seconds == 0 || self.ready_window_seconds == 0 {
            return Err(ConfigError::Validation(
                "eligibility_ttl_seconds and ready_window_seconds must be greater than 0"
                    .to_string(),
            ));
        }
        if self.ready_window_seconds > self.eligibility_ttl_seconds {
            return Err(ConfigError::Validation(
                "ready_window_seconds must not exceed eligibility_ttl_seconds".to_string(),
            ));
        }
        Ok(())
    }
}
