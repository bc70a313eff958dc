//! 派单系统配置
//!
//! 类型安全的配置模型，支持 TOML 文件与环境变量覆盖加载

pub mod app_config;
pub mod dispatch;
pub mod resilience;

pub use app_config::{AppConfig, CollaboratorConfig, MessageQueueConfig, RedisConfig, StorageConfig};
pub use dispatch::DispatchConfig;
pub use resilience::{CircuitBreakerConfig, CircuitState, ResilienceConfig, RetryConfig};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置加载失败: {0}")]
    Load(String),
    #[error("配置验证失败: {0}")]
    Validation(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
