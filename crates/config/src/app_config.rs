use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult, DispatchConfig, ResilienceConfig};

fn default_database_url() -> String {
    "sqlite:dispatch.db".to_string()
}
fn default_events_queue() -> String {
    "booking.events".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// sqlx 连接串，如 sqlite:dispatch.db 或 sqlite::memory:
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// 未配置 Redis 时使用内存版许可存储（嵌入式部署）
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            redis: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageQueueConfig {
    #[serde(default = "default_events_queue")]
    pub events_queue: String,
    /// 单队列最大积压条数
    #[serde(default)]
    pub max_queue_size: Option<usize>,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            events_queue: default_events_queue(),
            max_queue_size: None,
        }
    }
}

/// 协作方服务地址，为空表示该协作方未接入
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    pub driver_directory_url: Option<String>,
    pub booking_history_url: Option<String>,
    pub notification_gateway_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub message_queue: MessageQueueConfig,
    #[serde(default)]
    pub collaborators: CollaboratorConfig,
}

impl AppConfig {
    /// 加载配置：TOML 文件（可选）叠加 DISPATCH_ 前缀环境变量
    pub fn load(config_path: Option<&str>) -> ConfigResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("DISPATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        let app_config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.dispatch.validate()?;
        self.resilience.validate()?;
        if self.storage.database_url.is_empty() {
            return Err(ConfigError::Validation(
                "storage.database_url must not be empty".to_string(),
            ));
        }
        if self.message_queue.events_queue.is_empty() {
            return Err(ConfigError::Validation(
                "message_queue.events_queue must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
