use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::broadcast;
use tracing::{error, info};

use dispatch_config::AppConfig;
use dispatch_coordinator::matcher::DriverMatcher;
use dispatch_coordinator::{BookingControl, DispatchSaga};
use dispatch_domain::collaborators::{BookingHistoryService, DriverDirectory, NotificationGateway};
use dispatch_domain::messaging::MessageQueue;
use dispatch_domain::repositories::{BookingRepository, EligibilityStore, MatchCache};
use dispatch_infrastructure::collaborators::http::{
    HttpBookingHistoryService, HttpDriverDirectory, HttpNotificationGateway,
};
use dispatch_infrastructure::database::sqlite::SqliteBookingRepository;
use dispatch_infrastructure::{
    InMemoryMessageQueue, MemoryDispatchStore, RedisDispatchStore, ResilientCaller,
};

/// 派单服务组装根
///
/// 订单仓储落 SQLite；许可/缓存存储按配置选 Redis 或内存实现；
/// 协作方一律走 HTTP 客户端并包上弹性策略。
pub struct Application {
    saga: Arc<DispatchSaga>,
    booking_control: Arc<BookingControl>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化派单服务");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&config.storage.database_url)
            .await
            .with_context(|| format!("连接数据库失败: {}", config.storage.database_url))?;
        SqliteBookingRepository::init_schema(&pool)
            .await
            .context("初始化数据库结构失败")?;
        let repository: Arc<dyn BookingRepository> = Arc::new(SqliteBookingRepository::new(pool));

        let (eligibility, cache): (Arc<dyn EligibilityStore>, Arc<dyn MatchCache>) =
            match &config.storage.redis {
                Some(redis) => {
                    info!(url = %redis.url, "使用 Redis 许可存储");
                    let store = Arc::new(
                        RedisDispatchStore::new(&redis.url)
                            .await
                            .context("连接 Redis 失败")?,
                    );
                    (store.clone(), store)
                }
                None => {
                    info!("未配置 Redis，使用内存许可存储");
                    let store = Arc::new(MemoryDispatchStore::new());
                    (store.clone(), store)
                }
            };

        let message_queue: Arc<dyn MessageQueue> = Arc::new(
            InMemoryMessageQueue::with_max_queue_size(config.message_queue.max_queue_size),
        );

        let directory: Arc<dyn DriverDirectory> = Arc::new(
            HttpDriverDirectory::new(require_url(
                &config.collaborators.driver_directory_url,
                "collaborators.driver_directory_url",
            )?)
            .context("创建在线司机目录客户端失败")?,
        );
        let history: Arc<dyn BookingHistoryService> = Arc::new(
            HttpBookingHistoryService::new(require_url(
                &config.collaborators.booking_history_url,
                "collaborators.booking_history_url",
            )?)
            .context("创建订单历史客户端失败")?,
        );
        let notifications: Arc<dyn NotificationGateway> = Arc::new(
            HttpNotificationGateway::new(require_url(
                &config.collaborators.notification_gateway_url,
                "collaborators.notification_gateway_url",
            )?)
            .context("创建推送网关客户端失败")?,
        );

        let caller = |target: &str| {
            ResilientCaller::with_config(
                target,
                config.resilience.retry.clone(),
                config.resilience.circuit_breaker.clone(),
            )
        };

        let matcher = Arc::new(DriverMatcher::new(
            directory,
            history,
            eligibility.clone(),
            cache,
            caller("driver-directory"),
            caller("booking-history"),
            config.dispatch.clone(),
        ));
        let booking_control = Arc::new(BookingControl::new(
            repository.clone(),
            eligibility.clone(),
            message_queue.clone(),
            config.message_queue.events_queue.clone(),
            config.dispatch.clone(),
        ));
        let saga = Arc::new(DispatchSaga::new(
            matcher,
            repository,
            eligibility,
            notifications,
            caller("notification-gateway"),
            message_queue,
            config.message_queue.events_queue.clone(),
            config.dispatch.clone(),
        ));

        Ok(Self {
            saga,
            booking_control,
        })
    }

    /// 订单状态变更入口，供外层传输接入
    pub fn booking_control(&self) -> Arc<BookingControl> {
        Arc::clone(&self.booking_control)
    }

    /// 运行派单 Saga 直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let saga_handle = {
            let saga = Arc::clone(&self.saga);
            tokio::spawn(async move {
                if let Err(e) = saga.run().await {
                    error!("派单 Saga 异常退出: {e}");
                }
            })
        };

        let _ = shutdown_rx.recv().await;
        info!("停止派单 Saga");
        self.saga.stop().await;
        let _ = saga_handle.await;

        Ok(())
    }
}

fn require_url(url: &Option<String>, key: &str) -> Result<String> {
    url.clone()
        .with_context(|| format!("缺少必需的配置项: {key}"))
}
