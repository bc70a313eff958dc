//! 派单 Saga 集成测试
//!
//! 不启动 run 循环，直接排空事件队列驱动 handler，
//! 事件流与生产路径完全一致。

use std::sync::Arc;
use std::time::Duration;

use dispatch_config::{CircuitBreakerConfig, DispatchConfig, RetryConfig};
use dispatch_coordinator::matcher::DriverMatcher;
use dispatch_coordinator::{BookingControl, DispatchSaga, SagaPhase};
use dispatch_domain::collaborators::CustomerNotice;
use dispatch_domain::entities::{Actor, BookingStatus, Location, TargetStatus, VehicleType};
use dispatch_domain::messaging::MessageQueue;
use dispatch_domain::repositories::{BookingRepository, EligibilityStore};
use dispatch_infrastructure::memory_store::MemoryDispatchStore;
use dispatch_infrastructure::resilient::ResilientCaller;
use dispatch_testing_utils::{
    CandidateBuilder, MockBookingHistoryService, MockBookingRepository, MockDriverDirectory,
    MockMessageQueue, MockNotificationGateway, RecordedNotification,
};

const EVENTS_QUEUE: &str = "booking.events";
const JAKARTA: Location = Location {
    lat: -6.2088,
    lng: 106.8456,
};

fn fast_caller(target: &str) -> ResilientCaller {
    ResilientCaller::with_config(
        target,
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        },
        CircuitBreakerConfig {
            failure_threshold: 100,
            call_timeout: Duration::from_millis(500),
            ..Default::default()
        },
    )
}

struct Fixture {
    control: Arc<BookingControl>,
    saga: Arc<DispatchSaga>,
    repository: Arc<MockBookingRepository>,
    store: Arc<MemoryDispatchStore>,
    queue: Arc<MockMessageQueue>,
    directory: Arc<MockDriverDirectory>,
    notifications: Arc<MockNotificationGateway>,
}

fn fixture_with(config: DispatchConfig) -> Fixture {
    let repository = Arc::new(MockBookingRepository::new());
    let store = Arc::new(MemoryDispatchStore::new());
    let queue = Arc::new(MockMessageQueue::new());
    let directory = Arc::new(MockDriverDirectory::new());
    let history = Arc::new(MockBookingHistoryService::new());
    let notifications = Arc::new(MockNotificationGateway::new());

    let matcher = Arc::new(DriverMatcher::new(
        directory.clone(),
        history.clone(),
        store.clone(),
        store.clone(),
        fast_caller("driver-directory"),
        fast_caller("booking-history"),
        config.clone(),
    ));
    let control = Arc::new(BookingControl::new(
        repository.clone(),
        store.clone(),
        queue.clone(),
        EVENTS_QUEUE.to_string(),
        config.clone(),
    ));
    let saga = Arc::new(DispatchSaga::new(
        matcher,
        repository.clone(),
        store.clone(),
        notifications.clone(),
        fast_caller("notification-gateway"),
        queue.clone(),
        EVENTS_QUEUE.to_string(),
        config,
    ));

    Fixture {
        control,
        saga,
        repository,
        store,
        queue,
        directory,
        notifications,
    }
}

fn fixture() -> Fixture {
    fixture_with(DispatchConfig::default())
}

/// 排空事件队列，把每条事件喂给 Saga，直到不再产生新事件
async fn drain(fx: &Fixture) {
    loop {
        let messages = fx.queue.consume_messages(EVENTS_QUEUE).await.unwrap();
        if messages.is_empty() {
            return;
        }
        for message in messages {
            fx.saga.handle_event(&message.event).await.unwrap();
        }
    }
}

async fn create_booking(fx: &Fixture) -> uuid::Uuid {
    fx.control
        .create_booking(
            "cust-1".to_string(),
            JAKARTA,
            Location::new(-6.1751, 106.8650),
            VehicleType::Car,
        )
        .await
        .unwrap()
        .id
}

async fn two_online_drivers(fx: &Fixture) {
    fx.directory
        .set_online_drivers(vec![
            CandidateBuilder::new("drv-1").km_north_of(JAKARTA, 0.3).build(),
            CandidateBuilder::new("drv-2").km_north_of(JAKARTA, 0.6).build(),
        ])
        .await;
}

#[tokio::test]
async fn test_created_booking_is_broadcast_to_nearby_drivers() {
    let fx = fixture();
    two_online_drivers(&fx).await;
    let booking_id = create_booking(&fx).await;

    drain(&fx).await;

    // 两位司机都拿到许可
    assert!(fx.store.is_eligible(booking_id, "drv-1").await.unwrap());
    assert!(fx.store.is_eligible(booking_id, "drv-2").await.unwrap());
    assert_eq!(fx.saga.phase(booking_id).await, Some(SagaPhase::AwaitingAcceptance));

    let types = fx.queue.published_event_types().await;
    for expected in [
        "booking.created",
        "booking.driver_search_requested",
        "booking.nearby_drivers_found",
        "booking.drivers_ready",
    ] {
        assert!(types.contains(&expected.to_string()), "缺少事件 {expected}");
    }

    let sent = fx.notifications.sent().await;
    let requests = sent
        .iter()
        .filter(|n| matches!(n, RecordedNotification::DriverRequest { .. }))
        .count();
    assert_eq!(requests, 2);
    assert!(sent.iter().any(|n| matches!(
        n,
        RecordedNotification::Customer {
            notice: CustomerNotice::RequestBroadcast { driver_count: 2 },
            ..
        }
    )));
}

#[tokio::test]
async fn test_accept_settles_race_and_notifies_losers() {
    let fx = fixture();
    two_online_drivers(&fx).await;
    let booking_id = create_booking(&fx).await;
    drain(&fx).await;

    fx.control
        .request_transition(booking_id, Actor::driver("drv-1"), TargetStatus::Accepted)
        .await
        .unwrap();
    drain(&fx).await;

    assert_eq!(fx.saga.phase(booking_id).await, Some(SagaPhase::Settled));
    // 许可全部撤销
    assert!(fx.store.list_eligible(booking_id).await.unwrap().is_empty());
    assert!(fx
        .queue
        .published_event_types()
        .await
        .contains(&"booking.taken".to_string()));

    let sent = fx.notifications.sent().await;
    assert!(sent.iter().any(|n| matches!(
        n,
        RecordedNotification::BookingTaken { driver_id, taken_by, .. }
            if driver_id == "drv-2" && taken_by == "drv-1"
    )));
    assert!(sent.iter().any(|n| matches!(
        n,
        RecordedNotification::Customer {
            notice: CustomerNotice::DriverAssigned { .. },
            ..
        }
    )));
}

#[tokio::test]
async fn test_all_rejections_trigger_bounded_rematch_excluding_rejecters() {
    let fx = fixture();
    fx.directory
        .set_online_drivers(vec![CandidateBuilder::new("drv-1")
            .km_north_of(JAKARTA, 0.3)
            .build()])
        .await;
    let booking_id = create_booking(&fx).await;
    drain(&fx).await;
    assert!(fx.store.is_eligible(booking_id, "drv-1").await.unwrap());

    // 唯一的许可司机拒单
    fx.control
        .request_transition(booking_id, Actor::driver("drv-1"), TargetStatus::Rejected)
        .await
        .unwrap();
    drain(&fx).await;

    // 第二轮搜索排除了拒单司机，没有候选，向客户宣告无司机
    let searches = fx
        .queue
        .published_event_types()
        .await
        .iter()
        .filter(|t| t.as_str() == "booking.driver_search_requested")
        .count();
    assert_eq!(searches, 2);
    assert_eq!(fx.saga.phase(booking_id).await, Some(SagaPhase::Expired));
    assert!(fx.notifications.sent().await.iter().any(|n| matches!(
        n,
        RecordedNotification::Customer {
            notice: CustomerNotice::NoDriversAvailable,
            ..
        }
    )));

    // 订单保持 PENDING，从未被错误地终结
    let booking = fx.repository.find_by_id(booking_id).await.unwrap().unwrap();
    assert_eq!(booking.status, BookingStatus::Pending);
}

#[tokio::test]
async fn test_no_online_drivers_expires_and_informs_customer() {
    let fx = fixture();
    let booking_id = create_booking(&fx).await;

    drain(&fx).await;

    assert_eq!(fx.saga.phase(booking_id).await, Some(SagaPhase::Expired));
    assert!(fx.notifications.sent().await.iter().any(|n| matches!(
        n,
        RecordedNotification::Customer {
            notice: CustomerNotice::NoDriversAvailable,
            ..
        }
    )));
}

#[tokio::test]
async fn test_customer_cancellation_cleans_up_dispatch_state() {
    let fx = fixture();
    two_online_drivers(&fx).await;
    let booking_id = create_booking(&fx).await;
    drain(&fx).await;

    fx.control
        .request_transition(booking_id, Actor::customer("cust-1"), TargetStatus::Cancelled)
        .await
        .unwrap();
    drain(&fx).await;

    assert_eq!(fx.saga.phase(booking_id).await, Some(SagaPhase::Settled));
    assert!(fx.store.list_eligible(booking_id).await.unwrap().is_empty());
    assert!(fx.store.list_rejections(booking_id).await.unwrap().is_empty());
    // 尚未有承接司机，不应有司机侧取消通知
    assert!(!fx
        .notifications
        .sent()
        .await
        .iter()
        .any(|n| matches!(n, RecordedNotification::BookingCancelled { .. })));
}

#[tokio::test]
async fn test_customer_cancellation_after_accept_notifies_driver() {
    let fx = fixture();
    two_online_drivers(&fx).await;
    let booking_id = create_booking(&fx).await;
    drain(&fx).await;

    fx.control
        .request_transition(booking_id, Actor::driver("drv-1"), TargetStatus::Accepted)
        .await
        .unwrap();
    drain(&fx).await;
    fx.control
        .request_transition(booking_id, Actor::customer("cust-1"), TargetStatus::Cancelled)
        .await
        .unwrap();
    drain(&fx).await;

    assert!(fx.notifications.sent().await.iter().any(|n| matches!(
        n,
        RecordedNotification::BookingCancelled { driver_id, .. } if driver_id == "drv-1"
    )));
}

#[tokio::test]
async fn test_driver_cancellation_notifies_customer() {
    let fx = fixture();
    two_online_drivers(&fx).await;
    let booking_id = create_booking(&fx).await;
    drain(&fx).await;

    fx.control
        .request_transition(booking_id, Actor::driver("drv-1"), TargetStatus::Accepted)
        .await
        .unwrap();
    drain(&fx).await;
    fx.control
        .request_transition(booking_id, Actor::driver("drv-1"), TargetStatus::Cancelled)
        .await
        .unwrap();
    drain(&fx).await;

    assert!(fx.notifications.sent().await.iter().any(|n| matches!(
        n,
        RecordedNotification::Customer {
            notice: CustomerNotice::BookingCancelled,
            ..
        }
    )));
}

#[tokio::test]
async fn test_terminal_saga_states_are_purged_on_expiry_check() {
    let fx = fixture();
    two_online_drivers(&fx).await;

    // 三个订单跑完整生命周期后全部结算
    let mut booking_ids = Vec::new();
    for _ in 0..3 {
        let booking_id = create_booking(&fx).await;
        drain(&fx).await;
        let driver = Actor::driver("drv-1");
        fx.control
            .request_transition(booking_id, driver.clone(), TargetStatus::Accepted)
            .await
            .unwrap();
        drain(&fx).await;
        fx.control
            .request_transition(booking_id, driver.clone(), TargetStatus::Ongoing)
            .await
            .unwrap();
        fx.control
            .request_transition(booking_id, driver, TargetStatus::Completed)
            .await
            .unwrap();
        drain(&fx).await;
        booking_ids.push(booking_id);
    }

    for booking_id in &booking_ids {
        assert_eq!(fx.saga.phase(*booking_id).await, Some(SagaPhase::Settled));
    }

    // 过期检查同时清理终态记录，状态表不随历史订单增长
    fx.saga.check_expired_windows().await;
    for booking_id in &booking_ids {
        assert_eq!(fx.saga.phase(*booking_id).await, None);
    }
}

#[tokio::test(start_paused = true)]
async fn test_expired_ready_window_exhausts_attempts_and_fails() {
    // 只允许一轮搜索：广播窗口过期后直接宣告无司机
    let config = DispatchConfig {
        max_search_attempts: 1,
        ..Default::default()
    };
    let fx = fixture_with(config);
    two_online_drivers(&fx).await;
    let booking_id = create_booking(&fx).await;
    drain(&fx).await;
    assert_eq!(fx.saga.phase(booking_id).await, Some(SagaPhase::AwaitingAcceptance));

    tokio::time::advance(Duration::from_secs(121)).await;
    fx.saga.check_expired_windows().await;
    drain(&fx).await;

    assert_eq!(fx.saga.phase(booking_id).await, Some(SagaPhase::Failed));
    assert!(fx.store.list_eligible(booking_id).await.unwrap().is_empty());
    assert!(fx.notifications.sent().await.iter().any(|n| matches!(
        n,
        RecordedNotification::Customer {
            notice: CustomerNotice::NoDriversAvailable,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_expired_ready_window_rematches_when_attempts_remain() {
    let fx = fixture();
    two_online_drivers(&fx).await;
    let booking_id = create_booking(&fx).await;
    drain(&fx).await;

    tokio::time::advance(Duration::from_secs(121)).await;
    fx.saga.check_expired_windows().await;
    drain(&fx).await;

    // 第二轮搜索重新授予许可
    assert_eq!(fx.saga.phase(booking_id).await, Some(SagaPhase::AwaitingAcceptance));
    let searches = fx
        .queue
        .published_event_types()
        .await
        .iter()
        .filter(|t| t.as_str() == "booking.driver_search_requested")
        .count();
    assert_eq!(searches, 2);
    assert!(fx.store.is_eligible(booking_id, "drv-1").await.unwrap());
}
