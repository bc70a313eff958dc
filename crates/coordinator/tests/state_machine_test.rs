//! 订单状态机集成测试
//!
//! 仓储使用与生产相同 CAS 语义的内存实现，
//! 并发接单竞争测试验证至多一个赢家。

use std::sync::Arc;
use std::time::Duration;

use dispatch_config::DispatchConfig;
use dispatch_coordinator::BookingControl;
use dispatch_domain::entities::{Actor, BookingStatus, Location, TargetStatus, VehicleType};
use dispatch_domain::repositories::{BookingRepository, EligibilityStore};
use dispatch_errors::DispatchError;
use dispatch_infrastructure::memory_store::MemoryDispatchStore;
use dispatch_testing_utils::{MockBookingRepository, MockMessageQueue};

const EVENTS_QUEUE: &str = "booking.events";

struct Fixture {
    control: Arc<BookingControl>,
    repository: Arc<MockBookingRepository>,
    store: Arc<MemoryDispatchStore>,
    queue: Arc<MockMessageQueue>,
}

fn fixture() -> Fixture {
    let repository = Arc::new(MockBookingRepository::new());
    let store = Arc::new(MemoryDispatchStore::new());
    let queue = Arc::new(MockMessageQueue::new());
    let control = Arc::new(BookingControl::new(
        repository.clone(),
        store.clone(),
        queue.clone(),
        EVENTS_QUEUE.to_string(),
        DispatchConfig::default(),
    ));
    Fixture {
        control,
        repository,
        store,
        queue,
    }
}

async fn pending_booking(fx: &Fixture) -> uuid::Uuid {
    let booking = fx
        .control
        .create_booking(
            "cust-1".to_string(),
            Location::new(-6.2088, 106.8456),
            Location::new(-6.1751, 106.8650),
            VehicleType::Car,
        )
        .await
        .unwrap();
    booking.id
}

#[tokio::test]
async fn test_create_booking_is_pending_and_publishes_created() {
    let fx = fixture();
    let booking_id = pending_booking(&fx).await;

    let stored = fx.repository.find_by_id(booking_id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::Pending);
    assert!(stored.driver_id.is_none());
    assert_eq!(
        fx.queue.published_event_types().await,
        vec!["booking.created"]
    );
}

#[tokio::test]
async fn test_concurrent_accepts_have_exactly_one_winner() {
    let fx = fixture();
    let booking_id = pending_booking(&fx).await;

    let drivers: Vec<String> = (1..=5).map(|i| format!("drv-{i}")).collect();
    fx.store
        .grant(booking_id, &drivers, Duration::from_secs(7200))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for driver_id in &drivers {
        let control = fx.control.clone();
        let driver = Actor::driver(driver_id.clone());
        handles.push(tokio::spawn(async move {
            control
                .request_transition(booking_id, driver, TargetStatus::Accepted)
                .await
        }));
    }

    let mut winners = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(booking) => {
                winners += 1;
                assert_eq!(booking.status, BookingStatus::Accepted);
            }
            Err(DispatchError::TransitionConflict { .. }) => conflicts += 1,
            Err(other) => panic!("意料之外的错误: {other}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(conflicts, 4);

    let stored = fx.repository.find_by_id(booking_id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::Accepted);
    assert!(stored.driver_id.is_some());

    // 恰好一个 booking.accepted 事件
    let accepted = fx
        .queue
        .published_event_types()
        .await
        .iter()
        .filter(|t| t.as_str() == "booking.accepted")
        .count();
    assert_eq!(accepted, 1);
}

#[tokio::test]
async fn test_ineligible_driver_cannot_accept() {
    let fx = fixture();
    let booking_id = pending_booking(&fx).await;
    // 许可集合授予 drv-1，drv-9 不在其中
    fx.store
        .grant(booking_id, &["drv-1".to_string()], Duration::from_secs(7200))
        .await
        .unwrap();

    let err = fx
        .control
        .request_transition(booking_id, Actor::driver("drv-9"), TargetStatus::Accepted)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Unauthorized { .. }));

    let stored = fx.repository.find_by_id(booking_id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::Pending);
}

#[tokio::test]
async fn test_rejection_keeps_booking_pending_and_revokes_driver() {
    let fx = fixture();
    let booking_id = pending_booking(&fx).await;
    fx.store
        .grant(
            booking_id,
            &["drv-1".to_string(), "drv-2".to_string()],
            Duration::from_secs(7200),
        )
        .await
        .unwrap();

    fx.control
        .request_transition(booking_id, Actor::driver("drv-1"), TargetStatus::Rejected)
        .await
        .unwrap();

    let stored = fx.repository.find_by_id(booking_id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::Pending);

    assert!(!fx.store.is_eligible(booking_id, "drv-1").await.unwrap());
    assert!(fx.store.is_eligible(booking_id, "drv-2").await.unwrap());
    assert_eq!(
        fx.store.list_rejections(booking_id).await.unwrap(),
        vec!["drv-1".to_string()]
    );
    assert!(fx
        .queue
        .published_event_types()
        .await
        .contains(&"booking.rejected".to_string()));
}

#[tokio::test]
async fn test_rejected_driver_cannot_accept_afterwards() {
    let fx = fixture();
    let booking_id = pending_booking(&fx).await;
    fx.store
        .grant(booking_id, &["drv-1".to_string()], Duration::from_secs(7200))
        .await
        .unwrap();

    fx.control
        .request_transition(booking_id, Actor::driver("drv-1"), TargetStatus::Rejected)
        .await
        .unwrap();
    let err = fx
        .control
        .request_transition(booking_id, Actor::driver("drv-1"), TargetStatus::Accepted)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Unauthorized { .. }));
}

#[tokio::test]
async fn test_driver_with_active_booking_cannot_accept_another() {
    let fx = fixture();
    let first = pending_booking(&fx).await;
    let second = pending_booking(&fx).await;
    for booking_id in [first, second] {
        fx.store
            .grant(booking_id, &["drv-1".to_string()], Duration::from_secs(7200))
            .await
            .unwrap();
    }
    let driver = Actor::driver("drv-1");

    fx.control
        .request_transition(first, driver.clone(), TargetStatus::Accepted)
        .await
        .unwrap();
    // 手上有未完结订单时不允许再接单
    let err = fx
        .control
        .request_transition(second, driver.clone(), TargetStatus::Accepted)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Unauthorized { .. }));

    // 完成首单后恢复接单资格
    fx.control
        .request_transition(first, driver.clone(), TargetStatus::Ongoing)
        .await
        .unwrap();
    fx.control
        .request_transition(first, driver.clone(), TargetStatus::Completed)
        .await
        .unwrap();
    let booking = fx
        .control
        .request_transition(second, driver, TargetStatus::Accepted)
        .await
        .unwrap();
    assert_eq!(booking.status, BookingStatus::Accepted);
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let fx = fixture();
    let booking_id = pending_booking(&fx).await;
    let customer = Actor::customer("cust-1");

    fx.control
        .request_transition(booking_id, customer.clone(), TargetStatus::Cancelled)
        .await
        .unwrap();
    // 重复取消是空操作，不是错误
    let booking = fx
        .control
        .request_transition(booking_id, customer, TargetStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(booking.status, BookingStatus::Cancelled);

    let cancelled = fx
        .queue
        .published_event_types()
        .await
        .iter()
        .filter(|t| t.as_str() == "booking.cancelled")
        .count();
    assert_eq!(cancelled, 1);
}

#[tokio::test]
async fn test_full_lifecycle_to_completed() {
    let fx = fixture();
    let booking_id = pending_booking(&fx).await;
    fx.store
        .grant(booking_id, &["drv-1".to_string()], Duration::from_secs(7200))
        .await
        .unwrap();
    let driver = Actor::driver("drv-1");

    fx.control
        .request_transition(booking_id, driver.clone(), TargetStatus::Accepted)
        .await
        .unwrap();
    fx.control
        .request_transition(booking_id, driver.clone(), TargetStatus::Ongoing)
        .await
        .unwrap();
    let booking = fx
        .control
        .request_transition(booking_id, driver, TargetStatus::Completed)
        .await
        .unwrap();

    assert_eq!(booking.status, BookingStatus::Completed);
    assert!(booking.accepted_at.is_some());
    assert!(booking.started_at.is_some());
    assert!(booking.completed_at.is_some());
    assert!(fx
        .queue
        .published_event_types()
        .await
        .contains(&"booking.completed".to_string()));
}

#[tokio::test]
async fn test_unknown_booking_returns_not_found() {
    let fx = fixture();
    let err = fx
        .control
        .request_transition(
            uuid::Uuid::new_v4(),
            Actor::customer("cust-1"),
            TargetStatus::Cancelled,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::BookingNotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_eligibility_expires_after_ttl_without_revocation() {
    let fx = fixture();
    let booking_id = pending_booking(&fx).await;
    fx.store
        .grant(booking_id, &["drv-1".to_string()], Duration::from_secs(7200))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(7201)).await;

    let err = fx
        .control
        .request_transition(booking_id, Actor::driver("drv-1"), TargetStatus::Accepted)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Unauthorized { .. }));
}
