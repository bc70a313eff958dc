//! 仓储与共享状态端口
//!
//! 订单状态与许可集合是全链路仅有的共享可变状态，
//! 全部通过条件原子操作修改，禁止先读后写

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::entities::{Booking, BookingStatus, DriverCandidate, TransitionUpdate};
use dispatch_errors::DispatchResult;

/// 订单仓储
#[async_trait]
pub trait BookingRepository: Send + Sync {
    async fn create(&self, booking: &Booking) -> DispatchResult<Booking>;
    async fn find_by_id(&self, id: Uuid) -> DispatchResult<Option<Booking>>;

    /// 条件流转：仅当当前状态等于 `expected` 时提交
    ///
    /// 承载全部并发正确性的原语。状态不匹配返回
    /// `TransitionConflict`，这也是并发接单竞争中落败方收到的结果。
    async fn conditional_transition(
        &self,
        id: Uuid,
        expected: BookingStatus,
        update: TransitionUpdate,
    ) -> DispatchResult<Booking>;

    /// 司机当前占用中的订单（ACCEPTED/ONGOING）
    async fn find_active_by_driver(&self, driver_id: &str) -> DispatchResult<Vec<Booking>>;
}

/// 许可窗口存储
///
/// 键空间（TTL 见括号）：eligible:{booking_id}（2h）、
/// rejected:{booking_id}（2h）。不在许可集合中的司机
/// 绝不允许接下该订单；TTL 到期后即使从未显式撤销，
/// `is_eligible` 也必须返回 false。
#[async_trait]
pub trait EligibilityStore: Send + Sync {
    async fn grant(
        &self,
        booking_id: Uuid,
        driver_ids: &[String],
        ttl: Duration,
    ) -> DispatchResult<()>;
    async fn is_eligible(&self, booking_id: Uuid, driver_id: &str) -> DispatchResult<bool>;
    async fn list_eligible(&self, booking_id: Uuid) -> DispatchResult<Vec<String>>;
    /// 撤销单个司机的许可（司机拒单后调用）
    async fn revoke(&self, booking_id: Uuid, driver_id: &str) -> DispatchResult<()>;
    async fn revoke_all(&self, booking_id: Uuid) -> DispatchResult<()>;

    async fn record_rejection(
        &self,
        booking_id: Uuid,
        driver_id: &str,
        ttl: Duration,
    ) -> DispatchResult<()>;
    async fn list_rejections(&self, booking_id: Uuid) -> DispatchResult<Vec<String>>;
    async fn clear_rejections(&self, booking_id: Uuid) -> DispatchResult<()>;
}

/// 撮合辅助缓存，均为尽力而为，不影响正确性
///
/// 键空间：blocked:{customer_id}（1h）、search-cache:{customer_id}（10min）
#[async_trait]
pub trait MatchCache: Send + Sync {
    async fn get_blocked_drivers(&self, customer_id: &str) -> DispatchResult<Option<Vec<String>>>;
    async fn put_blocked_drivers(
        &self,
        customer_id: &str,
        driver_ids: &[String],
        ttl: Duration,
    ) -> DispatchResult<()>;

    async fn get_search_result(
        &self,
        customer_id: &str,
    ) -> DispatchResult<Option<Vec<DriverCandidate>>>;
    async fn put_search_result(
        &self,
        customer_id: &str,
        candidates: &[DriverCandidate],
        ttl: Duration,
    ) -> DispatchResult<()>;
}
