//! 协作方服务端口
//!
//! 在线司机、订单历史、推送网关均为外部服务，
//! 这里只定义消费侧接口；调用一律经过 ResilientCaller

use async_trait::async_trait;
use uuid::Uuid;

use crate::entities::{
    BookingSummary, CustomerPreferences, DriverAvailability, DriverCandidate, Location,
    VehicleType,
};
use dispatch_errors::DispatchResult;

/// 在线司机目录
#[async_trait]
pub trait DriverDirectory: Send + Sync {
    /// 按车型查询在线司机，排除指定司机
    async fn find_online_drivers(
        &self,
        vehicle_types: &[VehicleType],
        excluded_ids: &[String],
        near: Location,
    ) -> DispatchResult<Vec<DriverCandidate>>;

    /// 批量查询司机是否已有进行中的订单
    async fn check_drivers_availability(
        &self,
        driver_ids: &[String],
    ) -> DispatchResult<Vec<DriverAvailability>>;
}

/// 客户订单历史
#[async_trait]
pub trait BookingHistoryService: Send + Sync {
    /// 近 days_back 天内该客户被取消的订单
    async fn cancelled_bookings(
        &self,
        customer_id: &str,
        days_back: u32,
    ) -> DispatchResult<Vec<BookingSummary>>;

    async fn booking_history(
        &self,
        customer_id: &str,
        days_back: u32,
        limit: usize,
    ) -> DispatchResult<Vec<BookingSummary>>;

    /// 客户撮合偏好；None 时使用缺省偏好
    async fn customer_preferences(
        &self,
        customer_id: &str,
    ) -> DispatchResult<Option<CustomerPreferences>>;
}

/// 面向客户的通知内容
#[derive(Debug, Clone, PartialEq)]
pub enum CustomerNotice {
    /// 请求已广播给 N 位司机
    RequestBroadcast { driver_count: usize },
    DriverAssigned { driver_id: String },
    NoDriversAvailable,
    BookingCancelled,
}

/// 推送网关
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// 向单个司机推送接单请求
    async fn notify_driver_request(
        &self,
        driver_id: &str,
        booking_id: Uuid,
        pickup: Location,
    ) -> DispatchResult<()>;

    /// 告知落败司机订单已被抢
    async fn notify_booking_taken(
        &self,
        driver_id: &str,
        booking_id: Uuid,
        taken_by: &str,
    ) -> DispatchResult<()>;

    async fn notify_booking_cancelled(
        &self,
        driver_id: &str,
        booking_id: Uuid,
    ) -> DispatchResult<()>;

    async fn notify_customer(
        &self,
        customer_id: &str,
        booking_id: Uuid,
        notice: CustomerNotice,
    ) -> DispatchResult<()>;
}
