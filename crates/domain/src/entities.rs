//! 派单领域实体

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// WGS84 坐标
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

impl Location {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleType {
    #[serde(rename = "motorcycle")]
    Motorcycle,
    #[serde(rename = "car")]
    Car,
}

impl std::fmt::Display for VehicleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VehicleType::Motorcycle => write!(f, "motorcycle"),
            VehicleType::Car => write!(f, "car"),
        }
    }
}

/// 订单状态机的持久化状态
///
/// REJECTED 不是订单级状态：司机拒单只写入拒单集合，
/// 订单本身保持 PENDING 以便重新撮合。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "ACCEPTED")]
    Accepted,
    #[serde(rename = "ONGOING")]
    Ongoing,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Accepted => "ACCEPTED",
            BookingStatus::Ongoing => "ONGOING",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 可被请求的目标状态，PENDING 永远不是流转目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetStatus {
    #[serde(rename = "ACCEPTED")]
    Accepted,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "ONGOING")]
    Ongoing,
    #[serde(rename = "COMPLETED")]
    Completed,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Accepted => "ACCEPTED",
            TargetStatus::Rejected => "REJECTED",
            TargetStatus::Cancelled => "CANCELLED",
            TargetStatus::Ongoing => "ONGOING",
            TargetStatus::Completed => "COMPLETED",
        }
    }
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorRole {
    #[serde(rename = "customer")]
    Customer,
    #[serde(rename = "driver")]
    Driver,
}

impl std::fmt::Display for ActorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorRole::Customer => write!(f, "customer"),
            ActorRole::Driver => write!(f, "driver"),
        }
    }
}

/// 状态流转的发起方
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub role: ActorRole,
    pub id: String,
}

impl Actor {
    pub fn customer<S: Into<String>>(id: S) -> Self {
        Self {
            role: ActorRole::Customer,
            id: id.into(),
        }
    }
    pub fn driver<S: Into<String>>(id: S) -> Self {
        Self {
            role: ActorRole::Driver,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub customer_id: String,
    /// 接单成功前为 None；任一订单至多一个非空司机
    pub driver_id: Option<String>,
    pub pickup_location: Location,
    pub destination_location: Location,
    pub vehicle_type: VehicleType,
    pub status: BookingStatus,
    pub accepted_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn new(
        customer_id: String,
        pickup_location: Location,
        destination_location: Location,
        vehicle_type: VehicleType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            customer_id,
            driver_id: None,
            pickup_location,
            destination_location,
            vehicle_type,
            status: BookingStatus::Pending,
            accepted_at: None,
            cancelled_at: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 应用一次已通过条件检查的流转，落对应的时间戳
    pub fn apply_transition(&mut self, update: &TransitionUpdate) {
        self.status = update.status;
        if let Some(driver_id) = &update.driver_id {
            self.driver_id = Some(driver_id.clone());
        }
        match update.status {
            BookingStatus::Accepted => self.accepted_at = Some(update.at),
            BookingStatus::Cancelled => self.cancelled_at = Some(update.at),
            BookingStatus::Ongoing => self.started_at = Some(update.at),
            BookingStatus::Completed => self.completed_at = Some(update.at),
            BookingStatus::Pending => {}
        }
        self.updated_at = update.at;
    }
}

/// 条件流转要写入的新状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionUpdate {
    pub status: BookingStatus,
    /// 仅接单流转会设置；其余流转保持原司机不变
    pub driver_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl TransitionUpdate {
    pub fn accept(driver_id: String, at: DateTime<Utc>) -> Self {
        Self {
            status: BookingStatus::Accepted,
            driver_id: Some(driver_id),
            at,
        }
    }
    pub fn to(status: BookingStatus, at: DateTime<Utc>) -> Self {
        Self {
            status,
            driver_id: None,
            at,
        }
    }
}

/// 撮合候选（瞬态，不落库，每次撮合重新生成）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverCandidate {
    pub driver_id: String,
    pub location: Location,
    pub rating: f64,
    pub vehicle_type: VehicleType,
    /// 到上车点的大圆距离（公里），撮合过程中按全精度比较
    pub distance_km: f64,
    #[serde(default)]
    pub is_preferred: bool,
    #[serde(default)]
    pub previous_trip_count: u32,
}

impl DriverCandidate {
    /// 对外上报的距离保留两位小数
    pub fn reported_distance_km(&self) -> f64 {
        (self.distance_km * 100.0).round() / 100.0
    }

    /// 生成对外上报用的副本（距离取两位小数）
    pub fn for_report(&self) -> Self {
        Self {
            distance_km: self.reported_distance_km(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverAvailability {
    pub driver_id: String,
    pub is_available: bool,
}

/// 客户撮合偏好；缺省允许两类车型、最低评分 3.0、最远 5 公里
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerPreferences {
    pub vehicle_types: Vec<VehicleType>,
    pub min_rating: f64,
    pub max_distance_km: f64,
}

impl Default for CustomerPreferences {
    fn default() -> Self {
        Self {
            vehicle_types: vec![VehicleType::Motorcycle, VehicleType::Car],
            min_rating: 3.0,
            max_distance_km: 5.0,
        }
    }
}

/// 协作方历史查询返回的订单摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingSummary {
    pub booking_id: Uuid,
    pub driver_id: Option<String>,
    pub status: BookingStatus,
    pub cancelled_by: Option<ActorRole>,
    pub created_at: DateTime<Utc>,
}
