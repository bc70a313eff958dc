//! 领域事件
//!
//! 订单派单链路上的全部领域事件；事件至少一次投递，消费方必须幂等

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{Actor, DriverCandidate, Location};

/// 领域事件基础trait
pub trait DomainEvent: Send + Sync {
    fn event_id(&self) -> Uuid;
    fn event_type(&self) -> &str;
    fn occurred_at(&self) -> DateTime<Utc>;
    fn aggregate_id(&self) -> String;
}

/// 订单派单事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BookingEvent {
    Created {
        id: Uuid,
        booking_id: Uuid,
        customer_id: String,
        pickup_location: Location,
        destination_location: Location,
        occurred_at: DateTime<Utc>,
    },
    DriverSearchRequested {
        id: Uuid,
        booking_id: Uuid,
        customer_id: String,
        pickup_location: Location,
        radius_km: f64,
        /// 第几轮搜索，重新撮合时递增
        attempt: u32,
        occurred_at: DateTime<Utc>,
    },
    NearbyDriversFound {
        id: Uuid,
        booking_id: Uuid,
        customer_id: String,
        candidates: Vec<DriverCandidate>,
        search_radius_km: f64,
        occurred_at: DateTime<Utc>,
    },
    DriversReady {
        id: Uuid,
        booking_id: Uuid,
        customer_id: String,
        eligible_driver_ids: Vec<String>,
        candidates: Vec<DriverCandidate>,
        expires_at: DateTime<Utc>,
        occurred_at: DateTime<Utc>,
    },
    Accepted {
        id: Uuid,
        booking_id: Uuid,
        customer_id: String,
        driver_id: String,
        occurred_at: DateTime<Utc>,
    },
    Rejected {
        id: Uuid,
        booking_id: Uuid,
        driver_id: String,
        occurred_at: DateTime<Utc>,
    },
    Taken {
        id: Uuid,
        booking_id: Uuid,
        taken_by_driver_id: String,
        occurred_at: DateTime<Utc>,
    },
    Cancelled {
        id: Uuid,
        booking_id: Uuid,
        cancelled_by: Actor,
        occurred_at: DateTime<Utc>,
    },
    Completed {
        id: Uuid,
        booking_id: Uuid,
        occurred_at: DateTime<Utc>,
    },
}

impl BookingEvent {
    pub fn booking_id(&self) -> Uuid {
        match self {
            BookingEvent::Created { booking_id, .. }
            | BookingEvent::DriverSearchRequested { booking_id, .. }
            | BookingEvent::NearbyDriversFound { booking_id, .. }
            | BookingEvent::DriversReady { booking_id, .. }
            | BookingEvent::Accepted { booking_id, .. }
            | BookingEvent::Rejected { booking_id, .. }
            | BookingEvent::Taken { booking_id, .. }
            | BookingEvent::Cancelled { booking_id, .. }
            | BookingEvent::Completed { booking_id, .. } => *booking_id,
        }
    }
}

impl DomainEvent for BookingEvent {
    fn event_id(&self) -> Uuid {
        match self {
            BookingEvent::Created { id, .. }
            | BookingEvent::DriverSearchRequested { id, .. }
            | BookingEvent::NearbyDriversFound { id, .. }
            | BookingEvent::DriversReady { id, .. }
            | BookingEvent::Accepted { id, .. }
            | BookingEvent::Rejected { id, .. }
            | BookingEvent::Taken { id, .. }
            | BookingEvent::Cancelled { id, .. }
            | BookingEvent::Completed { id, .. } => *id,
        }
    }

    fn event_type(&self) -> &str {
        match self {
            BookingEvent::Created { .. } => "booking.created",
            BookingEvent::DriverSearchRequested { .. } => "booking.driver_search_requested",
            BookingEvent::NearbyDriversFound { .. } => "booking.nearby_drivers_found",
            BookingEvent::DriversReady { .. } => "booking.drivers_ready",
            BookingEvent::Accepted { .. } => "booking.accepted",
            BookingEvent::Rejected { .. } => "booking.rejected",
            BookingEvent::Taken { .. } => "booking.taken",
            BookingEvent::Cancelled { .. } => "booking.cancelled",
            BookingEvent::Completed { .. } => "booking.completed",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            BookingEvent::Created { occurred_at, .. }
            | BookingEvent::DriverSearchRequested { occurred_at, .. }
            | BookingEvent::NearbyDriversFound { occurred_at, .. }
            | BookingEvent::DriversReady { occurred_at, .. }
            | BookingEvent::Accepted { occurred_at, .. }
            | BookingEvent::Rejected { occurred_at, .. }
            | BookingEvent::Taken { occurred_at, .. }
            | BookingEvent::Cancelled { occurred_at, .. }
            | BookingEvent::Completed { occurred_at, .. } => *occurred_at,
        }
    }

    fn aggregate_id(&self) -> String {
        self.booking_id().to_string()
    }
}

/// 消息队列投递的信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub event: BookingEvent,
    pub timestamp: DateTime<Utc>,
    pub retry_count: i32,
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn from_event(event: BookingEvent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            retry_count: 0,
            correlation_id: Some(event.aggregate_id()),
            event,
        }
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ActorRole;

    fn sample_accepted() -> BookingEvent {
        BookingEvent::Accepted {
            id: Uuid::new_v4(),
            booking_id: Uuid::new_v4(),
            customer_id: "cust-1".to_string(),
            driver_id: "drv-1".to_string(),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn test_event_types_match_published_names() {
        let booking_id = Uuid::new_v4();
        let cancelled = BookingEvent::Cancelled {
            id: Uuid::new_v4(),
            booking_id,
            cancelled_by: Actor {
                role: ActorRole::Customer,
                id: "cust-1".to_string(),
            },
            occurred_at: Utc::now(),
        };
        assert_eq!(cancelled.event_type(), "booking.cancelled");
        assert_eq!(cancelled.aggregate_id(), booking_id.to_string());
        assert_eq!(sample_accepted().event_type(), "booking.accepted");
    }

    #[test]
    fn test_event_round_trips_through_json() {
        let event = sample_accepted();
        let json = serde_json::to_string(&event).unwrap();
        let back: BookingEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_id(), event.event_id());
        assert_eq!(back.booking_id(), event.booking_id());
    }

    #[test]
    fn test_message_envelope_carries_correlation() {
        let event = sample_accepted();
        let booking_id = event.booking_id();
        let mut message = Message::from_event(event);
        assert_eq!(message.correlation_id.as_deref(), Some(booking_id.to_string().as_str()));
        assert_eq!(message.retry_count, 0);
        message.increment_retry();
        assert_eq!(message.retry_count, 1);
    }
}
