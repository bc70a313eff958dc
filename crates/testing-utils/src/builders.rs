//! Test data builders.

use chrono::{Duration, Utc};
use uuid::Uuid;

use dispatch_domain::entities::{
    ActorRole, Booking, BookingStatus, BookingSummary, DriverCandidate, Location, VehicleType,
};

pub struct BookingBuilder {
    booking: Booking,
}

impl Default for BookingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BookingBuilder {
    pub fn new() -> Self {
        Self {
            booking: Booking::new(
                "cust-1".to_string(),
                Location::new(-6.2088, 106.8456),
                Location::new(-6.1751, 106.8650),
                VehicleType::Car,
            ),
        }
    }

    pub fn with_status(mut self, status: BookingStatus) -> Self {
        self.booking.status = status;
        self
    }

    pub fn with_driver<S: Into<String>>(mut self, driver_id: S) -> Self {
        self.booking.driver_id = Some(driver_id.into());
        self
    }

    pub fn accepted_by<S: Into<String>>(mut self, driver_id: S) -> Self {
        self.booking.status = BookingStatus::Accepted;
        self.booking.driver_id = Some(driver_id.into());
        self.booking.accepted_at = Some(Utc::now());
        self
    }

    pub fn build(self) -> Booking {
        self.booking
    }
}

pub struct CandidateBuilder {
    candidate: DriverCandidate,
}

impl Default for CandidateBuilder {
    fn default() -> Self {
        Self::new("drv-1")
    }
}

impl CandidateBuilder {
    pub fn new<S: Into<String>>(driver_id: S) -> Self {
        Self {
            candidate: DriverCandidate {
                driver_id: driver_id.into(),
                location: Location::new(-6.2088, 106.8456),
                rating: 4.5,
                vehicle_type: VehicleType::Car,
                distance_km: 0.0,
                is_preferred: false,
                previous_trip_count: 0,
            },
        }
    }

    /// 把司机放到参考点正北方向约 km 公里处
    pub fn km_north_of(mut self, reference: Location, km: f64) -> Self {
        // 纬度一度约 111.19 公里（大圆）
        self.candidate.location =
            Location::new(reference.lat + km / 111.19, reference.lng);
        self
    }

    pub fn with_rating(mut self, rating: f64) -> Self {
        self.candidate.rating = rating;
        self
    }

    pub fn build(self) -> DriverCandidate {
        self.candidate
    }
}

pub struct SummaryBuilder {
    summary: BookingSummary,
}

impl Default for SummaryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SummaryBuilder {
    pub fn new() -> Self {
        Self {
            summary: BookingSummary {
                booking_id: Uuid::new_v4(),
                driver_id: None,
                status: BookingStatus::Completed,
                cancelled_by: None,
                created_at: Utc::now(),
            },
        }
    }

    pub fn completed_with<S: Into<String>>(mut self, driver_id: S) -> Self {
        self.summary.driver_id = Some(driver_id.into());
        self.summary.status = BookingStatus::Completed;
        self
    }

    pub fn cancelled_by_driver<S: Into<String>>(mut self, driver_id: S) -> Self {
        self.summary.driver_id = Some(driver_id.into());
        self.summary.status = BookingStatus::Cancelled;
        self.summary.cancelled_by = Some(ActorRole::Driver);
        self
    }

    pub fn days_ago(mut self, days: i64) -> Self {
        self.summary.created_at = Utc::now() - Duration::days(days);
        self
    }

    pub fn build(self) -> BookingSummary {
        self.summary
    }
}
