//! 协作方服务的 HTTP 客户端
//!
//! 按 JSON 请求/响应消费在线司机目录、订单历史与推送网关。
//! 这里只做传输与映射，重试与熔断由上层 ResilientCaller 负责。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dispatch_domain::collaborators::{
    BookingHistoryService, CustomerNotice, DriverDirectory, NotificationGateway,
};
use dispatch_domain::entities::{
    BookingSummary, CustomerPreferences, DriverAvailability, DriverCandidate, Location,
    VehicleType,
};
use dispatch_errors::{DispatchError, DispatchResult};

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

fn build_client() -> DispatchResult<Client> {
    Client::builder()
        .timeout(DEFAULT_HTTP_TIMEOUT)
        .build()
        .map_err(|e| DispatchError::Internal(format!("构建 HTTP 客户端失败: {e}")))
}

fn transport_err(context: &str, e: reqwest::Error) -> DispatchError {
    if e.is_timeout() {
        DispatchError::Timeout(format!("{context}: {e}"))
    } else {
        DispatchError::Network(format!("{context}: {e}"))
    }
}

async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
    client: &Client,
    url: &str,
    body: &Req,
) -> DispatchResult<Resp> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| transport_err(url, e))?;

    if !response.status().is_success() {
        return Err(DispatchError::Network(format!(
            "{url} 返回 {}",
            response.status()
        )));
    }

    response.json().await.map_err(|e| transport_err(url, e))
}

#[derive(Debug, Serialize)]
struct FindOnlineDriversRequest<'a> {
    vehicle_types: &'a [VehicleType],
    excluded_ids: &'a [String],
    ref_location: Location,
}

#[derive(Debug, Serialize)]
struct CheckAvailabilityRequest<'a> {
    driver_ids: &'a [String],
}

pub struct HttpDriverDirectory {
    client: Client,
    base_url: String,
}

impl HttpDriverDirectory {
    pub fn new(base_url: String) -> DispatchResult<Self> {
        Ok(Self {
            client: build_client()?,
            base_url,
        })
    }
}

#[async_trait]
impl DriverDirectory for HttpDriverDirectory {
    async fn find_online_drivers(
        &self,
        vehicle_types: &[VehicleType],
        excluded_ids: &[String],
        near: Location,
    ) -> DispatchResult<Vec<DriverCandidate>> {
        post_json(
            &self.client,
            &format!("{}/drivers/online/search", self.base_url),
            &FindOnlineDriversRequest {
                vehicle_types,
                excluded_ids,
                ref_location: near,
            },
        )
        .await
    }

    async fn check_drivers_availability(
        &self,
        driver_ids: &[String],
    ) -> DispatchResult<Vec<DriverAvailability>> {
        post_json(
            &self.client,
            &format!("{}/drivers/availability", self.base_url),
            &CheckAvailabilityRequest { driver_ids },
        )
        .await
    }
}

#[derive(Debug, Serialize)]
struct HistoryRequest<'a> {
    customer_id: &'a str,
    days_back: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
}

pub struct HttpBookingHistoryService {
    client: Client,
    base_url: String,
}

impl HttpBookingHistoryService {
    pub fn new(base_url: String) -> DispatchResult<Self> {
        Ok(Self {
            client: build_client()?,
            base_url,
        })
    }
}

#[async_trait]
impl BookingHistoryService for HttpBookingHistoryService {
    async fn cancelled_bookings(
        &self,
        customer_id: &str,
        days_back: u32,
    ) -> DispatchResult<Vec<BookingSummary>> {
        post_json(
            &self.client,
            &format!("{}/customers/cancelled-bookings", self.base_url),
            &HistoryRequest {
                customer_id,
                days_back,
                limit: None,
            },
        )
        .await
    }

    async fn booking_history(
        &self,
        customer_id: &str,
        days_back: u32,
        limit: usize,
    ) -> DispatchResult<Vec<BookingSummary>> {
        post_json(
            &self.client,
            &format!("{}/customers/booking-history", self.base_url),
            &HistoryRequest {
                customer_id,
                days_back,
                limit: Some(limit),
            },
        )
        .await
    }

    async fn customer_preferences(
        &self,
        customer_id: &str,
    ) -> DispatchResult<Option<CustomerPreferences>> {
        let url = format!("{}/customers/{customer_id}/preferences", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_err(&url, e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(DispatchError::Network(format!(
                "{url} 返回 {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| transport_err(&url, e))
    }
}

#[derive(Debug, Serialize)]
struct DriverPush<'a> {
    driver_id: &'a str,
    booking_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pickup_location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    taken_by: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct CustomerPush<'a> {
    customer_id: &'a str,
    booking_id: Uuid,
    notice: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    driver_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    driver_id: Option<&'a str>,
}

pub struct HttpNotificationGateway {
    client: Client,
    base_url: String,
}

impl HttpNotificationGateway {
    pub fn new(base_url: String) -> DispatchResult<Self> {
        Ok(Self {
            client: build_client()?,
            base_url,
        })
    }

    async fn push<B: Serialize>(&self, path: &str, body: &B) -> DispatchResult<()> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_err(&url, e))?;
        if !response.status().is_success() {
            return Err(DispatchError::Network(format!(
                "{url} 返回 {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationGateway for HttpNotificationGateway {
    async fn notify_driver_request(
        &self,
        driver_id: &str,
        booking_id: Uuid,
        pickup: Location,
    ) -> DispatchResult<()> {
        self.push(
            "/push/driver/booking-request",
            &DriverPush {
                driver_id,
                booking_id,
                pickup_location: Some(pickup),
                taken_by: None,
            },
        )
        .await
    }

    async fn notify_booking_taken(
        &self,
        driver_id: &str,
        booking_id: Uuid,
        taken_by: &str,
    ) -> DispatchResult<()> {
        self.push(
            "/push/driver/booking-taken",
            &DriverPush {
                driver_id,
                booking_id,
                pickup_location: None,
                taken_by: Some(taken_by),
            },
        )
        .await
    }

    async fn notify_booking_cancelled(
        &self,
        driver_id: &str,
        booking_id: Uuid,
    ) -> DispatchResult<()> {
        self.push(
            "/push/driver/booking-cancelled",
            &DriverPush {
                driver_id,
                booking_id,
                pickup_location: None,
                taken_by: None,
            },
        )
        .await
    }

    async fn notify_customer(
        &self,
        customer_id: &str,
        booking_id: Uuid,
        notice: CustomerNotice,
    ) -> DispatchResult<()> {
        let (kind, driver_count, driver_id) = match &notice {
            CustomerNotice::RequestBroadcast { driver_count } => {
                ("request_broadcast", Some(*driver_count), None)
            }
            CustomerNotice::DriverAssigned { driver_id } => {
                ("driver_assigned", None, Some(driver_id.as_str()))
            }
            CustomerNotice::NoDriversAvailable => ("no_drivers_available", None, None),
            CustomerNotice::BookingCancelled => ("booking_cancelled", None, None),
        };
        self.push(
            "/push/customer",
            &CustomerPush {
                customer_id,
                booking_id,
                notice: kind,
                driver_count,
                driver_id,
            },
        )
        .await
    }
}
