//! In-memory mock implementations of the dispatch ports.
//!
//! `MockBookingRepository` keeps the real compare-and-set semantics of the
//! production repositories so race tests exercise the actual concurrency
//! contract, not a stub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use dispatch_domain::collaborators::{
    BookingHistoryService, CustomerNotice, DriverDirectory, NotificationGateway,
};
use dispatch_domain::entities::{
    Booking, BookingStatus, BookingSummary, CustomerPreferences, DriverAvailability,
    DriverCandidate, Location, TransitionUpdate, VehicleType,
};
use dispatch_domain::events::Message;
use dispatch_domain::messaging::MessageQueue;
use dispatch_domain::repositories::BookingRepository;
use dispatch_errors::{DispatchError, DispatchResult};

#[derive(Debug, Default)]
pub struct MockBookingRepository {
    bookings: RwLock<HashMap<Uuid, Booking>>,
}

impl MockBookingRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BookingRepository for MockBookingRepository {
    async fn create(&self, booking: &Booking) -> DispatchResult<Booking> {
        let mut bookings = self.bookings.write().await;
        bookings.insert(booking.id, booking.clone());
        Ok(booking.clone())
    }

    async fn find_by_id(&self, id: Uuid) -> DispatchResult<Option<Booking>> {
        let bookings = self.bookings.read().await;
        Ok(bookings.get(&id).cloned())
    }

    async fn conditional_transition(
        &self,
        id: Uuid,
        expected: BookingStatus,
        update: TransitionUpdate,
    ) -> DispatchResult<Booking> {
        // Single write lock makes check-and-apply atomic, mirroring the
        // conditional UPDATE of the SQLite repository.
        let mut bookings = self.bookings.write().await;
        let booking = bookings
            .get_mut(&id)
            .ok_or_else(|| DispatchError::booking_not_found(id))?;
        if booking.status != expected {
            return Err(DispatchError::TransitionConflict {
                id: id.to_string(),
                expected: expected.to_string(),
                actual: booking.status.to_string(),
            });
        }
        booking.apply_transition(&update);
        Ok(booking.clone())
    }

    async fn find_active_by_driver(&self, driver_id: &str) -> DispatchResult<Vec<Booking>> {
        let bookings = self.bookings.read().await;
        Ok(bookings
            .values()
            .filter(|b| {
                b.driver_id.as_deref() == Some(driver_id)
                    && matches!(b.status, BookingStatus::Accepted | BookingStatus::Ongoing)
            })
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MockMessageQueue {
    queues: Mutex<HashMap<String, Vec<Message>>>,
    /// Every message ever published, in order, for assertions.
    log: Mutex<Vec<(String, Message)>>,
}

impl MockMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<(String, Message)> {
        self.log.lock().await.clone()
    }

    pub async fn published_event_types(&self) -> Vec<String> {
        use dispatch_domain::events::DomainEvent;
        self.log
            .lock()
            .await
            .iter()
            .map(|(_, m)| m.event.event_type().to_string())
            .collect()
    }
}

#[async_trait]
impl MessageQueue for MockMessageQueue {
    async fn publish_message(&self, queue: &str, message: &Message) -> DispatchResult<()> {
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .push(message.clone());
        self.log
            .lock()
            .await
            .push((queue.to_string(), message.clone()));
        Ok(())
    }

    async fn consume_messages(&self, queue: &str) -> DispatchResult<Vec<Message>> {
        let mut queues = self.queues.lock().await;
        Ok(queues.remove(queue).unwrap_or_default())
    }

    async fn create_queue(&self, _queue: &str, _durable: bool) -> DispatchResult<()> {
        Ok(())
    }

    async fn get_queue_size(&self, queue: &str) -> DispatchResult<u32> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map(|q| q.len() as u32).unwrap_or(0))
    }

    async fn purge_queue(&self, queue: &str) -> DispatchResult<()> {
        self.queues.lock().await.remove(queue);
        Ok(())
    }
}

/// Driver directory fake with scripted failures.
#[derive(Debug, Default)]
pub struct MockDriverDirectory {
    online: RwLock<Vec<DriverCandidate>>,
    unavailable: RwLock<Vec<String>>,
    /// Remaining `find_online_drivers` calls that fail with a timeout.
    fail_online_calls: AtomicU32,
    /// Remaining `check_drivers_availability` calls that fail.
    fail_availability_calls: AtomicU32,
    online_calls: AtomicU32,
}

impl MockDriverDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_online_drivers(&self, drivers: Vec<DriverCandidate>) {
        *self.online.write().await = drivers;
    }

    pub async fn set_unavailable(&self, driver_ids: Vec<String>) {
        *self.unavailable.write().await = driver_ids;
    }

    pub fn fail_next_online_calls(&self, count: u32) {
        self.fail_online_calls.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_availability_calls(&self, count: u32) {
        self.fail_availability_calls.store(count, Ordering::SeqCst);
    }

    pub fn online_call_count(&self) -> u32 {
        self.online_calls.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DriverDirectory for MockDriverDirectory {
    async fn find_online_drivers(
        &self,
        vehicle_types: &[VehicleType],
        excluded_ids: &[String],
        _near: Location,
    ) -> DispatchResult<Vec<DriverCandidate>> {
        self.online_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_online_calls) {
            return Err(DispatchError::Timeout(
                "driver directory timed out".to_string(),
            ));
        }
        let online = self.online.read().await;
        Ok(online
            .iter()
            .filter(|c| vehicle_types.contains(&c.vehicle_type))
            .filter(|c| !excluded_ids.contains(&c.driver_id))
            .cloned()
            .collect())
    }

    async fn check_drivers_availability(
        &self,
        driver_ids: &[String],
    ) -> DispatchResult<Vec<DriverAvailability>> {
        if Self::take_failure(&self.fail_availability_calls) {
            return Err(DispatchError::Timeout(
                "availability check timed out".to_string(),
            ));
        }
        let unavailable = self.unavailable.read().await;
        Ok(driver_ids
            .iter()
            .map(|id| DriverAvailability {
                driver_id: id.clone(),
                is_available: !unavailable.contains(id),
            })
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MockBookingHistoryService {
    cancelled: RwLock<Vec<BookingSummary>>,
    history: RwLock<Vec<BookingSummary>>,
    preferences: RwLock<Option<CustomerPreferences>>,
    fail_calls: AtomicU32,
}

impl MockBookingHistoryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_cancelled_bookings(&self, bookings: Vec<BookingSummary>) {
        *self.cancelled.write().await = bookings;
    }

    pub async fn set_booking_history(&self, bookings: Vec<BookingSummary>) {
        *self.history.write().await = bookings;
    }

    pub async fn set_preferences(&self, preferences: Option<CustomerPreferences>) {
        *self.preferences.write().await = preferences;
    }

    pub fn fail_next_calls(&self, count: u32) {
        self.fail_calls.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.fail_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BookingHistoryService for MockBookingHistoryService {
    async fn cancelled_bookings(
        &self,
        _customer_id: &str,
        _days_back: u32,
    ) -> DispatchResult<Vec<BookingSummary>> {
        if self.take_failure() {
            return Err(DispatchError::Network("history unavailable".to_string()));
        }
        Ok(self.cancelled.read().await.clone())
    }

    async fn booking_history(
        &self,
        _customer_id: &str,
        _days_back: u32,
        limit: usize,
    ) -> DispatchResult<Vec<BookingSummary>> {
        if self.take_failure() {
            return Err(DispatchError::Network("history unavailable".to_string()));
        }
        let history = self.history.read().await;
        Ok(history.iter().take(limit).cloned().collect())
    }

    async fn customer_preferences(
        &self,
        _customer_id: &str,
    ) -> DispatchResult<Option<CustomerPreferences>> {
        if self.take_failure() {
            return Err(DispatchError::Network("history unavailable".to_string()));
        }
        Ok(self.preferences.read().await.clone())
    }
}

/// Recorded outbound notification.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedNotification {
    DriverRequest {
        driver_id: String,
        booking_id: Uuid,
    },
    BookingTaken {
        driver_id: String,
        booking_id: Uuid,
        taken_by: String,
    },
    BookingCancelled {
        driver_id: String,
        booking_id: Uuid,
    },
    Customer {
        customer_id: String,
        booking_id: Uuid,
        notice: CustomerNotice,
    },
}

#[derive(Debug, Default)]
pub struct MockNotificationGateway {
    sent: Mutex<Vec<RecordedNotification>>,
    fail_calls: AtomicU32,
}

impl MockNotificationGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<RecordedNotification> {
        self.sent.lock().await.clone()
    }

    pub fn fail_next_calls(&self, count: u32) {
        self.fail_calls.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.fail_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }

    async fn record(&self, notification: RecordedNotification) -> DispatchResult<()> {
        if self.take_failure() {
            return Err(DispatchError::Network("push gateway down".to_string()));
        }
        self.sent.lock().await.push(notification);
        Ok(())
    }
}

#[async_trait]
impl NotificationGateway for MockNotificationGateway {
    async fn notify_driver_request(
        &self,
        driver_id: &str,
        booking_id: Uuid,
        _pickup: Location,
    ) -> DispatchResult<()> {
        self.record(RecordedNotification::DriverRequest {
            driver_id: driver_id.to_string(),
            booking_id,
        })
        .await
    }

    async fn notify_booking_taken(
        &self,
        driver_id: &str,
        booking_id: Uuid,
        taken_by: &str,
    ) -> DispatchResult<()> {
        self.record(RecordedNotification::BookingTaken {
            driver_id: driver_id.to_string(),
            booking_id,
            taken_by: taken_by.to_string(),
        })
        .await
    }

    async fn notify_booking_cancelled(
        &self,
        driver_id: &str,
        booking_id: Uuid,
    ) -> DispatchResult<()> {
        self.record(RecordedNotification::BookingCancelled {
            driver_id: driver_id.to_string(),
            booking_id,
        })
        .await
    }

    async fn notify_customer(
        &self,
        customer_id: &str,
        booking_id: Uuid,
        notice: CustomerNotice,
    ) -> DispatchResult<()> {
        self.record(RecordedNotification::Customer {
            customer_id: customer_id.to_string(),
            booking_id,
            notice,
        })
        .await
    }
}
