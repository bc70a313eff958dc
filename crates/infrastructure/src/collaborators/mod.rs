pub mod http;

pub use http::{HttpBookingHistoryService, HttpDriverDirectory, HttpNotificationGateway};
