pub mod sqlite;

pub use sqlite::SqliteBookingRepository;
