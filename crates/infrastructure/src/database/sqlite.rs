//! SQLite 订单仓储
//!
//! 条件流转通过带状态前置条件的 UPDATE 落地，
//! rows_affected == 0 再回查一次区分 NotFound 与并发冲突。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use dispatch_domain::entities::{
    Booking, BookingStatus, Location, TransitionUpdate, VehicleType,
};
use dispatch_domain::repositories::BookingRepository;
use dispatch_errors::{DispatchError, DispatchResult};

pub struct SqliteBookingRepository {
    pool: SqlitePool,
}

fn status_to_str(status: BookingStatus) -> &'static str {
    status.as_str()
}

fn status_from_str(s: &str) -> DispatchResult<BookingStatus> {
    match s {
        "PENDING" => Ok(BookingStatus::Pending),
        "ACCEPTED" => Ok(BookingStatus::Accepted),
        "ONGOING" => Ok(BookingStatus::Ongoing),
        "COMPLETED" => Ok(BookingStatus::Completed),
        "CANCELLED" => Ok(BookingStatus::Cancelled),
        other => Err(DispatchError::storage_error(format!(
            "非法的订单状态值: {other}"
        ))),
    }
}

fn vehicle_to_str(vehicle: VehicleType) -> &'static str {
    match vehicle {
        VehicleType::Motorcycle => "motorcycle",
        VehicleType::Car => "car",
    }
}

fn vehicle_from_str(s: &str) -> DispatchResult<VehicleType> {
    match s {
        "motorcycle" => Ok(VehicleType::Motorcycle),
        "car" => Ok(VehicleType::Car),
        other => Err(DispatchError::storage_error(format!(
            "非法的车型值: {other}"
        ))),
    }
}

impl SqliteBookingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 嵌入式部署启动时建表
    pub async fn init_schema(pool: &SqlitePool) -> DispatchResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bookings (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                driver_id TEXT,
                pickup_lat REAL NOT NULL,
                pickup_lng REAL NOT NULL,
                destination_lat REAL NOT NULL,
                destination_lng REAL NOT NULL,
                vehicle_type TEXT NOT NULL,
                status TEXT NOT NULL,
                accepted_at TEXT,
                cancelled_at TEXT,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| DispatchError::storage_error(format!("初始化订单表失败: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_bookings_driver_status \
             ON bookings (driver_id, status)",
        )
        .execute(pool)
        .await
        .map_err(|e| DispatchError::storage_error(format!("初始化订单索引失败: {e}")))?;
        Ok(())
    }

    fn row_to_booking(row: &sqlx::sqlite::SqliteRow) -> DispatchResult<Booking> {
        let id: String = row
            .try_get("id")
            .map_err(|e| DispatchError::storage_error(e.to_string()))?;
        let status: String = row
            .try_get("status")
            .map_err(|e| DispatchError::storage_error(e.to_string()))?;
        let vehicle_type: String = row
            .try_get("vehicle_type")
            .map_err(|e| DispatchError::storage_error(e.to_string()))?;

        let get_ts = |column: &str| -> DispatchResult<Option<DateTime<Utc>>> {
            row.try_get::<Option<DateTime<Utc>>, _>(column)
                .map_err(|e| DispatchError::storage_error(e.to_string()))
        };
        let get_f64 = |column: &str| -> DispatchResult<f64> {
            row.try_get::<f64, _>(column)
                .map_err(|e| DispatchError::storage_error(e.to_string()))
        };

        Ok(Booking {
            id: Uuid::parse_str(&id)
                .map_err(|e| DispatchError::storage_error(format!("非法的订单 id: {e}")))?,
            customer_id: row
                .try_get("customer_id")
                .map_err(|e| DispatchError::storage_error(e.to_string()))?,
            driver_id: row
                .try_get("driver_id")
                .map_err(|e| DispatchError::storage_error(e.to_string()))?,
            pickup_location: Location::new(get_f64("pickup_lat")?, get_f64("pickup_lng")?),
            destination_location: Location::new(
                get_f64("destination_lat")?,
                get_f64("destination_lng")?,
            ),
            vehicle_type: vehicle_from_str(&vehicle_type)?,
            status: status_from_str(&status)?,
            accepted_at: get_ts("accepted_at")?,
            cancelled_at: get_ts("cancelled_at")?,
            started_at: get_ts("started_at")?,
            completed_at: get_ts("completed_at")?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| DispatchError::storage_error(e.to_string()))?,
            updated_at: row
                .try_get("updated_at")
                .map_err(|e| DispatchError::storage_error(e.to_string()))?,
        })
    }
}

#[async_trait]
impl BookingRepository for SqliteBookingRepository {
    #[instrument(skip(self, booking), fields(booking_id = %booking.id))]
    async fn create(&self, booking: &Booking) -> DispatchResult<Booking> {
        sqlx::query(
            r#"
            INSERT INTO bookings (id, customer_id, driver_id,
                pickup_lat, pickup_lng, destination_lat, destination_lng,
                vehicle_type, status,
                accepted_at, cancelled_at, started_at, completed_at,
                created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(booking.id.to_string())
        .bind(&booking.customer_id)
        .bind(&booking.driver_id)
        .bind(booking.pickup_location.lat)
        .bind(booking.pickup_location.lng)
        .bind(booking.destination_location.lat)
        .bind(booking.destination_location.lng)
        .bind(vehicle_to_str(booking.vehicle_type))
        .bind(status_to_str(booking.status))
        .bind(booking.accepted_at)
        .bind(booking.cancelled_at)
        .bind(booking.started_at)
        .bind(booking.completed_at)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| DispatchError::storage_error(format!("写入订单失败: {e}")))?;

        debug!(booking_id = %booking.id, "订单已创建");
        Ok(booking.clone())
    }

    async fn find_by_id(&self, id: Uuid) -> DispatchResult<Option<Booking>> {
        let row = sqlx::query("SELECT * FROM bookings WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DispatchError::storage_error(format!("查询订单失败: {e}")))?;

        row.map(|r| Self::row_to_booking(&r)).transpose()
    }

    #[instrument(skip(self, update), fields(booking_id = %id, expected = %expected, target = %update.status))]
    async fn conditional_transition(
        &self,
        id: Uuid,
        expected: BookingStatus,
        update: TransitionUpdate,
    ) -> DispatchResult<Booking> {
        let current = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| DispatchError::booking_not_found(id))?;

        let mut next = current;
        next.apply_transition(&update);

        // 带状态前置条件的 UPDATE 是唯一的并发正确性保证；
        // 上面读到的副本只用来补全不变的列
        let result = sqlx::query(
            r#"
            UPDATE bookings
            SET status = ?1, driver_id = ?2,
                accepted_at = ?3, cancelled_at = ?4, started_at = ?5, completed_at = ?6,
                updated_at = ?7
            WHERE id = ?8 AND status = ?9
            "#,
        )
        .bind(status_to_str(next.status))
        .bind(&next.driver_id)
        .bind(next.accepted_at)
        .bind(next.cancelled_at)
        .bind(next.started_at)
        .bind(next.completed_at)
        .bind(next.updated_at)
        .bind(id.to_string())
        .bind(status_to_str(expected))
        .execute(&self.pool)
        .await
        .map_err(|e| DispatchError::storage_error(format!("订单流转失败: {e}")))?;

        if result.rows_affected() == 0 {
            let actual = self
                .find_by_id(id)
                .await?
                .ok_or_else(|| DispatchError::booking_not_found(id))?;
            return Err(DispatchError::TransitionConflict {
                id: id.to_string(),
                expected: expected.to_string(),
                actual: actual.status.to_string(),
            });
        }

        debug!(booking_id = %id, status = %next.status, "订单流转已提交");
        Ok(next)
    }

    async fn find_active_by_driver(&self, driver_id: &str) -> DispatchResult<Vec<Booking>> {
        let rows = sqlx::query(
            "SELECT * FROM bookings WHERE driver_id = ?1 AND status IN ('ACCEPTED', 'ONGOING')",
        )
        .bind(driver_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DispatchError::storage_error(format!("查询司机在途订单失败: {e}")))?;

        rows.iter().map(Self::row_to_booking).collect()
    }
}
