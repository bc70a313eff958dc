//! Redis-backed eligibility and match-cache store.
//!
//! Key layout (TTL in parentheses):
//! `eligible:{booking_id}` set (2h), `rejected:{booking_id}` set (2h),
//! `blocked:{customer_id}` value (1h), `search-cache:{customer_id}` value (10min).
//! Business logic never sees these keys, only the store ports.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;
use uuid::Uuid;

use dispatch_domain::entities::DriverCandidate;
use dispatch_domain::repositories::{EligibilityStore, MatchCache};
use dispatch_errors::{DispatchError, DispatchResult};

pub struct RedisDispatchStore {
    connection: ConnectionManager,
}

fn storage_err(context: &str, e: redis::RedisError) -> DispatchError {
    DispatchError::Storage(format!("{context}: {e}"))
}

fn eligible_key(booking_id: Uuid) -> String {
    format!("eligible:{booking_id}")
}
fn rejected_key(booking_id: Uuid) -> String {
    format!("rejected:{booking_id}")
}
fn blocked_key(customer_id: &str) -> String {
    format!("blocked:{customer_id}")
}
fn search_cache_key(customer_id: &str) -> String {
    format!("search-cache:{customer_id}")
}

impl RedisDispatchStore {
    pub async fn new(redis_url: &str) -> DispatchResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| DispatchError::Storage(format!("invalid redis url: {e}")))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| DispatchError::Storage(format!("redis connection failed: {e}")))?;
        debug!("connected to redis eligibility store");
        Ok(Self { connection })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }

    async fn set_members(&self, key: &str) -> DispatchResult<Vec<String>> {
        let mut conn = self.conn();
        conn.smembers(key)
            .await
            .map_err(|e| storage_err("SMEMBERS failed", e))
    }
}

#[async_trait]
impl EligibilityStore for RedisDispatchStore {
    async fn grant(
        &self,
        booking_id: Uuid,
        driver_ids: &[String],
        ttl: Duration,
    ) -> DispatchResult<()> {
        if driver_ids.is_empty() {
            return Ok(());
        }
        let key = eligible_key(booking_id);
        let mut conn = self.conn();
        // SADD 与 EXPIRE 必须原子提交，否则中途失败会留下永不过期的许可集合
        let _: () = redis::pipe()
            .atomic()
            .sadd(&key, driver_ids)
            .ignore()
            .expire(&key, ttl.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| storage_err("SADD/EXPIRE pipeline failed", e))?;
        Ok(())
    }

    async fn is_eligible(&self, booking_id: Uuid, driver_id: &str) -> DispatchResult<bool> {
        let mut conn = self.conn();
        conn.sismember(eligible_key(booking_id), driver_id)
            .await
            .map_err(|e| storage_err("SISMEMBER failed", e))
    }

    async fn list_eligible(&self, booking_id: Uuid) -> DispatchResult<Vec<String>> {
        self.set_members(&eligible_key(booking_id)).await
    }

    async fn revoke(&self, booking_id: Uuid, driver_id: &str) -> DispatchResult<()> {
        let mut conn = self.conn();
        let _: () = conn
            .srem(eligible_key(booking_id), driver_id)
            .await
            .map_err(|e| storage_err("SREM failed", e))?;
        Ok(())
    }

    async fn revoke_all(&self, booking_id: Uuid) -> DispatchResult<()> {
        let mut conn = self.conn();
        let _: () = conn
            .del(eligible_key(booking_id))
            .await
            .map_err(|e| storage_err("DEL failed", e))?;
        Ok(())
    }

    async fn record_rejection(
        &self,
        booking_id: Uuid,
        driver_id: &str,
        ttl: Duration,
    ) -> DispatchResult<()> {
        let key = rejected_key(booking_id);
        let mut conn = self.conn();
        // 同 grant：拒单集合的写入与 TTL 原子提交
        let _: () = redis::pipe()
            .atomic()
            .sadd(&key, driver_id)
            .ignore()
            .expire(&key, ttl.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| storage_err("SADD/EXPIRE pipeline failed", e))?;
        Ok(())
    }

    async fn list_rejections(&self, booking_id: Uuid) -> DispatchResult<Vec<String>> {
        self.set_members(&rejected_key(booking_id)).await
    }

    async fn clear_rejections(&self, booking_id: Uuid) -> DispatchResult<()> {
        let mut conn = self.conn();
        let _: () = conn
            .del(rejected_key(booking_id))
            .await
            .map_err(|e| storage_err("DEL failed", e))?;
        Ok(())
    }
}

#[async_trait]
impl MatchCache for RedisDispatchStore {
    async fn get_blocked_drivers(&self, customer_id: &str) -> DispatchResult<Option<Vec<String>>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get(blocked_key(customer_id))
            .await
            .map_err(|e| storage_err("GET failed", e))?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put_blocked_drivers(
        &self,
        customer_id: &str,
        driver_ids: &[String],
        ttl: Duration,
    ) -> DispatchResult<()> {
        let json = serde_json::to_string(driver_ids)?;
        let mut conn = self.conn();
        let _: () = conn
            .set_ex(blocked_key(customer_id), json, ttl.as_secs())
            .await
            .map_err(|e| storage_err("SETEX failed", e))?;
        Ok(())
    }

    async fn get_search_result(
        &self,
        customer_id: &str,
    ) -> DispatchResult<Option<Vec<DriverCandidate>>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get(search_cache_key(customer_id))
            .await
            .map_err(|e| storage_err("GET failed", e))?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put_search_result(
        &self,
        customer_id: &str,
        candidates: &[DriverCandidate],
        ttl: Duration,
    ) -> DispatchResult<()> {
        let json = serde_json::to_string(candidates)?;
        let mut conn = self.conn();
        let _: () = conn
            .set_ex(search_cache_key(customer_id), json, ttl.as_secs())
            .await
            .map_err(|e| storage_err("SETEX failed", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let booking_id = Uuid::nil();
        assert_eq!(
            eligible_key(booking_id),
            "eligible:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            rejected_key(booking_id),
            "rejected:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(blocked_key("cust-1"), "blocked:cust-1");
        assert_eq!(search_cache_key("cust-1"), "search-cache:cust-1");
    }
}
