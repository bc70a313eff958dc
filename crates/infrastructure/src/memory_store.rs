//! 内存版许可/缓存存储
//!
//! 嵌入式部署与测试使用；生产部署使用 Redis 实现。
//! 过期在读取路径上惰性判定，到期键即使未显式撤销也不可见。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use dispatch_domain::entities::DriverCandidate;
use dispatch_domain::repositories::{EligibilityStore, MatchCache};
use dispatch_errors::DispatchResult;

#[derive(Debug, Clone)]
struct SetEntry {
    members: Vec<String>,
    expires_at: Instant,
}

impl SetEntry {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Debug, Clone)]
struct ValueEntry<T> {
    value: T,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct StoreInner {
    eligible: HashMap<Uuid, SetEntry>,
    rejected: HashMap<Uuid, SetEntry>,
    blocked: HashMap<String, SetEntry>,
    search_cache: HashMap<String, ValueEntry<Vec<DriverCandidate>>>,
}

#[derive(Debug, Default)]
pub struct MemoryDispatchStore {
    inner: RwLock<StoreInner>,
}

impl MemoryDispatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 清理全部已过期的键；由调用方按需触发，正确性不依赖它
    pub async fn purge_expired(&self) {
        let mut inner = self.inner.write().await;
        inner.eligible.retain(|_, e| e.live());
        inner.rejected.retain(|_, e| e.live());
        inner.blocked.retain(|_, e| e.live());
        let now = Instant::now();
        inner.search_cache.retain(|_, e| now < e.expires_at);
    }
}

fn live_members(entry: Option<&SetEntry>) -> Vec<String> {
    match entry {
        Some(e) if e.live() => e.members.clone(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl EligibilityStore for MemoryDispatchStore {
    async fn grant(
        &self,
        booking_id: Uuid,
        driver_ids: &[String],
        ttl: Duration,
    ) -> DispatchResult<()> {
        let mut inner = self.inner.write().await;
        let expires_at = Instant::now() + ttl;
        let entry = inner.eligible.entry(booking_id).or_insert_with(|| SetEntry {
            members: Vec::new(),
            expires_at,
        });
        if !entry.live() {
            entry.members.clear();
        }
        // 续期到本次授予的窗口
        entry.expires_at = expires_at;
        for driver_id in driver_ids {
            if !entry.members.contains(driver_id) {
                entry.members.push(driver_id.clone());
            }
        }
        Ok(())
    }

    async fn is_eligible(&self, booking_id: Uuid, driver_id: &str) -> DispatchResult<bool> {
        let inner = self.inner.read().await;
        Ok(match inner.eligible.get(&booking_id) {
            Some(entry) if entry.live() => entry.members.iter().any(|d| d == driver_id),
            _ => false,
        })
    }

    async fn list_eligible(&self, booking_id: Uuid) -> DispatchResult<Vec<String>> {
        let inner = self.inner.read().await;
        Ok(live_members(inner.eligible.get(&booking_id)))
    }

    async fn revoke(&self, booking_id: Uuid, driver_id: &str) -> DispatchResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.eligible.get_mut(&booking_id) {
            entry.members.retain(|d| d != driver_id);
        }
        Ok(())
    }

    async fn revoke_all(&self, booking_id: Uuid) -> DispatchResult<()> {
        let mut inner = self.inner.write().await;
        inner.eligible.remove(&booking_id);
        Ok(())
    }

    async fn record_rejection(
        &self,
        booking_id: Uuid,
        driver_id: &str,
        ttl: Duration,
    ) -> DispatchResult<()> {
        let mut inner = self.inner.write().await;
        let expires_at = Instant::now() + ttl;
        let entry = inner.rejected.entry(booking_id).or_insert_with(|| SetEntry {
            members: Vec::new(),
            expires_at,
        });
        if !entry.live() {
            entry.members.clear();
            entry.expires_at = expires_at;
        }
        if !entry.members.iter().any(|d| d == driver_id) {
            entry.members.push(driver_id.to_string());
        }
        Ok(())
    }

    async fn list_rejections(&self, booking_id: Uuid) -> DispatchResult<Vec<String>> {
        let inner = self.inner.read().await;
        Ok(live_members(inner.rejected.get(&booking_id)))
    }

    async fn clear_rejections(&self, booking_id: Uuid) -> DispatchResult<()> {
        let mut inner = self.inner.write().await;
        inner.rejected.remove(&booking_id);
        Ok(())
    }
}

#[async_trait]
impl MatchCache for MemoryDispatchStore {
    async fn get_blocked_drivers(&self, customer_id: &str) -> DispatchResult<Option<Vec<String>>> {
        let inner = self.inner.read().await;
        Ok(match inner.blocked.get(customer_id) {
            Some(entry) if entry.live() => Some(entry.members.clone()),
            _ => None,
        })
    }

    async fn put_blocked_drivers(
        &self,
        customer_id: &str,
        driver_ids: &[String],
        ttl: Duration,
    ) -> DispatchResult<()> {
        let mut inner = self.inner.write().await;
        inner.blocked.insert(
            customer_id.to_string(),
            SetEntry {
                members: driver_ids.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get_search_result(
        &self,
        customer_id: &str,
    ) -> DispatchResult<Option<Vec<DriverCandidate>>> {
        let inner = self.inner.read().await;
        Ok(match inner.search_cache.get(customer_id) {
            Some(entry) if Instant::now() < entry.expires_at => Some(entry.value.clone()),
            _ => None,
        })
    }

    async fn put_search_result(
        &self,
        customer_id: &str,
        candidates: &[DriverCandidate],
        ttl: Duration,
    ) -> DispatchResult<()> {
        let mut inner = self.inner.write().await;
        inner.search_cache.insert(
            customer_id.to_string(),
            ValueEntry {
                value: candidates.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drivers(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_grant_and_membership() {
        let store = MemoryDispatchStore::new();
        let booking_id = Uuid::new_v4();
        store
            .grant(booking_id, &drivers(&["d1", "d2"]), Duration::from_secs(7200))
            .await
            .unwrap();

        assert!(store.is_eligible(booking_id, "d1").await.unwrap());
        assert!(store.is_eligible(booking_id, "d2").await.unwrap());
        assert!(!store.is_eligible(booking_id, "d3").await.unwrap());
        assert_eq!(
            store.list_eligible(booking_id).await.unwrap(),
            drivers(&["d1", "d2"])
        );
    }

    #[tokio::test]
    async fn test_revoke_single_and_all() {
        let store = MemoryDispatchStore::new();
        let booking_id = Uuid::new_v4();
        store
            .grant(booking_id, &drivers(&["d1", "d2"]), Duration::from_secs(60))
            .await
            .unwrap();

        store.revoke(booking_id, "d1").await.unwrap();
        assert!(!store.is_eligible(booking_id, "d1").await.unwrap());
        assert!(store.is_eligible(booking_id, "d2").await.unwrap());

        store.revoke_all(booking_id).await.unwrap();
        assert!(store.list_eligible(booking_id).await.unwrap().is_empty());
    }

    // 时间旅行测试：TTL 到期后即使从未撤销，许可也必须失效
    #[tokio::test(start_paused = true)]
    async fn test_eligibility_expires_without_revocation() {
        let store = MemoryDispatchStore::new();
        let booking_id = Uuid::new_v4();
        store
            .grant(booking_id, &drivers(&["d1"]), Duration::from_secs(7200))
            .await
            .unwrap();
        assert!(store.is_eligible(booking_id, "d1").await.unwrap());

        tokio::time::advance(Duration::from_secs(7199)).await;
        assert!(store.is_eligible(booking_id, "d1").await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.is_eligible(booking_id, "d1").await.unwrap());
        assert!(store.list_eligible(booking_id).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_expire() {
        let store = MemoryDispatchStore::new();
        let booking_id = Uuid::new_v4();
        store
            .record_rejection(booking_id, "d1", Duration::from_secs(7200))
            .await
            .unwrap();
        assert_eq!(store.list_rejections(booking_id).await.unwrap(), drivers(&["d1"]));

        tokio::time::advance(Duration::from_secs(7201)).await;
        assert!(store.list_rejections(booking_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_recorded_once() {
        let store = MemoryDispatchStore::new();
        let booking_id = Uuid::new_v4();
        store
            .record_rejection(booking_id, "d1", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .record_rejection(booking_id, "d1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.list_rejections(booking_id).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_cache_ttl() {
        let store = MemoryDispatchStore::new();
        store
            .put_search_result("cust-1", &[], Duration::from_secs(600))
            .await
            .unwrap();
        assert!(store.get_search_result("cust-1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(store.get_search_result("cust-1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_drops_dead_keys() {
        let store = MemoryDispatchStore::new();
        let booking_id = Uuid::new_v4();
        store
            .grant(booking_id, &drivers(&["d1"]), Duration::from_secs(10))
            .await
            .unwrap();
        store
            .put_blocked_drivers("cust-1", &drivers(&["d9"]), Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        store.purge_expired().await;

        let inner = store.inner.read().await;
        assert!(inner.eligible.is_empty());
        assert!(inner.blocked.is_empty());
    }
}
