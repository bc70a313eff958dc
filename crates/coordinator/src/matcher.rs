//! 候选司机撮合
//!
//! 汇总拉黑名单、显式排除与拒单集合，查询在线司机目录，
//! 按距离/偏好/历史重排后产出有序候选。
//! 协作方不可用不是错误：撮合返回 success=false 的空结果，
//! 由 Saga 决定通知客户还是重试。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use dispatch_config::DispatchConfig;
use dispatch_domain::collaborators::{BookingHistoryService, DriverDirectory};
use dispatch_domain::entities::{
    ActorRole, BookingStatus, CustomerPreferences, DriverCandidate, Location, VehicleType,
};
use dispatch_domain::repositories::{EligibilityStore, MatchCache};
use dispatch_errors::{DispatchError, DispatchResult};
use dispatch_infrastructure::resilient::ResilientCaller;

use crate::ranking;

/// 一次撮合请求
#[derive(Debug, Clone)]
pub struct MatchRequest {
    /// 重新撮合时携带，用于排除已拒单的司机
    pub booking_id: Option<Uuid>,
    pub customer_id: String,
    pub ref_location: Location,
    pub radius_km: f64,
    pub vehicle_types: Vec<VehicleType>,
    pub excluded_driver_ids: Vec<String>,
    pub preferred_driver_ids: Vec<String>,
}

/// 撮合结果；success=false 表示合法的"无可用司机"，不是错误
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub success: bool,
    pub candidates: Vec<DriverCandidate>,
    pub message: String,
}

impl MatchOutcome {
    fn empty<S: Into<String>>(message: S) -> Self {
        Self {
            success: false,
            candidates: Vec::new(),
            message: message.into(),
        }
    }
}

pub struct DriverMatcher {
    directory: Arc<dyn DriverDirectory>,
    history: Arc<dyn BookingHistoryService>,
    eligibility: Arc<dyn EligibilityStore>,
    cache: Arc<dyn MatchCache>,
    directory_caller: ResilientCaller,
    history_caller: ResilientCaller,
    config: DispatchConfig,
}

impl DriverMatcher {
    pub fn new(
        directory: Arc<dyn DriverDirectory>,
        history: Arc<dyn BookingHistoryService>,
        eligibility: Arc<dyn EligibilityStore>,
        cache: Arc<dyn MatchCache>,
        directory_caller: ResilientCaller,
        history_caller: ResilientCaller,
        config: DispatchConfig,
    ) -> Self {
        Self {
            directory,
            history,
            eligibility,
            cache,
            directory_caller,
            history_caller,
            config,
        }
    }

    /// 执行撮合流水线，返回按派单顺序排列的候选
    pub async fn find_candidates(&self, request: &MatchRequest) -> DispatchResult<MatchOutcome> {
        let excluded = self.resolve_exclusions(request).await?;
        debug!(
            customer_id = %request.customer_id,
            excluded = excluded.len(),
            "开始撮合"
        );

        if let Some(cached) = self.cached_candidates(request, &excluded).await {
            info!(
                customer_id = %request.customer_id,
                candidates = cached.len(),
                "搜索缓存命中"
            );
            return Ok(MatchOutcome {
                success: true,
                candidates: cached,
                message: "ok".to_string(),
            });
        }

        let excluded_vec: Vec<String> = excluded.iter().cloned().collect();
        let online = match self
            .directory_caller
            .call(|| {
                self.directory.find_online_drivers(
                    &request.vehicle_types,
                    &excluded_vec,
                    request.ref_location,
                )
            })
            .await
        {
            Ok(drivers) => drivers,
            Err(DispatchError::DownstreamUnavailable { target }) => {
                warn!(customer_id = %request.customer_id, %target, "在线司机目录不可用");
                return Ok(MatchOutcome::empty("在线司机目录暂时不可用，请稍后重试"));
            }
            Err(e) => return Err(e),
        };

        // 目录按排除名单过滤过一次，这里再兜底过滤一遍
        let online: Vec<DriverCandidate> = online
            .into_iter()
            .filter(|c| !excluded.contains(&c.driver_id))
            .collect();

        if online.is_empty() {
            return Ok(MatchOutcome::empty("附近没有符合条件的在线司机"));
        }

        let available = self.filter_available(online).await;
        if available.is_empty() {
            return Ok(MatchOutcome::empty("附近司机都在服务其他订单"));
        }

        let mut candidates =
            ranking::rank_within_radius(request.ref_location, available, request.radius_km);
        if candidates.is_empty() {
            return Ok(MatchOutcome::empty("搜索半径内没有在线司机"));
        }

        let preferences = self.resolve_preferences(&request.customer_id).await;
        candidates.retain(|c| {
            preferences.vehicle_types.contains(&c.vehicle_type)
                && c.rating >= preferences.min_rating
                && c.distance_km <= preferences.max_distance_km
        });
        if candidates.is_empty() {
            return Ok(MatchOutcome::empty("没有符合客户偏好的司机"));
        }

        let candidates = self
            .order_by_preference_and_history(request, candidates)
            .await;

        // 搜索结果缓存为尽力而为，不影响撮合结果
        if let Err(e) = self
            .cache
            .put_search_result(
                &request.customer_id,
                &candidates,
                self.config.search_cache_ttl(),
            )
            .await
        {
            warn!(customer_id = %request.customer_id, error = %e, "写入搜索缓存失败");
        }

        info!(
            customer_id = %request.customer_id,
            candidates = candidates.len(),
            "撮合完成"
        );
        Ok(MatchOutcome {
            success: true,
            candidates,
            message: "ok".to_string(),
        })
    }

    /// 10 分钟内的重复撮合直接复用缓存的搜索结果
    ///
    /// 命中后仍按当前排除名单和半径过滤；过滤后为空
    /// 视同未命中，回退到全量撮合流水线
    async fn cached_candidates(
        &self,
        request: &MatchRequest,
        excluded: &HashSet<String>,
    ) -> Option<Vec<DriverCandidate>> {
        let cached = match self.cache.get_search_result(&request.customer_id).await {
            Ok(Some(cached)) => cached,
            Ok(None) => return None,
            Err(e) => {
                warn!(customer_id = %request.customer_id, error = %e, "读取搜索缓存失败");
                return None;
            }
        };

        let filtered: Vec<DriverCandidate> = cached
            .into_iter()
            .filter(|c| !excluded.contains(&c.driver_id))
            .filter(|c| c.distance_km <= request.radius_km)
            .collect();
        if filtered.is_empty() {
            None
        } else {
            Some(filtered)
        }
    }

    /// 排除名单 = 客户拉黑 ∪ 显式排除 ∪ 该订单的拒单集合
    async fn resolve_exclusions(&self, request: &MatchRequest) -> DispatchResult<HashSet<String>> {
        let mut excluded: HashSet<String> = request.excluded_driver_ids.iter().cloned().collect();

        for driver_id in self.blocked_drivers(&request.customer_id).await {
            excluded.insert(driver_id);
        }

        if let Some(booking_id) = request.booking_id {
            for driver_id in self.eligibility.list_rejections(booking_id).await? {
                excluded.insert(driver_id);
            }
        }

        Ok(excluded)
    }

    /// 近 N 天内被同一司机取消达到阈值的司机进入拉黑名单，结果缓存 1 小时
    ///
    /// 历史服务失败时放开处理：拉黑是体验优化，不是安全约束
    async fn blocked_drivers(&self, customer_id: &str) -> Vec<String> {
        match self.cache.get_blocked_drivers(customer_id).await {
            Ok(Some(cached)) => return cached,
            Ok(None) => {}
            Err(e) => {
                warn!(customer_id, error = %e, "读取拉黑缓存失败");
            }
        }

        let cancelled = match self
            .history_caller
            .call(|| {
                self.history
                    .cancelled_bookings(customer_id, self.config.blocked_window_days)
            })
            .await
        {
            Ok(bookings) => bookings,
            Err(e) => {
                warn!(customer_id, error = %e, "查询取消历史失败，跳过拉黑过滤");
                return Vec::new();
            }
        };

        let mut cancellations: HashMap<String, u32> = HashMap::new();
        for summary in cancelled {
            if summary.status != BookingStatus::Cancelled
                || summary.cancelled_by != Some(ActorRole::Driver)
            {
                continue;
            }
            if let Some(driver_id) = summary.driver_id {
                *cancellations.entry(driver_id).or_insert(0) += 1;
            }
        }

        let blocked: Vec<String> = cancellations
            .into_iter()
            .filter(|(_, count)| *count >= self.config.blocked_cancellation_threshold)
            .map(|(driver_id, _)| driver_id)
            .collect();

        if let Err(e) = self
            .cache
            .put_blocked_drivers(customer_id, &blocked, self.config.blocked_cache_ttl())
            .await
        {
            warn!(customer_id, error = %e, "写入拉黑缓存失败");
        }
        blocked
    }

    /// 剔除已有进行中订单的司机
    ///
    /// 可用性查不到时一律按不可用处理（宁可少派，不可重复派）
    async fn filter_available(&self, candidates: Vec<DriverCandidate>) -> Vec<DriverCandidate> {
        let driver_ids: Vec<String> = candidates.iter().map(|c| c.driver_id.clone()).collect();
        let availability = match self
            .directory_caller
            .call(|| self.directory.check_drivers_availability(&driver_ids))
            .await
        {
            Ok(availability) => availability,
            Err(e) => {
                warn!(
                    drivers = driver_ids.len(),
                    error = %e,
                    "可用性查询失败，整批司机按不可用处理"
                );
                return Vec::new();
            }
        };

        let available: HashSet<String> = availability
            .into_iter()
            .filter(|a| a.is_available)
            .map(|a| a.driver_id)
            .collect();

        candidates
            .into_iter()
            .filter(|c| available.contains(&c.driver_id))
            .collect()
    }

    async fn resolve_preferences(&self, customer_id: &str) -> CustomerPreferences {
        match self
            .history_caller
            .call(|| self.history.customer_preferences(customer_id))
            .await
        {
            Ok(Some(preferences)) => preferences,
            Ok(None) => CustomerPreferences::default(),
            Err(e) => {
                warn!(customer_id, error = %e, "查询客户偏好失败，使用缺省偏好");
                CustomerPreferences::default()
            }
        }
    }

    /// 指定偏好司机按距离排在最前；其余按 (历史单量, 评分, 距离) 重排
    async fn order_by_preference_and_history(
        &self,
        request: &MatchRequest,
        candidates: Vec<DriverCandidate>,
    ) -> Vec<DriverCandidate> {
        let preferred_ids: HashSet<&String> = request.preferred_driver_ids.iter().collect();
        let trip_counts = self.previous_trip_counts(&request.customer_id).await;

        let (mut preferred, mut rest): (Vec<DriverCandidate>, Vec<DriverCandidate>) = candidates
            .into_iter()
            .map(|mut c| {
                c.is_preferred = preferred_ids.contains(&c.driver_id);
                c.previous_trip_count = trip_counts.get(&c.driver_id).copied().unwrap_or(0);
                c
            })
            .partition(|c| c.is_preferred);

        ranking::sort_by_distance(&mut preferred);
        rest.sort_by(|a, b| {
            b.previous_trip_count
                .cmp(&a.previous_trip_count)
                .then_with(|| b.rating.total_cmp(&a.rating))
                .then_with(|| a.distance_km.total_cmp(&b.distance_km))
                .then_with(|| a.driver_id.cmp(&b.driver_id))
        });

        preferred.extend(rest);
        preferred
    }

    /// 该客户近 90 天内每位司机的完单数；查询失败时按无历史处理
    async fn previous_trip_counts(&self, customer_id: &str) -> HashMap<String, u32> {
        let history = match self
            .history_caller
            .call(|| {
                self.history.booking_history(
                    customer_id,
                    self.config.history_window_days,
                    self.config.history_limit,
                )
            })
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(customer_id, error = %e, "查询订单历史失败，跳过历史重排");
                return HashMap::new();
            }
        };

        let mut counts = HashMap::new();
        for summary in history {
            if summary.status != BookingStatus::Completed {
                continue;
            }
            if let Some(driver_id) = summary.driver_id {
                *counts.entry(driver_id).or_insert(0) += 1;
            }
        }
        counts
    }
}
