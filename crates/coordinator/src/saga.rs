//! 派单 Saga
//!
//! 由领域事件驱动的派单编排：创建 → 搜索 → 广播 → 接单竞争 → 结算，
//! 没有任何中心化的阻塞调用链。事件至少一次投递，所有 handler 幂等。
//! 接单竞争的正确性由状态机的条件流转保证，Saga 只做善后：
//! 赢家确定后撤销许可、向落败司机扇出 booking.taken。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dispatch_config::DispatchConfig;
use dispatch_domain::collaborators::{CustomerNotice, NotificationGateway};
use dispatch_domain::entities::{Actor, ActorRole, Booking, BookingStatus, Location};
use dispatch_domain::events::{BookingEvent, DomainEvent, Message};
use dispatch_domain::messaging::MessageQueue;
use dispatch_domain::repositories::{BookingRepository, EligibilityStore};
use dispatch_errors::DispatchResult;
use dispatch_infrastructure::resilient::ResilientCaller;

use crate::matcher::{DriverMatcher, MatchRequest};

/// 队列轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// 广播窗口过期检查间隔
const EXPIRY_TICK: Duration = Duration::from_secs(5);

/// 单个订单的 Saga 阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaPhase {
    Searching,
    AwaitingAcceptance,
    Settled,
    Expired,
    Failed,
}

impl SagaPhase {
    /// 终态：订单不会再收到需要 Saga 善后的事件
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled | Self::Expired | Self::Failed)
    }
}

#[derive(Debug, Clone)]
struct SagaState {
    phase: SagaPhase,
    /// 已用的搜索轮次
    attempt: u32,
    /// drivers_ready 广播的新鲜度截止时间
    ready_deadline: Option<Instant>,
}

pub struct DispatchSaga {
    matcher: Arc<DriverMatcher>,
    repository: Arc<dyn BookingRepository>,
    eligibility: Arc<dyn EligibilityStore>,
    notifications: Arc<dyn NotificationGateway>,
    notify_caller: ResilientCaller,
    message_queue: Arc<dyn MessageQueue>,
    events_queue: String,
    config: DispatchConfig,
    states: RwLock<HashMap<Uuid, SagaState>>,
    running: RwLock<bool>,
}

impl DispatchSaga {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        matcher: Arc<DriverMatcher>,
        repository: Arc<dyn BookingRepository>,
        eligibility: Arc<dyn EligibilityStore>,
        notifications: Arc<dyn NotificationGateway>,
        notify_caller: ResilientCaller,
        message_queue: Arc<dyn MessageQueue>,
        events_queue: String,
        config: DispatchConfig,
    ) -> Self {
        Self {
            matcher,
            repository,
            eligibility,
            notifications,
            notify_caller,
            message_queue,
            events_queue,
            config,
            states: RwLock::new(HashMap::new()),
            running: RwLock::new(false),
        }
    }

    /// 消费事件队列并驱动过期检查，直到 stop 被调用
    pub async fn run(&self) -> DispatchResult<()> {
        *self.running.write().await = true;
        info!(queue = %self.events_queue, "派单 Saga 已启动");

        let mut expiry_tick = tokio::time::interval(EXPIRY_TICK);
        expiry_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while *self.running.read().await {
            tokio::select! {
                _ = expiry_tick.tick() => {
                    self.check_expired_windows().await;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    match self.message_queue.consume_messages(&self.events_queue).await {
                        Ok(messages) => {
                            for message in messages {
                                if let Err(e) = self.handle_event(&message.event).await {
                                    error!(
                                        event_type = message.event.event_type(),
                                        booking_id = %message.event.booking_id(),
                                        error = %e,
                                        "处理派单事件失败"
                                    );
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "消费事件队列失败"),
                    }
                }
            }
        }

        info!("派单 Saga 已停止");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    pub async fn phase(&self, booking_id: Uuid) -> Option<SagaPhase> {
        self.states.read().await.get(&booking_id).map(|s| s.phase)
    }

    /// 事件到 handler 的显式映射
    pub async fn handle_event(&self, event: &BookingEvent) -> DispatchResult<()> {
        match event {
            BookingEvent::Created {
                booking_id,
                customer_id,
                pickup_location,
                ..
            } => {
                self.on_created(*booking_id, customer_id, *pickup_location)
                    .await
            }
            BookingEvent::DriverSearchRequested {
                booking_id,
                customer_id,
                pickup_location,
                radius_km,
                attempt,
                ..
            } => {
                self.on_search_requested(
                    *booking_id,
                    customer_id,
                    *pickup_location,
                    *radius_km,
                    *attempt,
                )
                .await
            }
            BookingEvent::DriversReady {
                booking_id,
                customer_id,
                eligible_driver_ids,
                ..
            } => {
                self.on_drivers_ready(*booking_id, customer_id, eligible_driver_ids)
                    .await
            }
            BookingEvent::Accepted {
                booking_id,
                customer_id,
                driver_id,
                ..
            } => self.on_accepted(*booking_id, customer_id, driver_id).await,
            BookingEvent::Rejected {
                booking_id,
                driver_id,
                ..
            } => self.on_rejected(*booking_id, driver_id).await,
            BookingEvent::Cancelled {
                booking_id,
                cancelled_by,
                ..
            } => self.on_cancelled(*booking_id, cancelled_by).await,
            BookingEvent::Completed { booking_id, .. } => self.on_completed(*booking_id).await,
            // 这两个事件由本 Saga 产出，供外部消费方使用
            BookingEvent::NearbyDriversFound { .. } | BookingEvent::Taken { .. } => Ok(()),
        }
    }

    /// booking.created：进入搜索阶段，按缺省半径发起第一轮搜索
    async fn on_created(
        &self,
        booking_id: Uuid,
        customer_id: &str,
        pickup: Location,
    ) -> DispatchResult<()> {
        self.set_state(
            booking_id,
            SagaState {
                phase: SagaPhase::Searching,
                attempt: 1,
                ready_deadline: None,
            },
        )
        .await;

        self.publish(BookingEvent::DriverSearchRequested {
            id: Uuid::new_v4(),
            booking_id,
            customer_id: customer_id.to_string(),
            pickup_location: pickup,
            radius_km: self.config.search_radius_km,
            attempt: 1,
            occurred_at: chrono::Utc::now(),
        })
        .await
    }

    /// driver_search_requested：撮合、授予许可并广播 drivers_ready
    async fn on_search_requested(
        &self,
        booking_id: Uuid,
        customer_id: &str,
        pickup: Location,
        radius_km: f64,
        attempt: u32,
    ) -> DispatchResult<()> {
        let booking = match self.pending_booking(booking_id).await? {
            Some(booking) => booking,
            None => return Ok(()),
        };

        let request = MatchRequest {
            booking_id: Some(booking_id),
            customer_id: customer_id.to_string(),
            ref_location: pickup,
            radius_km,
            vehicle_types: vec![booking.vehicle_type],
            excluded_driver_ids: Vec::new(),
            preferred_driver_ids: Vec::new(),
        };
        let outcome = self.matcher.find_candidates(&request).await?;

        let reported: Vec<_> = outcome.candidates.iter().map(|c| c.for_report()).collect();
        self.publish(BookingEvent::NearbyDriversFound {
            id: Uuid::new_v4(),
            booking_id,
            customer_id: customer_id.to_string(),
            candidates: reported.clone(),
            search_radius_km: radius_km,
            occurred_at: chrono::Utc::now(),
        })
        .await?;

        if !outcome.success || outcome.candidates.is_empty() {
            info!(%booking_id, attempt, reason = %outcome.message, "本轮搜索没有候选司机");
            self.settle_no_drivers(booking_id, customer_id).await;
            return Ok(());
        }

        let driver_ids: Vec<String> = outcome
            .candidates
            .iter()
            .map(|c| c.driver_id.clone())
            .collect();
        self.eligibility
            .grant(booking_id, &driver_ids, self.config.eligibility_ttl())
            .await?;

        let expires_at = chrono::Utc::now()
            + chrono::Duration::from_std(self.config.ready_window())
                .unwrap_or_else(|_| chrono::Duration::seconds(120));
        self.publish(BookingEvent::DriversReady {
            id: Uuid::new_v4(),
            booking_id,
            customer_id: customer_id.to_string(),
            eligible_driver_ids: driver_ids,
            candidates: reported,
            expires_at,
            occurred_at: chrono::Utc::now(),
        })
        .await?;

        self.set_state(
            booking_id,
            SagaState {
                phase: SagaPhase::AwaitingAcceptance,
                attempt,
                ready_deadline: Some(Instant::now() + self.config.ready_window()),
            },
        )
        .await;

        Ok(())
    }

    /// drivers_ready：向每位许可司机推送接单请求，并告知客户广播范围
    async fn on_drivers_ready(
        &self,
        booking_id: Uuid,
        customer_id: &str,
        eligible_driver_ids: &[String],
    ) -> DispatchResult<()> {
        let booking = match self.repository.find_by_id(booking_id).await? {
            Some(booking) => booking,
            None => return Ok(()),
        };

        // 单个司机推送失败不阻塞其余司机
        for driver_id in eligible_driver_ids {
            if let Err(e) = self
                .notify_caller
                .call(|| {
                    self.notifications.notify_driver_request(
                        driver_id,
                        booking_id,
                        booking.pickup_location,
                    )
                })
                .await
            {
                warn!(%booking_id, driver_id, error = %e, "向司机推送接单请求失败");
            }
        }

        self.notify_customer(
            customer_id,
            booking_id,
            CustomerNotice::RequestBroadcast {
                driver_count: eligible_driver_ids.len(),
            },
        )
        .await;

        Ok(())
    }

    /// booking.accepted：撤销许可并向落败司机扇出 booking.taken
    ///
    /// 提交与撤销之间的窗口内落败方的接单仍会因 CAS 失败而被拒，
    /// 安全性不依赖撤销的时机。
    async fn on_accepted(
        &self,
        booking_id: Uuid,
        customer_id: &str,
        winner_driver_id: &str,
    ) -> DispatchResult<()> {
        let losers: Vec<String> = self
            .eligibility
            .list_eligible(booking_id)
            .await?
            .into_iter()
            .filter(|d| d != winner_driver_id)
            .collect();

        self.eligibility.revoke_all(booking_id).await?;
        self.eligibility.clear_rejections(booking_id).await?;

        for driver_id in &losers {
            if let Err(e) = self
                .notify_caller
                .call(|| {
                    self.notifications
                        .notify_booking_taken(driver_id, booking_id, winner_driver_id)
                })
                .await
            {
                warn!(%booking_id, driver_id, error = %e, "通知落败司机失败");
            }
        }

        if !losers.is_empty() {
            self.publish(BookingEvent::Taken {
                id: Uuid::new_v4(),
                booking_id,
                taken_by_driver_id: winner_driver_id.to_string(),
                occurred_at: chrono::Utc::now(),
            })
            .await?;
        }

        self.notify_customer(
            customer_id,
            booking_id,
            CustomerNotice::DriverAssigned {
                driver_id: winner_driver_id.to_string(),
            },
        )
        .await;

        self.set_phase(booking_id, SagaPhase::Settled).await;
        info!(%booking_id, driver_id = %winner_driver_id, losers = losers.len(), "接单竞争已结算");
        Ok(())
    }

    /// booking.rejected：全部司机都拒单时发起下一轮搜索
    async fn on_rejected(&self, booking_id: Uuid, driver_id: &str) -> DispatchResult<()> {
        debug!(%booking_id, driver_id, "收到司机拒单");

        let remaining = self.eligibility.list_eligible(booking_id).await?;
        if !remaining.is_empty() {
            return Ok(());
        }

        self.try_rematch(booking_id).await
    }

    /// booking.cancelled：清理许可/拒单集合并通知相关方
    async fn on_cancelled(&self, booking_id: Uuid, cancelled_by: &Actor) -> DispatchResult<()> {
        self.eligibility.revoke_all(booking_id).await?;
        self.eligibility.clear_rejections(booking_id).await?;

        if let Some(booking) = self.repository.find_by_id(booking_id).await? {
            match cancelled_by.role {
                ActorRole::Customer => {
                    if let Some(driver_id) = &booking.driver_id {
                        if let Err(e) = self
                            .notify_caller
                            .call(|| {
                                self.notifications
                                    .notify_booking_cancelled(driver_id, booking_id)
                            })
                            .await
                        {
                            warn!(%booking_id, driver_id, error = %e, "通知司机订单取消失败");
                        }
                    }
                }
                ActorRole::Driver => {
                    self.notify_customer(
                        &booking.customer_id,
                        booking_id,
                        CustomerNotice::BookingCancelled,
                    )
                    .await;
                }
            }
        }

        self.set_phase(booking_id, SagaPhase::Settled).await;
        info!(%booking_id, cancelled_by = %cancelled_by.role, "取消善后完成");
        Ok(())
    }

    async fn on_completed(&self, booking_id: Uuid) -> DispatchResult<()> {
        self.eligibility.revoke_all(booking_id).await?;
        self.eligibility.clear_rejections(booking_id).await?;
        self.set_phase(booking_id, SagaPhase::Settled).await;
        Ok(())
    }

    /// 广播窗口过期且无人接单的订单进入下一轮搜索或宣告无司机
    ///
    /// 终态订单的记录在这里一并清理，常驻进程的状态表
    /// 只保留在途订单。终态 phase 在下一次过期检查前仍可读。
    pub async fn check_expired_windows(&self) {
        self.purge_terminal_states().await;

        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .states
            .read()
            .await
            .iter()
            .filter(|(_, state)| {
                state.phase == SagaPhase::AwaitingAcceptance
                    && state.ready_deadline.is_some_and(|deadline| deadline <= now)
            })
            .map(|(booking_id, _)| *booking_id)
            .collect();

        for booking_id in expired {
            info!(%booking_id, "广播窗口已过期，无人接单");
            if let Err(e) = self.try_rematch(booking_id).await {
                error!(%booking_id, error = %e, "处理过期广播窗口失败");
            }
        }
    }

    /// 有界重新撮合：轮次未用尽则带着拒单集合再搜一轮，
    /// 否则向客户宣告无可用司机
    async fn try_rematch(&self, booking_id: Uuid) -> DispatchResult<()> {
        let booking = match self.pending_booking(booking_id).await? {
            Some(booking) => booking,
            None => {
                self.set_phase(booking_id, SagaPhase::Settled).await;
                return Ok(());
            }
        };

        let attempt = self
            .states
            .read()
            .await
            .get(&booking_id)
            .map(|s| s.attempt)
            .unwrap_or(1);

        if attempt >= self.config.max_search_attempts {
            info!(%booking_id, attempt, "搜索轮次已用尽");
            self.eligibility.revoke_all(booking_id).await?;
            self.eligibility.clear_rejections(booking_id).await?;
            self.set_phase(booking_id, SagaPhase::Failed).await;
            self.notify_customer(
                &booking.customer_id,
                booking_id,
                CustomerNotice::NoDriversAvailable,
            )
            .await;
            return Ok(());
        }

        // 上一轮的许可作废，拒单集合保留用于排除
        self.eligibility.revoke_all(booking_id).await?;
        self.set_state(
            booking_id,
            SagaState {
                phase: SagaPhase::Searching,
                attempt: attempt + 1,
                ready_deadline: None,
            },
        )
        .await;

        info!(%booking_id, attempt = attempt + 1, "发起新一轮司机搜索");
        self.publish(BookingEvent::DriverSearchRequested {
            id: Uuid::new_v4(),
            booking_id,
            customer_id: booking.customer_id.clone(),
            pickup_location: booking.pickup_location,
            radius_km: self.config.search_radius_km,
            attempt: attempt + 1,
            occurred_at: chrono::Utc::now(),
        })
        .await
    }

    /// 无候选司机：清理状态并告知客户
    async fn settle_no_drivers(&self, booking_id: Uuid, customer_id: &str) {
        self.set_phase(booking_id, SagaPhase::Expired).await;
        self.notify_customer(customer_id, booking_id, CustomerNotice::NoDriversAvailable)
            .await;
    }

    /// 仅 PENDING 订单继续派单流程
    async fn pending_booking(&self, booking_id: Uuid) -> DispatchResult<Option<Booking>> {
        match self.repository.find_by_id(booking_id).await? {
            Some(booking) if booking.status == BookingStatus::Pending => Ok(Some(booking)),
            Some(booking) => {
                debug!(%booking_id, status = %booking.status, "订单已离开 PENDING，跳过");
                Ok(None)
            }
            None => {
                warn!(%booking_id, "订单不存在，跳过派单事件");
                Ok(None)
            }
        }
    }

    /// 客户通知为尽力而为，失败只记录
    async fn notify_customer(&self, customer_id: &str, booking_id: Uuid, notice: CustomerNotice) {
        if let Err(e) = self
            .notify_caller
            .call(|| {
                self.notifications
                    .notify_customer(customer_id, booking_id, notice.clone())
            })
            .await
        {
            warn!(%booking_id, customer_id, error = %e, "通知客户失败");
        }
    }

    async fn publish(&self, event: BookingEvent) -> DispatchResult<()> {
        let message = Message::from_event(event);
        self.message_queue
            .publish_message(&self.events_queue, &message)
            .await
    }

    async fn purge_terminal_states(&self) {
        let mut states = self.states.write().await;
        let before = states.len();
        states.retain(|_, state| !state.phase.is_terminal());
        let purged = before - states.len();
        if purged > 0 {
            debug!(purged, remaining = states.len(), "已清理终态订单的 Saga 状态");
        }
    }

    async fn set_state(&self, booking_id: Uuid, state: SagaState) {
        self.states.write().await.insert(booking_id, state);
    }

    async fn set_phase(&self, booking_id: Uuid, phase: SagaPhase) {
        let mut states = self.states.write().await;
        match states.get_mut(&booking_id) {
            Some(state) => {
                state.phase = phase;
                state.ready_deadline = None;
            }
            None => {
                states.insert(
                    booking_id,
                    SagaState {
                        phase,
                        attempt: 1,
                        ready_deadline: None,
                    },
                );
            }
        }
    }
}
