//! 订单状态机
//!
//! 所有状态变更的唯一入口。授权校验是纯函数，
//! 提交一律走仓储的条件流转，并发竞争的正确性完全由 CAS 保证：
//! 两个司机同时接单时，只有先提交的一方成功，落败方收到
//! TransitionConflict。

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use dispatch_config::DispatchConfig;
use dispatch_domain::entities::{
    Actor, ActorRole, Booking, BookingStatus, Location, TargetStatus, TransitionUpdate,
    VehicleType,
};
use dispatch_domain::events::{BookingEvent, Message};
use dispatch_domain::messaging::MessageQueue;
use dispatch_domain::repositories::{BookingRepository, EligibilityStore};
use dispatch_errors::{DispatchError, DispatchResult};

pub struct BookingControl {
    repository: Arc<dyn BookingRepository>,
    eligibility: Arc<dyn EligibilityStore>,
    message_queue: Arc<dyn MessageQueue>,
    events_queue: String,
    config: DispatchConfig,
}

impl BookingControl {
    pub fn new(
        repository: Arc<dyn BookingRepository>,
        eligibility: Arc<dyn EligibilityStore>,
        message_queue: Arc<dyn MessageQueue>,
        events_queue: String,
        config: DispatchConfig,
    ) -> Self {
        Self {
            repository,
            eligibility,
            message_queue,
            events_queue,
            config,
        }
    }

    /// 创建 PENDING 订单并发布 booking.created
    pub async fn create_booking(
        &self,
        customer_id: String,
        pickup: Location,
        destination: Location,
        vehicle_type: VehicleType,
    ) -> DispatchResult<Booking> {
        let booking = Booking::new(customer_id, pickup, destination, vehicle_type);
        let created = self.repository.create(&booking).await?;

        info!(booking_id = %created.id, customer_id = %created.customer_id, "订单已创建");
        self.publish(BookingEvent::Created {
            id: Uuid::new_v4(),
            booking_id: created.id,
            customer_id: created.customer_id.clone(),
            pickup_location: created.pickup_location,
            destination_location: created.destination_location,
            occurred_at: Utc::now(),
        })
        .await?;

        Ok(created)
    }

    /// 请求一次状态流转
    ///
    /// 拒单不改变订单状态，只写入拒单集合；其余流转
    /// 以加载时的状态为 CAS 期望值提交。重复取消是幂等空操作。
    pub async fn request_transition(
        &self,
        booking_id: Uuid,
        actor: Actor,
        target: TargetStatus,
    ) -> DispatchResult<Booking> {
        let booking = self
            .repository
            .find_by_id(booking_id)
            .await?
            .ok_or_else(|| DispatchError::booking_not_found(booking_id))?;

        // 幂等取消：已取消的订单再次取消是空操作
        if target == TargetStatus::Cancelled && booking.status == BookingStatus::Cancelled {
            debug!(%booking_id, actor_id = %actor.id, "订单已取消，忽略重复取消");
            return Ok(booking);
        }

        authorize(&actor, &booking, target)?;

        match target {
            TargetStatus::Rejected => self.record_rejection(booking, actor).await,
            TargetStatus::Accepted => {
                self.require_eligible(booking_id, &actor.id).await?;
                self.require_no_active_booking(&actor.id).await?;
                let update = TransitionUpdate::accept(actor.id.clone(), Utc::now());
                let updated = self
                    .repository
                    .conditional_transition(booking_id, BookingStatus::Pending, update)
                    .await?;
                info!(%booking_id, driver_id = %actor.id, "司机接单成功");
                self.publish(BookingEvent::Accepted {
                    id: Uuid::new_v4(),
                    booking_id,
                    customer_id: updated.customer_id.clone(),
                    driver_id: actor.id,
                    occurred_at: Utc::now(),
                })
                .await?;
                Ok(updated)
            }
            TargetStatus::Cancelled => {
                let update = TransitionUpdate::to(BookingStatus::Cancelled, Utc::now());
                let updated = self
                    .repository
                    .conditional_transition(booking_id, booking.status, update)
                    .await?;
                info!(%booking_id, actor_role = %actor.role, actor_id = %actor.id, "订单已取消");
                self.publish(BookingEvent::Cancelled {
                    id: Uuid::new_v4(),
                    booking_id,
                    cancelled_by: actor,
                    occurred_at: Utc::now(),
                })
                .await?;
                Ok(updated)
            }
            TargetStatus::Ongoing => {
                let update = TransitionUpdate::to(BookingStatus::Ongoing, Utc::now());
                let updated = self
                    .repository
                    .conditional_transition(booking_id, BookingStatus::Accepted, update)
                    .await?;
                info!(%booking_id, driver_id = %actor.id, "行程已开始");
                Ok(updated)
            }
            TargetStatus::Completed => {
                let update = TransitionUpdate::to(BookingStatus::Completed, Utc::now());
                let updated = self
                    .repository
                    .conditional_transition(booking_id, BookingStatus::Ongoing, update)
                    .await?;
                info!(%booking_id, driver_id = %actor.id, "行程已完成");
                self.publish(BookingEvent::Completed {
                    id: Uuid::new_v4(),
                    booking_id,
                    occurred_at: Utc::now(),
                })
                .await?;
                Ok(updated)
            }
        }
    }

    /// 拒单：订单保持 PENDING，司机进入拒单集合并失去许可
    async fn record_rejection(&self, booking: Booking, actor: Actor) -> DispatchResult<Booking> {
        self.require_eligible(booking.id, &actor.id).await?;

        self.eligibility
            .record_rejection(booking.id, &actor.id, self.config.eligibility_ttl())
            .await?;
        self.eligibility.revoke(booking.id, &actor.id).await?;

        info!(booking_id = %booking.id, driver_id = %actor.id, "司机已拒单");
        self.publish(BookingEvent::Rejected {
            id: Uuid::new_v4(),
            booking_id: booking.id,
            driver_id: actor.id,
            occurred_at: Utc::now(),
        })
        .await?;

        Ok(booking)
    }

    /// 不在许可集合中的司机永远不允许接单或拒单
    async fn require_eligible(&self, booking_id: Uuid, driver_id: &str) -> DispatchResult<()> {
        if self.eligibility.is_eligible(booking_id, driver_id).await? {
            Ok(())
        } else {
            Err(DispatchError::unauthorized(format!(
                "司机 {driver_id} 不在订单 {booking_id} 的许可集合中"
            )))
        }
    }

    /// 手上还有 ACCEPTED/ONGOING 订单的司机不允许再接单
    async fn require_no_active_booking(&self, driver_id: &str) -> DispatchResult<()> {
        let active = self.repository.find_active_by_driver(driver_id).await?;
        if active.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::unauthorized(format!(
                "司机 {driver_id} 已有进行中的订单"
            )))
        }
    }

    async fn publish(&self, event: BookingEvent) -> DispatchResult<()> {
        let message = Message::from_event(event);
        self.message_queue
            .publish_message(&self.events_queue, &message)
            .await
    }
}

/// 纯授权表
///
/// 角色不具备的目标状态返回 Unauthorized；
/// 角色合法但当前状态不允许返回 InvalidTransition。
fn authorize(actor: &Actor, booking: &Booking, target: TargetStatus) -> DispatchResult<()> {
    let invalid = || {
        Err(DispatchError::InvalidTransition {
            from: booking.status.to_string(),
            to: target.to_string(),
            role: actor.role.to_string(),
        })
    };

    match (actor.role, target) {
        (ActorRole::Customer, TargetStatus::Cancelled) => match booking.status {
            BookingStatus::Pending | BookingStatus::Accepted => Ok(()),
            _ => invalid(),
        },
        (ActorRole::Customer, _) => Err(DispatchError::unauthorized(format!(
            "客户不允许请求 {target} 流转"
        ))),
        (ActorRole::Driver, TargetStatus::Accepted | TargetStatus::Rejected) => {
            match booking.status {
                BookingStatus::Pending => Ok(()),
                _ => invalid(),
            }
        }
        (ActorRole::Driver, TargetStatus::Cancelled) => match booking.status {
            BookingStatus::Accepted if is_assigned(booking, actor) => Ok(()),
            BookingStatus::Accepted => Err(DispatchError::unauthorized(format!(
                "司机 {} 不是该订单的承接司机",
                actor.id
            ))),
            _ => invalid(),
        },
        (ActorRole::Driver, TargetStatus::Ongoing) => match booking.status {
            BookingStatus::Accepted if is_assigned(booking, actor) => Ok(()),
            BookingStatus::Accepted => Err(DispatchError::unauthorized(format!(
                "司机 {} 不是该订单的承接司机",
                actor.id
            ))),
            _ => invalid(),
        },
        (ActorRole::Driver, TargetStatus::Completed) => match booking.status {
            BookingStatus::Ongoing if is_assigned(booking, actor) => Ok(()),
            BookingStatus::Ongoing => Err(DispatchError::unauthorized(format!(
                "司机 {} 不是该订单的承接司机",
                actor.id
            ))),
            _ => invalid(),
        },
    }
}

fn is_assigned(booking: &Booking, actor: &Actor) -> bool {
    booking.driver_id.as_deref() == Some(actor.id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_testing_utils::BookingBuilder;

    fn booking_in(status: BookingStatus, driver_id: Option<&str>) -> Booking {
        let mut builder = BookingBuilder::new().with_status(status);
        if let Some(driver_id) = driver_id {
            builder = builder.with_driver(driver_id);
        }
        builder.build()
    }

    #[test]
    fn test_customer_may_only_cancel() {
        let pending = booking_in(BookingStatus::Pending, None);
        let customer = Actor::customer("cust-1");

        assert!(authorize(&customer, &pending, TargetStatus::Cancelled).is_ok());
        assert!(matches!(
            authorize(&customer, &pending, TargetStatus::Accepted),
            Err(DispatchError::Unauthorized { .. })
        ));
        assert!(matches!(
            authorize(&customer, &pending, TargetStatus::Completed),
            Err(DispatchError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_customer_cannot_cancel_ongoing() {
        let ongoing = booking_in(BookingStatus::Ongoing, Some("drv-1"));
        let err = authorize(&Actor::customer("cust-1"), &ongoing, TargetStatus::Cancelled)
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransition { .. }));
    }

    #[test]
    fn test_driver_accept_and_reject_only_from_pending() {
        let pending = booking_in(BookingStatus::Pending, None);
        let accepted = BookingBuilder::new().accepted_by("drv-1").build();
        let driver = Actor::driver("drv-1");

        assert!(authorize(&driver, &pending, TargetStatus::Accepted).is_ok());
        assert!(authorize(&driver, &pending, TargetStatus::Rejected).is_ok());
        assert!(matches!(
            authorize(&driver, &accepted, TargetStatus::Accepted),
            Err(DispatchError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_only_assigned_driver_may_progress_booking() {
        let accepted = booking_in(BookingStatus::Accepted, Some("drv-1"));
        let ongoing = booking_in(BookingStatus::Ongoing, Some("drv-1"));

        assert!(authorize(&Actor::driver("drv-1"), &accepted, TargetStatus::Ongoing).is_ok());
        assert!(authorize(&Actor::driver("drv-1"), &accepted, TargetStatus::Cancelled).is_ok());
        assert!(authorize(&Actor::driver("drv-1"), &ongoing, TargetStatus::Completed).is_ok());

        assert!(matches!(
            authorize(&Actor::driver("drv-2"), &accepted, TargetStatus::Ongoing),
            Err(DispatchError::Unauthorized { .. })
        ));
        assert!(matches!(
            authorize(&Actor::driver("drv-2"), &ongoing, TargetStatus::Completed),
            Err(DispatchError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let completed = booking_in(BookingStatus::Completed, Some("drv-1"));
        let driver = Actor::driver("drv-1");
        assert!(matches!(
            authorize(&driver, &completed, TargetStatus::Cancelled),
            Err(DispatchError::InvalidTransition { .. })
        ));
        assert!(matches!(
            authorize(&Actor::customer("cust-1"), &completed, TargetStatus::Cancelled),
            Err(DispatchError::InvalidTransition { .. })
        ));
    }
}
