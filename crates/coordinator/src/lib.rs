//! 派单协调
//!
//! 订单从创建到结算的完整派单链路：
//! 地理排序（ranking）、候选撮合（matcher）、订单状态机（state_machine）
//! 与事件驱动的派单 Saga（saga）。

pub mod matcher;
pub mod ranking;
pub mod saga;
pub mod state_machine;

pub use matcher::{DriverMatcher, MatchOutcome, MatchRequest};
pub use saga::{DispatchSaga, SagaPhase};
pub use state_machine::BookingControl;
