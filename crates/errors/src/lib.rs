use thiserror::Error;


#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("订单未找到: {id}")]
    BookingNotFound { id: String },
    #[error("司机未找到: {id}")]
    DriverNotFound { id: String },
    #[error("无权执行该操作: {reason}")]
    Unauthorized { reason: String },
    #[error("非法状态流转: {from} -> {to} (角色: {role})")]
    InvalidTransition {
        from: String,
        to: String,
        role: String,
    },
    #[error("状态流转冲突: 订单 {id} 当前状态为 {actual}，期望 {expected}")]
    TransitionConflict {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("下游服务不可用: {target}")]
    DownstreamUnavailable { target: String },
    #[error("消息队列错误: {0}")]
    MessageQueue(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("存储错误: {0}")]
    Storage(String),
    #[error("网络错误: {0}")]
    Network(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

impl DispatchError {
    pub fn booking_not_found<S: ToString>(id: S) -> Self {
        Self::BookingNotFound { id: id.to_string() }
    }
    pub fn driver_not_found<S: ToString>(id: S) -> Self {
        Self::DriverNotFound { id: id.to_string() }
    }
    pub fn unauthorized<S: Into<String>>(reason: S) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }
    pub fn storage_error<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn downstream_unavailable<S: Into<String>>(target: S) -> Self {
        Self::DownstreamUnavailable {
            target: target.into(),
        }
    }

    /// 基础设施类瞬时错误才允许重试，业务规则错误立即返回调用方
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::MessageQueue(_)
                | DispatchError::Storage(_)
                | DispatchError::Network(_)
                | DispatchError::Timeout(_)
        )
    }

    pub fn is_business_error(&self) -> bool {
        matches!(
            self,
            DispatchError::BookingNotFound { .. }
                | DispatchError::DriverNotFound { .. }
                | DispatchError::Unauthorized { .. }
                | DispatchError::InvalidTransition { .. }
                | DispatchError::TransitionConflict { .. }
        )
    }

    /// 输掉并发竞争不是应用层错误，对落败方展示为"已被处理"
    pub fn is_conflict(&self) -> bool {
        matches!(self, DispatchError::TransitionConflict { .. })
    }

    pub fn user_message(&self) -> &str {
        match self {
            DispatchError::BookingNotFound { .. } => "请求的订单不存在",
            DispatchError::DriverNotFound { .. } => "请求的司机不存在",
            DispatchError::Unauthorized { .. } => "您没有执行此操作的权限",
            DispatchError::InvalidTransition { .. } => "订单当前状态不允许该操作",
            DispatchError::TransitionConflict { .. } => "订单已被处理",
            DispatchError::DownstreamUnavailable { .. } => "系统繁忙，请稍后重试",
            DispatchError::Timeout(_) => "操作超时，请稍后重试",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for DispatchError {
    fn from(err: anyhow::Error) -> Self {
        DispatchError::Internal(err.to_string())
    }
}
