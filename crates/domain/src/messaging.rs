use async_trait::async_trait;

use crate::events::Message;
use dispatch_errors::DispatchResult;

/// 消息队列端口
///
/// 投递语义为至少一次，消费方必须幂等处理
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish_message(&self, queue: &str, message: &Message) -> DispatchResult<()>;
    async fn consume_messages(&self, queue: &str) -> DispatchResult<Vec<Message>>;
    async fn create_queue(&self, queue: &str, durable: bool) -> DispatchResult<()>;
    async fn get_queue_size(&self, queue: &str) -> DispatchResult<u32>;
    async fn purge_queue(&self, queue: &str) -> DispatchResult<()>;
}
