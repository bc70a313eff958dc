//! 内存消息队列实现
//!
//! 使用 Tokio channels 实现的内存消息队列，用于嵌入式部署与测试。
//! 投递语义为至少一次，消费方需自行幂等。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

use dispatch_domain::events::Message;
use dispatch_domain::messaging::MessageQueue;
use dispatch_errors::{DispatchError, DispatchResult};

#[derive(Debug)]
struct QueueChannels {
    sender: mpsc::UnboundedSender<Message>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
    size: Arc<AtomicU32>,
}

impl QueueChannels {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            size: Arc::new(AtomicU32::new(0)),
        }
    }
}

/// 队列名 -> 通道 的内存映射；首次发布时自动建队列
#[derive(Debug, Default)]
pub struct InMemoryMessageQueue {
    queues: Arc<RwLock<HashMap<String, QueueChannels>>>,
    /// 单队列积压上限，None 表示不限制
    max_queue_size: Option<usize>,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_queue_size(max_queue_size: Option<usize>) -> Self {
        Self {
            queues: Arc::new(RwLock::new(HashMap::new())),
            max_queue_size,
        }
    }

    async fn ensure_queue(&self, queue: &str) {
        let mut queues = self.queues.write().await;
        queues
            .entry(queue.to_string())
            .or_insert_with(QueueChannels::new);
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish_message(&self, queue: &str, message: &Message) -> DispatchResult<()> {
        self.ensure_queue(queue).await;
        let queues = self.queues.read().await;
        let channels = queues
            .get(queue)
            .ok_or_else(|| DispatchError::MessageQueue(format!("队列 {queue} 不存在")))?;

        if let Some(max) = self.max_queue_size {
            let current = channels.size.load(Ordering::Relaxed) as usize;
            if current >= max {
                warn!(queue, current, "队列积压达到上限，拒绝发布");
                return Err(DispatchError::MessageQueue(format!(
                    "队列 {queue} 已满 ({current}/{max})"
                )));
            }
        }

        channels
            .sender
            .send(message.clone())
            .map_err(|e| DispatchError::MessageQueue(format!("发布消息到 {queue} 失败: {e}")))?;
        channels.size.fetch_add(1, Ordering::Relaxed);
        debug!(queue, message_id = %message.id, "消息已入队");
        Ok(())
    }

    async fn consume_messages(&self, queue: &str) -> DispatchResult<Vec<Message>> {
        self.ensure_queue(queue).await;
        let queues = self.queues.read().await;
        let channels = queues
            .get(queue)
            .ok_or_else(|| DispatchError::MessageQueue(format!("队列 {queue} 不存在")))?;

        let mut receiver = channels.receiver.lock().await;
        let mut messages = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            channels.size.fetch_sub(1, Ordering::Relaxed);
            messages.push(message);
        }
        if !messages.is_empty() {
            debug!(queue, count = messages.len(), "消费消息");
        }
        Ok(messages)
    }

    async fn create_queue(&self, queue: &str, _durable: bool) -> DispatchResult<()> {
        self.ensure_queue(queue).await;
        Ok(())
    }

    async fn get_queue_size(&self, queue: &str) -> DispatchResult<u32> {
        let queues = self.queues.read().await;
        Ok(queues
            .get(queue)
            .map(|c| c.size.load(Ordering::Relaxed))
            .unwrap_or(0))
    }

    async fn purge_queue(&self, queue: &str) -> DispatchResult<()> {
        let mut queues = self.queues.write().await;
        if queues.remove(queue).is_some() {
            debug!(queue, "队列已清空");
        }
        Ok(())
    }
}
