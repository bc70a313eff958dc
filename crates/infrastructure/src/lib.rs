pub mod circuit_breaker;
pub mod collaborators;
pub mod database;
pub mod in_memory_queue;
pub mod memory_store;
pub mod redis_store;
pub mod resilient;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats};
pub use in_memory_queue::InMemoryMessageQueue;
pub use memory_store::MemoryDispatchStore;
pub use redis_store::RedisDispatchStore;
pub use resilient::ResilientCaller;
