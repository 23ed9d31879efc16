pub mod feedback;
pub mod kv;
pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod repository;

pub use feedback::FeedbackRepository;
pub use kv::KvStore;
pub use memory::MemoryKvStore;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisKvStore;
pub use repository::ChatRepository;
