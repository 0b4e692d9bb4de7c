pub mod redis_scheduler;

pub use redis_scheduler::{RedisRetryScheduler, RedisSchedulerConfig};
