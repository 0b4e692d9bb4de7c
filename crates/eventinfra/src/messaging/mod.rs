pub mod nats;

pub use nats::{NatsConfig, NatsStreamLog};
