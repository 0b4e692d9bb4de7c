pub mod attempt_recorder;
pub mod event_store;
pub mod migrations;
pub mod pool;

pub use attempt_recorder::PgAttemptRecorder;
pub use event_store::PgEventStore;
