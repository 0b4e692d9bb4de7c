//! Core data model, error taxonomy, component contracts and configuration
//! for the Event & Webhook Delivery Core. Concrete implementations live in
//! `eventinfra` (storage/stream/scheduler-backed) and `webhookcore`
//! (matching, planning, HTTP delivery, recording).

pub mod config;
pub mod error;
pub mod events;
pub mod traits;
pub mod types;
pub mod validation;

pub use config::*;
pub use error::*;
pub use types::*;

pub use events::{topic_for, validate_event, validate_event_type};
pub use traits::*;
pub use validation::{is_reserved_header, validate_endpoint, MIN_SECRET_LEN};
