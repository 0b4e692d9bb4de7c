//! Endpoint management and observability HTTP API for the event core
//! (§6.2, §6.3).
//!
//! This crate owns only the HTTP edge: request parsing, response shaping,
//! and mapping `CoreError` onto problem+json. All business logic lives in
//! `eventcore`'s traits and their `eventinfra`/`webhookcore` implementations,
//! wired together by the caller through [`AppState`].

mod error;
pub mod rest;
mod state;

pub use error::ApiError;
pub use rest::router::create_router;
pub use state::AppState;
