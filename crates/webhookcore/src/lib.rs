//! Endpoint registry, subscription matching, delivery planning and outbound
//! HTTP delivery for the event and webhook delivery core (C4–C7, §4.4–4.7).
//!
//! This crate holds every component that reasons about *where* an event
//! should go and *how* to deliver it. Durable storage primitives shared
//! across the daemon (the Event Store, Stream Log, Attempt Recorder, Retry
//! Scheduler) live in `eventinfra` instead.

pub mod dispatcher;
pub mod filter;
pub mod http_adapter;
pub mod matcher;
pub mod planner;
pub mod publisher;
pub mod registry;
pub mod signature;

pub use dispatcher::Dispatcher;
pub use http_adapter::{HttpAdapterConfig, ReqwestHttpDeliveryAdapter};
pub use matcher::CachingSubscriptionMatcher;
pub use planner::BackoffDeliveryPlanner;
pub use publisher::{EventPublisher, PublishOutcome};
pub use registry::PgEndpointRegistry;
