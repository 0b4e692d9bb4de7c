//! Resilience patterns for fault-tolerant services.
//!
//! Only the bulkhead survives here: the dispatcher uses it to cap
//! in-flight deliveries per endpoint (§5). Circuit breaking, generic
//! retry-with-backoff, and a standalone timeout wrapper had no caller in
//! this system — delivery retry is owned end-to-end by the retry
//! scheduler and delivery planner instead.

pub mod bulkhead;

pub use bulkhead::{Bulkhead, BulkheadConfig};
