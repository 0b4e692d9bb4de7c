//! Schema-based tenant isolation for the event and webhook delivery core.
//!
//! The core isolates tenants by Postgres *schema* (`§3`, `§4.1`): every
//! query is scoped to a `schema_name` carried alongside the request. This
//! crate owns the one piece of that story that must never be skipped: schema
//! names are validated against a conservative identifier regex *before* they
//! are ever interpolated into SQL, since they cannot be bound as query
//! parameters (Postgres does not allow parameterizing identifiers).

pub mod isolation;

pub use isolation::{SchemaValidator, DEFAULT_SCHEMA_NAME_RE};

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum TenantError {
    #[error("invalid schema name: {0}")]
    InvalidSchemaName(String),
}

pub type Result<T> = std::result::Result<T, TenantError>;
