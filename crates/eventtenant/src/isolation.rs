//! Schema name validation (§4.1: "Schema name is validated against a
//! conservative identifier regex before being interpolated; parameter
//! binding is used elsewhere").

use crate::{Result, TenantError};
use once_cell::sync::Lazy;
use regex::Regex;

/// Lowercase letters, digits and underscores, starting with a letter, at
/// most 63 bytes (Postgres's identifier limit). Deliberately more
/// restrictive than what Postgres itself accepts: this is the one value in
/// the system that reaches SQL as raw text rather than a bound parameter,
/// so the regex is conservative by design rather than merely correct.
pub static DEFAULT_SCHEMA_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,62}$").expect("static regex is valid"));

/// A small set of schema names that must never be targeted directly by
/// tenant traffic (Postgres system schemas and the bootstrap schema).
const RESERVED_SCHEMA_NAMES: &[&str] = &["public", "pg_catalog", "information_schema", "pg_toast"];

/// Validates and normalizes tenant schema names before any query is built
/// against the Event Store, Endpoint Registry, or Attempt Recorder tables.
#[derive(Debug, Clone, Default)]
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn new() -> Self {
        Self
    }

    /// Returns the schema name unchanged if it is safe to interpolate into
    /// SQL, or `InvalidSchemaName` otherwise. Rejects before any SQL is sent
    /// (§8 schema isolation property).
    pub fn validate<'a>(&self, schema: &'a str) -> Result<&'a str> {
        if !DEFAULT_SCHEMA_NAME_RE.is_match(schema) {
            return Err(TenantError::InvalidSchemaName(format!(
                "'{schema}' does not match ^[a-z][a-z0-9_]{{0,62}}$"
            )));
        }
        if RESERVED_SCHEMA_NAMES.contains(&schema) {
            return Err(TenantError::InvalidSchemaName(format!(
                "'{schema}' is a reserved schema name"
            )));
        }
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_schema_names() {
        let validator = SchemaValidator::new();
        assert!(validator.validate("acme").is_ok());
        assert!(validator.validate("acme_corp_1").is_ok());
    }

    #[test]
    fn rejects_sql_injection_attempts() {
        let validator = SchemaValidator::new();
        assert!(validator.validate("acme; DROP TABLE events;--").is_err());
        assert!(validator.validate("acme\".events; --").is_err());
        assert!(validator.validate("Acme").is_err());
        assert!(validator.validate("1acme").is_err());
        assert!(validator.validate("").is_err());
    }

    #[test]
    fn rejects_reserved_schema_names() {
        let validator = SchemaValidator::new();
        assert!(validator.validate("public").is_err());
        assert!(validator.validate("pg_catalog").is_err());
    }

    #[test]
    fn rejects_overlong_schema_names() {
        let validator = SchemaValidator::new();
        let too_long = "a".repeat(64);
        assert!(validator.validate(&too_long).is_err());
    }
}
