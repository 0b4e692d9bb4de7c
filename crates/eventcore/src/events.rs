//! Event construction and validation helpers shared by the Publisher (C3)
//! and the HTTP producer surface.

use crate::error::CoreError;
use crate::types::DomainEvent;
use once_cell::sync::Lazy;
use regex::Regex;

/// `^[a-z_]+(\.[a-z_]+)+$` — dotted, lowercase, at least two segments
/// (§3).
static EVENT_TYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_]+(\.[a-z_]+)+$").expect("static regex is valid"));

/// Validates `event_type` format (§3, §4.3 step 1).
pub fn validate_event_type(event_type: &str) -> Result<(), CoreError> {
    if !EVENT_TYPE_RE.is_match(event_type) {
        return Err(CoreError::InvalidInput(format!(
            "event_type '{event_type}' must match ^[a-z_]+(\\.[a-z_]+)+$"
        )));
    }
    Ok(())
}

/// Validates the event carries metadata consistent with the target schema
/// before the Publisher's algorithm ever reaches the store (§4.3 step 1).
pub fn validate_event(event: &DomainEvent, schema: &str) -> Result<(), CoreError> {
    validate_event_type(&event.event_type)?;
    if event.aggregate_type.trim().is_empty() {
        return Err(CoreError::InvalidInput("aggregate_type must not be empty".into()));
    }
    if event.aggregate_id.trim().is_empty() {
        return Err(CoreError::InvalidInput("aggregate_id must not be empty".into()));
    }
    if let Some(declared) = &event.metadata.schema_name {
        if declared != schema {
            return Err(CoreError::InvalidInput(format!(
                "metadata.schema_name '{declared}' does not match target schema '{schema}'"
            )));
        }
    }
    Ok(())
}

/// Stream topic naming (§4.2, §6.5): `events.{schema}.{category}`.
pub fn topic_for(event: &DomainEvent, schema: &str) -> String {
    format!("events.{schema}.{}", event.category())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventMetadata;

    #[test]
    fn accepts_well_formed_event_types() {
        assert!(validate_event_type("users.created").is_ok());
        assert!(validate_event_type("users.profile.updated").is_ok());
    }

    #[test]
    fn rejects_malformed_event_types() {
        assert!(validate_event_type("UsersCreated").is_err());
        assert!(validate_event_type("users").is_err());
        assert!(validate_event_type("users.Created").is_err());
        assert!(validate_event_type("users..created").is_err());
    }

    #[test]
    fn topic_naming_uses_first_segment() {
        let event = DomainEvent::new(
            "orders.created",
            "order",
            "o1",
            serde_json::json!({}),
            EventMetadata::default(),
        );
        assert_eq!(topic_for(&event, "acme"), "events.acme.orders");
    }

    #[test]
    fn rejects_schema_mismatch_in_metadata() {
        let mut event = DomainEvent::new(
            "orders.created",
            "order",
            "o1",
            serde_json::json!({}),
            EventMetadata::default(),
        );
        event.metadata.schema_name = Some("other".to_string());
        assert!(validate_event(&event, "acme").is_err());
    }
}
