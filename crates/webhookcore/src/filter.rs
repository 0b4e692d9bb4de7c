//! Glob matching over `event_type` and predicate-tree evaluation over
//! `event.payload`/`event.metadata` (§4.5).

use eventcore::types::{DomainEvent, EventPattern, FilterExpr};
use serde_json::Value;

/// Matches `event_type` against a dotted glob pattern. `*` matches exactly
/// one dot-delimited segment; `**` matches any number of trailing segments
/// (it must be the last segment of the pattern).
pub fn pattern_matches(pattern: &EventPattern, event_type: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.0.split('.').collect();
    let event_segments: Vec<&str> = event_type.split('.').collect();
    match_segments(&pattern_segments, &event_segments)
}

fn match_segments(pattern: &[&str], event: &[&str]) -> bool {
    match pattern.first() {
        None => event.is_empty(),
        Some(&"**") => pattern.len() == 1,
        Some(&"*") => !event.is_empty() && match_segments(&pattern[1..], &event[1..]),
        Some(seg) => !event.is_empty() && event[0] == *seg && match_segments(&pattern[1..], &event[1..]),
    }
}

/// Resolves a dotted field path (`"payload.user.id"`, `"metadata.actor"`)
/// against one event. Typed `EventMetadata` fields are surfaced as JSON
/// strings; anything under `metadata.<other>` falls through to the
/// metadata envelope's free-form `extra` map.
fn field_value(event: &DomainEvent, field: &str) -> Option<Value> {
    let (root, rest) = field.split_once('.')?;
    match root {
        "payload" => {
            let mut current = &event.payload;
            for segment in rest.split('.') {
                current = current.as_object()?.get(segment)?;
            }
            Some(current.clone())
        }
        "metadata" => match rest {
            "correlation_id" => event.metadata.correlation_id.clone().map(Value::String),
            "causation_id" => event.metadata.causation_id.clone().map(Value::String),
            "request_id" => event.metadata.request_id.clone().map(Value::String),
            "actor" => event.metadata.actor.clone().map(Value::String),
            "ip" => event.metadata.ip.clone().map(Value::String),
            "user_agent" => event.metadata.user_agent.clone().map(Value::String),
            other => event.metadata.extra.get(other).cloned(),
        },
        _ => None,
    }
}

/// Evaluates a predicate tree against one event. Missing fields evaluate to
/// `false` for comparison operators and to "does not exist" for `exists`
/// (§4.5).
pub fn evaluate(expr: &FilterExpr, event: &DomainEvent) -> bool {
    match expr {
        FilterExpr::Eq { field, value } => field_value(event, field).as_ref() == Some(value),
        FilterExpr::Ne { field, value } => {
            field_value(event, field).map(|v| &v != value).unwrap_or(false)
        }
        FilterExpr::In { field, values } => {
            field_value(event, field).map(|v| values.contains(&v)).unwrap_or(false)
        }
        FilterExpr::NotIn { field, values } => {
            field_value(event, field).map(|v| !values.contains(&v)).unwrap_or(false)
        }
        FilterExpr::Exists { field } => field_value(event, field).is_some(),
        FilterExpr::Gt { field, value } => compare(event, field, value, |o| o == std::cmp::Ordering::Greater),
        FilterExpr::Ge { field, value } => compare(event, field, value, |o| o != std::cmp::Ordering::Less),
        FilterExpr::Lt { field, value } => compare(event, field, value, |o| o == std::cmp::Ordering::Less),
        FilterExpr::Le { field, value } => compare(event, field, value, |o| o != std::cmp::Ordering::Greater),
        FilterExpr::And(exprs) => exprs.iter().all(|e| evaluate(e, event)),
        FilterExpr::Or(exprs) => exprs.iter().any(|e| evaluate(e, event)),
        FilterExpr::Not(inner) => !evaluate(inner, event),
    }
}

fn compare(
    event: &DomainEvent,
    field: &str,
    value: &Value,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    let actual = match field_value(event, field) {
        Some(v) => v,
        None => return false,
    };

    match (actual.as_f64(), value.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).map(accept).unwrap_or(false),
        _ => match (actual.as_str(), value.as_str()) {
            (Some(a), Some(b)) => accept(a.cmp(b)),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventcore::types::EventMetadata;

    fn event(payload: Value) -> DomainEvent {
        DomainEvent::new("users.created", "user", "u1", payload, EventMetadata::default())
    }

    #[test]
    fn star_matches_single_segment_only() {
        let pattern = EventPattern("users.*".to_string());
        assert!(pattern_matches(&pattern, "users.created"));
        assert!(!pattern_matches(&pattern, "users.profile.updated"));
    }

    #[test]
    fn double_star_matches_multiple_segments() {
        let pattern = EventPattern("users.**".to_string());
        assert!(pattern_matches(&pattern, "users.created"));
        assert!(pattern_matches(&pattern, "users.profile.updated"));
    }

    #[test]
    fn exact_pattern_matches_exact_type_only() {
        let pattern = EventPattern("users.created".to_string());
        assert!(pattern_matches(&pattern, "users.created"));
        assert!(!pattern_matches(&pattern, "users.deleted"));
    }

    #[test]
    fn eq_filter_matches_payload_field() {
        let event = event(serde_json::json!({"status": "active"}));
        let expr = FilterExpr::Eq {
            field: "payload.status".to_string(),
            value: serde_json::json!("active"),
        };
        assert!(evaluate(&expr, &event));
    }

    #[test]
    fn missing_field_is_false_for_eq_and_absent_for_exists() {
        let event = event(serde_json::json!({}));
        let eq = FilterExpr::Eq {
            field: "payload.status".to_string(),
            value: serde_json::json!("active"),
        };
        let exists = FilterExpr::Exists {
            field: "payload.status".to_string(),
        };
        assert!(!evaluate(&eq, &event));
        assert!(!evaluate(&exists, &event));
    }

    #[test]
    fn and_or_not_compose() {
        let event = event(serde_json::json!({"amount": 42}));
        let expr = FilterExpr::And(vec![
            FilterExpr::Gt {
                field: "payload.amount".to_string(),
                value: serde_json::json!(10),
            },
            FilterExpr::Not(Box::new(FilterExpr::Eq {
                field: "payload.amount".to_string(),
                value: serde_json::json!(100),
            })),
        ]);
        assert!(evaluate(&expr, &event));
    }
}
