//! Endpoint validation rules enforced by the Endpoint Registry (C4, §4.4)
//! before a `WebhookEndpoint` is ever persisted.

use crate::error::CoreError;
use crate::types::WebhookEndpoint;
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::IpAddr;

/// RFC 7230 `token` grammar, used for both header names and the
/// `signature_header_name` field.
static HEADER_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[!#$%&'*+\-.^_`|~0-9A-Za-z]+$").expect("static regex is valid"));

pub const MIN_SECRET_LEN: usize = 16;

/// Validates a `WebhookEndpoint` prior to create/update, per §4.4's
/// contract: URL scheme, header legality, secret length, retry policy
/// bounds. `strict_host_check` additionally rejects private/link-local
/// hosts (useful in production; disabled in tests that target loopback
/// fixtures).
pub fn validate_endpoint(endpoint: &WebhookEndpoint, strict_host_check: bool) -> Result<(), CoreError> {
    validate_url(&endpoint.url, strict_host_check)?;
    validate_header_token(&endpoint.signature_header_name)?;
    for (name, value) in &endpoint.custom_headers {
        validate_header_token(name)?;
        if value.contains('\n') || value.contains('\r') {
            return Err(CoreError::InvalidInput(format!(
                "custom header '{name}' value must not contain CR/LF"
            )));
        }
        if is_reserved_header(name, &endpoint.signature_header_name) {
            return Err(CoreError::InvalidInput(format!(
                "custom header '{name}' collides with a reserved header"
            )));
        }
    }

    if endpoint.is_active && endpoint.secret.len() < MIN_SECRET_LEN {
        return Err(CoreError::InvalidInput(format!(
            "secret must be at least {MIN_SECRET_LEN} bytes for an active endpoint"
        )));
    }

    endpoint
        .retry_policy
        .validate()
        .map_err(CoreError::InvalidInput)?;

    let timeout = endpoint.timeout;
    if timeout < std::time::Duration::from_secs(1) || timeout > std::time::Duration::from_secs(300) {
        return Err(CoreError::InvalidInput(
            "timeout must be between 1s and 300s".into(),
        ));
    }

    Ok(())
}

/// Reserved headers that can never be overridden by `custom_headers`
/// (§4.7, §6.4): `Content-Type`, the endpoint's own configured signature
/// header, and the `X-Webhook-*` / `X-Idempotency-Key` family.
pub fn is_reserved_header(name: &str, signature_header_name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if lower == signature_header_name.to_ascii_lowercase() {
        return true;
    }
    matches!(
        lower.as_str(),
        "content-type"
            | "x-webhook-signature"
            | "x-webhook-timestamp"
            | "x-webhook-id"
            | "x-webhook-attempt"
            | "x-idempotency-key"
    )
}

fn validate_header_token(name: &str) -> Result<(), CoreError> {
    if name.is_empty() || !HEADER_TOKEN_RE.is_match(name) {
        return Err(CoreError::InvalidInput(format!(
            "'{name}' is not a legal HTTP header token"
        )));
    }
    Ok(())
}

fn validate_url(url: &str, strict_host_check: bool) -> Result<(), CoreError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| CoreError::InvalidInput(format!("invalid endpoint url: {e}")))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(CoreError::InvalidInput(
            "endpoint url scheme must be http or https".into(),
        ));
    }

    if strict_host_check {
        if let Some(host) = parsed.host_str() {
            if let Ok(ip) = host.parse::<IpAddr>() {
                if is_private_or_link_local(&ip) {
                    return Err(CoreError::InvalidInput(
                        "endpoint url host must not be a private or link-local address".into(),
                    ));
                }
            } else if host == "localhost" {
                return Err(CoreError::InvalidInput(
                    "endpoint url host must not be localhost".into(),
                ));
            }
        } else {
            return Err(CoreError::InvalidInput("endpoint url must have a host".into()));
        }
    }

    Ok(())
}

fn is_private_or_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_link_local() || v4.is_loopback() || v4.is_broadcast()
        }
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EndpointId, EndpointHealth, HttpMethod, RetryPolicy, SchemaName};
    use chrono::Utc;
    use std::collections::HashMap;

    fn sample_endpoint() -> WebhookEndpoint {
        WebhookEndpoint {
            endpoint_id: EndpointId::new(),
            owner_scope: SchemaName::new_unchecked("acme"),
            name: "primary".into(),
            url: "https://example.test/hook".into(),
            method: HttpMethod::Post,
            secret: vec![0u8; 32],
            signature_header_name: WebhookEndpoint::default_signature_header(),
            custom_headers: HashMap::new(),
            timeout: WebhookEndpoint::default_timeout(),
            retry_policy: RetryPolicy::default(),
            event_filters: vec![],
            filter_expression: None,
            health: EndpointHealth::Healthy,
            consecutive_failures: 0,
            is_active: true,
            created_by: "test".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn accepts_well_formed_endpoint() {
        assert!(validate_endpoint(&sample_endpoint(), false).is_ok());
    }

    #[test]
    fn rejects_non_http_scheme() {
        let mut endpoint = sample_endpoint();
        endpoint.url = "ftp://example.test/hook".into();
        assert!(validate_endpoint(&endpoint, false).is_err());
    }

    #[test]
    fn rejects_private_host_in_strict_mode() {
        let mut endpoint = sample_endpoint();
        endpoint.url = "http://127.0.0.1/hook".into();
        assert!(validate_endpoint(&endpoint, true).is_ok() == false);
    }

    #[test]
    fn rejects_short_secret() {
        let mut endpoint = sample_endpoint();
        endpoint.secret = vec![0u8; 4];
        assert!(validate_endpoint(&endpoint, false).is_err());
    }

    #[test]
    fn rejects_reserved_custom_header() {
        let mut endpoint = sample_endpoint();
        endpoint
            .custom_headers
            .insert("X-Webhook-Signature".into(), "nope".into());
        assert!(validate_endpoint(&endpoint, false).is_err());
    }

    #[test]
    fn rejects_custom_header_colliding_with_configured_signature_header() {
        let mut endpoint = sample_endpoint();
        endpoint.signature_header_name = "X-My-Sig".into();
        endpoint
            .custom_headers
            .insert("x-my-sig".into(), "attacker-value".into());
        assert!(validate_endpoint(&endpoint, false).is_err());
    }

}
