//! Outbound webhook signing (§4.7): `HMAC-SHA256(endpoint.secret,
//! "<unix_seconds>.<raw body bytes>")`, hex-encoded, carried in the
//! endpoint's configured signature header as `v1=<hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Computes the signature header value for a signed outbound delivery.
/// `timestamp` and `body` together are the signed message; callers are
/// responsible for sending `timestamp` separately as `X-Webhook-Timestamp`
/// so the receiver can reconstruct the same message.
pub fn sign(secret: &[u8], timestamp_unix_seconds: i64, body: &[u8]) -> String {
    let mut message = Vec::with_capacity(body.len() + 16);
    message.extend_from_slice(timestamp_unix_seconds.to_string().as_bytes());
    message.push(b'.');
    message.extend_from_slice(body);

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts a key of any length");
    mac.update(&message);
    let digest = hex::encode(mac.finalize().into_bytes());

    format!("v1={digest}")
}

/// Generates a cryptographically random webhook secret suitable for storage
/// as `WebhookEndpoint.secret`.
pub fn generate_secret() -> Vec<u8> {
    use rand::RngCore;
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_has_the_v1_prefix() {
        let sig = sign(b"secret", 1_700_000_000, b"{}");
        assert!(sig.starts_with("v1="));
    }

    #[test]
    fn signature_changes_with_the_body() {
        let a = sign(b"secret", 1_700_000_000, b"{\"a\":1}");
        let b = sign(b"secret", 1_700_000_000, b"{\"a\":2}");
        assert_ne!(a, b);
    }

    #[test]
    fn signature_changes_with_the_timestamp() {
        let a = sign(b"secret", 1_700_000_000, b"{}");
        let b = sign(b"secret", 1_700_000_001, b"{}");
        assert_ne!(a, b);
    }

    #[test]
    fn secrets_are_32_bytes_and_not_reused() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
