//! Webhook payload signature verification.
//!
//! The platform signs delivery payloads with HMAC-SHA256 over the raw
//! request body, sent as `X-Hub-Signature-256: sha256=<hex digest>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Verify a delivery payload signature header against the app secret.
///
/// # Arguments
///
/// * `app_secret` - The pre-shared application secret
/// * `header` - The `X-Hub-Signature-256` header value (`sha256=...`)
/// * `body` - The raw request body bytes
///
/// # Returns
///
/// `true` if the digest matches, `false` otherwise.
pub fn verify_payload_signature(app_secret: &str, header: &str, body: &[u8]) -> bool {
    if app_secret.is_empty() || header.is_empty() {
        warn!(
            has_secret = !app_secret.is_empty(),
            has_header = !header.is_empty(),
            "payload_signature_missing_fields"
        );
        return false;
    }

    let hex_digest = match header.strip_prefix("sha256=") {
        Some(d) => d,
        None => {
            warn!(header_prefix = %&header[..header.len().min(16)], "payload_signature_bad_scheme");
            return false;
        }
    };

    let mut mac = match HmacSha256::new_from_slice(app_secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            warn!("payload_signature_invalid_key");
            return false;
        }
    };
    mac.update(body);

    let expected = hex::encode(mac.finalize().into_bytes());

    // Constant-time comparison to prevent timing attacks.
    let valid = constant_time_compare(&expected, hex_digest);

    if !valid {
        warn!(
            expected_length = expected.len(),
            actual_length = hex_digest.len(),
            "payload_signature_mismatch"
        );
    }

    valid
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Check whether payload signature verification is enabled.
pub fn is_signature_verification_enabled(app_secret: &Option<String>) -> bool {
    app_secret
        .as_ref()
        .map(|k| !k.trim().is_empty())
        .unwrap_or(false)
}
