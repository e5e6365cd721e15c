//! RFC 6238 TOTP codes for accounts with a two-factor secret.
//!
//! Platforms hand out base32-encoded secrets; codes are six digits over a
//! 30-second step with HMAC-SHA1, which is what authenticator apps produce.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

const STEP_SECS: u64 = 30;

/// Generate the current six-digit code for a base32 secret.
///
/// Returns `None` when the secret is not valid base32.
pub fn totp_now(secret: &str) -> Option<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    totp_at(secret, now)
}

/// Generate the six-digit code for a base32 secret at a given unix time.
pub fn totp_at(secret: &str, unix_secs: u64) -> Option<String> {
    let key = decode_base32(secret)?;
    if key.is_empty() {
        return None;
    }

    let counter = unix_secs / STEP_SECS;

    let mut mac = HmacSha1::new_from_slice(&key).ok()?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation per RFC 4226 §5.3.
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let bin = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);

    Some(format!("{:06}", bin % 1_000_000))
}

/// Decode RFC 4648 base32, case-insensitive, ignoring padding and spaces.
fn decode_base32(input: &str) -> Option<Vec<u8>> {
    let mut bits: u32 = 0;
    let mut bit_count: u8 = 0;
    let mut out = Vec::with_capacity(input.len() * 5 / 8);

    for c in input.chars() {
        if c == '=' || c == ' ' {
            continue;
        }
        let value = match c.to_ascii_uppercase() {
            c @ 'A'..='Z' => c as u32 - 'A' as u32,
            c @ '2'..='7' => c as u32 - '2' as u32 + 26,
            _ => return None,
        };
        bits = (bits << 5) | value;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Base32 of the RFC 6238 test key "12345678901234567890".
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn test_decode_base32() {
        assert_eq!(
            decode_base32(RFC_SECRET).unwrap(),
            b"12345678901234567890".to_vec()
        );
        assert_eq!(decode_base32("MZXW6===").unwrap(), b"foo".to_vec());
        assert_eq!(decode_base32("mzxw6").unwrap(), b"foo".to_vec());
        assert!(decode_base32("not!base32").is_none());
    }

    #[test]
    fn test_rfc6238_vectors() {
        // RFC 6238 appendix B, SHA-1 rows, truncated to six digits.
        assert_eq!(totp_at(RFC_SECRET, 59).unwrap(), "287082");
        assert_eq!(totp_at(RFC_SECRET, 1_111_111_109).unwrap(), "081804");
        assert_eq!(totp_at(RFC_SECRET, 1_234_567_890).unwrap(), "005924");
    }

    #[test]
    fn test_invalid_secret() {
        assert!(totp_at("!!!!", 59).is_none());
        assert!(totp_at("", 59).is_none());
    }
}
