//! Time-based one-time codes for the two-factor login step (RFC 6238).

use crate::error::BrokerError;
use hmac::{Hmac, Mac};
use sha1::Sha1;

const STEP_SECS: u64 = 30;
const DIGITS: u32 = 6;

/// Six-digit code for the given Unix time.
pub fn totp_at(seed_base32: &str, unix_secs: u64) -> Result<String, BrokerError> {
    let key = decode_base32(seed_base32)
        .ok_or_else(|| BrokerError::Auth("TOTP seed is not valid base32".to_string()))?;
    let counter = unix_secs / STEP_SECS;

    let mut mac = Hmac::<Sha1>::new_from_slice(&key)
        .map_err(|e| BrokerError::Auth(format!("TOTP key rejected: {}", e)))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    let code = binary % 10u32.pow(DIGITS);
    Ok(format!("{:0width$}", code, width = DIGITS as usize))
}

/// Code for the current time.
pub fn totp_now(seed_base32: &str) -> Result<String, BrokerError> {
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    totp_at(seed_base32, now)
}

/// RFC 4648 base32, case-insensitive, padding and spaces ignored.
fn decode_base32(input: &str) -> Option<Vec<u8>> {
    let mut buffer: u64 = 0;
    let mut bits = 0u32;
    let mut out = Vec::with_capacity(input.len() * 5 / 8);

    for c in input.chars().filter(|c| !c.is_whitespace() && *c != '=') {
        let value = match c.to_ascii_uppercase() {
            c @ 'A'..='Z' => c as u64 - 'A' as u64,
            c @ '2'..='7' => c as u64 - '2' as u64 + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // "12345678901234567890" in base32, the RFC 6238 SHA-1 test key
    const RFC_SEED: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn test_rfc6238_vectors() {
        assert_eq!(totp_at(RFC_SEED, 59).unwrap(), "287082");
        assert_eq!(totp_at(RFC_SEED, 1_111_111_109).unwrap(), "081804");
        assert_eq!(totp_at(RFC_SEED, 1_234_567_890).unwrap(), "005924");
    }

    #[test]
    fn test_seed_is_case_insensitive() {
        let lower = RFC_SEED.to_lowercase();
        assert_eq!(totp_at(&lower, 59).unwrap(), "287082");
    }

    #[test]
    fn test_invalid_seed_is_auth_error() {
        let err = totp_at("not-base32!", 59).unwrap_err();
        assert!(matches!(err, BrokerError::Auth(_)));
    }

    #[test]
    fn test_decode_base32() {
        assert_eq!(decode_base32("MZXW6YQ=").unwrap(), b"foob");
        assert_eq!(decode_base32("MZXW6YTBOI======").unwrap(), b"foobar");
    }
}
