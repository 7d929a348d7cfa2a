use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing signature")]
    Missing,
    #[error("invalid signature format")]
    InvalidFormat,
    #[error("timestamp outside tolerance")]
    TimestampOutOfRange,
    #[error("signature mismatch")]
    Mismatch,
    #[error("invalid signing key")]
    InvalidKey,
}

fn keyed(secret: &[u8]) -> Result<HmacSha256, SignatureError> {
    HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidKey)
}

/// Hex-encoded HMAC-SHA256 of `message`.
pub fn sign(secret: &[u8], message: &[u8]) -> Result<String, SignatureError> {
    let mut mac = keyed(secret)?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a hex HMAC-SHA256 in constant time.
pub fn verify(secret: &[u8], message: &[u8], signature: &str) -> Result<(), SignatureError> {
    let signature = signature.trim();
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let expected = hex::decode(signature).map_err(|_| SignatureError::InvalidFormat)?;
    let mut mac = keyed(secret)?;
    mac.update(message);
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

fn timestamped_message(timestamp: i64, payload: &[u8]) -> Vec<u8> {
    let mut message = format!("{timestamp}.").into_bytes();
    message.extend_from_slice(payload);
    message
}

/// Signature header of the form `t=<unix seconds>,v1=<hex hmac>`, signed over
/// `"<t>.<payload>"`.
pub fn sign_timestamped(
    secret: &[u8],
    timestamp: i64,
    payload: &[u8],
) -> Result<String, SignatureError> {
    let v1 = sign(secret, &timestamped_message(timestamp, payload))?;
    Ok(format!("t={timestamp},v1={v1}"))
}

pub fn verify_timestamped(
    secret: &[u8],
    header: &str,
    payload: &[u8],
    now: i64,
    tolerance: Duration,
) -> Result<(), SignatureError> {
    if header.trim().is_empty() {
        return Err(SignatureError::Missing);
    }
    let mut timestamp = None;
    let mut v1 = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => v1 = Some(value),
            _ => {}
        }
    }
    let (Some(timestamp), Some(v1)) = (timestamp, v1) else {
        return Err(SignatureError::InvalidFormat);
    };

    let tolerance = i64::try_from(tolerance.as_secs()).unwrap_or(i64::MAX);
    if now.abs_diff(timestamp) > tolerance.unsigned_abs() {
        return Err(SignatureError::TimestampOutOfRange);
    }
    verify(secret, &timestamped_message(timestamp, payload), v1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signature = sign(b"secret", b"{\"a\":1}").unwrap();
        assert_eq!(signature.len(), 64);
        verify(b"secret", b"{\"a\":1}", &signature).unwrap();
        assert_eq!(
            verify(b"other", b"{\"a\":1}", &signature),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify(b"secret", b"{\"a\":2}", &signature),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify(b"secret", b"x", "not-hex"),
            Err(SignatureError::InvalidFormat)
        );
        assert_eq!(verify(b"secret", b"x", ""), Err(SignatureError::Missing));
    }

    #[test]
    fn test_timestamped_signature() {
        let tolerance = Duration::from_secs(300);
        let header = sign_timestamped(b"secret", 1_700_000_000, b"body").unwrap();
        assert!(header.starts_with("t=1700000000,v1="));

        verify_timestamped(b"secret", &header, b"body", 1_700_000_100, tolerance).unwrap();
        assert_eq!(
            verify_timestamped(b"secret", &header, b"body", 1_700_001_000, tolerance),
            Err(SignatureError::TimestampOutOfRange)
        );
        assert_eq!(
            verify_timestamped(b"secret", &header, b"tampered", 1_700_000_000, tolerance),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_timestamped(b"secret", "v1=abc", b"body", 1_700_000_000, tolerance),
            Err(SignatureError::InvalidFormat)
        );
    }
}
