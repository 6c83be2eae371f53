use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_VERSION: &str = "v0";
pub const SIGNATURE_HEADER: &str = "x-slack-signature";
pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing request timestamp or signature")]
    Missing,
    #[error("request timestamp is not an integer")]
    BadTimestamp,
    #[error("request timestamp is outside the allowed window")]
    Stale,
    #[error("signature does not match")]
    Mismatch,
    #[error("invalid signing secret: {0}")]
    Secret(String),
}

/// `v0=<hex>` signature of `v0:{timestamp}:{body}`.
pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| SignatureError::Secret(err.to_string()))?;
    mac.update(SIGNATURE_VERSION.as_bytes());
    mac.update(b":");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!("{SIGNATURE_VERSION}={hex}"))
}

/// Checks a request signature against `secret`. `now` is unix seconds.
pub fn verify(
    secret: &str,
    timestamp: Option<&str>,
    signature: Option<&str>,
    body: &[u8],
    now: i64,
    max_age_secs: u64,
) -> Result<(), SignatureError> {
    let (timestamp, signature) = match (timestamp, signature) {
        (Some(ts), Some(sig)) if !ts.is_empty() && !sig.is_empty() => (ts, sig),
        _ => return Err(SignatureError::Missing),
    };
    let sent_at: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| SignatureError::BadTimestamp)?;
    if now.abs_diff(sent_at) > max_age_secs {
        return Err(SignatureError::Stale);
    }
    let expected = sign(secret, timestamp, body)?;
    if expected.len() != signature.len() {
        return Err(SignatureError::Mismatch);
    }
    if bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}
