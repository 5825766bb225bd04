//! Webhook payload signing.
//!
//! Outbound requests carry `X-Webhook-Signature: sha256=<hex>` where the hex
//! string is HMAC-SHA256 over the exact request body, keyed by the endpoint
//! secret. Receivers can check it with [`verify_signature`].

use alloy::hex;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix carried by every signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute the hex-encoded HMAC-SHA256 of `body` under `secret`.
pub fn compute_hmac(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Header value for `X-Webhook-Signature`.
pub fn sign_payload(secret: &[u8], body: &[u8]) -> String {
    format!("{SIGNATURE_PREFIX}{}", compute_hmac(secret, body))
}

/// Check a `sha256=<hex>` header against the body.
///
/// Comparison is constant-time; malformed headers compare against zeros so
/// they take the same path as a wrong signature.
pub fn verify_signature(secret: &[u8], body: &[u8], header: &str) -> bool {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);

    let expected = header
        .strip_prefix(SIGNATURE_PREFIX)
        .and_then(|h| hex::decode(h).ok())
        .unwrap_or_else(|| vec![0u8; 32]);

    mac.verify_slice(&expected).is_ok()
}

/// Fresh endpoint secret: 32 random bytes, hex-encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
