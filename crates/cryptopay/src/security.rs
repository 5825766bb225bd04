//! Bearer token checks for operator endpoints.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Check an `Authorization` header value against the configured token.
///
/// The scheme is matched case-insensitively. Tokens are compared as SHA-256
/// digests so the comparison time does not depend on either token's length.
pub fn bearer_matches(authorization: Option<&str>, expected: &[u8]) -> bool {
    let Some((scheme, presented)) = authorization.and_then(|v| v.trim().split_once(' ')) else {
        return false;
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return false;
    }
    let presented = Sha256::digest(presented.trim().as_bytes());
    let expected = Sha256::digest(expected);
    presented.ct_eq(&expected).into()
}
