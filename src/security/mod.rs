//! Request-time security primitives.
//!
//! CSRF double-submit validation, sliding-window rate limiting, and the
//! token/comparison helpers they share with the session layer.

pub mod csrf;
pub mod rate_limit;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

pub use rate_limit::RateLimiter;

/// Generate an opaque, URL-safe random token (32 bytes of entropy).
///
/// Used for session ids, attempt ids, and CSRF tokens.
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compare two secrets without short-circuiting on the first differing byte.
///
/// Length is not secret here (both sides are fixed-size generated tokens),
/// so an early return on length mismatch is fine.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
