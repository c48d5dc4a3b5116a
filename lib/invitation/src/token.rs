//! Invitation token generation.

use base64::Engine;
use rand::RngCore;

/// Entropy per token, before encoding.
const TOKEN_BYTES: usize = 32;

/// Generates a single-use invitation token: 32 random bytes, base64url
/// without padding.
#[must_use]
pub fn generate() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
