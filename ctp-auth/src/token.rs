//! API token format: `ctp_` + 32 url-safe base64 characters.
//!
//! Only the SHA-256 digest and the 12-character display prefix are ever
//! stored; the cleartext is shown to the caller exactly once.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const TOKEN_PREFIX: &str = "ctp_";
pub const TOKEN_RANDOM_LENGTH: usize = 32;
pub const DISPLAY_PREFIX_LENGTH: usize = 12;

/// Cleartext token plus the two values that go to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMaterial {
    pub token: String,
    /// First 12 characters, safe to display and index.
    pub prefix: String,
    /// Hex-encoded SHA-256 of the full token.
    pub hash: String,
}

/// Generate a fresh token. ~192 bits of entropy; hash collisions are a
/// unique-constraint retry, not a correctness concern.
pub fn generate_api_token() -> TokenMaterial {
    let mut bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let mut random_part = URL_SAFE_NO_PAD.encode(bytes);
    random_part.truncate(TOKEN_RANDOM_LENGTH);
    let token = format!("{TOKEN_PREFIX}{random_part}");
    material_for(&token)
}

/// Hex-encoded SHA-256 of a token string.
pub fn hash_api_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Constant-time comparison of a presented token against a stored digest.
pub fn verify_api_token(token: &str, stored_hash: &str) -> bool {
    ct_eq(hash_api_token(token).as_bytes(), stored_hash.as_bytes())
}

/// Structural validation: prefix, total length, url-safe alphabet.
pub fn validate_token_format(token: &str) -> bool {
    let Some(random_part) = token.strip_prefix(TOKEN_PREFIX) else {
        return false;
    };
    if random_part.len() != TOKEN_RANDOM_LENGTH {
        return false;
    }
    random_part
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Prepare a caller-supplied token (worker seeding) for storage.
pub fn prepare_predefined_token(token: &str) -> Result<TokenMaterial, InvalidTokenFormat> {
    if !validate_token_format(token) {
        return Err(InvalidTokenFormat);
    }
    Ok(material_for(token))
}

fn material_for(token: &str) -> TokenMaterial {
    TokenMaterial {
        token: token.to_string(),
        prefix: token[..DISPLAY_PREFIX_LENGTH].to_string(),
        hash: hash_api_token(token),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTokenFormat;

impl std::fmt::Display for InvalidTokenFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid token format: expected '{TOKEN_PREFIX}' followed by {TOKEN_RANDOM_LENGTH} url-safe base64 characters"
        )
    }
}

impl std::error::Error for InvalidTokenFormat {}

/// Hash a session token (same digest scheme as API tokens).
pub fn hash_session_token(token: &str) -> String {
    hash_api_token(token)
}

/// Random url-safe session token material (32 bytes → 43 characters).
pub fn generate_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Constant-time byte equality; both inputs are digests of fixed length.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_have_the_documented_shape() {
        let material = generate_api_token();
        assert!(material.token.starts_with(TOKEN_PREFIX));
        assert_eq!(material.token.len(), TOKEN_PREFIX.len() + TOKEN_RANDOM_LENGTH);
        assert_eq!(material.prefix, &material.token[..12]);
        assert_eq!(material.hash.len(), 64);
        assert!(validate_token_format(&material.token));
    }

    #[test]
    fn generated_tokens_are_unique() {
        let a = generate_api_token();
        let b = generate_api_token();
        assert_ne!(a.token, b.token);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn verify_round_trips_and_rejects_others() {
        let material = generate_api_token();
        assert!(verify_api_token(&material.token, &material.hash));
        assert!(!verify_api_token("ctp_aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", &material.hash));
    }

    #[test]
    fn format_validation_catches_bad_inputs() {
        assert!(!validate_token_format("invalid_token"));
        assert!(!validate_token_format("ctp_short"));
        assert!(!validate_token_format("ctp_############################ghij"));
        assert!(validate_token_format("ctp_a1b2c3d4e5f6g7h8i9j0k1l2m3n4o5p6"));
    }

    #[test]
    fn predefined_tokens_round_trip() {
        let material = prepare_predefined_token("ctp_a1b2c3d4e5f6g7h8i9j0k1l2m3n4o5p6").unwrap();
        assert_eq!(material.prefix, "ctp_a1b2c3d4");
        assert!(verify_api_token(&material.token, &material.hash));
        assert!(prepare_predefined_token("nope").is_err());
    }

    #[test]
    fn session_tokens_are_long_and_random() {
        let a = generate_session_token();
        let b = generate_session_token();
        assert_ne!(a, b);
        assert!(a.len() >= 43);
        assert_eq!(hash_session_token(&a).len(), 64);
    }
}
