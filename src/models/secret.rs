//! Opaque credentials handed to clients: user API keys and bearer tokens.
//!
//! Only the SHA-256 digest is persisted; the plaintext is shown once.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const API_KEY_PREFIX: &str = "aiapi_";
pub const TOKEN_PREFIX: &str = "aiapi_tok_";

/// Number of leading characters kept for display ("aiapi_3f9c1a").
const DISPLAY_PREFIX_LEN: usize = 12;

/// A freshly generated secret: the plaintext for the client plus what the
/// store keeps.
#[derive(Debug, Clone)]
pub struct GeneratedSecret {
    pub plaintext: String,
    pub hash: String,
    pub display_prefix: String,
}

pub fn generate_api_key() -> GeneratedSecret {
    generate(API_KEY_PREFIX)
}

pub fn generate_token() -> GeneratedSecret {
    generate(TOKEN_PREFIX)
}

fn generate(prefix: &str) -> GeneratedSecret {
    let mut random_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut random_bytes);
    let plaintext = format!("{}{}", prefix, hex::encode(random_bytes));
    GeneratedSecret {
        hash: hash_secret(&plaintext),
        display_prefix: plaintext.chars().take(DISPLAY_PREFIX_LEN).collect(),
        plaintext,
    }
}

pub fn hash_secret(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

/// Mask a presented credential for log lines: keep 4 chars on each side.
pub fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 12 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}…{}", head, tail)
    } else {
        "****".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_shape() {
        let key = generate_api_key();
        assert!(key.plaintext.starts_with("aiapi_"));
        assert!(!key.plaintext.starts_with(TOKEN_PREFIX));
        assert_eq!(key.plaintext.len(), API_KEY_PREFIX.len() + 64);
        assert_eq!(key.display_prefix.len(), 12);
        assert_eq!(key.hash, hash_secret(&key.plaintext));
    }

    #[test]
    fn test_generated_secrets_are_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a.plaintext, b.plaintext);
        assert_ne!(a.hash, b.hash);
        assert!(a.plaintext.starts_with(TOKEN_PREFIX));
    }

    #[test]
    fn test_hash_is_stable_sha256_hex() {
        assert_eq!(
            hash_secret("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_mask_never_reveals_short_secrets() {
        assert_eq!(mask("short"), "****");
        assert_eq!(mask("aiapi_0123456789abcdef"), "aiap…cdef");
    }
}
