//! API key generation and hashing.
//!
//! The raw secret is shown once at creation time; the database keeps only
//! the SHA-256 hash and a display mask.

use rand::Rng;
use sha2::{Digest, Sha256};

const API_KEY_PREFIX: &str = "os_";
const API_KEY_LENGTH: usize = 32;

/// Returns `(secret, hash, mask)` for a newly issued key.
pub fn generate_api_key() -> (String, String, String) {
    let mut rng = rand::rng();

    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    let random_part: String = (0..API_KEY_LENGTH)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect();

    let secret = format!("{API_KEY_PREFIX}{random_part}");
    let hash = hash_api_key(&secret);
    let mask = mask_api_key(&secret);

    (secret, hash, mask)
}

pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn mask_api_key(key: &str) -> String {
    let stripped = key.strip_prefix(API_KEY_PREFIX).unwrap_or(key);
    format!("{API_KEY_PREFIX}{}...", &stripped[..8.min(stripped.len())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_has_prefix_and_length() {
        let (secret, hash, mask) = generate_api_key();
        assert!(secret.starts_with(API_KEY_PREFIX));
        assert_eq!(secret.len(), API_KEY_PREFIX.len() + API_KEY_LENGTH);
        assert_eq!(hash, hash_api_key(&secret));
        assert!(mask.starts_with(API_KEY_PREFIX));
        assert!(mask.ends_with("..."));
    }

    #[test]
    fn hash_is_deterministic_and_raw_free() {
        let hash = hash_api_key("os_abcdef");
        assert_eq!(hash, hash_api_key("os_abcdef"));
        assert_eq!(hash.len(), 64);
        assert!(!hash.contains("abcdef"));
    }

    #[test]
    fn mask_never_reveals_the_tail() {
        let (secret, _, mask) = generate_api_key();
        let tail = &secret[secret.len() - 8..];
        assert!(!mask.contains(tail));
    }

    #[test]
    fn distinct_keys_distinct_hashes() {
        let (_, hash_a, _) = generate_api_key();
        let (_, hash_b, _) = generate_api_key();
        assert_ne!(hash_a, hash_b);
    }
}
