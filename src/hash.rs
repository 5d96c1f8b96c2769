//! Content identity
//!
//! Ingestion is deduplicated by content, not by filename: two uploads with
//! byte-identical payloads hash the same regardless of key or timestamp.

use sha2::{Digest, Sha256};

/// Compute the SHA-256 hex digest of raw file bytes, before any parsing
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        assert_eq!(content_hash(b"hello"), content_hash(b"hello"));
    }

    #[test]
    fn test_content_sensitive() {
        assert_ne!(content_hash(b"hello"), content_hash(b"hello "));
        assert_ne!(content_hash(b""), content_hash(b"\n"));
    }

    #[test]
    fn test_known_vector() {
        // SHA-256 of the empty string
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hex_encoding() {
        let hash = content_hash(b"accounts.csv content");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    proptest::proptest! {
        #[test]
        fn prop_always_lowercase_hex_64(bytes: Vec<u8>) {
            let hash = content_hash(&bytes);
            proptest::prop_assert_eq!(hash.len(), 64);
            proptest::prop_assert!(hash
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        }
    }
}
