// src/crypto.rs
use ring::digest::{digest, SHA256};

/// SHA-256 of the secret, hex-encoded. This is what the account store keeps.
pub fn hash_password(secret: &str) -> String {
    hex::encode(digest(&SHA256, secret.as_bytes()))
}

pub fn verify_password(provided: &str, stored_hash: &str) -> bool {
    hash_password(provided) == stored_hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        // sha256("pw1")
        assert_eq!(
            hash_password("pw1"),
            "c592df4a86933b92addc9842402ddf198c638ea9be58916ee6e3734e1e3152f8"
        );
    }

    #[test]
    fn verify_matches_only_same_secret() {
        let stored = hash_password("correct horse");
        assert!(verify_password("correct horse", &stored));
        assert!(!verify_password("correct_horse", &stored));
    }
}
