//! HMAC-SHA256 credential digests

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SALT_LEN: usize = 16;

/// Salted digest of a user secret; the secret itself is never stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretDigest {
    salt: String,
    digest: String,
}

impl SecretDigest {
    /// Digest `secret` under a fresh random salt
    pub fn new(secret: &str) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::with_salt(secret, &salt)
    }

    pub fn with_salt(secret: &str, salt: &[u8]) -> Self {
        Self {
            salt: STANDARD.encode(salt),
            digest: STANDARD.encode(keyed_mac(salt, secret.as_bytes())),
        }
    }

    /// Check a candidate secret in constant time
    pub fn verify(&self, secret: &str) -> bool {
        let (Ok(salt), Ok(expected)) = (STANDARD.decode(&self.salt), STANDARD.decode(&self.digest))
        else {
            return false;
        };

        let mut mac = HmacSha256::new_from_slice(&salt).expect("HMAC can take key of any size");
        mac.update(secret.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}

/// Process-local keyed hash used to recognise identical credentials
/// without keeping them around
pub struct CredentialHasher {
    key: [u8; 32],
}

impl CredentialHasher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn random() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(key)
    }

    /// Digest of `username` + `secret`; the NUL separator keeps
    /// ("ab", "c") and ("a", "bc") apart
    pub fn digest(&self, username: &str, secret: &str) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size");
        mac.update(username.as_bytes());
        mac.update(&[0]);
        mac.update(secret.as_bytes());
        mac.finalize().into_bytes().into()
    }
}

fn keyed_mac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_verifies_original_secret() {
        let digest = SecretDigest::new("correct horse");

        assert!(digest.verify("correct horse"));
        assert!(!digest.verify("correct horse "));
        assert!(!digest.verify(""));
    }

    #[test]
    fn test_salts_differ() {
        let a = SecretDigest::new("same");
        let b = SecretDigest::new("same");

        assert_ne!(a, b);
        assert!(a.verify("same") && b.verify("same"));
    }

    #[test]
    fn test_digest_never_contains_secret() {
        let digest = SecretDigest::with_salt("plaintext-password", b"0123456789abcdef");
        let json = serde_json::to_string(&digest).unwrap();

        assert!(!json.contains("plaintext-password"));
        let restored: SecretDigest = serde_json::from_str(&json).unwrap();
        assert!(restored.verify("plaintext-password"));
    }

    #[test]
    fn test_corrupt_digest_fails_closed() {
        let digest = SecretDigest {
            salt: "not base64!".into(),
            digest: "???".into(),
        };
        assert!(!digest.verify("anything"));
    }

    #[test]
    fn test_credential_hasher_separates_fields() {
        let hasher = CredentialHasher::new([7u8; 32]);

        assert_eq!(hasher.digest("alice", "pw"), hasher.digest("alice", "pw"));
        assert_ne!(hasher.digest("ab", "c"), hasher.digest("a", "bc"));
        assert_ne!(
            hasher.digest("alice", "pw"),
            CredentialHasher::new([8u8; 32]).digest("alice", "pw")
        );
    }
}
