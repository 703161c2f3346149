//! HMAC-SHA256 body signing shared by both processes.
//!
//! The signature always covers the uncompressed JSON body: the agent signs
//! before gzip, the server verifies after decompression.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Secret used to sign and verify bodies
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").field("key", &"<redacted>").finish()
    }
}

impl Signer {
    /// `None` when the key is empty: signing disabled.
    pub fn from_key(key: &str) -> Option<Self> {
        if key.is_empty() {
            return None;
        }
        HmacSha256::new_from_slice(key.as_bytes()).ok().map(|mac| Self { mac })
    }

    /// Hex-encoded HMAC-SHA256 of `body`
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time comparison of `signature` (hex) against `body`.
    pub fn verify(&self, body: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature.trim()) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    }
}
