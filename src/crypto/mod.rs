pub mod cvv;
pub mod hsm;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use cvv::{CvvError, CvvProvider, DynamicCvv, HmacCvvProvider};
pub use hsm::{HsmCvvProvider, MacModule, SoftDes3Module};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key must not be empty")]
    Empty,

    #[error("key is not valid hex")]
    Hex,

    #[error("key must be {expected} bytes (got {got})")]
    Length { expected: usize, got: usize },
}

/// Secret key material. The bytes are wiped when the key is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let mut bytes = hex::decode(s.trim()).map_err(|_| KeyError::Hex)?;
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED; {}])", self.0.len())
    }
}

/// Time-window counter for dynamic codes: `floor(unix_seconds / step)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Window(u64);

impl Window {
    pub fn at(unix_seconds: i64, step_secs: u64) -> Self {
        let step = step_secs.max(1);
        Self(u64::try_from(unix_seconds).unwrap_or(0) / step)
    }

    /// Big-endian encoding fed to the MAC.
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

/// Keyed PAN fingerprint used as the card lookup key.
///
/// PANs are stored only as `HMAC-SHA256(pepper, pan)`; the pepper never leaves
/// the server.
#[derive(Clone)]
pub struct PanHasher {
    mac: HmacSha256,
}

impl PanHasher {
    pub fn new(pepper: &SecretKey) -> Result<Self, KeyError> {
        let mac = <HmacSha256 as Mac>::new_from_slice(pepper.as_bytes())
            .map_err(|_| KeyError::Empty)?;
        Ok(Self { mac })
    }

    /// Hex digest of the normalized PAN.
    pub fn hash(&self, pan: &str) -> String {
        let normalized = crate::cardgen::normalize_pan(pan);
        let mut mac = self.mac.clone();
        mac.update(normalized.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl fmt::Debug for PanHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanHasher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_key_from_hex() {
        let key = SecretKey::from_hex("00112233").unwrap();
        assert_eq!(key.as_bytes(), &[0x00, 0x11, 0x22, 0x33]);
        assert_eq!(key.len(), 4);

        assert_eq!(SecretKey::from_hex(""), Err(KeyError::Empty));
        assert_eq!(SecretKey::from_hex("zz"), Err(KeyError::Hex));
        assert_eq!(SecretKey::from_bytes(&[]), Err(KeyError::Empty));
    }

    #[test]
    fn test_secret_key_debug_is_redacted() {
        let key = SecretKey::from_bytes(b"super-secret").unwrap();
        let printed = format!("{:?}", key);
        assert!(!printed.contains("super"));
        assert!(printed.contains("REDACTED"));
    }

    #[test]
    fn test_window_counter() {
        assert_eq!(Window::at(59, 30), Window(1));
        assert_eq!(Window::at(60, 30), Window(2));
        assert_eq!(Window::at(60, 0), Window(60));
        assert_eq!(Window::at(1, 30).to_bytes(), [0u8; 8]);
        assert_eq!(Window::at(300, 1).to_bytes(), [0, 0, 0, 0, 0, 0, 1, 44]);
    }

    #[test]
    fn test_pan_hash_is_keyed_and_normalized() {
        let hasher = PanHasher::new(&SecretKey::from_bytes(b"pepper-one").unwrap()).unwrap();
        let other = PanHasher::new(&SecretKey::from_bytes(b"pepper-two").unwrap()).unwrap();

        let h = hasher.hash("4212345678901234");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hasher.hash("4212 3456-7890 1234"));
        assert_ne!(h, other.hash("4212345678901234"));
        assert_ne!(h, hasher.hash("4212345678901242"));
    }

    #[test]
    fn test_pan_hash_known_vector() {
        let hasher = PanHasher::new(&SecretKey::from_bytes(b"test-pan-hash-key").unwrap()).unwrap();
        assert_eq!(
            hasher.hash("4111 1111 1111 1111"),
            "4e75aaa8cf442e781d2647169d12872fe21486e7f7e1a2bf40559f2ebb50d3bd"
        );
    }
}
