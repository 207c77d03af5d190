use std::fmt;

use secp256k1::global::SECP256K1;
use secp256k1::{ecdsa, Message};
use sha2::{Digest, Sha256};

/// Size of a secp256k1 private key in bytes
pub const PRIVATE_KEY_SIZE: usize = 32;
/// Size of a compressed secp256k1 public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 33;
/// Size of a sha-256 content digest in bytes
pub const VALUE_HASH_SIZE: usize = 32;

/// Errors that can occur during key operations
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key size, expected {expected}, got {actual}")]
    InvalidSize { expected: usize, actual: usize },
    #[error("hex decode error")]
    HexDecode,
    #[error("key rejected by curve validation")]
    InvalidKey,
}

/// Public key identifying a variable and authenticating its writer
///
/// A thin wrapper around a compressed secp256k1 point. The same 33 bytes
/// serve two purposes:
/// - **Variable identity**: names a replicated variable in the registry
/// - **Authorship**: verifies the detached signatures on published values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(secp256k1::PublicKey);

impl PublicKey {
    /// Parse a public key from its 33-byte compressed encoding
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(KeyError::InvalidSize {
                expected: PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let key = secp256k1::PublicKey::from_slice(bytes).map_err(|_| KeyError::InvalidKey)?;
        Ok(PublicKey(key))
    }

    /// Parse a public key from a hexadecimal string
    ///
    /// Accepts both plain hex and "0x"-prefixed hex strings.
    pub fn from_hex(hex: &str) -> Result<Self, KeyError> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let mut buff = [0; PUBLIC_KEY_SIZE];
        hex::decode_to_slice(hex, &mut buff).map_err(|_| KeyError::HexDecode)?;
        Self::from_bytes(&buff)
    }

    /// Convert public key to its compressed byte encoding
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0.serialize()
    }

    /// Convert public key to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Verify a compact ECDSA signature over a 32-byte digest.
    ///
    /// Returns false on any mismatch, including signature bytes that do not
    /// parse as a well-formed signature. Never panics or errors.
    pub fn verify(&self, digest: &[u8; 32], signature: &[u8; 64]) -> bool {
        let Ok(sig) = ecdsa::Signature::from_compact(signature) else {
            return false;
        };
        let message = Message::from_digest(*digest);
        SECP256K1.verify_ecdsa(&message, &sig, &self.0).is_ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Secret key authorizing writes to one variable
///
/// The private half of a secp256k1 keypair. A replica holding the secret key
/// is the authoritative writer for the variable named by the matching public
/// key; everyone else is a reader.
#[derive(Debug, Clone)]
pub struct SecretKey(secp256k1::SecretKey);

impl SecretKey {
    /// Generate a new random secret key using a cryptographically secure RNG
    ///
    /// Draws are validated against the curve order and invalid draws are
    /// redrawn, so the returned key is always well-formed.
    pub fn generate() -> Self {
        loop {
            let mut bytes = [0u8; PRIVATE_KEY_SIZE];
            getrandom::getrandom(&mut bytes).expect("failed to generate random bytes");

            if let Ok(key) = secp256k1::SecretKey::from_slice(&bytes) {
                return SecretKey(key);
            }
        }
    }

    /// Parse a secret key from raw bytes, validating it against the curve order
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != PRIVATE_KEY_SIZE {
            return Err(KeyError::InvalidSize {
                expected: PRIVATE_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let key = secp256k1::SecretKey::from_slice(bytes).map_err(|_| KeyError::InvalidKey)?;
        Ok(SecretKey(key))
    }

    /// Parse a secret key from a hexadecimal string
    ///
    /// Accepts both plain hex and "0x"-prefixed hex strings.
    pub fn from_hex(hex: &str) -> Result<Self, KeyError> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let mut buff = [0; PRIVATE_KEY_SIZE];
        hex::decode_to_slice(hex, &mut buff).map_err(|_| KeyError::HexDecode)?;
        Self::from_bytes(&buff)
    }

    /// Convert secret key to raw bytes
    pub fn to_bytes(&self) -> [u8; PRIVATE_KEY_SIZE] {
        self.0.secret_bytes()
    }

    /// Convert secret key to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Derive the public key from this secret key
    pub fn public(&self) -> PublicKey {
        PublicKey(secp256k1::PublicKey::from_secret_key_global(&self.0))
    }

    /// Sign a 32-byte digest, returning a compact 64-byte ECDSA signature
    pub fn sign(&self, digest: &[u8; 32]) -> [u8; 64] {
        let message = Message::from_digest(*digest);
        SECP256K1.sign_ecdsa(&message, &self.0).serialize_compact()
    }
}

/// Content digest of an encoded value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueHash(pub [u8; VALUE_HASH_SIZE]);

impl ValueHash {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; VALUE_HASH_SIZE] = bytes.try_into().map_err(|_| KeyError::InvalidSize {
            expected: VALUE_HASH_SIZE,
            actual: bytes.len(),
        })?;
        Ok(ValueHash(arr))
    }

    pub fn as_bytes(&self) -> &[u8; VALUE_HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for ValueHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Digest a byte payload with the protocol hash (sha-256)
pub fn sha256(data: &[u8]) -> ValueHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    ValueHash(hasher.finalize().into())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let private_key = SecretKey::generate();
        let public_key = private_key.public();

        // Test round-trip conversion
        let private_hex = private_key.to_hex();
        let recovered_private = SecretKey::from_hex(&private_hex).unwrap();
        assert_eq!(private_key.to_bytes(), recovered_private.to_bytes());

        let public_hex = public_key.to_hex();
        let recovered_public = PublicKey::from_hex(&public_hex).unwrap();
        assert_eq!(public_key.to_bytes(), recovered_public.to_bytes());
    }

    #[test]
    fn test_public_key_size() {
        let public_key = SecretKey::generate().public();
        assert_eq!(public_key.to_bytes().len(), PUBLIC_KEY_SIZE);
    }

    #[test]
    fn test_sign_and_verify() {
        let secret_key = SecretKey::generate();
        let public_key = secret_key.public();
        let digest = sha256(b"hello, world!");

        let signature = secret_key.sign(digest.as_bytes());
        assert!(public_key.verify(digest.as_bytes(), &signature));

        // Verify fails with wrong digest
        let wrong_digest = sha256(b"hello, world?");
        assert!(!public_key.verify(wrong_digest.as_bytes(), &signature));

        // Verify fails with wrong key
        let other_key = SecretKey::generate().public();
        assert!(!other_key.verify(digest.as_bytes(), &signature));
    }

    #[test]
    fn test_verify_garbage_signature() {
        let public_key = SecretKey::generate().public();
        let digest = sha256(b"payload");

        // All-0xff bytes are not a parseable compact signature; verify must
        // report false rather than error.
        assert!(!public_key.verify(digest.as_bytes(), &[0xff; 64]));
    }

    #[test]
    fn test_invalid_secret_rejected() {
        // Zero is outside the valid scalar range for the curve.
        assert!(matches!(
            SecretKey::from_bytes(&[0u8; 32]),
            Err(KeyError::InvalidKey)
        ));
    }

    #[test]
    fn test_hash_is_stable() {
        let a = sha256(b"same input");
        let b = sha256(b"same input");
        assert_eq!(a, b);
        assert_ne!(a, sha256(b"other input"));
    }
}
