use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use super::keys::{KeyError, PublicKey, SecretKey, ValueHash, PUBLIC_KEY_SIZE, VALUE_HASH_SIZE};

const SIGNATURE_SIZE: usize = 64;
/// Width of the timestamp field on the wire. Only the first
/// `TIMESTAMP_BYTE_SIZE` bytes carry the value; the rest stay zero.
const TIMESTAMP_FIELD_SIZE: usize = 8;
const TIMESTAMP_BYTE_SIZE: usize = 6;
const TIMESTAMP_MASK: u64 = (1 << (TIMESTAMP_BYTE_SIZE * 8)) - 1;

/// Fixed encoded size of a [`Signature`]:
/// `public_key(33) || signature(64) || timestamp(8) || value_hash(32)`
pub const SIGNATURE_ENCODED_SIZE: usize =
    PUBLIC_KEY_SIZE + SIGNATURE_SIZE + TIMESTAMP_FIELD_SIZE + VALUE_HASH_SIZE;

/// Errors that can occur decoding a signature envelope
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("invalid signature buffer length, expected {SIGNATURE_ENCODED_SIZE}, got {0}")]
    InvalidLength(usize),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Identity of a replicated variable: the raw 33 bytes of its writer's
/// public key. Used as the registry key for variables and for the
/// per-peer known-signature caches.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId([u8; PUBLIC_KEY_SIZE]);

impl VarId {
    pub const SIZE: usize = PUBLIC_KEY_SIZE;

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| KeyError::InvalidSize {
            expected: PUBLIC_KEY_SIZE,
            actual: bytes.len(),
        })?;
        Ok(VarId(arr))
    }

    /// Parse an id from a hexadecimal string, "0x"-prefixed or plain
    pub fn from_hex(hex: &str) -> Result<Self, KeyError> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let mut arr = [0; PUBLIC_KEY_SIZE];
        hex::decode_to_slice(hex, &mut arr).map_err(|_| KeyError::HexDecode)?;
        Ok(VarId(arr))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<PublicKey> for VarId {
    fn from(key: PublicKey) -> Self {
        VarId(key.to_bytes())
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarId({})", self.to_hex())
    }
}

/// Creation time of a signed value, milliseconds since the Unix epoch.
///
/// Stored truncated to 48 bits: the wire format reserves an 8-byte field
/// but encodes only 6 big-endian bytes of the value. The truncation is part
/// of the protocol; two implementations disagreeing on it would disagree on
/// both wire bytes and conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Timestamp(millis & TIMESTAMP_MASK)
    }

    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis & TIMESTAMP_MASK)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    fn to_field(self) -> [u8; TIMESTAMP_FIELD_SIZE] {
        let mut field = [0u8; TIMESTAMP_FIELD_SIZE];
        field[..TIMESTAMP_BYTE_SIZE]
            .copy_from_slice(&self.0.to_be_bytes()[8 - TIMESTAMP_BYTE_SIZE..]);
        field
    }

    fn from_field(field: &[u8]) -> Self {
        let mut be = [0u8; 8];
        be[8 - TIMESTAMP_BYTE_SIZE..].copy_from_slice(&field[..TIMESTAMP_BYTE_SIZE]);
        Timestamp(u64::from_be_bytes(be))
    }
}

/// An authenticated, ordered pointer to a value.
///
/// The envelope binds a content hash and a creation time to a writer
/// identity with a detached ECDSA signature. It is what actually travels
/// between peers during gossip; the value bytes themselves move separately
/// over the download path and are checked against `value_hash` on arrival.
#[derive(Debug, Clone)]
pub struct Signature {
    public_key: PublicKey,
    value_hash: ValueHash,
    timestamp: Timestamp,
    signature: [u8; SIGNATURE_SIZE],
}

impl Signature {
    /// Sign a value hash with the writer's secret key
    pub fn sign(secret: &SecretKey, value_hash: ValueHash, timestamp: Timestamp) -> Self {
        let digest = signed_digest(&value_hash, timestamp);
        Signature {
            public_key: secret.public(),
            value_hash,
            timestamp,
            signature: secret.sign(&digest),
        }
    }

    /// Decode an envelope from its fixed 137-byte wire form
    pub fn from_bytes(buffer: &[u8]) -> Result<Self, SignatureError> {
        if buffer.len() != SIGNATURE_ENCODED_SIZE {
            return Err(SignatureError::InvalidLength(buffer.len()));
        }

        let mut end = PUBLIC_KEY_SIZE;
        let public_key = PublicKey::from_bytes(&buffer[..end])?;

        let mut start = end;
        end += SIGNATURE_SIZE;
        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&buffer[start..end]);

        start = end;
        end += TIMESTAMP_FIELD_SIZE;
        let timestamp = Timestamp::from_field(&buffer[start..end]);

        start = end;
        let value_hash = ValueHash::from_bytes(&buffer[start..])?;

        Ok(Signature {
            public_key,
            value_hash,
            timestamp,
            signature,
        })
    }

    /// Encode to the fixed 137-byte wire form
    pub fn to_bytes(&self) -> [u8; SIGNATURE_ENCODED_SIZE] {
        let mut buffer = [0u8; SIGNATURE_ENCODED_SIZE];
        let mut end = PUBLIC_KEY_SIZE;
        buffer[..end].copy_from_slice(&self.public_key.to_bytes());

        let mut start = end;
        end += SIGNATURE_SIZE;
        buffer[start..end].copy_from_slice(&self.signature);

        start = end;
        end += TIMESTAMP_FIELD_SIZE;
        buffer[start..end].copy_from_slice(&self.timestamp.to_field());

        start = end;
        buffer[start..].copy_from_slice(self.value_hash.as_bytes());
        buffer
    }

    /// Check the detached signature against the embedded public key.
    ///
    /// Returns false on any mismatch; forged or corrupted envelopes are a
    /// normal occurrence on the wire, not an exceptional one.
    pub fn verify(&self) -> bool {
        let digest = signed_digest(&self.value_hash, self.timestamp);
        self.public_key.verify(&digest, &self.signature)
    }

    /// Conflict resolution: true iff this envelope is at least as recent as
    /// `other` for the same identity. Undefined (false) across identities.
    pub fn better_than(&self, other: &Signature) -> bool {
        self.timestamp >= other.timestamp && self.public_key == other.public_key
    }

    /// True iff both envelopes refer to the same identity, regardless of
    /// recency. Guards against a peer substituting a signature for a
    /// different variable during anti-entropy.
    pub fn similar_to(&self, other: &Signature) -> bool {
        self.public_key == other.public_key
    }

    pub fn id(&self) -> VarId {
        self.public_key.into()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn value_hash(&self) -> &ValueHash {
        &self.value_hash
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Equality covers identity, recency and content; the signature bytes are
/// deliberately excluded (deterministic signing makes them redundant).
impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
            && self.timestamp == other.timestamp
            && self.value_hash == other.value_hash
    }
}

impl Eq for Signature {}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id(), self.timestamp.as_millis())
    }
}

fn signed_digest(value_hash: &ValueHash, timestamp: Timestamp) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(value_hash.as_bytes());
    hasher.update(timestamp.to_field());
    hasher.finalize().into()
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Signature;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a {SIGNATURE_ENCODED_SIZE}-byte signature envelope")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Signature, E> {
                Signature::from_bytes(v).map_err(E::custom)
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Signature, E> {
                self.visit_bytes(&v)
            }
        }

        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}
