mod keys;
mod signature;

pub use keys::{
    sha256, KeyError, PublicKey, SecretKey, ValueHash, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE,
    VALUE_HASH_SIZE,
};
pub use signature::{Signature, SignatureError, Timestamp, VarId, SIGNATURE_ENCODED_SIZE};
