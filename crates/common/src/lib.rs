/**
 * Out-of-order chunk reassembly for large
 *  value transfers.
 */
pub mod buffer;
/**
 * Engine tuning knobs: timeouts, fan-out
 *  limits, chunk sizing.
 */
pub mod config;
/**
 * Cryptographic types and operations.
 *  - Public and private key wrappers
 *  - The signed value envelope and its ordering rules
 */
pub mod crypto;
/**
 * The replication engine: socket lifecycle,
 *  request/response correlation, message dispatch
 *  and the lookup/publish/download fan-outs.
 */
pub mod engine;
mod events;
/**
 * Remote peer bookkeeping: identity, reliability
 *  counters and the known-signature cache.
 */
pub mod peer;
/**
 * The replicated variable abstraction:
 *  sync, set and anti-entropy push.
 */
pub mod shared_var;
/**
 * Localhost multi-engine harness for
 *  integration tests.
 */
pub mod testkit;
/**
 * The datagram wire protocol: frame codec,
 *  message types and error codes.
 */
pub mod wire;

pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::crypto::{PublicKey, SecretKey, Signature, Timestamp, VarId};
    pub use crate::engine::{Engine, EngineBuilder, EngineError, EngineEvent, Value};
    pub use crate::peer::Peer;
    pub use crate::shared_var::{SharedVar, VarEvent};
}
