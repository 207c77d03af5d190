//! Remote peer bookkeeping
//!
//! A [`Peer`] is one remote endpoint plus everything this node has locally
//! observed about it: reliability counters, last-contact times, and a cache
//! of the most recent signature the peer is known to hold for each variable.
//! Peers do no I/O themselves; the engine owns the socket and the registry
//! and shares peers out as `Arc<Peer>` handles.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::{Signature, VarId};

/// Window after which a fresh error restarts the consecutive-error count
/// instead of extending it.
const ERROR_DECAY: Duration = Duration::from_secs(300);

const IPV4_SIZE: usize = 4;
const IPV6_SIZE: usize = 16;

/// Errors that can occur decoding a peer address
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("invalid peer buffer length {0}, expected 6 or 18 bytes")]
    InvalidLength(usize),
}

/// Snapshot of a peer's reliability counters.
///
/// Advisory telemetry only: the engine records these but does not gate
/// fan-out participation on them.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerStats {
    /// Consecutive errors within the decay window
    pub errors: u32,
    /// Consecutive timeouts
    pub timeouts: u32,
    pub last_seen: Option<Instant>,
    pub last_error: Option<Instant>,
}

#[derive(Default)]
struct PeerState {
    stats: PeerStats,
    /// Most recent signature this peer is known to hold, per variable
    signatures: HashMap<VarId, Signature>,
}

/// A remote endpoint and its locally-observed state.
///
/// Identity is `(address, port)`; the address family is implied. Distinct
/// textual spellings of one IPv6 address collapse to a single identity
/// because [`IpAddr`] compares structurally, not textually.
pub struct Peer {
    addr: SocketAddr,
    state: Mutex<PeerState>,
}

impl Peer {
    pub fn new(addr: SocketAddr) -> Self {
        Peer {
            addr,
            state: Mutex::new(PeerState::default()),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Decode from the fixed binary form: 4 or 16 address bytes followed by
    /// a 2-byte big-endian port; the family is inferred from the length.
    pub fn from_bytes(buffer: &[u8]) -> Result<Self, PeerError> {
        let ip: IpAddr = match buffer.len() {
            n if n == IPV4_SIZE + 2 => {
                let octets: [u8; IPV4_SIZE] = buffer[..IPV4_SIZE].try_into().unwrap();
                Ipv4Addr::from(octets).into()
            }
            n if n == IPV6_SIZE + 2 => {
                let octets: [u8; IPV6_SIZE] = buffer[..IPV6_SIZE].try_into().unwrap();
                Ipv6Addr::from(octets).into()
            }
            n => return Err(PeerError::InvalidLength(n)),
        };
        let port = u16::from_be_bytes([buffer[buffer.len() - 2], buffer[buffer.len() - 1]]);

        Ok(Peer::new(SocketAddr::new(ip, port)))
    }

    /// Encode to the fixed binary form (6 bytes for IPv4, 18 for IPv6)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = match self.addr.ip() {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        buffer.extend_from_slice(&self.addr.port().to_be_bytes());
        buffer
    }

    /** known-signature cache **/

    pub fn signature_for(&self, id: &VarId) -> Option<Signature> {
        self.state.lock().signatures.get(id).cloned()
    }

    pub fn record_signature(&self, signature: Signature) {
        self.state
            .lock()
            .signatures
            .insert(signature.id(), signature);
    }

    /// True iff the peer's cached signature for this variable is exactly
    /// the given one
    pub fn holds_signature(&self, signature: &Signature) -> bool {
        self.state
            .lock()
            .signatures
            .get(&signature.id())
            .is_some_and(|cached| cached == signature)
    }

    /** statistics **/

    pub fn stats(&self) -> PeerStats {
        self.state.lock().stats
    }

    pub fn add_request(&self) {
        let mut state = self.state.lock();
        state.stats.last_seen = Some(Instant::now());
        state.stats.timeouts = 0;
    }

    pub fn add_response(&self) {
        let mut state = self.state.lock();
        state.stats.last_seen = Some(Instant::now());
        state.stats.timeouts = 0;
    }

    /// Record a failed exchange. Consecutive errors accumulate until the
    /// peer stays quiet for [`ERROR_DECAY`]; timeouts track their own
    /// consecutive run and reset on any non-timeout error.
    pub fn add_error(&self, is_timeout: bool) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let previous = state.stats.last_error.replace(now);

        match previous {
            Some(at) if now.duration_since(at) <= ERROR_DECAY => state.stats.errors += 1,
            _ => state.stats.errors = 1,
        }

        if is_timeout {
            state.stats.timeouts += 1;
        } else {
            state.stats.timeouts = 0;
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Peer {}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("errors", &stats.errors)
            .field("timeouts", &stats.timeouts)
            .finish()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl Serialize for Peer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Peer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Peer;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a 6- or 18-byte peer address")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Peer, E> {
                Peer::from_bytes(v).map_err(E::custom)
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Peer, E> {
                self.visit_bytes(&v)
            }
        }

        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::{sha256, SecretKey, Signature, Timestamp};

    fn sig_for(secret: &SecretKey, millis: u64) -> Signature {
        Signature::sign(secret, sha256(b"value"), Timestamp::from_millis(millis))
    }

    #[test]
    fn test_ipv4_round_trip() {
        let peer = Peer::new("192.168.7.13:3149".parse().unwrap());

        let buffer = peer.to_bytes();
        assert_eq!(buffer.len(), 6);

        let decoded = Peer::from_bytes(&buffer).unwrap();
        assert_eq!(decoded.addr(), peer.addr());
        assert_eq!(decoded.to_bytes(), buffer);
    }

    #[test]
    fn test_ipv6_round_trip() {
        let peer = Peer::new("[2001:db8::42]:9000".parse().unwrap());

        let buffer = peer.to_bytes();
        assert_eq!(buffer.len(), 18);

        let decoded = Peer::from_bytes(&buffer).unwrap();
        assert_eq!(decoded.addr(), peer.addr());
        assert_eq!(decoded.to_bytes(), buffer);
    }

    #[test]
    fn test_bad_length_rejected() {
        assert!(matches!(
            Peer::from_bytes(&[0u8; 7]),
            Err(PeerError::InvalidLength(7))
        ));
    }

    #[test]
    fn test_ipv6_spellings_collapse() {
        let long: SocketAddr = "[2001:0db8:0000:0000:0000:0000:0000:0042]:9000"
            .parse()
            .unwrap();
        let short: SocketAddr = "[2001:db8::42]:9000".parse().unwrap();

        assert_eq!(Peer::new(long), Peer::new(short));
    }

    #[test]
    fn test_identity_is_address_and_port() {
        let a = Peer::new("127.0.0.1:1000".parse().unwrap());
        let b = Peer::new("127.0.0.1:1001".parse().unwrap());
        let c = Peer::new("127.0.0.2:1000".parse().unwrap());

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, Peer::new("127.0.0.1:1000".parse().unwrap()));
    }

    #[test]
    fn test_signature_cache() {
        let peer = Peer::new("127.0.0.1:1000".parse().unwrap());
        let secret = SecretKey::generate();

        let older = sig_for(&secret, 1_000);
        let newer = sig_for(&secret, 2_000);
        let id = older.id();

        assert!(peer.signature_for(&id).is_none());
        assert!(!peer.holds_signature(&older));

        peer.record_signature(older.clone());
        assert!(peer.holds_signature(&older));
        assert_eq!(peer.signature_for(&id), Some(older.clone()));

        // A newer signature for the same variable replaces the cached one
        peer.record_signature(newer.clone());
        assert!(peer.holds_signature(&newer));
        assert!(!peer.holds_signature(&older));
    }

    #[test]
    fn test_serde_uses_fixed_encoding() {
        let peer = Peer::new("10.0.0.1:8125".parse().unwrap());

        // the serializer carries the same fixed form as to_bytes
        let serialized = bincode::serialize(&peer).unwrap();
        let decoded: Peer = bincode::deserialize(&serialized).unwrap();
        assert_eq!(decoded.addr(), peer.addr());
    }

    #[test]
    fn test_error_and_timeout_counters() {
        let peer = Peer::new("127.0.0.1:1000".parse().unwrap());

        peer.add_error(true);
        peer.add_error(true);
        let stats = peer.stats();
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.timeouts, 2);

        // A non-timeout error resets the timeout run but not the error run
        peer.add_error(false);
        let stats = peer.stats();
        assert_eq!(stats.errors, 3);
        assert_eq!(stats.timeouts, 0);

        // A successful exchange resets timeouts and refreshes last_seen
        peer.add_response();
        let stats = peer.stats();
        assert_eq!(stats.timeouts, 0);
        assert!(stats.last_seen.is_some());
    }
}
