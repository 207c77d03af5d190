//! Request-id correlation
//!
//! Outgoing requests borrow a u16 id from a shared table. Each live entry
//! remembers which peer the id was issued to and the channel its replies
//! should be forwarded on; replies arriving from any other address are
//! ignored, which keeps a third party from answering on a peer's behalf.
//!
//! Ids are allocated round-robin from a randomized starting point so a
//! restarted node is unlikely to collide with its own stale in-flight ids.
//! Entries are retired by the [`RidGuard`] RAII handle: dropping a
//! cancelled or timed-out request attempt frees its id immediately.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::wire::{Reply, Rid};

/// An application-level failure relayed by a remote peer
#[derive(Debug, Clone, thiserror::Error)]
#[error("remote error {code}: {}", .message.as_deref().unwrap_or("unspecified"))]
pub struct RemoteError {
    pub code: i8,
    pub message: Option<String>,
}

/// The whole id space is occupied by unexpired requests. Indicates a severe
/// backlog; callers surface it as fatal rather than degrading silently.
#[derive(Debug, thiserror::Error)]
#[error("no free request ids left")]
pub struct RidsExhausted;

pub(crate) type ReplyResult = Result<Reply, RemoteError>;

struct Pending {
    addr: SocketAddr,
    tx: flume::Sender<ReplyResult>,
}

/// Where an incoming response should go
pub(crate) enum RidRoute {
    /// Forward on this channel; the entry stays open until its guard drops
    Matched(flume::Sender<ReplyResult>),
    /// The id is live but was issued to a different peer
    WrongPeer,
    /// No live request under this id
    Vacant,
}

pub(crate) struct RidTable {
    next: Rid,
    pending: HashMap<Rid, Pending>,
}

impl RidTable {
    pub fn new() -> Self {
        let mut seed = [0u8; 2];
        getrandom::getrandom(&mut seed).expect("failed to generate random bytes");
        RidTable {
            next: Rid::from_be_bytes(seed),
            pending: HashMap::new(),
        }
    }

    fn allocate(
        &mut self,
        addr: SocketAddr,
        tx: flume::Sender<ReplyResult>,
    ) -> Result<Rid, RidsExhausted> {
        let start = self.next;
        loop {
            let rid = self.next;
            self.next = self.next.wrapping_add(1);

            if let Entry::Vacant(slot) = self.pending.entry(rid) {
                slot.insert(Pending { addr, tx });
                return Ok(rid);
            }
            if self.next == start {
                return Err(RidsExhausted);
            }
        }
    }

    pub fn route(&self, rid: Rid, from: SocketAddr) -> RidRoute {
        match self.pending.get(&rid) {
            None => RidRoute::Vacant,
            Some(pending) if pending.addr != from => RidRoute::WrongPeer,
            Some(pending) => RidRoute::Matched(pending.tx.clone()),
        }
    }

    fn release(&mut self, rid: Rid) {
        self.pending.remove(&rid);
    }

    #[cfg(test)]
    fn live(&self) -> usize {
        self.pending.len()
    }
}

/// Holds one allocated request id for the duration of an exchange
pub(crate) struct RidGuard {
    table: Arc<Mutex<RidTable>>,
    rid: Rid,
}

impl RidGuard {
    /// Borrow an id bound to `addr`, forwarding replies on `tx`
    pub fn allocate(
        table: &Arc<Mutex<RidTable>>,
        addr: SocketAddr,
        tx: flume::Sender<ReplyResult>,
    ) -> Result<Self, RidsExhausted> {
        let rid = table.lock().allocate(addr, tx)?;
        Ok(RidGuard {
            table: Arc::clone(table),
            rid,
        })
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }
}

impl Drop for RidGuard {
    fn drop(&mut self) {
        self.table.lock().release(self.rid);
    }
}
