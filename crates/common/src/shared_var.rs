//! One replicated variable, as seen from this node
//!
//! A [`SharedVar`] caches the latest verified `(value, signature)` pair for
//! one identity, remembers which peers have shown interest in it, and runs
//! the reconciliation moves: pull (`sync`), local write (`set`) and the
//! push half of anti-entropy (`push_update`). It holds only a weak
//! reference back to its engine; the engine owns the registries, the
//! variable just borrows the transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::crypto::{sha256, SecretKey, Signature, Timestamp, VarId};
use crate::engine::{EngineError, EngineInner, Value};
use crate::events::EventSink;
use crate::peer::Peer;
use crate::wire;

/// Notifications emitted by one variable replica
#[derive(Debug, Clone)]
pub enum VarEvent {
    /// A newer signature was accepted and its value fetch is starting
    Download(Signature),
    /// The replica committed a new `(value, signature)` pair
    Update,
    /// A value fetch failed; the replica keeps its previous state
    DownloadError(String),
}

struct VarState<V> {
    value: Option<V>,
    signature: Option<Signature>,
}

struct VarInner<V: Value> {
    id: VarId,
    /// Present iff this replica is the authoritative writer
    secret: Option<SecretKey>,
    engine: Weak<EngineInner<V>>,
    state: Mutex<VarState<V>>,
    /// Peers known to track this variable; weak because the engine's
    /// registry owns peer lifecycle
    peers: Mutex<HashMap<SocketAddr, Weak<Peer>>>,
    events: EventSink<VarEvent>,
}

/// Handle to a local replica of one distributed variable
pub struct SharedVar<V: Value> {
    inner: Arc<VarInner<V>>,
}

impl<V: Value> Clone for SharedVar<V> {
    fn clone(&self) -> Self {
        SharedVar {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Value> SharedVar<V> {
    pub(crate) fn writable(engine: Weak<EngineInner<V>>, id: VarId, secret: SecretKey) -> Self {
        Self::new(engine, id, Some(secret))
    }

    pub(crate) fn read_only(engine: Weak<EngineInner<V>>, id: VarId) -> Self {
        Self::new(engine, id, None)
    }

    fn new(engine: Weak<EngineInner<V>>, id: VarId, secret: Option<SecretKey>) -> Self {
        SharedVar {
            inner: Arc::new(VarInner {
                id,
                secret,
                engine,
                state: Mutex::new(VarState {
                    value: None,
                    signature: None,
                }),
                peers: Mutex::new(HashMap::new()),
                events: EventSink::new(),
            }),
        }
    }

    pub fn id(&self) -> VarId {
        self.inner.id
    }

    /// True iff this node holds the secret key and may call
    /// [`set`](Self::set)
    pub fn is_writable(&self) -> bool {
        self.inner.secret.is_some()
    }

    /// The last committed value, if any has been seen yet
    pub fn value(&self) -> Option<V> {
        self.inner.state.lock().value.clone()
    }

    /// The signature authenticating the current value
    pub fn signature(&self) -> Option<Signature> {
        self.inner.state.lock().signature.clone()
    }

    /// Register a listener for this replica's events
    pub fn subscribe(&self) -> flume::Receiver<VarEvent> {
        self.inner.events.subscribe()
    }

    /// How many peers this replica currently tracks
    pub fn peer_count(&self) -> usize {
        self.known_peers().len()
    }

    /// Pull reconciliation: query peers for a newer signature and, if one
    /// turns up, start fetching its value.
    ///
    /// Queries this variable's own peer set, or the engine's whole registry
    /// while the set is still empty. Newly responsive peers are merged into
    /// the set. Returns the best signature known after the sweep.
    pub async fn sync(&self) -> Result<Option<Signature>, EngineError> {
        let engine = self.engine()?;

        let known = self.known_peers();
        let peers = if known.is_empty() {
            engine.all_peers()
        } else {
            known
        };

        let (latest, found) = engine.lookup(self.inner.id, self.signature(), peers).await?;
        for peer in &found {
            self.add_peer(peer);
        }

        if let Some(signature) = &latest {
            let newer = self
                .signature()
                .map_or(true, |current| signature.better_than(&current));
            if newer {
                self.push_update(signature.clone());
            }
        }

        Ok(latest)
    }

    /// Write a new value (writer only).
    ///
    /// The local state updates immediately, since the writer is the
    /// authority, and the fresh envelope is then offered to every known
    /// peer. Returns how many peers accepted it.
    pub async fn set(&self, value: V) -> Result<usize, EngineError> {
        let Some(secret) = &self.inner.secret else {
            return Err(EngineError::ReadOnly);
        };
        let engine = self.engine()?;

        let encoded = wire::encode_value(&value)?;
        let signature = Signature::sign(secret, sha256(&encoded), Timestamp::now());

        {
            let mut state = self.inner.state.lock();
            state.value = Some(value);
            state.signature = Some(signature.clone());
        }
        tracing::debug!(id = %self.inner.id, ts = signature.timestamp().as_millis(), "local write");

        engine.publish(&signature, self.known_peers()).await
    }

    /// Feed a signature arriving via an inbound PUBLISH. Returns false iff
    /// the local replica already holds something at least as recent, in
    /// which case the caller should offer our signature back.
    pub(crate) fn apply_remote(&self, signature: Signature, peer: &Arc<Peer>) -> bool {
        self.add_peer(peer);
        self.push_update(signature)
    }

    /// Push-update state machine: accept a candidate signature, fetch its
    /// value from peers that provably hold it, commit if it is still the
    /// newest once fetched, then re-publish to peers left behind.
    ///
    /// Returns false iff the current signature is already at least as good.
    pub(crate) fn push_update(&self, signature: Signature) -> bool {
        if let Some(current) = self.signature() {
            if current.better_than(&signature) {
                return false;
            }
        }

        self.inner.events.emit(VarEvent::Download(signature.clone()));

        let preferred: Vec<Arc<Peer>> = self
            .known_peers()
            .into_iter()
            .filter(|peer| peer.holds_signature(&signature))
            .collect();

        if preferred.is_empty() {
            tracing::debug!(id = %self.inner.id, "no known peer holds the offered signature");
            self.inner
                .events
                .emit(VarEvent::DownloadError("no peers hold the update".into()));
            return true;
        }

        let Ok(engine) = self.engine() else {
            self.inner
                .events
                .emit(VarEvent::DownloadError(EngineError::Closed.to_string()));
            return true;
        };

        let this = self.clone();
        tokio::spawn(async move {
            match engine.download(&signature, preferred).await {
                Ok(value) => this.commit(signature, value, &engine).await,
                Err(e) => {
                    tracing::debug!(id = %this.inner.id, "download failed: {e}");
                    this.inner.events.emit(VarEvent::DownloadError(e.to_string()));
                }
            }
        });

        true
    }

    async fn commit(&self, signature: Signature, value: V, engine: &Arc<EngineInner<V>>) {
        {
            let mut state = self.inner.state.lock();

            // a concurrent update may have won the race while we were
            // downloading; never regress
            let still_newest = state
                .signature
                .as_ref()
                .map_or(true, |current| signature.better_than(current));
            if !still_newest {
                return;
            }

            state.value = Some(value);
            state.signature = Some(signature.clone());
        }

        tracing::debug!(id = %self.inner.id, ts = signature.timestamp().as_millis(), "replica updated");
        self.inner.events.emit(VarEvent::Update);

        // anti-entropy fan-out, limited to peers provably behind
        let outdated: Vec<Arc<Peer>> = self
            .known_peers()
            .into_iter()
            .filter(|peer| {
                peer.signature_for(&self.inner.id)
                    .map_or(true, |cached| !cached.better_than(&signature))
            })
            .collect();

        if !outdated.is_empty() {
            if let Err(e) = engine.publish(&signature, outdated).await {
                tracing::debug!(id = %self.inner.id, "anti-entropy publish failed: {e}");
            }
        }
    }

    /** peer set **/

    pub(crate) fn add_peer(&self, peer: &Arc<Peer>) {
        self.inner
            .peers
            .lock()
            .insert(peer.addr(), Arc::downgrade(peer));
    }

    fn known_peers(&self) -> Vec<Arc<Peer>> {
        let mut peers = self.inner.peers.lock();
        peers.retain(|_, weak| weak.strong_count() > 0);
        peers.values().filter_map(Weak::upgrade).collect()
    }

    fn engine(&self) -> Result<Arc<EngineInner<V>>, EngineError> {
        self.inner.engine.upgrade().ok_or(EngineError::Closed)
    }
}
