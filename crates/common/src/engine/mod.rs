//! The replication engine
//!
//! One [`Engine`] owns one datagram socket plus the two registries every
//! other component leans on: known peers (keyed by socket address) and
//! local variable replicas (keyed by identity). A single receive-loop task
//! decodes datagrams and dispatches them (responses to the request-id
//! table, requests to the handlers below), so all registry mutation funnels
//! through one logical thread per engine.

mod ops;
mod rids;

pub use rids::{RemoteError, RidsExhausted};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::crypto::{SecretKey, Signature, VarId};
use crate::events::EventSink;
use crate::peer::Peer;
use crate::shared_var::SharedVar;
use crate::wire::{self, Frame, Reply, Request, Rid, WireError, ERROR_NOT_FOUND, ERROR_PARAM, ERROR_UNKNOWN};

use rids::{RidRoute, RidTable};

/// Marker bound for the application value type an engine replicates
pub trait Value: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Value for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Errors surfaced by engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("request timed out")]
    Timeout,
    #[error("engine closed")]
    Closed,
    #[error("variable is read-only on this node")]
    ReadOnly,
    #[error("download failed: no peer produced a verified value")]
    DownloadFailed,
    #[error(transparent)]
    Rids(#[from] RidsExhausted),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine lifecycle and traffic notifications
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The socket is bound and the receive loop is running
    Listening { addr: SocketAddr },
    /// A well-formed datagram arrived
    Message { from: SocketAddr },
    /// A remote peer pinged us
    Ping { from: SocketAddr },
    /// The socket reported a receive error (non-fatal)
    Error(String),
    Closed,
}

/// Configures and binds an [`Engine`]
pub struct EngineBuilder {
    bind: SocketAddr,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        EngineBuilder {
            bind: "0.0.0.0:0".parse().expect("valid literal address"),
            config: EngineConfig::default(),
        }
    }

    /// The local address to bind the socket to; defaults to an ephemeral
    /// port on all interfaces
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind = addr;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind the socket and start the receive loop
    pub async fn bind<V: Value>(self) -> Result<Engine<V>, EngineError> {
        let socket = Arc::new(UdpSocket::bind(self.bind).await?);
        let local_addr = socket.local_addr()?;

        let inner = Arc::new(EngineInner {
            socket: Arc::clone(&socket),
            local_addr,
            config: self.config,
            peers: Mutex::new(HashMap::new()),
            vars: Mutex::new(HashMap::new()),
            rids: Arc::new(Mutex::new(RidTable::new())),
            events: EventSink::new(),
            closed: AtomicBool::new(false),
            driver: Mutex::new(None),
        });

        let handle = tokio::spawn(drive(socket, Arc::downgrade(&inner)));
        *inner.driver.lock() = Some(handle);

        tracing::debug!(%local_addr, "engine listening");
        inner.events.emit(EngineEvent::Listening { addr: local_addr });

        Ok(Engine { inner })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running replication engine.
///
/// Cheap to clone; the underlying state is shared. The engine keeps running
/// until [`close`](Engine::close) is called or every handle (and every
/// in-flight task borrowing one) is gone.
pub struct Engine<V: Value> {
    inner: Arc<EngineInner<V>>,
}

impl<V: Value> Clone for Engine<V> {
    fn clone(&self) -> Self {
        Engine {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Value> Engine<V> {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Register a listener for engine events
    pub fn events(&self) -> flume::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Ping a remote node, registering it as a peer.
    ///
    /// Resolves once the peer answers; times out against the configured
    /// request window otherwise.
    pub async fn ping(&self, addr: SocketAddr) -> Result<(), EngineError> {
        self.inner.ping(addr).await
    }

    /// Create a new writable variable holding `value`.
    ///
    /// Generates a fresh identity, signs the value and publishes the
    /// envelope to any peers already interested (none, for a brand-new id).
    pub async fn assign(&self, value: V) -> Result<SharedVar<V>, EngineError> {
        let secret = SecretKey::generate();
        let id: VarId = secret.public().into();

        let var = SharedVar::writable(Arc::downgrade(&self.inner), id, secret);
        self.inner.vars.lock().insert(id, var.clone());

        var.set(value).await?;
        Ok(var)
    }

    /// Get (or create) the local replica of the variable named by `id`.
    ///
    /// A freshly created replica starts its first sync in the background;
    /// subscribe to its events to learn when a value lands.
    pub fn get(&self, id: VarId) -> SharedVar<V> {
        let mut vars = self.inner.vars.lock();
        if let Some(var) = vars.get(&id) {
            return var.clone();
        }

        let var = SharedVar::read_only(Arc::downgrade(&self.inner), id);
        vars.insert(id, var.clone());
        drop(vars);

        let sync_var = var.clone();
        tokio::spawn(async move {
            if let Err(e) = sync_var.sync().await {
                tracing::debug!(%id, "initial sync failed: {e}");
            }
        });

        var
    }

    /// Look up an existing replica without creating one
    pub fn var(&self, id: &VarId) -> Option<SharedVar<V>> {
        self.inner.vars.lock().get(id).cloned()
    }

    /// Snapshot of every peer this engine has ever exchanged datagrams with
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner.all_peers()
    }

    /// Stop the receive loop and refuse further sends
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.inner.driver.lock().take() {
            handle.abort();
        }
        tracing::debug!(addr = %self.inner.local_addr, "engine closed");
        self.inner.events.emit(EngineEvent::Closed);
    }
}

pub(crate) struct EngineInner<V: Value> {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    pub(crate) config: EngineConfig,
    peers: Mutex<HashMap<SocketAddr, Arc<Peer>>>,
    vars: Mutex<HashMap<VarId, SharedVar<V>>>,
    pub(crate) rids: Arc<Mutex<RidTable>>,
    pub(crate) events: EventSink<EngineEvent>,
    closed: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Value> Drop for EngineInner<V> {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }
}

impl<V: Value> EngineInner<V> {
    /// Look up a peer by address, registering it on first sight
    pub(crate) fn peer(&self, addr: SocketAddr) -> Arc<Peer> {
        Arc::clone(
            self.peers
                .lock()
                .entry(addr)
                .or_insert_with(|| Arc::new(Peer::new(addr))),
        )
    }

    pub(crate) fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().values().cloned().collect()
    }

    fn var(&self, id: &VarId) -> Option<SharedVar<V>> {
        self.vars.lock().get(id).cloned()
    }

    pub(crate) async fn send_frame(
        &self,
        frame: &Frame,
        to: SocketAddr,
    ) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        let buffer = frame.encode()?;
        self.socket.send_to(&buffer, to).await?;
        Ok(())
    }

    /** dispatch **/

    async fn handle_datagram(self: &Arc<Self>, buffer: &[u8], from: SocketAddr) {
        let frame = match Frame::decode(buffer) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(%from, "dropping undecodable datagram: {e}");
                return;
            }
        };

        if self.events.has_subscribers() {
            self.events.emit(EngineEvent::Message { from });
        }

        match frame {
            Frame::Response { rid, reply } => self.handle_response(rid, reply, from),
            Frame::Error { rid, code, message } => {
                self.handle_error_response(rid, code, message, from)
            }
            Frame::Request { rid, request } => self.handle_request(rid, request, from).await,
            Frame::Unknown { rid, kind } => {
                tracing::debug!(%from, kind, "unknown request type");
                self.peer(from).add_error(false);
                self.respond_error(rid, ERROR_UNKNOWN, "Unknown request type", from)
                    .await;
            }
        }
    }

    fn handle_response(&self, rid: Rid, reply: Reply, from: SocketAddr) {
        let peer = self.peer(from);
        let route = self.rids.lock().route(rid, from);
        match route {
            RidRoute::Matched(tx) => {
                peer.add_response();
                let _ = tx.send(Ok(reply));
            }
            // ids are scoped to the peer they were issued to; an answer from
            // anyone else is not ours to accept
            RidRoute::WrongPeer => {
                tracing::debug!(%from, rid, "ignoring response from unexpected address");
            }
            RidRoute::Vacant => peer.add_error(false),
        }
    }

    fn handle_error_response(&self, rid: Rid, code: i8, message: Option<String>, from: SocketAddr) {
        let peer = self.peer(from);
        peer.add_error(false);

        let route = self.rids.lock().route(rid, from);
        if let RidRoute::Matched(tx) = route {
            let _ = tx.send(Err(RemoteError { code, message }));
        }
    }

    async fn handle_request(self: &Arc<Self>, rid: Rid, request: Request, from: SocketAddr) {
        let peer = self.peer(from);
        peer.add_request();

        match request {
            Request::Ping => {
                tracing::debug!(%from, "ping");
                self.events.emit(EngineEvent::Ping { from });
                self.respond(rid, Reply::Empty, from).await;
            }
            Request::Get { id } => match self.handle_get(&id) {
                Ok(reply) => self.respond(rid, reply, from).await,
                Err((code, message)) => {
                    peer.add_error(false);
                    self.respond_error(rid, code, message, from).await;
                }
            },
            Request::Publish { signature } => match self.handle_publish(&signature, &peer) {
                Ok(reply) => self.respond(rid, reply, from).await,
                Err((code, message)) => {
                    peer.add_error(false);
                    self.respond_error(rid, code, message, from).await;
                }
            },
            Request::Download { signature } => {
                if let Err((code, message)) = self.handle_download(rid, &signature, from).await {
                    peer.add_error(false);
                    self.respond_error(rid, code, message, from).await;
                }
            }
        }
    }

    /** request handlers **/

    fn handle_get(&self, id: &[u8]) -> Result<Reply, (i8, &'static str)> {
        let id = VarId::from_slice(id).map_err(|_| (ERROR_PARAM, "Invalid `id` param"))?;

        match self.var(&id).and_then(|var| var.signature()) {
            Some(signature) => Ok(Reply::Signature(signature)),
            None => Ok(Reply::Empty),
        }
    }

    fn handle_publish(
        &self,
        signature: &[u8],
        peer: &Arc<Peer>,
    ) -> Result<Reply, (i8, &'static str)> {
        let signature = decode_verified(signature)
            .ok_or((ERROR_PARAM, "Invalid `signature` param"))?;

        peer.record_signature(signature.clone());

        let Some(var) = self.var(&signature.id()) else {
            return Ok(Reply::Empty);
        };

        if var.apply_remote(signature, peer) {
            Ok(Reply::Empty)
        } else {
            // we hold something at least as recent; hand it back so the
            // sender can pull
            match var.signature() {
                Some(current) => Ok(Reply::Signature(current)),
                None => Ok(Reply::Empty),
            }
        }
    }

    /// Stream the value matching `signature` back as a run of chunk frames
    /// under the request's rid. A zero-length value still produces one
    /// empty chunk so the receiver can tell completion from loss.
    async fn handle_download(
        self: &Arc<Self>,
        rid: Rid,
        signature: &[u8],
        from: SocketAddr,
    ) -> Result<(), (i8, &'static str)> {
        let signature = decode_verified(signature)
            .ok_or((ERROR_PARAM, "Invalid `signature` param"))?;

        let value = self
            .var(&signature.id())
            .filter(|var| var.signature().is_some_and(|current| current == signature))
            .and_then(|var| var.value())
            .ok_or((ERROR_NOT_FOUND, "The given signature not found"))?;

        let buffer = wire::encode_value(&value)
            .map_err(|_| (ERROR_NOT_FOUND, "The given signature not found"))?;

        let chunk_size = self.config.chunk_size.max(1);
        let mut offset = 0usize;
        loop {
            let end = (offset + chunk_size).min(buffer.len());
            let reply = Reply::Chunk {
                offset: offset as u64,
                data: buffer[offset..end].to_vec(),
            };
            self.respond(rid, reply, from).await;

            if end >= buffer.len() {
                break;
            }
            offset = end;
        }
        Ok(())
    }

    async fn respond(&self, rid: Rid, reply: Reply, to: SocketAddr) {
        if let Err(e) = self.send_frame(&Frame::Response { rid, reply }, to).await {
            tracing::debug!(%to, "failed to send response: {e}");
        }
    }

    async fn respond_error(&self, rid: Rid, code: i8, message: &str, to: SocketAddr) {
        let frame = Frame::Error {
            rid,
            code,
            message: Some(message.to_string()),
        };
        if let Err(e) = self.send_frame(&frame, to).await {
            tracing::debug!(%to, "failed to send error response: {e}");
        }
    }
}

/// Parse and authenticate an envelope received as a request parameter
fn decode_verified(bytes: &[u8]) -> Option<Signature> {
    match Signature::from_bytes(bytes) {
        Ok(signature) if signature.verify() => Some(signature),
        _ => None,
    }
}

/// Receive loop: one task per engine, holding only a weak reference so a
/// fully dropped engine winds down on its own.
async fn drive<V: Value>(socket: Arc<UdpSocket>, inner: Weak<EngineInner<V>>) {
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, from)) => {
                let Some(engine) = inner.upgrade() else { break };
                engine.handle_datagram(&buffer[..len], from).await;
            }
            Err(e) => {
                tracing::warn!("socket receive error: {e}");
                match inner.upgrade() {
                    Some(engine) => engine.events.emit(EngineEvent::Error(e.to_string())),
                    None => break,
                }
            }
        }
    }
}
