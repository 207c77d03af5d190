//! Fan-out operations: lookup, publish, download, ping
//!
//! Lookup and publish spread a request over a peer set with bounded
//! concurrency and tolerate individual failures: a timed-out or lying peer
//! is marked and skipped, never aborts the sweep. Download instead races a
//! small redundant set of peers and takes the first reply whose reassembled
//! bytes hash to the advertised digest.
//!
//! The only error that aborts a whole fan-out is request-id exhaustion,
//! which signals a backlog severe enough that degrading quietly would hide
//! a real problem.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use crate::buffer::DynamicBuffer;
use crate::crypto::{sha256, Signature, VarId};
use crate::peer::Peer;
use crate::wire::{self, Frame, Reply, Request};

use super::rids::{ReplyResult, RidGuard, RidsExhausted};
use super::{EngineError, EngineInner, Value};

impl<V: Value> EngineInner<V> {
    /// Ask every peer in `peers` for its current signature for `id`.
    ///
    /// Returns the best verified signature seen (starting from `current`)
    /// and the peers that usefully answered. Peers answering with a
    /// mismatched identity or an unverifiable envelope are marked erroring
    /// and excluded; they do not abort the sweep.
    pub(crate) async fn lookup(
        self: &Arc<Self>,
        id: VarId,
        current: Option<Signature>,
        peers: Vec<Arc<Peer>>,
    ) -> Result<(Option<Signature>, Vec<Arc<Peer>>), EngineError> {
        let latest = Mutex::new(current);
        let found: Mutex<Vec<Arc<Peer>>> = Mutex::new(Vec::new());
        let fatal: Mutex<Option<RidsExhausted>> = Mutex::new(None);

        stream::iter(peers)
            .for_each_concurrent(Some(self.config.fanout_limit), |peer| {
                let latest = &latest;
                let found = &found;
                let fatal = &fatal;
                async move {
                    match self.query_signature(&peer, id).await {
                        Ok(Some(signature)) => {
                            peer.record_signature(signature.clone());
                            found.lock().push(Arc::clone(&peer));

                            let mut latest = latest.lock();
                            if latest.as_ref().is_none_or(|cur| signature.better_than(cur)) {
                                *latest = Some(signature);
                            }
                        }
                        Ok(None) => {}
                        Err(EngineError::Rids(e)) => *fatal.lock() = Some(e),
                        Err(e) => tracing::debug!(peer = %peer, "lookup query failed: {e}"),
                    }
                }
            })
            .await;

        if let Some(e) = fatal.into_inner() {
            return Err(e.into());
        }
        Ok((latest.into_inner(), found.into_inner()))
    }

    async fn query_signature(
        &self,
        peer: &Arc<Peer>,
        id: VarId,
    ) -> Result<Option<Signature>, EngineError> {
        let request = Request::Get {
            id: id.as_bytes().to_vec(),
        };
        match self.exchange(peer, request).await? {
            Reply::Empty => Ok(None),
            Reply::Signature(signature) => {
                if signature.id() == id && signature.verify() {
                    Ok(Some(signature))
                } else {
                    peer.add_error(false);
                    Ok(None)
                }
            }
            _ => {
                peer.add_error(false);
                Ok(None)
            }
        }
    }

    /// Offer `signature` to every peer in `peers`, returning how many
    /// accepted it.
    ///
    /// A peer may answer with a competing envelope of its own; it counts as
    /// a success only if that envelope is for the same identity, actually
    /// newer, and verifies; anything else marks the peer erroring.
    pub(crate) async fn publish(
        self: &Arc<Self>,
        signature: &Signature,
        peers: Vec<Arc<Peer>>,
    ) -> Result<usize, EngineError> {
        let success = AtomicUsize::new(0);
        let fatal: Mutex<Option<RidsExhausted>> = Mutex::new(None);

        stream::iter(peers)
            .for_each_concurrent(Some(self.config.fanout_limit), |peer| {
                let success = &success;
                let fatal = &fatal;
                async move {
                    match self.offer_signature(&peer, signature).await {
                        Ok(true) => {
                            success.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(false) => {}
                        Err(EngineError::Rids(e)) => *fatal.lock() = Some(e),
                        Err(e) => tracing::debug!(peer = %peer, "publish failed: {e}"),
                    }
                }
            })
            .await;

        if let Some(e) = fatal.into_inner() {
            return Err(e.into());
        }
        Ok(success.into_inner())
    }

    async fn offer_signature(
        &self,
        peer: &Arc<Peer>,
        signature: &Signature,
    ) -> Result<bool, EngineError> {
        let request = Request::Publish {
            signature: signature.to_bytes().to_vec(),
        };
        match self.exchange(peer, request).await? {
            Reply::Empty => Ok(true),
            Reply::Signature(theirs) => {
                if !theirs.similar_to(signature)
                    || !theirs.better_than(signature)
                    || !theirs.verify()
                {
                    peer.add_error(false);
                    return Ok(false);
                }
                peer.record_signature(theirs);
                Ok(true)
            }
            _ => {
                peer.add_error(false);
                Ok(false)
            }
        }
    }

    /// Fetch the value behind `signature`, racing up to the configured
    /// redundancy of peers at a time.
    ///
    /// Each attempt reassembles chunk frames into a [`DynamicBuffer`] and
    /// checks the joined bytes against the envelope's content hash; a
    /// mismatch fails that attempt (and marks the peer) while the race
    /// carries on with the rest. The first verified buffer wins.
    pub(crate) async fn download(
        self: &Arc<Self>,
        signature: &Signature,
        peers: Vec<Arc<Peer>>,
    ) -> Result<V, EngineError> {
        let redundancy = self.config.download_redundancy.max(1);
        let mut attempts = stream::iter(
            peers
                .into_iter()
                .map(|peer| self.fetch_value(peer, signature)),
        )
        .buffer_unordered(redundancy);

        while let Some(outcome) = attempts.next().await {
            match outcome {
                Ok(Some(buffer)) => {
                    drop(attempts);
                    return Ok(wire::decode_value(&buffer)?);
                }
                Ok(None) => {}
                Err(e) => {
                    drop(attempts);
                    return Err(e);
                }
            }
        }
        Err(EngineError::DownloadFailed)
    }

    /// One download attempt against one peer. `Ok(None)` is a failed
    /// attempt; `Err` is fatal for the whole download.
    async fn fetch_value(
        &self,
        peer: Arc<Peer>,
        signature: &Signature,
    ) -> Result<Option<Bytes>, EngineError> {
        let (tx, rx) = flume::unbounded();
        let guard = RidGuard::allocate(&self.rids, peer.addr(), tx)?;

        let request = Request::Download {
            signature: signature.to_bytes().to_vec(),
        };
        let frame = Frame::Request {
            rid: guard.rid(),
            request,
        };
        if let Err(e) = self.send_frame(&frame, peer.addr()).await {
            tracing::debug!(peer = %peer, "download request failed to send: {e}");
            return Ok(None);
        }

        // one timeout window for the whole multi-chunk exchange; receiving
        // a chunk does not extend it
        let deadline = tokio::time::Instant::now() + self.config.request_timeout;
        let mut buffer = DynamicBuffer::new();

        loop {
            let event = match tokio::time::timeout_at(deadline, rx.recv_async()).await {
                Err(_) => {
                    peer.add_error(true);
                    return Ok(None);
                }
                Ok(Err(_)) => return Ok(None),
                Ok(Ok(event)) => event,
            };

            match event {
                Err(_remote) => return Ok(None),
                Ok(Reply::Chunk { offset, data }) => {
                    buffer.add(Bytes::from(data), offset as usize);
                    if !buffer.is_complete() {
                        continue;
                    }

                    let joined = buffer.join();
                    if sha256(&joined) == *signature.value_hash() {
                        return Ok(Some(joined));
                    }
                    tracing::debug!(peer = %peer, "download hash mismatch");
                    peer.add_error(false);
                    return Ok(None);
                }
                Ok(_) => {
                    peer.add_error(false);
                    return Ok(None);
                }
            }
        }
    }

    /// Ping `addr`, registering it as a peer
    pub(crate) async fn ping(self: &Arc<Self>, addr: SocketAddr) -> Result<(), EngineError> {
        let peer = self.peer(addr);
        self.exchange(&peer, Request::Ping).await.map(|_| ())
    }

    /// Send one request and await its single reply within the timeout
    /// window. Timeouts are recorded against the peer; remote error replies
    /// were already recorded at dispatch.
    async fn exchange(&self, peer: &Arc<Peer>, request: Request) -> Result<Reply, EngineError> {
        let (tx, rx) = flume::bounded::<ReplyResult>(1);
        let guard = RidGuard::allocate(&self.rids, peer.addr(), tx)?;

        let frame = Frame::Request {
            rid: guard.rid(),
            request,
        };
        self.send_frame(&frame, peer.addr()).await?;

        match tokio::time::timeout(self.config.request_timeout, rx.recv_async()).await {
            Err(_) => {
                peer.add_error(true);
                Err(EngineError::Timeout)
            }
            Ok(Err(_)) => Err(EngineError::Closed),
            Ok(Ok(Err(remote))) => Err(remote.into()),
            Ok(Ok(Ok(reply))) => Ok(reply),
        }
    }
}
