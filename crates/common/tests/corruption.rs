//! Adversarial scenarios: lying download peers and spoofed reply sources
//!
//! The rogue actor below speaks just enough of the wire protocol to
//! advertise a real signature and then serve bytes that do not hash to it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use common::config::EngineConfig;
use common::crypto::{sha256, SecretKey, Signature, Timestamp, VarId};
use common::engine::EngineError;
use common::shared_var::VarEvent;
use common::testkit::{eventually, wait_for, TestNet};
use common::wire::{self, Frame, Reply, Request};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Payload {
    payload: String,
}

/// Answers pings, advertises `signature` on GET, and serves `payload` on
/// DOWNLOAD, whether or not it matches the advertised hash.
async fn rogue_server(socket: UdpSocket, signature: Signature, payload: Vec<u8>) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let Ok((len, from)) = socket.recv_from(&mut buf).await else {
            break;
        };
        let Ok(Frame::Request { rid, request }) = Frame::decode(&buf[..len]) else {
            continue;
        };

        let replies: Vec<Reply> = match request {
            Request::Ping | Request::Publish { .. } => vec![Reply::Empty],
            Request::Get { .. } => vec![Reply::Signature(signature.clone())],
            Request::Download { .. } => payload
                .chunks(500)
                .enumerate()
                .map(|(i, chunk)| Reply::Chunk {
                    offset: (i * 500) as u64,
                    data: chunk.to_vec(),
                })
                .collect(),
        };

        for reply in replies {
            let out = Frame::Response { rid, reply }.encode().unwrap();
            socket.send_to(&out, from).await.unwrap();
        }
    }
}

#[tokio::test]
async fn hash_mismatched_peer_loses_the_race() {
    let mut net: TestNet<Payload> = TestNet::new();
    let writer = net.add_engine("writer").await.unwrap();
    let reader = net.add_engine("reader").await.unwrap();

    let value = Payload {
        payload: "precious data".into(),
    };
    let var_w = writer.assign(value.clone()).await.unwrap();
    let signature = var_w.signature().unwrap();

    // a rogue peer advertising the same signature but serving garbage
    let rogue_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rogue_addr = rogue_socket.local_addr().unwrap();
    tokio::spawn(rogue_server(rogue_socket, signature, vec![0xAA; 64]));

    reader.ping(writer.local_addr()).await.unwrap();
    reader.ping(rogue_addr).await.unwrap();

    // both peers are raced; only the writer's bytes verify
    let var_r = reader.get(var_w.id());
    let converged = eventually(Duration::from_secs(3), || var_r.value()).await;
    assert_eq!(converged, Some(value));
}

#[tokio::test]
async fn download_fails_when_no_peer_verifies() {
    let mut net: TestNet<Payload> = TestNet::new();
    let reader = net.add_engine("reader").await.unwrap();

    // a signature crafted locally; the only peer claiming to hold it lies
    let secret = SecretKey::generate();
    let value = Payload {
        payload: "never delivered".into(),
    };
    let encoded = wire::encode_value(&value).unwrap();
    let signature = Signature::sign(&secret, sha256(&encoded), Timestamp::now());
    let id: VarId = signature.id();

    let rogue_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rogue_addr = rogue_socket.local_addr().unwrap();
    tokio::spawn(rogue_server(rogue_socket, signature, vec![0x55; 64]));

    reader.ping(rogue_addr).await.unwrap();

    let var_r = reader.get(id);
    let events = var_r.subscribe();

    // drive a sync we know starts after the subscription
    var_r.sync().await.unwrap();

    let failed = wait_for(&events, Duration::from_secs(2), |e| {
        matches!(e, VarEvent::DownloadError(_))
    })
    .await;
    assert!(failed.is_some(), "expected a download error event");
    assert!(var_r.value().is_none());
    assert!(var_r.signature().is_none());
}

#[tokio::test]
async fn reply_from_unexpected_address_is_ignored() {
    let config = EngineConfig::default().request_timeout(Duration::from_millis(400));
    let mut net: TestNet<Payload> = TestNet::with_config(config);
    let engine = net.add_engine("node").await.unwrap();
    let engine_addr = engine.local_addr();

    let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    let impostor = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // the target never answers itself; an impostor answers in its place
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        let Ok((len, _)) = target.recv_from(&mut buf).await else {
            return;
        };
        let Ok(frame) = Frame::decode(&buf[..len]) else {
            return;
        };
        let reply = Frame::Response {
            rid: frame.rid(),
            reply: Reply::Empty,
        }
        .encode()
        .unwrap();
        impostor.send_to(&reply, engine_addr).await.unwrap();
    });

    let started = std::time::Instant::now();
    let result = engine.ping(target_addr).await;

    // the spoofed reply must not complete the request early
    assert!(matches!(result, Err(EngineError::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(400));
}
