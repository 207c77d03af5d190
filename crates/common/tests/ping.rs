//! Engine lifecycle and ping exchange

use std::time::Duration;

use common::engine::{Engine, EngineBuilder, EngineError, EngineEvent};
use common::testkit::{wait_for, TestNet};

#[tokio::test]
async fn ping_registers_both_peers() {
    let mut net: TestNet<String> = TestNet::new();
    let a = net.add_engine("a").await.unwrap();
    let b = net.add_engine("b").await.unwrap();

    let a_events = a.events();
    b.ping(a.local_addr()).await.unwrap();

    // the pinged engine observed the ping
    let event = wait_for(&a_events, Duration::from_secs(1), |e| {
        matches!(e, EngineEvent::Ping { .. })
    })
    .await;
    assert!(event.is_some());

    // both sides registered each other lazily
    assert!(b.peers().iter().any(|p| p.addr() == a.local_addr()));
    assert!(a.peers().iter().any(|p| p.addr() == b.local_addr()));
}

#[tokio::test]
async fn ping_to_dead_address_times_out() {
    let mut net: TestNet<String> = TestNet::new();
    let a = net.add_engine("a").await.unwrap();

    // bind an engine just to reserve an address, then drop it so nothing
    // answers there
    let gone: Engine<String> = EngineBuilder::new()
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .bind()
        .await
        .unwrap();
    let dead_addr = gone.local_addr();
    gone.close();
    drop(gone);

    let result = a.ping(dead_addr).await;
    assert!(matches!(result, Err(EngineError::Timeout)));

    // the timeout was recorded against the peer
    let peer = a
        .peers()
        .into_iter()
        .find(|p| p.addr() == dead_addr)
        .unwrap();
    assert_eq!(peer.stats().timeouts, 1);
    assert_eq!(peer.stats().errors, 1);
}

#[tokio::test]
async fn close_stops_the_engine() {
    let mut net: TestNet<String> = TestNet::new();
    let a = net.add_engine("a").await.unwrap();
    let b = net.add_engine("b").await.unwrap();

    let b_events = b.events();
    b.close();
    assert!(
        wait_for(&b_events, Duration::from_secs(1), |e| matches!(
            e,
            EngineEvent::Closed
        ))
        .await
        .is_some()
    );

    // a closed engine refuses to send
    assert!(matches!(
        b.ping(a.local_addr()).await,
        Err(EngineError::Closed)
    ));
}
