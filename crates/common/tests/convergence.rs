//! End-to-end replication scenarios
//!
//! A writer assigns a value on one engine; readers on other engines
//! replicate it through ping + get and must converge to the latest write.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use common::shared_var::VarEvent;
use common::testkit::{eventually, wait_for, TestNet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Doc {
    foo: i64,
    bar: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Rev {
    rev: u32,
}

#[tokio::test]
async fn reader_converges_to_writer_value() {
    let mut net: TestNet<Doc> = TestNet::new();
    let writer = net.add_engine("writer").await.unwrap();
    let reader = net.add_engine("reader").await.unwrap();

    let value = Doc {
        foo: 1,
        bar: "hi".into(),
    };
    let var_w = writer.assign(value.clone()).await.unwrap();
    assert!(var_w.is_writable());
    assert_eq!(var_w.value(), Some(value.clone()));

    net.introduce("reader", "writer").await.unwrap();

    let var_r = reader.get(var_w.id());
    assert!(!var_r.is_writable());

    let events = var_r.subscribe();
    if var_r.value().is_none() {
        assert!(
            wait_for(&events, Duration::from_secs(2), |e| matches!(
                e,
                VarEvent::Update
            ))
            .await
            .is_some(),
            "reader never saw an update"
        );
    }

    assert_eq!(var_r.value(), Some(value));
    assert_eq!(var_r.signature(), var_w.signature());
}

#[tokio::test]
async fn reader_converges_to_latest_of_two_writes() {
    let mut net: TestNet<Rev> = TestNet::new();
    let writer = net.add_engine("writer").await.unwrap();
    let reader = net.add_engine("reader").await.unwrap();

    let var_w = writer.assign(Rev { rev: 1 }).await.unwrap();
    let first_ts = var_w.signature().unwrap().timestamp();

    net.introduce("reader", "writer").await.unwrap();

    // the reader starts replicating before the second write lands
    let var_r = reader.get(var_w.id());
    let first = eventually(Duration::from_secs(2), || var_r.value()).await;
    assert_eq!(first, Some(Rev { rev: 1 }));

    // timestamps have millisecond resolution; space the writes out so the
    // second is strictly newer
    tokio::time::sleep(Duration::from_millis(20)).await;
    var_w.set(Rev { rev: 2 }).await.unwrap();
    assert!(var_w.signature().unwrap().timestamp() > first_ts);

    var_r.sync().await.unwrap();

    let converged = eventually(Duration::from_secs(2), || {
        (var_r.value() == Some(Rev { rev: 2 })).then_some(())
    })
    .await;
    assert!(converged.is_some(), "reader never reached the second write");

    // and it must stay there: re-syncing cannot regress to rev 1
    var_r.sync().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(var_r.value(), Some(Rev { rev: 2 }));
    assert_eq!(var_r.signature(), var_w.signature());
}

#[tokio::test]
async fn large_value_replicates_in_chunks() {
    let mut net: TestNet<String> = TestNet::new();
    let writer = net.add_engine("writer").await.unwrap();
    let reader = net.add_engine("reader").await.unwrap();

    // well past the 500-byte chunk bound, so the download spans many frames
    let value: String = "abcdefgh".repeat(1_000);

    let var_w = writer.assign(value.clone()).await.unwrap();
    net.introduce("reader", "writer").await.unwrap();

    let var_r = reader.get(var_w.id());
    let converged = eventually(Duration::from_secs(3), || var_r.value()).await;
    assert_eq!(converged, Some(value));
}

#[tokio::test]
async fn set_on_read_only_replica_is_refused() {
    let mut net: TestNet<Rev> = TestNet::new();
    let writer = net.add_engine("writer").await.unwrap();
    let reader = net.add_engine("reader").await.unwrap();

    let var_w = writer.assign(Rev { rev: 1 }).await.unwrap();
    let var_r = reader.get(var_w.id());

    let result = var_r.set(Rev { rev: 2 }).await;
    assert!(matches!(
        result,
        Err(common::engine::EngineError::ReadOnly)
    ));
}

#[tokio::test]
async fn publish_pushes_update_to_interested_peer() {
    let mut net: TestNet<Rev> = TestNet::new();
    let writer = net.add_engine("writer").await.unwrap();
    let reader = net.add_engine("reader").await.unwrap();

    let var_w = writer.assign(Rev { rev: 1 }).await.unwrap();
    net.introduce("reader", "writer").await.unwrap();

    let var_r = reader.get(var_w.id());
    let first = eventually(Duration::from_secs(2), || var_r.value()).await;
    assert_eq!(first, Some(Rev { rev: 1 }));

    // the writer's sync discovers the reader as an interested peer
    var_w.sync().await.unwrap();

    // now a write is pushed to the reader with no further sync call on the
    // reading side
    tokio::time::sleep(Duration::from_millis(20)).await;
    let accepted = var_w.set(Rev { rev: 2 }).await.unwrap();
    assert_eq!(accepted, 1);

    let converged = eventually(Duration::from_secs(2), || {
        (var_r.value() == Some(Rev { rev: 2 })).then_some(())
    })
    .await;
    assert!(converged.is_some(), "push never reached the reader");
}
