//! Localhost test harness
//!
//! Spins up named engines on ephemeral localhost ports and wires them
//! together, plus small waiting helpers for eventual-consistency
//! assertions. Test-support code only; nothing here is part of the
//! protocol.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineBuilder, EngineError, Value};

/// A coordinator for multiple test engines
pub struct TestNet<V: Value> {
    config: EngineConfig,
    engines: HashMap<String, Engine<V>>,
}

impl<V: Value> TestNet<V> {
    /// A network with test-friendly timeouts
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default().request_timeout(Duration::from_millis(500)))
    }

    pub fn with_config(config: EngineConfig) -> Self {
        TestNet {
            config,
            engines: HashMap::new(),
        }
    }

    /// Bind a new engine on an ephemeral localhost port
    pub async fn add_engine(&mut self, name: &str) -> Result<Engine<V>, EngineError> {
        let engine = EngineBuilder::new()
            .bind_addr("127.0.0.1:0".parse().expect("valid literal address"))
            .config(self.config.clone())
            .bind()
            .await?;

        self.engines.insert(name.to_string(), engine.clone());
        Ok(engine)
    }

    pub fn engine(&self, name: &str) -> &Engine<V> {
        self.engines.get(name).expect("unknown engine")
    }

    /// `from` pings `to`, which registers each engine with the other
    pub async fn introduce(&self, from: &str, to: &str) -> Result<(), EngineError> {
        let to_addr = self.engine(to).local_addr();
        self.engine(from).ping(to_addr).await
    }

    pub fn close_all(&self) {
        for engine in self.engines.values() {
            engine.close();
        }
    }
}

impl<V: Value> Default for TestNet<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Value> Drop for TestNet<V> {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Wait for the next event matching `pred`, up to `timeout`
pub async fn wait_for<T, F>(rx: &flume::Receiver<T>, timeout: Duration, mut pred: F) -> Option<T>
where
    F: FnMut(&T) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv_async()).await {
            Ok(Ok(event)) if pred(&event) => return Some(event),
            Ok(Ok(_)) => continue,
            _ => return None,
        }
    }
}

/// Poll `check` until it produces a value or `timeout` elapses
pub async fn eventually<T, F>(timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
