//! Listener-list event delivery
//!
//! Engines and variables notify observers through per-instance listener
//! lists of flume senders. Subscribing clones a fresh channel into the
//! list; emitting fans the event out to every live receiver and prunes the
//! ones whose receivers have been dropped.

use parking_lot::Mutex;

/// A set of event subscribers for one emitting object
#[derive(Debug)]
pub struct EventSink<T> {
    senders: Mutex<Vec<flume::Sender<T>>>,
}

impl<T: Clone> EventSink<T> {
    pub fn new() -> Self {
        EventSink {
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Register a new listener and return its receiving end
    pub fn subscribe(&self) -> flume::Receiver<T> {
        let (tx, rx) = flume::unbounded();
        self.senders.lock().push(tx);
        rx
    }

    /// Deliver an event to every live listener
    pub fn emit(&self, event: T) {
        self.senders
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Whether anyone is listening (used to skip building chatty events)
    pub fn has_subscribers(&self) -> bool {
        !self.senders.lock().is_empty()
    }
}

impl<T: Clone> Default for EventSink<T> {
    fn default() -> Self {
        Self::new()
    }
}
