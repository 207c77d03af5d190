//! Engine tuning knobs

use std::time::Duration;

/// Tuning parameters for an [`Engine`](crate::engine::Engine).
///
/// The defaults match the protocol's reference constants; deployments
/// mostly shorten `request_timeout` in tests and leave the rest alone.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a request id stays live waiting for its reply. A chunked
    /// download must finish within one window; the timer is not reset per
    /// chunk.
    pub request_timeout: Duration,
    /// Maximum in-flight requests during a lookup/publish fan-out
    pub fanout_limit: usize,
    /// How many peers a download races concurrently
    pub download_redundancy: usize,
    /// Largest value fragment served in one download response frame
    pub chunk_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            request_timeout: Duration::from_secs(10),
            fanout_limit: 100,
            download_redundancy: 2,
            chunk_size: 500,
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn fanout_limit(mut self, limit: usize) -> Self {
        self.fanout_limit = limit;
        self
    }

    pub fn download_redundancy(mut self, redundancy: usize) -> Self {
        self.download_redundancy = redundancy;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }
}
