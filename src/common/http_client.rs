//! Shared outbound HTTP client
//!
//! One `reqwest::Client` is shared by every subsystem that talks to the
//! outside world (public IP lookups, release checks, block list downloads).
//! Connections pooled before the tunnel came up would keep routing around it,
//! so the VPN loop flushes the pool on every tunnel-ready event.

use crate::{Error, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Idle pooled connections are dropped after this long anyway
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared, flushable HTTP client
pub struct SharedClient {
    inner: RwLock<reqwest::Client>,
    timeout: Duration,
    /// Number of times the pool was flushed
    flushes: AtomicU64,
}

impl SharedClient {
    /// Create a client with the default timeout
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create a client with a custom request timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        Ok(SharedClient {
            inner: RwLock::new(Self::build(timeout)?),
            timeout,
            flushes: AtomicU64::new(0),
        })
    }

    fn build(timeout: Duration) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .user_agent(concat!("tunwarden/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::network(format!("Failed to build HTTP client: {}", e)))
    }

    /// Get a handle to the current client (cheap clone)
    pub fn client(&self) -> reqwest::Client {
        self.inner.read().clone()
    }

    /// Drop every idle pooled connection.
    ///
    /// `reqwest` has no explicit flush, so the inner client is replaced; handles
    /// already cloned out keep working on the old pool until they are dropped.
    pub fn close_idle_connections(&self) {
        match Self::build(self.timeout) {
            Ok(fresh) => {
                *self.inner.write() = fresh;
                self.flushes.fetch_add(1, Ordering::Relaxed);
                debug!("HTTP client idle connections closed");
            }
            Err(e) => debug!("Keeping current HTTP client: {}", e),
        }
    }

    /// Number of pool flushes so far
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_idle_connections_counts() {
        let client = SharedClient::new().unwrap();
        assert_eq!(client.flush_count(), 0);
        client.close_idle_connections();
        client.close_idle_connections();
        assert_eq!(client.flush_count(), 2);
    }
}
