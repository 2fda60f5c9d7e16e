//! One-time release notice

use crate::common::SharedClient;
use crate::{Error, Result};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Latest release endpoint
pub const RELEASES_URL: &str = "https://api.github.com/repos/tunwarden/tunwarden/releases/latest";

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
}

/// Logs once per process whether a newer release exists
pub struct VersionNotice {
    enabled: bool,
    current: String,
    url: String,
    client: Arc<SharedClient>,
    noticed: AtomicBool,
}

impl VersionNotice {
    pub fn new(enabled: bool, client: Arc<SharedClient>) -> Self {
        VersionNotice {
            enabled,
            current: crate::VERSION.to_string(),
            url: RELEASES_URL.to_string(),
            client,
            noticed: AtomicBool::new(false),
        }
    }

    /// Compare against another endpoint and version
    pub fn with_source<S: Into<String>>(mut self, url: S, current: S) -> Self {
        self.url = url.into();
        self.current = current.into();
        self
    }

    /// Returns the newer tag, if any. Only the first completed lookup counts;
    /// a cancelled one leaves the check to the next call.
    pub async fn notice_once(&self, cancel: &CancellationToken) -> Option<String> {
        if !self.enabled || self.noticed.swap(true, Ordering::SeqCst) {
            return None;
        }

        let latest = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.noticed.store(false, Ordering::SeqCst);
                return None;
            }
            latest = self.latest() => latest,
        };

        match latest {
            Ok(tag) if is_newer(&self.current, &tag) => {
                info!("A newer version {} is available (running {})", tag, self.current);
                Some(tag)
            }
            Ok(tag) => {
                debug!("Running version {} is up to date (latest {})", self.current, tag);
                None
            }
            Err(e) => {
                debug!("Cannot check for a newer version: {}", e);
                None
            }
        }
    }

    async fn latest(&self) -> Result<String> {
        let response = self
            .client
            .client()
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::network(format!("release lookup returned {}", response.status())));
        }
        let release: Release = response.json().await?;
        Ok(release.tag_name)
    }
}

fn parse_version(version: &str) -> Option<Vec<u64>> {
    version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .map(|part| part.parse().ok())
        .collect()
}

/// `true` when `latest` is a strictly higher dotted version than `current`
fn is_newer(current: &str, latest: &str) -> bool {
    match (parse_version(current), parse_version(latest)) {
        (Some(current), Some(latest)) => latest > current,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_newer() {
        assert!(is_newer("0.4.0", "v0.4.1"));
        assert!(is_newer("0.4.0", "1.0"));
        assert!(!is_newer("0.4.0", "v0.4.0"));
        assert!(!is_newer("0.4.0", "0.3.9"));
        assert!(!is_newer("0.4.0", "nightly"));
    }

    #[tokio::test]
    async fn test_notice_only_once() {
        let client = Arc::new(SharedClient::new().unwrap());
        // Nothing listens there; the lookup fails quietly
        let notice = VersionNotice::new(true, client).with_source("http://127.0.0.1:9/latest", "0.4.0");
        let cancel = CancellationToken::new();

        assert!(notice.notice_once(&cancel).await.is_none());
        assert!(notice.noticed.load(Ordering::SeqCst));
        assert!(notice.notice_once(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_lookup_is_retried() {
        let client = Arc::new(SharedClient::new().unwrap());
        let notice = VersionNotice::new(true, client).with_source("http://127.0.0.1:9/latest", "0.4.0");

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(notice.notice_once(&cancel).await.is_none());
        assert!(!notice.noticed.load(Ordering::SeqCst));

        assert!(notice.notice_once(&CancellationToken::new()).await.is_none());
        assert!(notice.noticed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_disabled_never_queries() {
        let notice = VersionNotice::new(false, Arc::new(SharedClient::new().unwrap()));
        assert!(notice.notice_once(&CancellationToken::new()).await.is_none());
        assert!(!notice.noticed.load(Ordering::SeqCst));
    }
}
