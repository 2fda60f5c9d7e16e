//! Crash backoff

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default wait after the first failure
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(15);

/// Default time a freshly started process gets to fail before it counts as up
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Timing knobs of a subsystem loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTimings {
    pub grace: Duration,
    pub initial_backoff: Duration,
}

impl Default for LoopTimings {
    fn default() -> Self {
        LoopTimings {
            grace: DEFAULT_GRACE_PERIOD,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }
}

/// Exponential backoff between retries.
///
/// The wait doubles after every consecutive failure and goes back to the
/// initial value on [`Backoff::reset`].
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration) -> Self {
        Backoff {
            initial,
            current: initial,
        }
    }

    /// Wait to use for this failure; doubles the next one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.checked_mul(2).unwrap_or(Duration::MAX);
        delay
    }

    /// Wait the next failure would get
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Back to the initial wait after a successful start
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Sleep for the next delay. Returns `false` if `cancel` fired first.
    pub async fn wait(&mut self, name: &str, cancel: &CancellationToken) -> bool {
        let delay = self.next_delay();
        info!("{}: retrying in {:?}", name, delay);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(DEFAULT_INITIAL_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(2));
        let waits: Vec<_> = (0..4).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            waits,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ]
        );

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let mut backoff = Backoff::new(Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!backoff.wait("test", &cancel).await);

        let mut backoff = Backoff::new(Duration::from_millis(1));
        assert!(backoff.wait("test", &CancellationToken::new()).await);
        assert_eq!(backoff.current(), Duration::from_millis(2));
    }

    #[test]
    fn test_backoff_never_decreases() {
        let mut backoff = Backoff::new(Duration::from_secs(15));
        let mut last = Duration::ZERO;
        for _ in 0..100 {
            let wait = backoff.next_delay();
            assert!(wait >= last);
            last = wait;
        }
        assert_eq!(backoff.current(), Duration::MAX);
    }
}
