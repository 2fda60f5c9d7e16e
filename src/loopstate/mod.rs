//! Loop state machine shared by every subsystem
//!
//! Each subsystem (VPN tunnel, DNS, port forwarding, proxies) runs one worker
//! task and owns one [`LoopState`]. Callers request transitions with
//! [`LoopState::apply_status`]; the worker receives the request on its
//! [`LoopSignals`] and answers through the attached [`Ack`] once it has really
//! reached the new status.
//!
//! ```text
//!  caller                         LoopState                     worker
//!    | apply_status(Running)          |                            |
//!    |------------------------------->| status = Starting          |
//!    |                                |--- start(Ack) ------------>|
//!    |                                |                            | ... starts ...
//!    |                                |<-- Ack::confirm(Running) --| status = Running
//!    |<------------- "Running" -------|                            |
//! ```
//!
//! Worker-side transitions that nobody asked for (a crash, a recovery after a
//! crash) go through [`LoopState::set_status`] directly.

mod backoff;
mod settings;
mod status;

pub use backoff::{Backoff, LoopTimings, DEFAULT_GRACE_PERIOD, DEFAULT_INITIAL_BACKOFF};
pub use settings::{
    apply_enablement, HotReload, SettingsChange, SettingsStore, SETTINGS_UNCHANGED,
    SETTINGS_UPDATED, UPDATE_PERIOD_CHANGED,
};
pub use status::LoopStatus;

use crate::{Error, Result};
use parking_lot::{RwLock, RwLockWriteGuard};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reply handle travelling with every start or stop request.
///
/// Dropping it without confirming makes the waiting caller fail, so workers
/// confirm on every exit path.
#[derive(Debug)]
pub struct Ack {
    tx: oneshot::Sender<LoopStatus>,
}

impl Ack {
    fn new() -> (Self, oneshot::Receiver<LoopStatus>) {
        let (tx, rx) = oneshot::channel();
        (Ack { tx }, rx)
    }

    /// Commit the reached status and wake the caller if it is still waiting.
    pub fn confirm(self, state: &LoopState, status: LoopStatus) {
        state.set_status(status);
        if self.tx.send(status).is_err() {
            debug!("{} loop: requester stopped waiting, status {} kept", state.name(), status);
        }
    }
}

/// Worker half of a loop's signal channels
pub struct LoopSignals {
    pub start: mpsc::Receiver<Ack>,
    pub stop: mpsc::Receiver<Ack>,
}

/// Status and request channels of one subsystem loop
pub struct LoopState {
    name: &'static str,
    status: RwLock<LoopStatus>,
    /// Serializes `apply_status` callers
    apply: Mutex<()>,
    start: mpsc::Sender<Ack>,
    stop: mpsc::Sender<Ack>,
}

impl LoopState {
    /// Create the state and the worker-side signal receivers
    pub fn new(name: &'static str, initial: LoopStatus) -> (Self, LoopSignals) {
        let (start_tx, start_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let state = LoopState {
            name,
            status: RwLock::new(initial),
            apply: Mutex::new(()),
            start: start_tx,
            stop: stop_tx,
        };
        let signals = LoopSignals {
            start: start_rx,
            stop: stop_rx,
        };
        (state, signals)
    }

    /// Subsystem name used in logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current status
    pub fn status(&self) -> LoopStatus {
        *self.status.read()
    }

    /// Set the status without a caller handshake (worker use only)
    pub fn set_status(&self, status: LoopStatus) {
        let mut current = self.status.write();
        if *current != status {
            debug!("{} loop: {} -> {}", self.name, *current, status);
            *current = status;
        }
    }

    /// Hold the status lock for a read-modify-write by the worker.
    ///
    /// Never hold the guard across an await point.
    pub fn lock(&self) -> RwLockWriteGuard<'_, LoopStatus> {
        self.status.write()
    }

    /// Request a transition to `Running` or `Stopped`.
    ///
    /// Returns a short outcome such as `"Running"` or `"already Crashed"`.
    /// If `cancel` fires while waiting for the worker, the provisional status
    /// (`Starting`/`Stopping`) is returned and the worker settles the real one.
    pub async fn apply_status(&self, cancel: &CancellationToken, status: LoopStatus) -> Result<String> {
        if !matches!(status, LoopStatus::Running | LoopStatus::Stopped) {
            return Err(Error::invalid_status(format!(
                "{} loop cannot be set to {}",
                self.name, status
            )));
        }

        let _serial = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(self.status().to_string()),
            guard = self.apply.lock() => guard,
        };

        let (signal, provisional) = match status {
            LoopStatus::Running => (&self.start, LoopStatus::Starting),
            _ => (&self.stop, LoopStatus::Stopping),
        };

        let previous = {
            let mut current = self.status.write();
            let accepted = match status {
                LoopStatus::Running => current.can_start(),
                _ => current.can_stop(),
            };
            if !accepted {
                return Ok(format!("already {}", *current));
            }
            let previous = *current;
            *current = provisional;
            previous
        };

        self.handshake(cancel, signal, previous, provisional).await
    }

    async fn handshake(
        &self,
        cancel: &CancellationToken,
        signal: &mpsc::Sender<Ack>,
        previous: LoopStatus,
        provisional: LoopStatus,
    ) -> Result<String> {
        let (ack, mut reply) = Ack::new();

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            sent = signal.send(ack) => Some(sent.is_ok()),
        };
        match sent {
            None => {
                // Nothing reached the worker, so nothing changed
                self.set_status(previous);
                return Ok(previous.to_string());
            }
            Some(false) => {
                self.set_status(previous);
                return Err(Error::internal(format!("{} loop worker is not running", self.name)));
            }
            Some(true) => {}
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                reply.close();
                match reply.try_recv() {
                    Ok(reached) => Ok(reached.to_string()),
                    Err(_) => Ok(provisional.to_string()),
                }
            }
            reported = &mut reply => match reported {
                Ok(reached) => Ok(reached.to_string()),
                Err(_) => {
                    self.set_status(LoopStatus::Stopped);
                    Err(Error::internal(format!(
                        "{} loop worker exited before confirming {}",
                        self.name, provisional
                    )))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Worker that confirms every request with the requested end state
    fn spawn_echo_worker(state: Arc<LoopState>, mut signals: LoopSignals, starts: Arc<AtomicUsize>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(ack) = signals.start.recv() => {
                        starts.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        ack.confirm(&state, LoopStatus::Running);
                    }
                    Some(ack) = signals.stop.recv() => ack.confirm(&state, LoopStatus::Stopped),
                    else => break,
                }
            }
        });
    }

    #[tokio::test]
    async fn test_apply_running_handshake() {
        let (state, signals) = LoopState::new("test", LoopStatus::Stopped);
        let state = Arc::new(state);
        let starts = Arc::new(AtomicUsize::new(0));
        spawn_echo_worker(state.clone(), signals, starts.clone());

        let cancel = CancellationToken::new();
        let outcome = state.apply_status(&cancel, LoopStatus::Running).await.unwrap();
        assert_eq!(outcome, "Running");
        assert_eq!(state.status(), LoopStatus::Running);

        let outcome = state.apply_status(&cancel, LoopStatus::Stopped).await.unwrap();
        assert_eq!(outcome, "Stopped");
        assert_eq!(state.status(), LoopStatus::Stopped);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_status_never_signals() {
        let cancel = CancellationToken::new();
        for existing in [
            LoopStatus::Running,
            LoopStatus::Starting,
            LoopStatus::Stopping,
            LoopStatus::Crashed,
        ] {
            let (state, mut signals) = LoopState::new("test", existing);
            let outcome = state.apply_status(&cancel, LoopStatus::Running).await.unwrap();
            assert_eq!(outcome, format!("already {}", existing));
            assert!(signals.start.try_recv().is_err());
            assert_eq!(state.status(), existing);
        }
    }

    #[tokio::test]
    async fn test_stop_when_not_running_short_circuits() {
        let cancel = CancellationToken::new();
        let (state, mut signals) = LoopState::new("test", LoopStatus::Crashed);
        let outcome = state.apply_status(&cancel, LoopStatus::Stopped).await.unwrap();
        assert_eq!(outcome, "already Crashed");
        assert!(signals.stop.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_apply_invalid_status() {
        let cancel = CancellationToken::new();
        let (state, _signals) = LoopState::new("test", LoopStatus::Stopped);
        let err = state.apply_status(&cancel, LoopStatus::Crashed).await.unwrap_err();
        assert!(matches!(err, Error::InvalidStatus(_)));
        assert_eq!(state.status(), LoopStatus::Stopped);
    }

    #[tokio::test]
    async fn test_cancelled_wait_returns_provisional() {
        let (state, mut signals) = LoopState::new("test", LoopStatus::Stopped);
        let state = Arc::new(state);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcome = state.apply_status(&cancel, LoopStatus::Running).await.unwrap();
        assert_eq!(outcome, "Starting");
        assert_eq!(state.status(), LoopStatus::Starting);

        // The worker settles the real status later on
        let ack = signals.start.recv().await.unwrap();
        ack.confirm(&state, LoopStatus::Running);
        assert_eq!(state.status(), LoopStatus::Running);
    }

    #[tokio::test]
    async fn test_concurrent_starts_single_handshake() {
        let (state, signals) = LoopState::new("test", LoopStatus::Stopped);
        let state = Arc::new(state);
        let starts = Arc::new(AtomicUsize::new(0));
        spawn_echo_worker(state.clone(), signals, starts.clone());

        let cancel = CancellationToken::new();
        let (a, b) = tokio::join!(
            state.apply_status(&cancel, LoopStatus::Running),
            state.apply_status(&cancel, LoopStatus::Running),
        );
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort();
        assert_eq!(outcomes, vec!["Running".to_string(), "already Running".to_string()]);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_gone() {
        let (state, signals) = LoopState::new("test", LoopStatus::Stopped);
        drop(signals);
        let cancel = CancellationToken::new();
        let result = state.apply_status(&cancel, LoopStatus::Running).await;
        assert!(matches!(result, Err(Error::Internal(_))));
        assert_eq!(state.status(), LoopStatus::Stopped);
    }
}
