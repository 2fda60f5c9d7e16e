//! Settings store and hot-reload protocol
//!
//! Settings sit behind their own lock, independent from the status lock, so a
//! status reader never waits on a settings writer. Updating settings returns a
//! [`SettingsChange`] telling the subsystem what to do about it; most changes
//! end in [`apply_enablement`], which issues the smallest `apply_status`
//! sequence for the enabled flag transition.

use super::{LoopState, LoopStatus};
use crate::Result;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outcome when the new settings equal the current ones
pub const SETTINGS_UNCHANGED: &str = "settings left unchanged";

/// Outcome when only the periodic update interval changed
pub const UPDATE_PERIOD_CHANGED: &str = "update period changed";

/// Outcome after a regular settings update
pub const SETTINGS_UPDATED: &str = "settings updated";

/// Settings that can be hot reloaded
pub trait HotReload: Clone + PartialEq + Send + Sync {
    /// Whether the subsystem should be running
    fn enabled(&self) -> bool;

    /// True when `new` differs from `self` only in fields that can be applied
    /// without restarting the subsystem.
    fn is_soft_change(&self, _new: &Self) -> bool {
        false
    }
}

/// What a settings update requires from the subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsChange {
    /// Structurally equal, nothing stored
    Unchanged,
    /// Stored; apply through the subsystem's lightweight signal
    Soft,
    /// Stored; run the enablement transition
    Restart { was_enabled: bool, now_enabled: bool },
}

/// Read/write guarded settings value
pub struct SettingsStore<T> {
    inner: RwLock<T>,
}

impl<T: HotReload> SettingsStore<T> {
    pub fn new(settings: T) -> Self {
        SettingsStore {
            inner: RwLock::new(settings),
        }
    }

    /// Snapshot of the current settings
    pub fn get(&self) -> T {
        self.inner.read().clone()
    }

    /// Compare, store and classify an update in one critical section
    pub fn update(&self, new: T) -> SettingsChange {
        let mut current = self.inner.write();
        if *current == new {
            return SettingsChange::Unchanged;
        }

        let change = if current.is_soft_change(&new) {
            SettingsChange::Soft
        } else {
            SettingsChange::Restart {
                was_enabled: current.enabled(),
                now_enabled: new.enabled(),
            }
        };
        *current = new;
        change
    }
}

/// Issue the minimal status sequence for an enabled flag transition.
///
/// | before   | after    | calls               |
/// |----------|----------|---------------------|
/// | disabled | disabled | none                |
/// | enabled  | enabled  | `Stopped`, `Running`|
/// | disabled | enabled  | `Running`           |
/// | enabled  | disabled | `Stopped`           |
pub async fn apply_enablement(
    state: &LoopState,
    cancel: &CancellationToken,
    was_enabled: bool,
    now_enabled: bool,
) -> Result<String> {
    match (was_enabled, now_enabled) {
        (false, false) => {}
        (true, true) => {
            let stopped = state.apply_status(cancel, LoopStatus::Stopped).await?;
            let started = state.apply_status(cancel, LoopStatus::Running).await?;
            debug!("{} restarted: {}, {}", state.name(), stopped, started);
        }
        (false, true) => {
            let started = state.apply_status(cancel, LoopStatus::Running).await?;
            debug!("{} enabled: {}", state.name(), started);
        }
        (true, false) => {
            let stopped = state.apply_status(cancel, LoopStatus::Stopped).await?;
            debug!("{} disabled: {}", state.name(), stopped);
        }
    }
    Ok(SETTINGS_UPDATED.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopstate::LoopSignals;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Sample {
        enabled: bool,
        period: Duration,
        upstream: String,
    }

    impl HotReload for Sample {
        fn enabled(&self) -> bool {
            self.enabled
        }

        fn is_soft_change(&self, new: &Self) -> bool {
            let mut patched = self.clone();
            patched.period = new.period;
            patched == *new
        }
    }

    fn sample(enabled: bool) -> Sample {
        Sample {
            enabled,
            period: Duration::from_secs(60),
            upstream: "1.1.1.1".to_string(),
        }
    }

    /// Records every request the worker receives
    fn spawn_recorder(state: Arc<LoopState>, mut signals: LoopSignals) -> Arc<Mutex<Vec<&'static str>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorded = log.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(ack) = signals.start.recv() => {
                        recorded.lock().push("start");
                        ack.confirm(&state, LoopStatus::Running);
                    }
                    Some(ack) = signals.stop.recv() => {
                        recorded.lock().push("stop");
                        ack.confirm(&state, LoopStatus::Stopped);
                    }
                    else => break,
                }
            }
        });
        log
    }

    #[test]
    fn test_update_classification() {
        let store = SettingsStore::new(sample(true));
        assert_eq!(store.update(sample(true)), SettingsChange::Unchanged);

        let mut faster = sample(true);
        faster.period = Duration::from_secs(5);
        assert_eq!(store.update(faster.clone()), SettingsChange::Soft);
        assert_eq!(store.get(), faster);

        let mut other = faster.clone();
        other.upstream = "9.9.9.9".to_string();
        assert_eq!(
            store.update(other),
            SettingsChange::Restart { was_enabled: true, now_enabled: true }
        );

        assert_eq!(
            store.update(sample(false)),
            SettingsChange::Restart { was_enabled: true, now_enabled: false }
        );
    }

    #[tokio::test]
    async fn test_enablement_transitions() {
        let cancel = CancellationToken::new();
        let (state, signals) = LoopState::new("test", LoopStatus::Stopped);
        let state = Arc::new(state);
        let log = spawn_recorder(state.clone(), signals);

        let outcome = apply_enablement(&state, &cancel, false, false).await.unwrap();
        assert_eq!(outcome, SETTINGS_UPDATED);
        assert!(log.lock().is_empty());

        apply_enablement(&state, &cancel, false, true).await.unwrap();
        assert_eq!(*log.lock(), vec!["start"]);
        assert_eq!(state.status(), LoopStatus::Running);

        apply_enablement(&state, &cancel, true, true).await.unwrap();
        assert_eq!(*log.lock(), vec!["start", "stop", "start"]);
        assert_eq!(state.status(), LoopStatus::Running);

        apply_enablement(&state, &cancel, true, false).await.unwrap();
        assert_eq!(*log.lock(), vec!["start", "stop", "start", "stop"]);
        assert_eq!(state.status(), LoopStatus::Stopped);
    }
}
