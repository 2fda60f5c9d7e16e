//! DNS subsystem
//!
//! Supervises the local resolver with crash backoff and refreshes its block
//! lists every `update-period`. Changing only the period resets the update
//! ticker instead of restarting the resolver.

mod unbound;

pub use unbound::UnboundServer;

use crate::config::DnsSettings;
use crate::loopstate::{
    apply_enablement, Ack, Backoff, HotReload, LoopSignals, LoopState, LoopStatus, LoopTimings,
    SettingsChange, SettingsStore, SETTINGS_UNCHANGED, UPDATE_PERIOD_CHANGED,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Local DNS resolver
#[async_trait]
pub trait DnsServer: Send + Sync {
    /// Serve until `cancel` fires, firing `ready` once queries are answered
    async fn run(&self, settings: &DnsSettings, cancel: CancellationToken, ready: oneshot::Sender<()>) -> Result<()>;

    /// Refresh block lists and other downloaded data
    async fn update(&self, settings: &DnsSettings, cancel: &CancellationToken) -> Result<()>;
}

impl HotReload for DnsSettings {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn is_soft_change(&self, new: &Self) -> bool {
        let mut patched = self.clone();
        patched.update_period = new.update_period;
        patched == *new
    }
}

enum Served {
    Shutdown,
    Stopped,
    Restart,
    Crashed(Error),
}

type ServerTask = JoinHandle<Result<()>>;

/// DNS subsystem loop
pub struct DnsLoop {
    state: LoopState,
    settings: SettingsStore<DnsSettings>,
    server: Arc<dyn DnsServer>,
    period_changed: Notify,
    timings: LoopTimings,
    signals: Mutex<Option<LoopSignals>>,
}

impl DnsLoop {
    pub fn new(settings: DnsSettings, server: Arc<dyn DnsServer>, timings: LoopTimings) -> Self {
        let (state, signals) = LoopState::new("dns", LoopStatus::Stopped);
        DnsLoop {
            state,
            settings: SettingsStore::new(settings),
            server,
            period_changed: Notify::new(),
            timings,
            signals: Mutex::new(Some(signals)),
        }
    }

    pub fn status(&self) -> LoopStatus {
        self.state.status()
    }

    pub async fn apply_status(&self, cancel: &CancellationToken, status: LoopStatus) -> Result<String> {
        self.state.apply_status(cancel, status).await
    }

    pub fn get_settings(&self) -> DnsSettings {
        self.settings.get()
    }

    pub async fn set_settings(&self, cancel: &CancellationToken, settings: DnsSettings) -> Result<String> {
        match self.settings.update(settings) {
            SettingsChange::Unchanged => Ok(SETTINGS_UNCHANGED.to_string()),
            SettingsChange::Soft => {
                self.period_changed.notify_one();
                Ok(UPDATE_PERIOD_CHANGED.to_string())
            }
            SettingsChange::Restart {
                was_enabled,
                now_enabled,
            } => apply_enablement(&self.state, cancel, was_enabled, now_enabled).await,
        }
    }

    /// Worker task, runs until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut signals) = self.signals.lock().await.take() else {
            error!("DNS loop is already running");
            return;
        };
        let mut backoff = Backoff::new(self.timings.initial_backoff);

        loop {
            let mut pending = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                Some(ack) = signals.start.recv() => Some(ack),
                Some(ack) = signals.stop.recv() => {
                    ack.confirm(&self.state, LoopStatus::Stopped);
                    continue;
                }
            };

            self.update(&cancel).await;

            loop {
                match self.serve(&cancel, &mut signals, &mut backoff, pending.take()).await {
                    Served::Shutdown => return,
                    Served::Stopped => break,
                    Served::Restart => {}
                    Served::Crashed(e) => {
                        error!("DNS server crashed: {}", e);
                        if !backoff.wait("dns", &cancel).await {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn update(&self, cancel: &CancellationToken) {
        let settings = self.settings.get();
        if settings.block_lists.is_empty() {
            return;
        }
        info!("Updating DNS block lists");
        if let Err(e) = self.server.update(&settings, cancel).await {
            warn!("DNS update failed: {}", e);
        }
    }

    async fn serve(
        &self,
        cancel: &CancellationToken,
        signals: &mut LoopSignals,
        backoff: &mut Backoff,
        pending: Option<Ack>,
    ) -> Served {
        let settings = self.settings.get();
        let token = cancel.child_token();
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut task: ServerTask = {
            let server = self.server.clone();
            let settings = settings.clone();
            let token = token.clone();
            tokio::spawn(async move { server.run(&settings, token, ready_tx).await })
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                stop_task(&token, task).await;
                if let Some(ack) = pending {
                    ack.confirm(&self.state, LoopStatus::Stopped);
                }
                return Served::Shutdown;
            }
            ready = ready_rx => {
                if ready.is_err() {
                    let err = exit_error(task.await);
                    self.crash(pending);
                    return Served::Crashed(err);
                }
            }
        }

        backoff.reset();
        match pending {
            Some(ack) => ack.confirm(&self.state, LoopStatus::Running),
            None => self.state.set_status(LoopStatus::Running),
        }
        info!("DNS server is ready");

        let mut ticker = update_ticker(settings.update_period);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stop_task(&token, task).await;
                    return Served::Shutdown;
                }
                Some(ack) = signals.stop.recv() => {
                    stop_task(&token, task).await;
                    ack.confirm(&self.state, LoopStatus::Stopped);
                    return Served::Stopped;
                }
                Some(ack) = signals.start.recv() => {
                    ack.confirm(&self.state, LoopStatus::Running);
                }
                _ = self.period_changed.notified() => {
                    let period = self.settings.get().update_period;
                    info!("DNS update period changed to {:?}", period);
                    ticker = update_ticker(period);
                }
                _ = tick(&mut ticker) => {
                    self.update(cancel).await;
                    stop_task(&token, task).await;
                    return Served::Restart;
                }
                joined = &mut task => {
                    self.crash(None);
                    return Served::Crashed(exit_error(joined));
                }
            }
        }
    }

    fn crash(&self, pending: Option<Ack>) {
        match pending {
            Some(ack) => ack.confirm(&self.state, LoopStatus::Crashed),
            None => self.state.set_status(LoopStatus::Crashed),
        }
    }
}

async fn stop_task(token: &CancellationToken, task: ServerTask) {
    token.cancel();
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("DNS server stopped with error: {}", e),
        Err(e) => warn!("DNS server task: {}", e),
    }
}

fn exit_error(joined: std::result::Result<Result<()>, JoinError>) -> Error {
    match joined {
        Ok(Ok(())) => Error::dns("server exited"),
        Ok(Err(e)) => e,
        Err(e) => Error::internal(format!("DNS server task: {}", e)),
    }
}

fn update_ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
