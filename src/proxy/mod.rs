//! Local proxy subsystems (HTTP proxy, Shadowsocks)

mod servers;

pub use servers::{ShadowsocksServer, TinyProxyServer};

use crate::config::ProxySettings;
use crate::loopstate::{
    apply_enablement, Ack, Backoff, HotReload, LoopSignals, LoopState, LoopStatus, LoopTimings,
    SettingsChange, SettingsStore, SETTINGS_UNCHANGED, SETTINGS_UPDATED,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A proxy daemon
#[async_trait]
pub trait ProxyServer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Serve until `cancel` fires, firing `ready` once listening
    async fn run(&self, settings: &ProxySettings, cancel: CancellationToken, ready: oneshot::Sender<()>) -> Result<()>;
}

impl HotReload for ProxySettings {
    fn enabled(&self) -> bool {
        self.enabled
    }
}

enum Served {
    Shutdown,
    Stopped,
    Crashed(Error),
}

/// Subsystem loop around one [`ProxyServer`]
pub struct ProxyLoop {
    state: LoopState,
    settings: SettingsStore<ProxySettings>,
    server: Arc<dyn ProxyServer>,
    timings: LoopTimings,
    signals: Mutex<Option<LoopSignals>>,
}

impl ProxyLoop {
    pub fn new(settings: ProxySettings, server: Arc<dyn ProxyServer>, timings: LoopTimings) -> Self {
        let (state, signals) = LoopState::new(server.name(), LoopStatus::Stopped);
        ProxyLoop {
            state,
            settings: SettingsStore::new(settings),
            server,
            timings,
            signals: Mutex::new(Some(signals)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.state.name()
    }

    pub fn status(&self) -> LoopStatus {
        self.state.status()
    }

    pub async fn apply_status(&self, cancel: &CancellationToken, status: LoopStatus) -> Result<String> {
        self.state.apply_status(cancel, status).await
    }

    pub fn get_settings(&self) -> ProxySettings {
        self.settings.get()
    }

    pub async fn set_settings(&self, cancel: &CancellationToken, settings: ProxySettings) -> Result<String> {
        match self.settings.update(settings) {
            SettingsChange::Unchanged => Ok(SETTINGS_UNCHANGED.to_string()),
            SettingsChange::Soft => Ok(SETTINGS_UPDATED.to_string()),
            SettingsChange::Restart {
                was_enabled,
                now_enabled,
            } => apply_enablement(&self.state, cancel, was_enabled, now_enabled).await,
        }
    }

    /// Worker task, runs until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut signals) = self.signals.lock().await.take() else {
            error!("{} loop is already running", self.name());
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

            loop {
                match self.serve(&cancel, &mut signals, &mut backoff, pending.take()).await {
                    Served::Shutdown => return,
                    Served::Stopped => break,
                    Served::Crashed(e) => {
                        error!("{} crashed: {}", self.name(), e);
                        if !backoff.wait(self.name(), &cancel).await {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn serve(
        &self,
        cancel: &CancellationToken,
        signals: &mut LoopSignals,
        backoff: &mut Backoff,
        pending: Option<Ack>,
    ) -> Served {
        let token = cancel.child_token();
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut task: JoinHandle<Result<()>> = {
            let server = self.server.clone();
            let settings = self.settings.get();
            let token = token.clone();
            tokio::spawn(async move { server.run(&settings, token, ready_tx).await })
        };

        // Ready, then still alive after the grace period
        let up = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.stop_task(&token, task).await;
                if let Some(ack) = pending {
                    ack.confirm(&self.state, LoopStatus::Stopped);
                }
                return Served::Shutdown;
            }
            joined = &mut task => Err(joined),
            ready = async {
                let ready = ready_rx.await;
                tokio::time::sleep(self.timings.grace).await;
                ready
            } => Ok(ready.is_ok()),
        };
        match up {
            Ok(true) => {}
            Ok(false) => {
                let joined = task.await;
                self.crash(pending);
                return Served::Crashed(exit_error(joined));
            }
            Err(joined) => {
                self.crash(pending);
                return Served::Crashed(exit_error(joined));
            }
        }

        backoff.reset();
        match pending {
            Some(ack) => ack.confirm(&self.state, LoopStatus::Running),
            None => self.state.set_status(LoopStatus::Running),
        }
        info!("{} is running", self.name());

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.stop_task(&token, task).await;
                    return Served::Shutdown;
                }
                Some(ack) = signals.stop.recv() => {
                    self.stop_task(&token, task).await;
                    ack.confirm(&self.state, LoopStatus::Stopped);
                    return Served::Stopped;
                }
                Some(ack) = signals.start.recv() => {
                    ack.confirm(&self.state, LoopStatus::Running);
                }
                joined = &mut task => {
                    self.crash(None);
                    return Served::Crashed(exit_error(joined));
                }
            }
        }
    }

    async fn stop_task(&self, token: &CancellationToken, task: JoinHandle<Result<()>>) {
        token.cancel();
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} stopped with error: {}", self.name(), e),
            Err(e) => warn!("{} task: {}", self.name(), e),
        }
    }

    fn crash(&self, pending: Option<Ack>) {
        match pending {
            Some(ack) => ack.confirm(&self.state, LoopStatus::Crashed),
            None => self.state.set_status(LoopStatus::Crashed),
        }
    }
}

fn exit_error(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Error {
    match joined {
        Ok(Ok(())) => Error::proxy("server exited"),
        Ok(Err(e)) => e,
        Err(e) => Error::internal(format!("proxy task: {}", e)),
    }
}
