//! VPN tunnel orchestrator
//!
//! One worker task drives every tunnel attempt:
//!
//! 1. wait for a start request (or shutdown)
//! 2. resolve provider and connection, render the config, open the firewall
//!    for the server and prepare the tunnel runner
//! 3. run the tunnel and give it a short grace period to fail right away
//! 4. report `Running`, then react to tunnel-ready (dependent subsystems),
//!    shutdown, stop, restart and tunnel failure
//!
//! Setup and runtime failures end in cleanup, `Crashed` and an exponential
//! backoff before the next attempt. Nothing a tunnel attempt does is fatal to
//! the process.

mod tunnel_up;

use crate::common::SharedClient;
use crate::config::VpnSettings;
use crate::dns::DnsLoop;
use crate::firewall::Firewall;
use crate::loopstate::{
    apply_enablement, Ack, Backoff, HotReload, LoopSignals, LoopState, LoopStatus, LoopTimings,
    SettingsChange, SettingsStore, SETTINGS_UNCHANGED, SETTINGS_UPDATED,
};
use crate::portforward::PortForwardLoop;
use crate::provider::{Connection, Provider, Providers};
use crate::publicip::PublicIp;
use crate::tunnel::{TunnelLauncher, TunnelRunner};
use crate::version::VersionNotice;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

impl HotReload for VpnSettings {
    fn enabled(&self) -> bool {
        self.enabled
    }
}

/// Everything the VPN loop drives besides the tunnel itself
#[derive(Clone)]
pub struct Collaborators {
    pub providers: Providers,
    pub launcher: Arc<dyn TunnelLauncher>,
    pub firewall: Arc<dyn Firewall>,
    pub dns: Arc<DnsLoop>,
    pub port_forward: Arc<PortForwardLoop>,
    pub public_ip: Arc<PublicIp>,
    pub version: Arc<VersionNotice>,
    pub client: Arc<SharedClient>,
}

/// How one attempt ended
enum Attempt {
    Shutdown,
    Stopped,
    /// A start request arrived while running
    Restart(Ack),
    Crashed(Error),
}

type TunnelTask = JoinHandle<Result<()>>;

/// VPN subsystem loop
pub struct VpnLoop {
    state: LoopState,
    settings: SettingsStore<VpnSettings>,
    deps: Collaborators,
    /// Opened on the tunnel interface once it is up
    input_ports: Vec<u16>,
    timings: LoopTimings,
    signals: Mutex<Option<LoopSignals>>,
}

impl VpnLoop {
    pub fn new(settings: VpnSettings, deps: Collaborators, timings: LoopTimings) -> Self {
        let (state, signals) = LoopState::new("vpn", LoopStatus::Stopped);
        VpnLoop {
            state,
            settings: SettingsStore::new(settings),
            deps,
            input_ports: Vec::new(),
            timings,
            signals: Mutex::new(Some(signals)),
        }
    }

    pub fn with_input_ports(mut self, ports: Vec<u16>) -> Self {
        self.input_ports = ports;
        self
    }

    pub fn status(&self) -> LoopStatus {
        self.state.status()
    }

    pub async fn apply_status(&self, cancel: &CancellationToken, status: LoopStatus) -> Result<String> {
        self.state.apply_status(cancel, status).await
    }

    pub fn get_settings(&self) -> VpnSettings {
        self.settings.get()
    }

    /// Store new settings; any change restarts a running tunnel
    pub async fn set_settings(&self, cancel: &CancellationToken, settings: VpnSettings) -> Result<String> {
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
            error!("VPN loop is already running");
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
                match self.attempt(&cancel, &mut signals, &mut backoff, pending.take()).await {
                    Attempt::Shutdown => return,
                    Attempt::Stopped => break,
                    Attempt::Restart(ack) => pending = Some(ack),
                    Attempt::Crashed(e) => {
                        error!("VPN: {}", e);
                        if !backoff.wait("vpn", &cancel).await {
                            return;
                        }
                        // Disabled while crashed: the stop request only got "already Crashed"
                        if !self.settings.get().enabled {
                            info!("VPN is disabled, not reconnecting");
                            self.state.set_status(LoopStatus::Stopped);
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn setup(&self, settings: &VpnSettings) -> Result<(Connection, Arc<dyn Provider>, Box<dyn TunnelRunner>)> {
        let provider = self.deps.providers.get(settings.provider.name)?;
        let connection = provider.get_connection(settings)?;
        info!("Connecting to {}", connection);

        let config = provider.build_tunnel_config(&connection, settings)?;
        self.deps
            .firewall
            .set_vpn_connection(&connection, settings.interface())
            .await?;
        let runner = self.deps.launcher.prepare(&connection, &config, settings).await?;
        Ok((connection, provider, runner))
    }

    async fn attempt(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        signals: &mut LoopSignals,
        backoff: &mut Backoff,
        pending: Option<Ack>,
    ) -> Attempt {
        let settings = self.settings.get();
        let (connection, provider, runner) = match self.setup(&settings).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.cleanup(cancel).await;
                self.crash(pending);
                return Attempt::Crashed(e);
            }
        };

        let tunnel_token = cancel.child_token();
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut task: TunnelTask = {
            let token = tunnel_token.clone();
            tokio::spawn(async move { runner.run(token, ready_tx).await })
        };

        let early_exit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.teardown(&tunnel_token, Some(task), None, cancel).await;
                if let Some(ack) = pending {
                    ack.confirm(&self.state, LoopStatus::Stopped);
                }
                return Attempt::Shutdown;
            }
            joined = &mut task => Some(joined),
            _ = tokio::time::sleep(self.timings.grace) => None,
        };
        if let Some(joined) = early_exit {
            self.teardown(&tunnel_token, None, None, cancel).await;
            self.crash(pending);
            return Attempt::Crashed(exit_error(joined));
        }

        backoff.reset();
        match pending {
            Some(ack) => ack.confirm(&self.state, LoopStatus::Running),
            None => self.state.set_status(LoopStatus::Running),
        }

        let mut ready_rx = Some(ready_rx);
        let mut up_task: Option<JoinHandle<()>> = None;
        loop {
            tokio::select! {
                biased;
                ready = wait_ready(&mut ready_rx) => {
                    ready_rx = None;
                    if ready {
                        info!("VPN tunnel is up on {}", settings.interface());
                        up_task = Some(tokio::spawn(self.clone().on_tunnel_up(
                            connection.clone(),
                            provider.clone(),
                            settings.interface().to_string(),
                            tunnel_token.clone(),
                        )));
                    }
                }
                _ = cancel.cancelled() => {
                    self.teardown(&tunnel_token, Some(task), up_task, cancel).await;
                    return Attempt::Shutdown;
                }
                Some(ack) = signals.stop.recv() => {
                    self.teardown(&tunnel_token, Some(task), up_task, cancel).await;
                    ack.confirm(&self.state, LoopStatus::Stopped);
                    return Attempt::Stopped;
                }
                Some(ack) = signals.start.recv() => {
                    info!("Restarting VPN tunnel");
                    self.teardown(&tunnel_token, Some(task), up_task, cancel).await;
                    return Attempt::Restart(ack);
                }
                joined = &mut task => {
                    let err = exit_error(joined);
                    self.teardown(&tunnel_token, None, up_task, cancel).await;
                    self.state.set_status(LoopStatus::Crashed);
                    return Attempt::Crashed(err);
                }
            }
        }
    }

    /// Stop the tunnel and everything hanging off it
    async fn teardown(
        &self,
        tunnel_token: &CancellationToken,
        task: Option<TunnelTask>,
        up_task: Option<JoinHandle<()>>,
        cancel: &CancellationToken,
    ) {
        tunnel_token.cancel();
        if let Some(up_task) = up_task {
            if let Err(e) = up_task.await {
                warn!("VPN tunnel-up task: {}", e);
            }
        }
        if let Some(task) = task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("VPN tunnel stopped with error: {}", e),
                Err(e) => warn!("VPN tunnel task: {}", e),
            }
        }
        self.cleanup(cancel).await;
    }

    fn crash(&self, pending: Option<Ack>) {
        match pending {
            Some(ack) => ack.confirm(&self.state, LoopStatus::Crashed),
            None => self.state.set_status(LoopStatus::Crashed),
        }
    }
}

/// Resolves once with whether the tunnel reported ready, then never again
async fn wait_ready(ready: &mut Option<oneshot::Receiver<()>>) -> bool {
    match ready {
        Some(rx) => rx.await.is_ok(),
        None => std::future::pending().await,
    }
}

fn exit_error(joined: std::result::Result<Result<()>, JoinError>) -> Error {
    match joined {
        Ok(Ok(())) => Error::tunnel("tunnel exited"),
        Ok(Err(e)) => e,
        Err(e) => Error::internal(format!("VPN tunnel task: {}", e)),
    }
}
