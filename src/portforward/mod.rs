//! Port forwarding subsystem
//!
//! [`PortForwardService`] obtains a port from the provider's forwarding API,
//! opens it in the firewall, publishes it to a file and keeps it alive.
//! [`PortForwardLoop`] wraps the service in a subsystem loop driven by the VPN
//! loop (`tunnel_up`/`tunnel_down`) and by the control surface.
//!
//! The loop only ever settles in `Running` or `Stopped`: a failed forward or
//! keepalive is logged and the subsystem idles until the next start.

mod natpmp;
mod service;
mod state_file;

pub use natpmp::{NatPmpForwarder, NATPMP_PORT};
pub use service::{ForwardedPortState, PortForwardService};

use crate::config::PortForwardSettings;
use crate::firewall::Firewall;
use crate::loopstate::{
    apply_enablement, HotReload, LoopSignals, LoopState, LoopStatus, SettingsChange, SettingsStore,
    SETTINGS_UNCHANGED, SETTINGS_UPDATED,
};
use crate::tunnel::TunnelUpData;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// What a forwarder needs to know about the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardRequest {
    pub interface: String,
    pub server_name: String,
    pub gateway: Option<IpAddr>,
}

/// Provider specific port forwarding API
#[async_trait]
pub trait PortForwarder: Send + Sync {
    fn name(&self) -> &str;

    /// Obtain a forwarded port
    async fn port_forward(&self, request: &PortForwardRequest) -> Result<u16>;

    /// Keep `port` alive until `cancel` fires (`Ok`) or the port is lost (`Err`)
    async fn keep_port_forward(
        &self,
        request: &PortForwardRequest,
        port: u16,
        cancel: CancellationToken,
    ) -> Result<()>;
}

impl HotReload for PortForwardSettings {
    fn enabled(&self) -> bool {
        self.enabled
    }
}

/// Port forwarding subsystem loop
pub struct PortForwardLoop {
    state: LoopState,
    settings: SettingsStore<PortForwardSettings>,
    service: PortForwardService,
    tunnel: parking_lot::Mutex<Option<TunnelUpData>>,
    signals: Mutex<Option<LoopSignals>>,
}

enum Exit {
    Shutdown,
    Idle,
}

impl PortForwardLoop {
    pub fn new(settings: PortForwardSettings, firewall: Arc<dyn Firewall>) -> Self {
        let (state, signals) = LoopState::new("port forwarding", LoopStatus::Stopped);
        PortForwardLoop {
            state,
            settings: SettingsStore::new(settings),
            service: PortForwardService::new(firewall),
            tunnel: parking_lot::Mutex::new(None),
            signals: Mutex::new(Some(signals)),
        }
    }

    pub fn status(&self) -> LoopStatus {
        self.state.status()
    }

    pub async fn apply_status(&self, cancel: &CancellationToken, status: LoopStatus) -> Result<String> {
        self.state.apply_status(cancel, status).await
    }

    pub fn get_settings(&self) -> PortForwardSettings {
        self.settings.get()
    }

    pub async fn set_settings(&self, cancel: &CancellationToken, settings: PortForwardSettings) -> Result<String> {
        match self.settings.update(settings) {
            SettingsChange::Unchanged => Ok(SETTINGS_UNCHANGED.to_string()),
            SettingsChange::Soft => Ok(SETTINGS_UPDATED.to_string()),
            SettingsChange::Restart {
                was_enabled,
                now_enabled,
            } => apply_enablement(&self.state, cancel, was_enabled, now_enabled).await,
        }
    }

    /// Forwarded port, 0 when none
    pub fn port(&self) -> u16 {
        self.service.port()
    }

    /// Remember the tunnel that a following start forwards through
    pub fn tunnel_up(&self, data: TunnelUpData) {
        *self.tunnel.lock() = Some(data);
    }

    /// Forget the tunnel and make sure nothing stays forwarded.
    ///
    /// The port is gone once this returns, even if `cancel` already fired.
    pub async fn tunnel_down(&self, cancel: &CancellationToken) -> Result<()> {
        self.tunnel.lock().take();
        if let Err(e) = self.state.apply_status(cancel, LoopStatus::Stopped).await {
            warn!("Stopping port forwarding: {}", e);
        }
        self.service.stop().await
    }

    /// Worker task, runs until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut signals) = self.signals.lock().await.take() else {
            error!("Port forwarding loop is already running");
            return;
        };

        loop {
            let ack = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                Some(ack) = signals.start.recv() => ack,
                Some(ack) = signals.stop.recv() => {
                    ack.confirm(&self.state, LoopStatus::Stopped);
                    continue;
                }
            };

            let tunnel = self.tunnel.lock().clone();
            let Some(tunnel) = tunnel else {
                info!("Port forwarding waits for the VPN tunnel to be up");
                ack.confirm(&self.state, LoopStatus::Stopped);
                continue;
            };

            let failed = match self.service.start(&self.settings.get(), &tunnel).await {
                Ok(Some(failed)) => failed,
                Ok(None) => {
                    ack.confirm(&self.state, LoopStatus::Stopped);
                    continue;
                }
                Err(e) => {
                    error!("Port forwarding failed to start: {}", e);
                    ack.confirm(&self.state, LoopStatus::Stopped);
                    continue;
                }
            };
            ack.confirm(&self.state, LoopStatus::Running);

            if let Exit::Shutdown = self.run_forwarded(&cancel, &mut signals, &tunnel, failed).await {
                return;
            }
        }
    }

    async fn run_forwarded(
        &self,
        cancel: &CancellationToken,
        signals: &mut LoopSignals,
        tunnel: &TunnelUpData,
        mut failed: oneshot::Receiver<Error>,
    ) -> Exit {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.stop_service().await;
                    return Exit::Shutdown;
                }
                Some(ack) = signals.stop.recv() => {
                    self.stop_service().await;
                    ack.confirm(&self.state, LoopStatus::Stopped);
                    return Exit::Idle;
                }
                Some(ack) = signals.start.recv() => {
                    ack.confirm(&self.state, LoopStatus::Running);
                }
                _ = tunnel.tunnel_token.cancelled() => {
                    info!("VPN tunnel went down, stopping port forwarding");
                    self.stop_service().await;
                    self.settle_stopped();
                    return Exit::Idle;
                }
                result = &mut failed => {
                    if let Ok(e) = result {
                        warn!("Port forwarding stopped: {}", e);
                    }
                    self.stop_service().await;
                    self.settle_stopped();
                    return Exit::Idle;
                }
            }
        }
    }

    async fn stop_service(&self) {
        if let Err(e) = self.service.stop().await {
            warn!("Port forwarding cleanup: {}", e);
        }
    }

    /// Worker-initiated stop; a pending caller stop confirms on its own
    fn settle_stopped(&self) {
        let mut status = self.state.lock();
        if *status == LoopStatus::Running {
            *status = LoopStatus::Stopped;
        }
    }
}
