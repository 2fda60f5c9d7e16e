//! Forwarded port acquisition and keepalive

use super::{state_file, PortForwardRequest};
use crate::config::PortForwardSettings;
use crate::firewall::Firewall;
use crate::tunnel::TunnelUpData;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Currently forwarded port and where it is published
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedPortState {
    /// 0 when nothing is forwarded
    pub port: u16,
    pub filepath: PathBuf,
    pub interface: String,
}

struct Keepalive {
    cancel: CancellationToken,
    done: JoinHandle<()>,
}

/// Owns the forwarded port for the lifetime of one tunnel
pub struct PortForwardService {
    firewall: Arc<dyn Firewall>,
    state: Arc<RwLock<ForwardedPortState>>,
    /// Held by `start` and `stop` for their whole duration
    keepalive: Mutex<Option<Keepalive>>,
}

impl PortForwardService {
    pub fn new(firewall: Arc<dyn Firewall>) -> Self {
        PortForwardService {
            firewall,
            state: Arc::new(RwLock::new(ForwardedPortState::default())),
            keepalive: Mutex::new(None),
        }
    }

    /// Forwarded port, 0 when none
    pub fn port(&self) -> u16 {
        self.state.read().port
    }

    pub fn state(&self) -> ForwardedPortState {
        self.state.read().clone()
    }

    /// Obtain a port and keep it alive in the background.
    ///
    /// Returns `Ok(None)` without touching anything when forwarding is
    /// disabled. Otherwise the returned receiver yields the error that ended
    /// the keepalive, after its firewall rule and state file were removed.
    /// It never yields after [`PortForwardService::stop`].
    pub async fn start(
        &self,
        settings: &PortForwardSettings,
        tunnel: &TunnelUpData,
    ) -> Result<Option<oneshot::Receiver<Error>>> {
        if !settings.enabled {
            debug!("Port forwarding is disabled");
            return Ok(None);
        }

        let mut keepalive = self.keepalive.lock().await;
        if let Some(previous) = keepalive.take() {
            self.shutdown(previous).await?;
        }

        let forwarder = tunnel.port_forwarder.clone().ok_or_else(|| {
            Error::unsupported(format!("port forwarding is not available on {}", tunnel.server_name))
        })?;
        let request = PortForwardRequest {
            interface: tunnel.interface.clone(),
            server_name: tunnel.server_name.clone(),
            gateway: settings.natpmp_gateway,
        };

        let port = tokio::select! {
            biased;
            _ = tunnel.tunnel_token.cancelled() => {
                return Err(Error::port_forward("tunnel went down before a port was forwarded"));
            }
            port = forwarder.port_forward(&request) => port?,
        };
        info!("Port forwarded is {} ({})", port, forwarder.name());

        self.firewall.set_allowed_port(port, &tunnel.interface).await?;
        if let Err(e) = state_file::write(&settings.status_file, port, settings.uid, settings.gid).await {
            if let Err(cleanup) = self.firewall.remove_allowed_port(port).await {
                warn!("Cleanup after failed port file write: {}", cleanup);
            }
            if let Err(cleanup) = state_file::remove(&settings.status_file).await {
                warn!("Cleanup after failed port file write: {}", cleanup);
            }
            return Err(e);
        }
        // Published only once the rule and the file are both in place
        *self.state.write() = ForwardedPortState {
            port,
            filepath: settings.status_file.clone(),
            interface: tunnel.interface.clone(),
        };

        let cancel = CancellationToken::new();
        let (failed_tx, failed_rx) = oneshot::channel();
        let done = {
            let cancel = cancel.clone();
            let firewall = self.firewall.clone();
            let state = self.state.clone();
            tokio::spawn(async move {
                let result = forwarder.keep_port_forward(&request, port, cancel.clone()).await;
                if cancel.is_cancelled() {
                    return;
                }

                let err = match result {
                    Err(e) => e,
                    Ok(()) => Error::port_forward(format!("keepalive for port {} ended", port)),
                };
                error!("Port forwarding keepalive failed: {}", err);
                if let Err(e) = cleanup(&*firewall, &state).await {
                    warn!("Port forwarding cleanup: {}", e);
                }
                let _ = failed_tx.send(err);
            })
        };

        *keepalive = Some(Keepalive { cancel, done });
        Ok(Some(failed_rx))
    }

    /// Stop forwarding. Returns at once when no port is active.
    pub async fn stop(&self) -> Result<()> {
        let mut keepalive = self.keepalive.lock().await;
        match keepalive.take() {
            Some(running) => self.shutdown(running).await,
            None => Ok(()),
        }
    }

    async fn shutdown(&self, running: Keepalive) -> Result<()> {
        running.cancel.cancel();
        if let Err(e) = running.done.await {
            warn!("Port forwarding keepalive task: {}", e);
        }
        cleanup(&*self.firewall, &self.state).await
    }
}

/// Remove the firewall rule and state file of the current port, once
async fn cleanup(firewall: &dyn Firewall, state: &RwLock<ForwardedPortState>) -> Result<()> {
    let (port, filepath) = {
        let mut state = state.write();
        (std::mem::take(&mut state.port), state.filepath.clone())
    };
    if port == 0 {
        return Ok(());
    }

    info!("Removing forwarded port {}", port);
    let firewall_result = firewall.remove_allowed_port(port).await;
    let file_result = state_file::remove(&filepath).await;
    firewall_result.and(file_result)
}
