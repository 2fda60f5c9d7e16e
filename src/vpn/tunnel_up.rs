//! Tunnel-ready activation and tunnel-down cleanup

use super::VpnLoop;
use crate::loopstate::LoopStatus;
use crate::provider::{Connection, Provider};
use crate::tunnel::TunnelUpData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

impl VpnLoop {
    /// Bring up everything that needs a working tunnel.
    ///
    /// Runs as a background task owned by the attempt; `tunnel_token` is
    /// cancelled when the tunnel starts going down.
    pub(super) async fn on_tunnel_up(
        self: Arc<Self>,
        connection: Connection,
        provider: Arc<dyn Provider>,
        interface: String,
        tunnel_token: CancellationToken,
    ) {
        let deps = &self.deps;
        deps.client.close_idle_connections();

        if !self.input_ports.is_empty() {
            if let Err(e) = deps.firewall.set_input_ports(&self.input_ports, &interface).await {
                warn!("Cannot allow input ports {:?}: {}", self.input_ports, e);
            }
        }

        if deps.dns.get_settings().enabled {
            match deps.dns.apply_status(&tunnel_token, LoopStatus::Running).await {
                Ok(outcome) => info!("DNS: {}", outcome),
                Err(e) => warn!("DNS: {}", e),
            }
        }

        if let Err(e) = deps.public_ip.run_once(&tunnel_token).await {
            warn!("Public IP lookup failed: {}", e);
        }

        deps.version.notice_once(&tunnel_token).await;

        if !connection.port_forward {
            return;
        }
        if !provider.supports_port_forward() {
            info!("Server {} offers port forwarding but {} has no forwarder", connection.server_name, provider.kind());
            return;
        }

        deps.port_forward.tunnel_up(TunnelUpData {
            interface,
            server_name: connection.server_name.clone(),
            port_forwarder: provider.port_forwarder(),
            tunnel_token: tunnel_token.clone(),
        });
        match deps.port_forward.apply_status(&tunnel_token, LoopStatus::Running).await {
            Ok(outcome) => info!("Port forwarding: {}", outcome),
            Err(e) => warn!("Port forwarding: {}", e),
        }
    }

    /// Undo everything the attempt set up. Each step runs even if an earlier one failed.
    pub(super) async fn cleanup(&self, cancel: &CancellationToken) {
        let deps = &self.deps;

        if let Err(e) = deps.firewall.clear_input_ports().await {
            warn!("Cannot remove input ports: {}", e);
        }
        if let Err(e) = deps.firewall.clear_vpn_connection().await {
            warn!("Cannot remove VPN connection firewall rules: {}", e);
        }

        deps.public_ip.clear_data();

        if let Err(e) = deps.port_forward.tunnel_down(cancel).await {
            warn!("Cannot stop port forwarding: {}", e);
        }
    }
}
