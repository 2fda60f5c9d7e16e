//! Tunnel processes
//!
//! The VPN loop prepares a [`TunnelRunner`] for every attempt through a
//! [`TunnelLauncher`] and runs it in its own task. The task's join handle is
//! the error sink: it resolves with `Err` when the tunnel dies on its own and
//! with `Ok` once it was cancelled.

mod openvpn;
mod wireguard;

pub use openvpn::OpenVpnRunner;
pub use wireguard::WireguardRunner;

use crate::config::{VpnSettings, VpnType};
use crate::portforward::PortForwarder;
use crate::provider::Connection;
use crate::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handed to dependent subsystems once the tunnel is ready
#[derive(Clone)]
pub struct TunnelUpData {
    pub interface: String,
    pub server_name: String,
    /// Forwarder of the provider, `None` when it has none
    pub port_forwarder: Option<Arc<dyn PortForwarder>>,
    /// Cancelled as soon as this tunnel starts going down
    pub tunnel_token: CancellationToken,
}

impl std::fmt::Debug for TunnelUpData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelUpData")
            .field("interface", &self.interface)
            .field("server_name", &self.server_name)
            .field("port_forwarder", &self.port_forwarder.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}

/// One running tunnel
#[async_trait]
pub trait TunnelRunner: Send + Sync {
    /// Run until `cancel` fires.
    ///
    /// Fires `ready` once when traffic can flow. Returns `Ok` after
    /// cancellation and `Err` if the tunnel went away by itself.
    async fn run(&self, cancel: CancellationToken, ready: oneshot::Sender<()>) -> Result<()>;
}

/// Turns a connection and its rendered configuration into a runner
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    async fn prepare(
        &self,
        connection: &Connection,
        config: &[String],
        settings: &VpnSettings,
    ) -> Result<Box<dyn TunnelRunner>>;
}

/// Writes configuration files and runs `openvpn` or `wg-quick`
#[derive(Debug, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl TunnelLauncher for ProcessLauncher {
    async fn prepare(
        &self,
        connection: &Connection,
        config: &[String],
        settings: &VpnSettings,
    ) -> Result<Box<dyn TunnelRunner>> {
        match connection.vpn_type {
            VpnType::OpenVpn => {
                let openvpn = &settings.openvpn;
                write_private(&openvpn.config_path, config).await?;
                if let Some(user) = &openvpn.user {
                    let password = openvpn.password.clone().unwrap_or_default();
                    write_private(&openvpn.auth_path, &[user.clone(), password]).await?;
                }
                Ok(Box::new(OpenVpnRunner::new(openvpn)))
            }
            VpnType::WireGuard => {
                let wireguard = &settings.wireguard;
                write_private(&wireguard.config_path(), config).await?;
                Ok(Box::new(WireguardRunner::new(wireguard)))
            }
        }
    }
}

/// Write `lines` readable by the owner only
async fn write_private(path: &Path, lines: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let mut content = lines.join("\n");
    content.push('\n');
    fs::write(path, content).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    debug!("Wrote {} lines to {}", lines.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    #[tokio::test]
    async fn test_prepare_writes_openvpn_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = VpnSettings::default();
        settings.openvpn.config_path = dir.path().join("target.ovpn");
        settings.openvpn.auth_path = dir.path().join("auth.conf");
        settings.openvpn.user = Some("alice".to_string());
        settings.openvpn.password = Some("hunter2".to_string());

        let connection = Connection {
            ip: "203.0.113.10".parse().unwrap(),
            port: 1194,
            protocol: Protocol::Udp,
            vpn_type: VpnType::OpenVpn,
            server_name: "nl-01".to_string(),
            port_forward: false,
            public_key: None,
        };
        let config = vec!["client".to_string(), "remote 203.0.113.10 1194".to_string()];

        ProcessLauncher.prepare(&connection, &config, &settings).await.unwrap();

        let written = std::fs::read_to_string(&settings.openvpn.config_path).unwrap();
        assert_eq!(written, "client\nremote 203.0.113.10 1194\n");
        let auth = std::fs::read_to_string(&settings.openvpn.auth_path).unwrap();
        assert_eq!(auth, "alice\nhunter2\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&settings.openvpn.auth_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
