//! tunwarden - self-healing VPN client orchestrator
//!
//! Keeps a VPN tunnel (OpenVPN or WireGuard) up and supervises the
//! subsystems that depend on it:
//! - firewall rules for the VPN server and inbound ports
//! - a local DNS resolver with block lists
//! - provider port forwarding with a state file
//! - HTTP proxy and Shadowsocks servers
//! - public IP lookup and a release notice
//!
//! # Architecture
//!
//! ```text
//!                   +---------------+
//!                   |   control/    |
//!                   +-------+-------+
//!                           |
//!        +------------------+------------------+
//!        |                  |                  |
//! +------v------+   +-------v-------+   +------v------+
//! |    vpn/     |   |     dns/      |   |   proxy/    |
//! | (attempts)  |   |  (ticker)     |   | (http, ss)  |
//! +------+------+   +---------------+   +-------------+
//!        |
//!        +-----------------+-----------------+
//!        |                 |                 |
//! +------v------+   +------v------+   +------v-------+
//! |  provider/  |   |   tunnel/   |   | portforward/ |
//! +-------------+   +-------------+   +--------------+
//! ```
//!
//! Every subsystem is a worker task built on [`loopstate`]: callers ask for a
//! status and wait for the worker to confirm it.

pub mod common;
pub mod config;
pub mod control;
pub mod dns;
pub mod firewall;
pub mod loopstate;
pub mod portforward;
pub mod process;
pub mod provider;
pub mod proxy;
pub mod publicip;
pub mod tunnel;
pub mod version;
pub mod vpn;

pub use common::error::{Error, Result};
pub use config::Config;

use common::SharedClient;
use control::Control;
use dns::{DnsLoop, UnboundServer};
use firewall::{Firewall, IptablesFirewall};
use futures::future::join_all;
use loopstate::{LoopStatus, LoopTimings};
use portforward::{NatPmpForwarder, PortForwardLoop, PortForwarder};
use provider::Providers;
use proxy::{ProxyLoop, ShadowsocksServer, TinyProxyServer};
use publicip::PublicIp;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tunnel::ProcessLauncher;
use version::VersionNotice;
use vpn::{Collaborators, VpnLoop};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Owns every subsystem loop
pub struct Supervisor {
    vpn: Arc<VpnLoop>,
    dns: Arc<DnsLoop>,
    port_forward: Arc<PortForwardLoop>,
    http_proxy: Arc<ProxyLoop>,
    shadowsocks: Arc<ProxyLoop>,
    public_ip: Arc<PublicIp>,
}

impl Supervisor {
    /// Build every subsystem from configuration
    pub fn new(config: Config) -> Result<Self> {
        info!("Initializing tunwarden v{}", VERSION);
        let timings = LoopTimings::default();

        let client = Arc::new(SharedClient::new()?);
        let firewall: Arc<dyn Firewall> = Arc::new(IptablesFirewall::new(config.firewall.clone()));

        let forwarder = config.port_forwarding.natpmp_gateway.map(|gateway| {
            info!("NAT-PMP port forwarding through {}", gateway);
            Arc::new(NatPmpForwarder::new(Some(gateway))) as Arc<dyn PortForwarder>
        });
        let providers = Providers::new(forwarder);

        let dns = Arc::new(DnsLoop::new(
            config.dns.clone(),
            Arc::new(UnboundServer::new(client.clone())),
            timings,
        ));
        let port_forward = Arc::new(PortForwardLoop::new(config.port_forwarding.clone(), firewall.clone()));
        let http_proxy = Arc::new(ProxyLoop::new(
            config.http_proxy.clone(),
            Arc::new(TinyProxyServer::new()),
            timings,
        ));
        let shadowsocks = Arc::new(ProxyLoop::new(
            config.shadowsocks.clone(),
            Arc::new(ShadowsocksServer::new()),
            timings,
        ));
        let public_ip = Arc::new(PublicIp::new(config.public_ip.clone(), client.clone()));
        let version = Arc::new(VersionNotice::new(config.version_check, client.clone()));

        let deps = Collaborators {
            providers,
            launcher: Arc::new(ProcessLauncher),
            firewall,
            dns: dns.clone(),
            port_forward: port_forward.clone(),
            public_ip: public_ip.clone(),
            version,
            client,
        };
        let vpn = Arc::new(
            VpnLoop::new(config.vpn.clone(), deps, timings).with_input_ports(config.firewall.vpn_input_ports.clone()),
        );

        Ok(Supervisor {
            vpn,
            dns,
            port_forward,
            http_proxy,
            shadowsocks,
            public_ip,
        })
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(&self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves, then stop every subsystem
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting subsystems...");
        let cancel = CancellationToken::new();

        let handles = vec![
            tokio::spawn(self.vpn.clone().run(cancel.clone())),
            tokio::spawn(self.dns.clone().run(cancel.clone())),
            tokio::spawn(self.port_forward.clone().run(cancel.clone())),
            tokio::spawn(self.http_proxy.clone().run(cancel.clone())),
            tokio::spawn(self.shadowsocks.clone().run(cancel.clone())),
        ];

        tokio::pin!(shutdown);
        tokio::select! {
            _ = self.start_enabled(&cancel) => (&mut shutdown).await,
            _ = &mut shutdown => {}
        }
        info!("Received shutdown signal");

        cancel.cancel();
        for joined in join_all(handles).await {
            if let Err(e) = joined {
                warn!("Subsystem task: {}", e);
            }
        }

        info!("tunwarden stopped");
        Ok(())
    }

    /// Start proxies and the VPN when enabled. DNS and port forwarding follow the tunnel.
    async fn start_enabled(&self, cancel: &CancellationToken) {
        for proxy in [&self.http_proxy, &self.shadowsocks] {
            if !proxy.get_settings().enabled {
                continue;
            }
            match proxy.apply_status(cancel, LoopStatus::Running).await {
                Ok(outcome) => info!("{}: {}", proxy.name(), outcome),
                Err(e) => warn!("{}: {}", proxy.name(), e),
            }
        }

        if self.vpn.get_settings().enabled {
            match self.vpn.apply_status(cancel, LoopStatus::Running).await {
                Ok(outcome) => info!("VPN: {}", outcome),
                Err(e) => warn!("VPN: {}", e),
            }
        } else {
            info!("VPN is disabled");
        }
    }

    /// Control surface over every subsystem
    pub fn control(&self) -> Control {
        Control::new(
            self.vpn.clone(),
            self.dns.clone(),
            self.port_forward.clone(),
            self.http_proxy.clone(),
            self.shadowsocks.clone(),
            self.public_ip.clone(),
        )
    }

    pub fn vpn(&self) -> &Arc<VpnLoop> {
        &self.vpn
    }

    pub fn port_forward(&self) -> &Arc<PortForwardLoop> {
        &self.port_forward
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.4.0");
    }

    #[tokio::test]
    async fn test_supervisor_with_everything_disabled() {
        let mut config = Config::default();
        config.vpn.enabled = false;
        config.firewall.enabled = false;
        config.version_check = false;

        let supervisor = Supervisor::new(config).unwrap();
        let control = supervisor.control();
        supervisor.run_until(async {}).await.unwrap();

        assert_eq!(control.status(control::Subsystem::Vpn), LoopStatus::Stopped);
        assert_eq!(control.status(control::Subsystem::HttpProxy), LoopStatus::Stopped);
        assert_eq!(control.forwarded_port(), 0);
        assert!(control.public_ip().is_none());
    }
}
