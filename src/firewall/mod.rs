//! Firewall collaborator
//!
//! The VPN loop only ever talks to the [`Firewall`] trait. The iptables backed
//! implementation remembers what it added so every call is idempotent and
//! cleanup can remove exactly the rules it owns.

use crate::config::{FirewallSettings, Protocol};
use crate::process::run_command;
use crate::provider::Connection;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Firewall operations the orchestrator relies on.
///
/// Repeating a call with identical arguments is a no-op.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Allow outbound traffic to the VPN server and through the tunnel
    async fn set_vpn_connection(&self, connection: &Connection, interface: &str) -> Result<()>;

    /// Revert [`Firewall::set_vpn_connection`]
    async fn clear_vpn_connection(&self) -> Result<()>;

    /// Accept inbound traffic on `port` arriving through `interface`
    async fn set_allowed_port(&self, port: u16, interface: &str) -> Result<()>;

    async fn remove_allowed_port(&self, port: u16) -> Result<()>;

    /// Accept the operator's inbound `ports` through `interface`.
    ///
    /// Tracked apart from [`Firewall::set_allowed_port`], so removing a
    /// forwarded port never drops an input port rule.
    async fn set_input_ports(&self, ports: &[u16], interface: &str) -> Result<()>;

    /// Revert [`Firewall::set_input_ports`]
    async fn clear_input_ports(&self) -> Result<()>;
}

#[derive(Default)]
struct Applied {
    vpn: Option<(Connection, String)>,
    /// Forwarded ports
    ports: HashMap<u16, String>,
    input: Option<(Vec<u16>, String)>,
}

/// `iptables`/`ip6tables` implementation
pub struct IptablesFirewall {
    settings: FirewallSettings,
    applied: Mutex<Applied>,
}

impl IptablesFirewall {
    pub fn new(settings: FirewallSettings) -> Self {
        if !settings.enabled {
            info!("Firewall management is disabled, rules will not be applied");
        }
        IptablesFirewall {
            settings,
            applied: Mutex::new(Applied::default()),
        }
    }

    fn binary_for(&self, ip: IpAddr) -> &PathBuf {
        match ip {
            IpAddr::V4(_) => &self.settings.binary,
            IpAddr::V6(_) => &self.settings.binary_v6,
        }
    }

    async fn run(&self, binary: &PathBuf, rule: Vec<String>) -> Result<()> {
        if !self.settings.enabled {
            debug!("Firewall disabled, skipping: {}", rule.join(" "));
            return Ok(());
        }
        run_command(binary, &rule, Error::firewall::<String>).await?;
        Ok(())
    }

    async fn apply_vpn_rules(&self, action: &str, connection: &Connection, interface: &str) -> Result<()> {
        let binary = self.binary_for(connection.ip).clone();
        for rule in vpn_rules(action, connection, interface) {
            self.run(&binary, rule).await?;
        }
        Ok(())
    }

    async fn apply_port_rules(&self, action: &str, port: u16, interface: &str) -> Result<()> {
        for binary in [self.settings.binary.clone(), self.settings.binary_v6.clone()] {
            for rule in input_port_rules(action, port, interface) {
                self.run(&binary, rule).await?;
            }
        }
        Ok(())
    }

    async fn remove_input_ports(&self, applied: &mut Applied) -> Result<()> {
        if let Some((mut ports, interface)) = applied.input.take() {
            while let Some(port) = ports.last().copied() {
                if let Err(e) = self.apply_port_rules("-D", port, &interface).await {
                    applied.input = Some((ports, interface));
                    return Err(e);
                }
                ports.pop();
            }
            info!("Firewall input ports on {} removed", interface);
        }
        Ok(())
    }
}

#[async_trait]
impl Firewall for IptablesFirewall {
    async fn set_vpn_connection(&self, connection: &Connection, interface: &str) -> Result<()> {
        let mut applied = self.applied.lock().await;
        if let Some((current, current_iface)) = &applied.vpn {
            if current == connection && current_iface == interface {
                return Ok(());
            }
            self.apply_vpn_rules("-D", current, current_iface).await?;
            applied.vpn = None;
        }

        self.apply_vpn_rules("-A", connection, interface).await?;
        info!("Firewall allows VPN connection to {} via {}", connection.endpoint(), interface);
        applied.vpn = Some((connection.clone(), interface.to_string()));
        Ok(())
    }

    async fn clear_vpn_connection(&self) -> Result<()> {
        let mut applied = self.applied.lock().await;
        if let Some((connection, interface)) = applied.vpn.take() {
            if let Err(e) = self.apply_vpn_rules("-D", &connection, &interface).await {
                applied.vpn = Some((connection, interface));
                return Err(e);
            }
            info!("Firewall VPN connection rules removed");
        }
        Ok(())
    }

    async fn set_allowed_port(&self, port: u16, interface: &str) -> Result<()> {
        let mut applied = self.applied.lock().await;
        if let Some(current) = applied.ports.get(&port) {
            if current == interface {
                return Ok(());
            }
            let current = current.clone();
            self.apply_port_rules("-D", port, &current).await?;
            applied.ports.remove(&port);
        }

        self.apply_port_rules("-A", port, interface).await?;
        info!("Firewall allows input port {} on {}", port, interface);
        applied.ports.insert(port, interface.to_string());
        Ok(())
    }

    async fn remove_allowed_port(&self, port: u16) -> Result<()> {
        let mut applied = self.applied.lock().await;
        if let Some(interface) = applied.ports.get(&port).cloned() {
            self.apply_port_rules("-D", port, &interface).await?;
            applied.ports.remove(&port);
            info!("Firewall input port {} removed", port);
        }
        Ok(())
    }

    async fn set_input_ports(&self, ports: &[u16], interface: &str) -> Result<()> {
        let mut applied = self.applied.lock().await;
        if let Some((current, current_iface)) = &applied.input {
            if current.as_slice() == ports && current_iface == interface {
                return Ok(());
            }
        }
        self.remove_input_ports(&mut applied).await?;

        let mut opened = Vec::with_capacity(ports.len());
        for port in ports {
            if let Err(e) = self.apply_port_rules("-A", *port, interface).await {
                applied.input = Some((opened, interface.to_string()));
                return Err(e);
            }
            opened.push(*port);
        }
        info!("Firewall allows input ports {:?} on {}", opened, interface);
        applied.input = Some((opened, interface.to_string()));
        Ok(())
    }

    async fn clear_input_ports(&self) -> Result<()> {
        let mut applied = self.applied.lock().await;
        self.remove_input_ports(&mut applied).await
    }
}

fn vpn_rules(action: &str, connection: &Connection, interface: &str) -> Vec<Vec<String>> {
    let proto = match connection.protocol {
        Protocol::Udp => "udp",
        Protocol::Tcp => "tcp",
    };
    vec![
        args(&[
            action,
            "OUTPUT",
            "-d",
            &connection.ip.to_string(),
            "-p",
            proto,
            "-m",
            proto,
            "--dport",
            &connection.port.to_string(),
            "-j",
            "ACCEPT",
        ]),
        args(&[action, "OUTPUT", "-o", interface, "-j", "ACCEPT"]),
    ]
}

fn input_port_rules(action: &str, port: u16, interface: &str) -> Vec<Vec<String>> {
    let port = port.to_string();
    ["tcp", "udp"]
        .into_iter()
        .map(|proto| {
            args(&[
                action, "INPUT", "-i", interface, "-p", proto, "-m", proto, "--dport", &port, "-j", "ACCEPT",
            ])
        })
        .collect()
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}
