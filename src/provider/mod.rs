//! VPN providers
//!
//! A provider turns the VPN settings into a [`Connection`] (which server to
//! dial) and renders the tunnel configuration for it. Providers are resolved
//! once at startup into [`Providers`], keyed by [`ProviderKind`].

mod custom;
mod openvpn;
mod servers;
mod wireguard;

pub use custom::CustomProvider;
pub use servers::ServerListProvider;

use crate::config::{Protocol, ProviderKind, VpnSettings, VpnType};
use crate::portforward::PortForwarder;
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Server chosen for one tunnel attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub vpn_type: VpnType,
    pub server_name: String,
    /// Whether the server offers port forwarding
    pub port_forward: bool,
    /// WireGuard peer public key
    pub public_key: Option<String>,
}

impl Connection {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {}/{}",
            self.vpn_type,
            self.server_name,
            self.endpoint(),
            self.protocol
        )
    }
}

/// One VPN service
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Pick a server matching the selection in `settings`.
    ///
    /// No match is an [`Error::Provider`], never a panic.
    fn get_connection(&self, settings: &VpnSettings) -> Result<Connection>;

    /// Render the tunnel configuration file for `connection`
    fn build_tunnel_config(&self, connection: &Connection, settings: &VpnSettings) -> Result<Vec<String>> {
        match connection.vpn_type {
            VpnType::OpenVpn => Ok(openvpn::build_config(connection, &settings.openvpn)),
            VpnType::WireGuard => wireguard::build_config(connection, &settings.wireguard),
        }
    }

    /// Whether a port forwarder is available for this provider
    fn supports_port_forward(&self) -> bool {
        self.port_forwarder().is_some()
    }

    fn port_forwarder(&self) -> Option<Arc<dyn PortForwarder>>;
}

/// Providers available to the VPN loop
#[derive(Clone, Default)]
pub struct Providers {
    inner: HashMap<ProviderKind, Arc<dyn Provider>>,
}

impl Providers {
    /// Built-in providers sharing one optional port forwarder
    pub fn new(port_forwarder: Option<Arc<dyn PortForwarder>>) -> Self {
        let mut providers = Providers::default();
        providers.insert(Arc::new(CustomProvider::new(port_forwarder.clone())));
        providers.insert(Arc::new(ServerListProvider::new(port_forwarder)));
        providers
    }

    /// Register or replace a provider
    pub fn insert(&mut self, provider: Arc<dyn Provider>) {
        self.inner.insert(provider.kind(), provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn Provider>> {
        self.inner
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::provider(format!("provider {} is not available", kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_display() {
        let conn = Connection {
            ip: "203.0.113.10".parse().unwrap(),
            port: 1194,
            protocol: Protocol::Udp,
            vpn_type: VpnType::OpenVpn,
            server_name: "nl-01".to_string(),
            port_forward: false,
            public_key: None,
        };
        assert_eq!(conn.to_string(), "openvpn nl-01 203.0.113.10:1194/udp");
    }

    #[test]
    fn test_providers_lookup() {
        let providers = Providers::new(None);
        assert_eq!(providers.get(ProviderKind::Custom).unwrap().kind(), ProviderKind::Custom);
        assert!(!providers.get(ProviderKind::Servers).unwrap().supports_port_forward());

        let empty = Providers::default();
        assert!(matches!(empty.get(ProviderKind::Custom), Err(Error::Provider(_))));
    }
}
