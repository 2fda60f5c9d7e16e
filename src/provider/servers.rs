//! Server list provider

use super::{Connection, Provider};
use crate::config::{Protocol, ProviderKind, ServerEntry, ServerSelection, VpnSettings, VpnType};
use crate::portforward::PortForwarder;
use crate::{Error, Result};
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::debug;

/// Picks a random server among the configured ones matching the selection
pub struct ServerListProvider {
    port_forwarder: Option<Arc<dyn PortForwarder>>,
}

impl ServerListProvider {
    pub fn new(port_forwarder: Option<Arc<dyn PortForwarder>>) -> Self {
        ServerListProvider { port_forwarder }
    }
}

fn matches(server: &ServerEntry, selection: &ServerSelection, vpn_type: VpnType) -> bool {
    if !selection.server_names.is_empty()
        && !selection
            .server_names
            .iter()
            .any(|name| name.eq_ignore_ascii_case(&server.name))
    {
        return false;
    }

    if !selection.regions.is_empty()
        && !selection
            .regions
            .iter()
            .any(|region| region.eq_ignore_ascii_case(&server.region))
    {
        return false;
    }

    if selection.port_forward_only && !server.port_forward {
        return false;
    }

    match (vpn_type, selection.protocol) {
        (VpnType::WireGuard, _) => server.public_key.is_some(),
        (VpnType::OpenVpn, Protocol::Udp) => server.udp,
        (VpnType::OpenVpn, Protocol::Tcp) => server.tcp,
    }
}

impl Provider for ServerListProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Servers
    }

    fn get_connection(&self, settings: &VpnSettings) -> Result<Connection> {
        let selection = &settings.provider.selection;
        let candidates: Vec<&ServerEntry> = settings
            .provider
            .servers
            .iter()
            .filter(|server| matches(server, selection, settings.vpn_type))
            .collect();
        debug!(
            "{} of {} servers match the selection",
            candidates.len(),
            settings.provider.servers.len()
        );

        let server = candidates
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| Error::provider(format!("no server matches the selection {:?}", selection)))?;

        let (port, protocol) = match settings.vpn_type {
            VpnType::OpenVpn => (server.openvpn_port, selection.protocol),
            VpnType::WireGuard => (server.wireguard_port, Protocol::Udp),
        };

        Ok(Connection {
            ip: server.ip,
            port,
            protocol,
            vpn_type: settings.vpn_type,
            server_name: server.name.clone(),
            port_forward: server.port_forward,
            public_key: server.public_key.clone(),
        })
    }

    fn port_forwarder(&self) -> Option<Arc<dyn PortForwarder>> {
        self.port_forwarder.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;

    fn server(name: &str, region: &str, port_forward: bool) -> ServerEntry {
        ServerEntry {
            name: name.to_string(),
            region: region.to_string(),
            ip: "203.0.113.1".parse().unwrap(),
            openvpn_port: 1194,
            wireguard_port: 51820,
            udp: true,
            tcp: false,
            port_forward,
            public_key: None,
        }
    }

    fn settings() -> VpnSettings {
        let mut settings = VpnSettings::default();
        settings.provider.name = ProviderKind::Servers;
        settings.provider.servers = vec![
            server("nl-01", "Netherlands", true),
            server("nl-02", "Netherlands", false),
            server("de-01", "Germany", false),
        ];
        settings
    }

    #[test]
    fn test_region_and_port_forward_filters() {
        let mut settings = settings();
        settings.provider.selection.regions = vec!["netherlands".to_string()];
        settings.provider.selection.port_forward_only = true;

        let provider = ServerListProvider::new(None);
        for _ in 0..10 {
            let conn = provider.get_connection(&settings).unwrap();
            assert_eq!(conn.server_name, "nl-01");
            assert!(conn.port_forward);
        }
    }

    #[test]
    fn test_no_match_is_provider_error() {
        let mut settings = settings();
        settings.provider.selection.protocol = Protocol::Tcp;

        let err = ServerListProvider::new(None).get_connection(&settings).unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }

    #[test]
    fn test_wireguard_requires_public_key() {
        let mut settings = settings();
        settings.vpn_type = VpnType::WireGuard;
        settings.provider.servers[2].public_key = Some("peer-key".to_string());

        let conn = ServerListProvider::new(None).get_connection(&settings).unwrap();
        assert_eq!(conn.server_name, "de-01");
        assert_eq!(conn.port, 51820);
        assert_eq!(conn.protocol, Protocol::Udp);
    }
}
