//! Single endpoint provider

use super::{Connection, Provider};
use crate::config::{Protocol, ProviderKind, VpnSettings, VpnType};
use crate::portforward::PortForwarder;
use crate::{Error, Result};
use std::sync::Arc;

/// Connects to the endpoint written in `vpn.provider.custom`
pub struct CustomProvider {
    port_forwarder: Option<Arc<dyn PortForwarder>>,
}

impl CustomProvider {
    pub fn new(port_forwarder: Option<Arc<dyn PortForwarder>>) -> Self {
        CustomProvider { port_forwarder }
    }
}

impl Provider for CustomProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Custom
    }

    fn get_connection(&self, settings: &VpnSettings) -> Result<Connection> {
        let endpoint = settings
            .provider
            .custom
            .as_ref()
            .ok_or_else(|| Error::provider("no custom endpoint configured"))?;

        let protocol = match settings.vpn_type {
            VpnType::WireGuard => Protocol::Udp,
            VpnType::OpenVpn => endpoint.protocol,
        };

        Ok(Connection {
            ip: endpoint.ip,
            port: endpoint.port,
            protocol,
            vpn_type: settings.vpn_type,
            server_name: endpoint.name.clone(),
            port_forward: endpoint.port_forward,
            public_key: endpoint.public_key.clone(),
        })
    }

    fn port_forwarder(&self) -> Option<Arc<dyn PortForwarder>> {
        self.port_forwarder.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CustomEndpoint;

    #[test]
    fn test_custom_connection() {
        let mut settings = VpnSettings::default();
        settings.provider.custom = Some(CustomEndpoint {
            name: "home".to_string(),
            ip: "198.51.100.4".parse().unwrap(),
            port: 443,
            protocol: Protocol::Tcp,
            port_forward: true,
            public_key: None,
        });

        let provider = CustomProvider::new(None);
        let conn = provider.get_connection(&settings).unwrap();
        assert_eq!(conn.port, 443);
        assert_eq!(conn.protocol, Protocol::Tcp);
        assert!(conn.port_forward);

        settings.vpn_type = VpnType::WireGuard;
        let conn = provider.get_connection(&settings).unwrap();
        assert_eq!(conn.protocol, Protocol::Udp);
    }

    #[test]
    fn test_custom_without_endpoint() {
        let provider = CustomProvider::new(None);
        let err = provider.get_connection(&VpnSettings::default()).unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }
}
