//! WireGuard (`wg-quick`) configuration

use super::Connection;
use crate::config::WireguardSettings;
use crate::{Error, Result};

const PERSISTENT_KEEPALIVE: u16 = 25;

pub(super) fn build_config(connection: &Connection, settings: &WireguardSettings) -> Result<Vec<String>> {
    let private_key = settings
        .private_key
        .as_ref()
        .ok_or_else(|| Error::provider("wireguard private key is not set"))?;
    let public_key = connection
        .public_key
        .as_ref()
        .ok_or_else(|| Error::provider(format!("server {} has no wireguard public key", connection.server_name)))?;

    let mut lines = vec![
        "[Interface]".to_string(),
        format!("PrivateKey = {}", private_key),
        format!("Address = {}", settings.addresses.join(", ")),
        format!("MTU = {}", settings.mtu),
        String::new(),
        "[Peer]".to_string(),
        format!("PublicKey = {}", public_key),
    ];
    if let Some(psk) = &settings.preshared_key {
        lines.push(format!("PresharedKey = {}", psk));
    }
    lines.push("AllowedIPs = 0.0.0.0/0, ::/0".to_string());
    lines.push(format!("Endpoint = {}", connection.endpoint()));
    lines.push(format!("PersistentKeepalive = {}", PERSISTENT_KEEPALIVE));

    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Protocol, VpnType};

    fn connection(public_key: Option<&str>) -> Connection {
        Connection {
            ip: "198.51.100.4".parse().unwrap(),
            port: 51820,
            protocol: Protocol::Udp,
            vpn_type: VpnType::WireGuard,
            server_name: "home".to_string(),
            port_forward: false,
            public_key: public_key.map(str::to_string),
        }
    }

    #[test]
    fn test_wireguard_lines() {
        let settings = WireguardSettings {
            private_key: Some("client-key".to_string()),
            addresses: vec!["10.64.0.2/32".to_string()],
            ..Default::default()
        };

        let lines = build_config(&connection(Some("server-key")), &settings).unwrap();
        assert_eq!(lines[0], "[Interface]");
        assert!(lines.contains(&"PrivateKey = client-key".to_string()));
        assert!(lines.contains(&"PublicKey = server-key".to_string()));
        assert!(lines.contains(&"Endpoint = 198.51.100.4:51820".to_string()));
        assert!(!lines.iter().any(|line| line.starts_with("PresharedKey")));
    }

    #[test]
    fn test_wireguard_missing_peer_key() {
        let settings = WireguardSettings {
            private_key: Some("client-key".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            build_config(&connection(None), &settings),
            Err(Error::Provider(_))
        ));
    }
}
