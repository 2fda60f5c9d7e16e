//! OpenVPN client configuration

use super::Connection;
use crate::config::{OpenVpnSettings, Protocol};

pub(super) fn build_config(connection: &Connection, settings: &OpenVpnSettings) -> Vec<String> {
    let proto = match connection.protocol {
        Protocol::Udp => "udp",
        Protocol::Tcp => "tcp-client",
    };

    let mut lines = vec![
        "client".to_string(),
        "nobind".to_string(),
        format!("dev {}", settings.interface),
        "dev-type tun".to_string(),
        format!("proto {}", proto),
        format!("remote {} {}", connection.ip, connection.port),
        "remote-cert-tls server".to_string(),
        "auth-nocache".to_string(),
        "mute-replay-warnings".to_string(),
        "pull-filter ignore \"auth-token\"".to_string(),
        "suppress-timestamps".to_string(),
        format!("verb {}", settings.verbosity),
    ];

    if settings.user.is_some() {
        lines.push(format!("auth-user-pass {}", settings.auth_path.display()));
    }

    if connection.protocol == Protocol::Udp {
        lines.push("explicit-exit-notify".to_string());
    }

    lines.extend(settings.extra_lines.iter().cloned());
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VpnType;

    fn connection(protocol: Protocol) -> Connection {
        Connection {
            ip: "203.0.113.10".parse().unwrap(),
            port: 443,
            protocol,
            vpn_type: VpnType::OpenVpn,
            server_name: "nl-01".to_string(),
            port_forward: false,
            public_key: None,
        }
    }

    #[test]
    fn test_openvpn_lines() {
        let mut settings = OpenVpnSettings::default();
        settings.user = Some("alice".to_string());
        settings.extra_lines = vec!["cipher AES-256-GCM".to_string()];

        let lines = build_config(&connection(Protocol::Tcp), &settings);
        assert!(lines.contains(&"proto tcp-client".to_string()));
        assert!(lines.contains(&"remote 203.0.113.10 443".to_string()));
        assert!(lines.contains(&"dev tun0".to_string()));
        assert!(lines.contains(&"auth-user-pass /etc/openvpn/auth.conf".to_string()));
        assert!(!lines.contains(&"explicit-exit-notify".to_string()));
        assert_eq!(lines.last().unwrap(), "cipher AES-256-GCM");
    }

    #[test]
    fn test_openvpn_udp_without_credentials() {
        let lines = build_config(&connection(Protocol::Udp), &OpenVpnSettings::default());
        assert!(lines.contains(&"explicit-exit-notify".to_string()));
        assert!(!lines.iter().any(|line| line.starts_with("auth-user-pass")));
    }
}
