//! Configuration module

mod settings;

pub use settings::*;

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log format
    pub log_format: LogFormat,

    /// VPN tunnel
    pub vpn: VpnSettings,

    /// DNS resolver
    pub dns: DnsSettings,

    /// Port forwarding
    pub port_forwarding: PortForwardSettings,

    /// HTTP proxy
    pub http_proxy: ProxySettings,

    /// Shadowsocks server
    pub shadowsocks: ProxySettings,

    /// Public IP lookup
    pub public_ip: PublicIpSettings,

    /// Firewall
    pub firewall: FirewallSettings,

    /// Log a notice when a newer release exists
    pub version_check: bool,
}

impl Config {
    /// Load configuration from file (synchronous)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let provider = &self.vpn.provider;
        match provider.name {
            ProviderKind::Custom if provider.custom.is_none() => {
                return Err(Error::config("custom provider requires vpn.provider.custom"));
            }
            ProviderKind::Servers if provider.servers.is_empty() => {
                return Err(Error::config("servers provider requires a non-empty vpn.provider.servers"));
            }
            _ => {}
        }

        if self.vpn.vpn_type == VpnType::WireGuard {
            if self.vpn.wireguard.private_key.is_none() {
                return Err(Error::config("wireguard requires vpn.wireguard.private-key"));
            }
            if self.vpn.wireguard.addresses.is_empty() {
                return Err(Error::config("wireguard requires at least one vpn.wireguard.addresses entry"));
            }
        }

        if self.dns.enabled && self.dns.update_period.is_zero() {
            return Err(Error::config("dns.update-period must be at least one second"));
        }

        if self.port_forwarding.enabled && self.port_forwarding.status_file.as_os_str().is_empty() {
            return Err(Error::config("port-forwarding.status-file must not be empty"));
        }

        if self.public_ip.enabled && !self.public_ip.api_url.starts_with("http") {
            return Err(Error::config(format!(
                "public-ip.api-url is not an HTTP URL: {}",
                self.public_ip.api_url
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).await?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            vpn: VpnSettings::default(),
            dns: DnsSettings::default(),
            port_forwarding: PortForwardSettings::default(),
            http_proxy: ProxySettings::default(),
            shadowsocks: ProxySettings::default(),
            public_ip: PublicIpSettings::default(),
            firewall: FirewallSettings::default(),
            version_check: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SAMPLE: &str = r#"
log-level: debug
vpn:
  type: openvpn
  provider:
    name: servers
    selection:
      regions: [Netherlands]
      port-forward-only: true
    servers:
      - name: nl-01
        region: Netherlands
        ip: 203.0.113.10
        port-forward: true
      - name: de-01
        region: Germany
        ip: 203.0.113.20
  openvpn:
    user: alice
    password: hunter2
dns:
  update-period: 3600
port-forwarding:
  enabled: true
  natpmp-gateway: 10.2.0.1
firewall:
  vpn-input-ports: [8080]
"#;

    #[test]
    fn test_config_parsing() {
        let config = Config::from_str(SAMPLE).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.vpn.provider.name, ProviderKind::Servers);
        assert_eq!(config.vpn.provider.servers.len(), 2);
        assert!(config.vpn.provider.servers[0].port_forward);
        assert_eq!(config.vpn.provider.servers[1].openvpn_port, 1194);
        assert_eq!(config.dns.update_period, Duration::from_secs(3600));
        assert_eq!(config.firewall.vpn_input_ports, vec![8080]);
        assert_eq!(config.vpn.interface(), "tun0");
        assert!(config.version_check);
    }

    #[test]
    fn test_custom_provider_requires_endpoint() {
        let err = Config::from_str("vpn:\n  provider:\n    name: custom\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_wireguard_requires_key() {
        let yaml = r#"
vpn:
  type: wireguard
  provider:
    custom:
      name: home
      ip: 198.51.100.4
      port: 51820
"#;
        let err = Config::from_str(yaml).unwrap_err();
        assert!(err.to_string().contains("private-key"));
    }

    #[test]
    fn test_zero_dns_period_rejected() {
        let yaml = r#"
vpn:
  provider:
    custom:
      name: home
      ip: 198.51.100.4
      port: 1194
dns:
  update-period: 0
"#;
        let err = Config::from_str(yaml).unwrap_err();
        assert!(err.to_string().contains("update-period"));
    }

    #[test]
    fn test_defaults_round_trip_through_yaml() {
        let mut config = Config::default();
        config.vpn.provider.custom = Some(CustomEndpoint {
            name: "home".to_string(),
            ip: "198.51.100.4".parse().unwrap(),
            port: 1194,
            protocol: Protocol::Udp,
            port_forward: false,
            public_key: None,
        });
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert_eq!(Config::from_str(&yaml).unwrap(), config);
    }
}
