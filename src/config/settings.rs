//! Per-subsystem settings

use crate::common::serde_secs;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Tunnel implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VpnType {
    #[serde(rename = "openvpn")]
    OpenVpn,
    #[serde(rename = "wireguard")]
    WireGuard,
}

impl Default for VpnType {
    fn default() -> Self {
        VpnType::OpenVpn
    }
}

impl std::fmt::Display for VpnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VpnType::OpenVpn => write!(f, "openvpn"),
            VpnType::WireGuard => write!(f, "wireguard"),
        }
    }
}

/// Transport protocol of the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Udp
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// VPN service implementations known at build time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Single endpoint given in the configuration
    Custom,
    /// Operator supplied server list
    Servers,
}

impl Default for ProviderKind {
    fn default() -> Self {
        ProviderKind::Custom
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Custom => write!(f, "custom"),
            ProviderKind::Servers => write!(f, "servers"),
        }
    }
}

/// VPN tunnel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct VpnSettings {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub vpn_type: VpnType,
    pub provider: ProviderSettings,
    pub openvpn: OpenVpnSettings,
    pub wireguard: WireguardSettings,
}

impl Default for VpnSettings {
    fn default() -> Self {
        VpnSettings {
            enabled: true,
            vpn_type: VpnType::OpenVpn,
            provider: ProviderSettings::default(),
            openvpn: OpenVpnSettings::default(),
            wireguard: WireguardSettings::default(),
        }
    }
}

impl VpnSettings {
    /// Network interface the tunnel comes up on
    pub fn interface(&self) -> &str {
        match self.vpn_type {
            VpnType::OpenVpn => &self.openvpn.interface,
            VpnType::WireGuard => &self.wireguard.interface,
        }
    }
}

/// Provider and server selection
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProviderSettings {
    pub name: ProviderKind,
    pub selection: ServerSelection,
    /// Endpoint for the `custom` provider
    pub custom: Option<CustomEndpoint>,
    /// Server list for the `servers` provider
    pub servers: Vec<ServerEntry>,
}

/// Filters applied when picking a server
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerSelection {
    pub server_names: Vec<String>,
    pub regions: Vec<String>,
    pub protocol: Protocol,
    pub port_forward_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CustomEndpoint {
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub port_forward: bool,
    /// WireGuard server public key
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerEntry {
    pub name: String,
    #[serde(default)]
    pub region: String,
    pub ip: IpAddr,
    #[serde(default = "default_openvpn_port")]
    pub openvpn_port: u16,
    #[serde(default = "default_wireguard_port")]
    pub wireguard_port: u16,
    #[serde(default = "default_true")]
    pub udp: bool,
    #[serde(default)]
    pub tcp: bool,
    #[serde(default)]
    pub port_forward: bool,
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OpenVpnSettings {
    pub interface: String,
    pub binary: PathBuf,
    /// Where the generated configuration is written
    pub config_path: PathBuf,
    /// Where the credentials file is written
    pub auth_path: PathBuf,
    pub user: Option<String>,
    pub password: Option<String>,
    pub verbosity: u8,
    /// Appended verbatim to the generated configuration
    pub extra_lines: Vec<String>,
}

impl Default for OpenVpnSettings {
    fn default() -> Self {
        OpenVpnSettings {
            interface: "tun0".to_string(),
            binary: PathBuf::from("openvpn"),
            config_path: PathBuf::from("/etc/openvpn/target.ovpn"),
            auth_path: PathBuf::from("/etc/openvpn/auth.conf"),
            user: None,
            password: None,
            verbosity: 1,
            extra_lines: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WireguardSettings {
    pub interface: String,
    pub binary: PathBuf,
    pub config_dir: PathBuf,
    pub private_key: Option<String>,
    pub preshared_key: Option<String>,
    pub addresses: Vec<String>,
    pub mtu: u16,
}

impl WireguardSettings {
    /// `wg-quick` derives the interface name from the file name
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.conf", self.interface))
    }
}

impl Default for WireguardSettings {
    fn default() -> Self {
        WireguardSettings {
            interface: "wg0".to_string(),
            binary: PathBuf::from("wg-quick"),
            config_dir: PathBuf::from("/etc/wireguard"),
            private_key: None,
            preshared_key: None,
            addresses: Vec::new(),
            mtu: 1400,
        }
    }
}

/// DNS resolver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DnsSettings {
    pub enabled: bool,
    /// Block list refresh interval
    #[serde(with = "serde_secs")]
    pub update_period: Duration,
    pub binary: PathBuf,
    pub config_path: PathBuf,
    pub block_lists: Vec<String>,
    pub block_list_dir: PathBuf,
}

impl Default for DnsSettings {
    fn default() -> Self {
        DnsSettings {
            enabled: true,
            update_period: Duration::from_secs(24 * 60 * 60),
            binary: PathBuf::from("unbound"),
            config_path: PathBuf::from("/etc/unbound/unbound.conf"),
            block_lists: Vec::new(),
            block_list_dir: PathBuf::from("/etc/unbound/blocklists"),
        }
    }
}

/// Port forwarding settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PortForwardSettings {
    pub enabled: bool,
    /// File holding the forwarded port
    pub status_file: PathBuf,
    pub uid: u32,
    pub gid: u32,
    /// Gateway answering NAT-PMP requests inside the tunnel
    pub natpmp_gateway: Option<IpAddr>,
}

impl Default for PortForwardSettings {
    fn default() -> Self {
        PortForwardSettings {
            enabled: false,
            status_file: PathBuf::from("/tmp/tunwarden/forwarded_port"),
            uid: 1000,
            gid: 1000,
            natpmp_gateway: None,
        }
    }
}

/// Local proxy settings (HTTP proxy and Shadowsocks)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProxySettings {
    pub enabled: bool,
    /// Listen address, the server default when unset
    pub listen: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub cipher: Option<String>,
    /// Let the proxy log every request
    pub log: bool,
}

/// Public IP lookup settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PublicIpSettings {
    pub enabled: bool,
    pub api_url: String,
    pub ip_file: Option<PathBuf>,
}

impl Default for PublicIpSettings {
    fn default() -> Self {
        PublicIpSettings {
            enabled: true,
            api_url: "https://ipinfo.io/json".to_string(),
            ip_file: None,
        }
    }
}

/// Firewall settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FirewallSettings {
    pub enabled: bool,
    pub binary: PathBuf,
    pub binary_v6: PathBuf,
    /// Ports opened on the tunnel interface once it is up
    pub vpn_input_ports: Vec<u16>,
}

impl Default for FirewallSettings {
    fn default() -> Self {
        FirewallSettings {
            enabled: true,
            binary: PathBuf::from("iptables"),
            binary_v6: PathBuf::from("ip6tables"),
            vpn_input_ports: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_openvpn_port() -> u16 {
    1194
}

fn default_wireguard_port() -> u16 {
    51820
}
