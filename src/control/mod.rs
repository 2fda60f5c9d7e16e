//! Transport-agnostic control surface
//!
//! Any front end (HTTP server, IPC, tests) drives the subsystems through
//! [`Control`]: status, apply status, get settings and set settings per
//! subsystem. Settings travel as JSON values in the configuration's
//! kebab-case layout.

use crate::dns::DnsLoop;
use crate::loopstate::LoopStatus;
use crate::portforward::PortForwardLoop;
use crate::proxy::ProxyLoop;
use crate::publicip::{IpData, PublicIp};
use crate::vpn::VpnLoop;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Independently controllable subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Subsystem {
    Vpn,
    Dns,
    PortForwarding,
    HttpProxy,
    Shadowsocks,
}

impl Subsystem {
    pub const ALL: [Subsystem; 5] = [
        Subsystem::Vpn,
        Subsystem::Dns,
        Subsystem::PortForwarding,
        Subsystem::HttpProxy,
        Subsystem::Shadowsocks,
    ];
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subsystem::Vpn => write!(f, "vpn"),
            Subsystem::Dns => write!(f, "dns"),
            Subsystem::PortForwarding => write!(f, "port-forwarding"),
            Subsystem::HttpProxy => write!(f, "http-proxy"),
            Subsystem::Shadowsocks => write!(f, "shadowsocks"),
        }
    }
}

impl FromStr for Subsystem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Subsystem::ALL
            .into_iter()
            .find(|subsystem| subsystem.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::parse(format!("unknown subsystem: {}", s)))
    }
}

/// Handles to every subsystem loop
#[derive(Clone)]
pub struct Control {
    vpn: Arc<VpnLoop>,
    dns: Arc<DnsLoop>,
    port_forward: Arc<PortForwardLoop>,
    http_proxy: Arc<ProxyLoop>,
    shadowsocks: Arc<ProxyLoop>,
    public_ip: Arc<PublicIp>,
}

impl Control {
    pub fn new(
        vpn: Arc<VpnLoop>,
        dns: Arc<DnsLoop>,
        port_forward: Arc<PortForwardLoop>,
        http_proxy: Arc<ProxyLoop>,
        shadowsocks: Arc<ProxyLoop>,
        public_ip: Arc<PublicIp>,
    ) -> Self {
        Control {
            vpn,
            dns,
            port_forward,
            http_proxy,
            shadowsocks,
            public_ip,
        }
    }

    fn proxy(&self, subsystem: Subsystem) -> Option<&Arc<ProxyLoop>> {
        match subsystem {
            Subsystem::HttpProxy => Some(&self.http_proxy),
            Subsystem::Shadowsocks => Some(&self.shadowsocks),
            _ => None,
        }
    }

    pub fn status(&self, subsystem: Subsystem) -> LoopStatus {
        match subsystem {
            Subsystem::Vpn => self.vpn.status(),
            Subsystem::Dns => self.dns.status(),
            Subsystem::PortForwarding => self.port_forward.status(),
            Subsystem::HttpProxy => self.http_proxy.status(),
            Subsystem::Shadowsocks => self.shadowsocks.status(),
        }
    }

    pub async fn apply_status(
        &self,
        cancel: &CancellationToken,
        subsystem: Subsystem,
        status: LoopStatus,
    ) -> Result<String> {
        match subsystem {
            Subsystem::Vpn => self.vpn.apply_status(cancel, status).await,
            Subsystem::Dns => self.dns.apply_status(cancel, status).await,
            Subsystem::PortForwarding => self.port_forward.apply_status(cancel, status).await,
            Subsystem::HttpProxy => self.http_proxy.apply_status(cancel, status).await,
            Subsystem::Shadowsocks => self.shadowsocks.apply_status(cancel, status).await,
        }
    }

    pub fn settings(&self, subsystem: Subsystem) -> Result<Value> {
        let value = match subsystem {
            Subsystem::Vpn => serde_json::to_value(self.vpn.get_settings())?,
            Subsystem::Dns => serde_json::to_value(self.dns.get_settings())?,
            Subsystem::PortForwarding => serde_json::to_value(self.port_forward.get_settings())?,
            Subsystem::HttpProxy | Subsystem::Shadowsocks => match self.proxy(subsystem) {
                Some(proxy) => serde_json::to_value(proxy.get_settings())?,
                None => return Err(Error::internal(format!("{} has no proxy loop", subsystem))),
            },
        };
        Ok(value)
    }

    /// Replace the settings of `subsystem`; the whole settings object is expected
    pub async fn set_settings(&self, cancel: &CancellationToken, subsystem: Subsystem, value: Value) -> Result<String> {
        match subsystem {
            Subsystem::Vpn => {
                let settings = serde_json::from_value(value)?;
                self.vpn.set_settings(cancel, settings).await
            }
            Subsystem::Dns => {
                let settings = serde_json::from_value(value)?;
                self.dns.set_settings(cancel, settings).await
            }
            Subsystem::PortForwarding => {
                let settings = serde_json::from_value(value)?;
                self.port_forward.set_settings(cancel, settings).await
            }
            Subsystem::HttpProxy => {
                let settings = serde_json::from_value(value)?;
                self.http_proxy.set_settings(cancel, settings).await
            }
            Subsystem::Shadowsocks => {
                let settings = serde_json::from_value(value)?;
                self.shadowsocks.set_settings(cancel, settings).await
            }
        }
    }

    /// Forwarded port, 0 when none
    pub fn forwarded_port(&self) -> u16 {
        self.port_forward.port()
    }

    pub fn public_ip(&self) -> Option<IpData> {
        self.public_ip.data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsystem_names() {
        for subsystem in Subsystem::ALL {
            assert_eq!(subsystem.to_string().parse::<Subsystem>().unwrap(), subsystem);
        }
        assert_eq!("Port-Forwarding".parse::<Subsystem>().unwrap(), Subsystem::PortForwarding);
        assert!("firewall".parse::<Subsystem>().is_err());

        let json = serde_json::to_string(&Subsystem::HttpProxy).unwrap();
        assert_eq!(json, "\"http-proxy\"");
    }

    fn control() -> Control {
        let mut config = crate::Config::default();
        config.firewall.enabled = false;
        config.version_check = false;
        crate::Supervisor::new(config).unwrap().control()
    }

    #[tokio::test]
    async fn test_settings_as_json() {
        let control = control();
        let cancel = CancellationToken::new();

        let dns = control.settings(Subsystem::Dns).unwrap();
        assert_eq!(dns["update-period"], 86400);
        let outcome = control.set_settings(&cancel, Subsystem::Dns, dns).await.unwrap();
        assert_eq!(outcome, crate::loopstate::SETTINGS_UNCHANGED);

        let vpn = control.settings(Subsystem::Vpn).unwrap();
        assert_eq!(vpn["type"], "openvpn");

        let err = control
            .set_settings(&cancel, Subsystem::PortForwarding, serde_json::json!({"enabled": "yes"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_idle_status_and_port() {
        let control = control();
        for subsystem in Subsystem::ALL {
            assert_eq!(control.status(subsystem), LoopStatus::Stopped);
        }
        assert_eq!(control.forwarded_port(), 0);
        assert!(control.public_ip().is_none());
    }
}
