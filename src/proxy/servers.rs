//! tinyproxy and ssserver processes

use super::ProxyServer;
use crate::config::ProxySettings;
use crate::process::{supervise, ProcessConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const HTTP_PROXY_LISTEN: &str = "0.0.0.0:8888";
const SHADOWSOCKS_LISTEN: &str = "0.0.0.0:8388";
const SHADOWSOCKS_CIPHER: &str = "chacha20-ietf-poly1305";

/// HTTP proxy backed by tinyproxy
pub struct TinyProxyServer {
    binary: PathBuf,
    config_path: PathBuf,
}

impl TinyProxyServer {
    pub fn new() -> Self {
        TinyProxyServer {
            binary: PathBuf::from("tinyproxy"),
            config_path: PathBuf::from("/etc/tinyproxy/tinyproxy.conf"),
        }
    }

    pub fn with_paths(binary: PathBuf, config_path: PathBuf) -> Self {
        TinyProxyServer { binary, config_path }
    }
}

impl Default for TinyProxyServer {
    fn default() -> Self {
        Self::new()
    }
}

fn tinyproxy_config(settings: &ProxySettings) -> Result<String> {
    let listen = settings.listen.as_deref().unwrap_or(HTTP_PROXY_LISTEN);
    let (address, port) = listen
        .rsplit_once(':')
        .ok_or_else(|| Error::proxy(format!("listen address {} has no port", listen)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::proxy(format!("invalid port in listen address {}", listen)))?;

    let mut lines = vec![format!("Port {}", port)];
    if !address.is_empty() && address != "0.0.0.0" {
        lines.push(format!("Listen {}", address));
    }
    lines.push("Timeout 600".to_string());
    lines.push(format!("LogLevel {}", if settings.log { "Info" } else { "Warning" }));
    lines.push("DisableViaHeader Yes".to_string());
    if let (Some(user), Some(password)) = (&settings.user, &settings.password) {
        lines.push(format!("BasicAuth {} {}", user, password));
    }
    lines.push(String::new());
    Ok(lines.join("\n"))
}

#[async_trait]
impl ProxyServer for TinyProxyServer {
    fn name(&self) -> &'static str {
        "http proxy"
    }

    async fn run(&self, settings: &ProxySettings, cancel: CancellationToken, ready: oneshot::Sender<()>) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.config_path, tinyproxy_config(settings)?).await?;

        let process = ProcessConfig::new("tinyproxy", self.binary.clone(), Error::proxy::<String>)
            .args(["-d", "-c"])
            .arg(self.config_path.display().to_string());
        supervise(&process, &cancel, ready).await
    }
}

/// Shadowsocks server backed by `ssserver`
pub struct ShadowsocksServer {
    binary: PathBuf,
}

impl ShadowsocksServer {
    pub fn new() -> Self {
        ShadowsocksServer {
            binary: PathBuf::from("ssserver"),
        }
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        ShadowsocksServer { binary }
    }
}

impl Default for ShadowsocksServer {
    fn default() -> Self {
        Self::new()
    }
}

fn ssserver_args(settings: &ProxySettings) -> Result<Vec<String>> {
    let password = settings
        .password
        .as_ref()
        .ok_or_else(|| Error::proxy("shadowsocks requires a password"))?;
    let mut args = vec![
        "-s".to_string(),
        settings.listen.clone().unwrap_or_else(|| SHADOWSOCKS_LISTEN.to_string()),
        "-m".to_string(),
        settings.cipher.clone().unwrap_or_else(|| SHADOWSOCKS_CIPHER.to_string()),
        "-k".to_string(),
        password.clone(),
        "-U".to_string(),
    ];
    if settings.log {
        args.push("-v".to_string());
    }
    Ok(args)
}

#[async_trait]
impl ProxyServer for ShadowsocksServer {
    fn name(&self) -> &'static str {
        "shadowsocks"
    }

    async fn run(&self, settings: &ProxySettings, cancel: CancellationToken, ready: oneshot::Sender<()>) -> Result<()> {
        let process = ProcessConfig::new("ssserver", self.binary.clone(), Error::proxy::<String>)
            .args(ssserver_args(settings)?);
        supervise(&process, &cancel, ready).await
    }
}
