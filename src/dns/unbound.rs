//! Unbound resolver process

use super::DnsServer;
use crate::common::SharedClient;
use crate::config::DnsSettings;
use crate::process::{supervise, ProcessConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct UnboundServer {
    client: Arc<SharedClient>,
}

impl UnboundServer {
    pub fn new(client: Arc<SharedClient>) -> Self {
        UnboundServer { client }
    }

    async fn download_block_list(&self, url: &str) -> Result<Vec<String>> {
        let response = self.client.client().get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::dns(format!("block list {} returned {}", url, response.status())));
        }
        let body = response.text().await?;
        Ok(block_list_zones(&body))
    }
}

/// Domains of a hosts-style or plain block list as unbound local zones
fn block_list_zones(body: &str) -> Vec<String> {
    body.lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_whitespace().last())
        .filter(|domain| *domain != "localhost" && domain.contains('.'))
        .map(|domain| format!("local-zone: \"{}\" always_nxdomain", domain))
        .collect()
}

fn unbound_config(settings: &DnsSettings) -> String {
    let mut lines = vec![
        "server:".to_string(),
        "  interface: 127.0.0.1".to_string(),
        "  port: 53".to_string(),
        "  do-daemonize: no".to_string(),
        "  use-syslog: no".to_string(),
        "  username: \"\"".to_string(),
        "  hide-identity: yes".to_string(),
        "  hide-version: yes".to_string(),
        "  qname-minimisation: yes".to_string(),
        format!("  include: \"{}/*.conf\"", settings.block_list_dir.display()),
    ];
    lines.push(String::new());
    lines.join("\n")
}

async fn write_file(path: &Path, content: String) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    fs::write(path, content).await?;
    Ok(())
}

#[async_trait]
impl DnsServer for UnboundServer {
    async fn run(&self, settings: &DnsSettings, cancel: CancellationToken, ready: oneshot::Sender<()>) -> Result<()> {
        fs::create_dir_all(&settings.block_list_dir).await?;
        write_file(&settings.config_path, unbound_config(settings)).await?;

        let process = ProcessConfig::new("unbound", settings.binary.clone(), Error::dns::<String>)
            .args(["-d", "-c"])
            .arg(settings.config_path.display().to_string());
        supervise(&process, &cancel, ready).await
    }

    async fn update(&self, settings: &DnsSettings, cancel: &CancellationToken) -> Result<()> {
        fs::create_dir_all(&settings.block_list_dir).await?;
        for (index, url) in settings.block_lists.iter().enumerate() {
            let zones = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                zones = self.download_block_list(url) => zones,
            };
            match zones {
                Ok(zones) => {
                    let mut content = format!("server:\n  {}", zones.join("\n  "));
                    content.push('\n');
                    let path = settings.block_list_dir.join(format!("blocklist-{}.conf", index));
                    write_file(&path, content).await?;
                    info!("Block list {} loaded with {} domains", url, zones.len());
                }
                Err(e) => warn!("Block list {} not updated: {}", url, e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_list_zones() {
        let body = "# comment\n0.0.0.0 ads.example.com\n127.0.0.1 localhost\ntracker.example.net # inline\n\n";
        assert_eq!(
            block_list_zones(body),
            vec![
                "local-zone: \"ads.example.com\" always_nxdomain".to_string(),
                "local-zone: \"tracker.example.net\" always_nxdomain".to_string(),
            ]
        );
    }

    #[test]
    fn test_unbound_config_includes_block_lists() {
        let config = unbound_config(&DnsSettings::default());
        assert!(config.starts_with("server:"));
        assert!(config.contains("include: \"/etc/unbound/blocklists/*.conf\""));
    }
}
