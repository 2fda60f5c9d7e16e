//! Public IP lookup
//!
//! Triggered once every time the tunnel comes up and cleared when it goes
//! down, so the cached value always describes the current tunnel exit.

use crate::common::SharedClient;
use crate::config::PublicIpSettings;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Public address as seen from the outside
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpData {
    pub ip: IpAddr,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub organization: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Subset of the ipinfo.io response
#[derive(Debug, Deserialize)]
struct IpInfoResponse {
    ip: IpAddr,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    org: Option<String>,
}

impl IpData {
    fn parse(body: &str) -> Result<Self> {
        let response: IpInfoResponse = serde_json::from_str(body)?;
        Ok(IpData {
            ip: response.ip,
            country: response.country,
            region: response.region,
            city: response.city,
            organization: response.org,
            fetched_at: Utc::now(),
        })
    }

    fn location(&self) -> String {
        [&self.city, &self.region, &self.country]
            .iter()
            .filter_map(|part| part.as_deref())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub struct PublicIp {
    settings: PublicIpSettings,
    client: Arc<SharedClient>,
    data: RwLock<Option<IpData>>,
}

impl PublicIp {
    pub fn new(settings: PublicIpSettings, client: Arc<SharedClient>) -> Self {
        PublicIp {
            settings,
            client,
            data: RwLock::new(None),
        }
    }

    /// Last fetched data, `None` while the tunnel is down
    pub fn data(&self) -> Option<IpData> {
        self.data.read().clone()
    }

    pub fn clear_data(&self) {
        if self.data.write().take().is_some() {
            debug!("Public IP data cleared");
        }
    }

    /// Fetch the public IP once. `Ok(None)` when disabled or cancelled.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<Option<IpData>> {
        if !self.settings.enabled {
            return Ok(None);
        }

        let data = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            data = self.fetch() => data?,
        };

        let location = data.location();
        match &data.organization {
            Some(org) => info!("Public IP address is {} ({} - {})", data.ip, location, org),
            None => info!("Public IP address is {} ({})", data.ip, location),
        }

        if let Some(path) = &self.settings.ip_file {
            if let Err(e) = tokio::fs::write(path, data.ip.to_string()).await {
                warn!("Failed to write public IP to {}: {}", path.display(), e);
            }
        }

        *self.data.write() = Some(data.clone());
        Ok(Some(data))
    }

    async fn fetch(&self) -> Result<IpData> {
        let response = self
            .client
            .client()
            .get(&self.settings.api_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::network(format!(
                "public IP lookup returned {}",
                response.status()
            )));
        }
        let body = response.text().await?;
        IpData::parse(&body)
    }
}
