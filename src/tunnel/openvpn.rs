//! OpenVPN process runner

use super::TunnelRunner;
use crate::config::OpenVpnSettings;
use crate::process::{supervise, ProcessConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Printed by OpenVPN once routes and the tun device are set up
const READY_MARKER: &str = "Initialization Sequence Completed";

pub struct OpenVpnRunner {
    process: ProcessConfig,
}

impl OpenVpnRunner {
    pub fn new(settings: &OpenVpnSettings) -> Self {
        let process = ProcessConfig::new("openvpn", settings.binary.clone(), Error::tunnel::<String>)
            .arg("--config")
            .arg(settings.config_path.display().to_string())
            .ready_marker(READY_MARKER);
        OpenVpnRunner { process }
    }
}

#[async_trait]
impl TunnelRunner for OpenVpnRunner {
    async fn run(&self, cancel: CancellationToken, ready: oneshot::Sender<()>) -> Result<()> {
        supervise(&self.process, &cancel, ready).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openvpn_command() {
        let runner = OpenVpnRunner::new(&OpenVpnSettings::default());
        assert_eq!(runner.process.args, vec!["--config", "/etc/openvpn/target.ovpn"]);
        assert_eq!(runner.process.ready_marker.as_deref(), Some(READY_MARKER));
    }
}
