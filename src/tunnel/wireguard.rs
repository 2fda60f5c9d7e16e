//! WireGuard runner built on `wg-quick`

use super::TunnelRunner;
use crate::config::WireguardSettings;
use crate::process::run_command;
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Brings the interface up, holds it until cancelled, then takes it down.
///
/// The kernel owns a WireGuard interface, so there is no process that could
/// die on its own once `wg-quick up` succeeded.
pub struct WireguardRunner {
    binary: PathBuf,
    config_path: PathBuf,
}

impl WireguardRunner {
    pub fn new(settings: &WireguardSettings) -> Self {
        WireguardRunner {
            binary: settings.binary.clone(),
            config_path: settings.config_path(),
        }
    }

    fn args(&self, action: &str) -> Vec<String> {
        vec![action.to_string(), self.config_path.display().to_string()]
    }
}

#[async_trait]
impl TunnelRunner for WireguardRunner {
    async fn run(&self, cancel: CancellationToken, ready: oneshot::Sender<()>) -> Result<()> {
        let up_args = self.args("up");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            up = run_command(&self.binary, &up_args, Error::tunnel::<String>) => { up?; }
        }
        info!("WireGuard interface is up");
        let _ = ready.send(());

        cancel.cancelled().await;
        if let Err(e) = run_command(&self.binary, &self.args("down"), Error::tunnel::<String>).await {
            warn!("WireGuard interface teardown: {}", e);
        }
        info!("WireGuard interface is down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_up_failure_is_tunnel_error() {
        let settings = WireguardSettings {
            binary: PathBuf::from("false"),
            ..Default::default()
        };
        let runner = WireguardRunner::new(&settings);
        let (tx, mut rx) = oneshot::channel();

        let err = runner.run(CancellationToken::new(), tx).await.unwrap_err();
        assert!(matches!(err, Error::Tunnel(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_up_then_cancel() {
        let settings = WireguardSettings {
            binary: PathBuf::from("true"),
            ..Default::default()
        };
        let runner = WireguardRunner::new(&settings);
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.run(cancel, tx).await })
        };
        rx.await.unwrap();
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}
