//! Child process supervision
//!
//! Every external daemon the orchestrator drives (OpenVPN, Unbound, tinyproxy,
//! ssserver) runs through [`supervise`]: spawn, relay output to the log, signal
//! readiness, and terminate gracefully on cancellation. One-shot helpers such
//! as `iptables` or `wg-quick` go through [`run_command`].

use crate::{Error, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time given to a child after SIGTERM before it is killed
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// How to run one supervised child process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Name used as log prefix
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Stdout line announcing readiness; ready right after spawn when `None`
    pub ready_marker: Option<String>,
    /// Error constructor for spawn failures and unexpected exits
    pub failure: fn(String) -> Error,
}

impl ProcessConfig {
    pub fn new<S: Into<String>>(name: S, program: PathBuf, failure: fn(String) -> Error) -> Self {
        ProcessConfig {
            name: name.into(),
            program,
            args: Vec::new(),
            ready_marker: None,
            failure,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn ready_marker<S: Into<String>>(mut self, marker: S) -> Self {
        self.ready_marker = Some(marker.into());
        self
    }

    fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Run a child process until it exits or `cancel` fires.
///
/// `ready` is fired at most once. Cancellation terminates the child and
/// returns `Ok(())`; any exit not caused by cancellation is an error built
/// with [`ProcessConfig::failure`].
pub async fn supervise(
    config: &ProcessConfig,
    cancel: &CancellationToken,
    ready: oneshot::Sender<()>,
) -> Result<()> {
    let name = config.name.as_str();

    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    info!("Starting {}: {}", name, config.command_line());
    let mut child = cmd
        .spawn()
        .map_err(|e| (config.failure)(format!("failed to spawn {}: {}", name, e)))?;
    info!("{} started with PID: {}", name, child.id().unwrap_or(0));

    let mut ready = Some(ready);
    if config.ready_marker.is_none() {
        fire(&mut ready);
    }

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(relay_lines(name.to_string(), stderr));
    }
    let mut stdout = child.stdout.take().map(|out| BufReader::new(out).lines());

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminate(&mut child, name).await;
                return Ok(());
            }
            status = child.wait() => {
                let status = status?;
                return Err((config.failure)(format!("{} exited unexpectedly: {}", name, status)));
            }
            line = next_line(&mut stdout) => match line {
                Some(line) => {
                    debug!("{}: {}", name, line);
                    if let Some(marker) = &config.ready_marker {
                        if line.contains(marker.as_str()) && ready.is_some() {
                            info!("{} is ready", name);
                            fire(&mut ready);
                        }
                    }
                }
                None => stdout = None,
            },
        }
    }
}

/// Run a command to completion and return its stdout
pub async fn run_command(program: &PathBuf, args: &[String], failure: fn(String) -> Error) -> Result<String> {
    debug!("Running {} {}", program.display(), args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| failure(format!("failed to run {}: {}", program.display(), e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(failure(format!(
            "{} {} failed ({}): {}",
            program.display(),
            args.join(" "),
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn fire(ready: &mut Option<oneshot::Sender<()>>) {
    if let Some(tx) = ready.take() {
        let _ = tx.send(());
    }
}

async fn next_line(lines: &mut Option<Lines<BufReader<ChildStdout>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

async fn relay_lines<R: AsyncRead + Unpin>(name: String, reader: R) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("{}: {}", name, line);
    }
}

/// SIGTERM first, kill after a timeout
async fn terminate(child: &mut Child, name: &str) {
    info!("Stopping {}...", name);

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    match timeout(TERMINATE_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => info!("{} exited with status: {}", name, status),
        Ok(Err(e)) => warn!("Error waiting for {}: {}", name, e),
        Err(_) => {
            warn!("{} didn't exit gracefully, forcing kill", name);
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessConfig {
        ProcessConfig::new("sh", PathBuf::from("sh"), Error::tunnel::<String>).args(["-c", script])
    }

    #[tokio::test]
    async fn test_ready_marker_then_cancel() {
        let config = sh("echo booting; echo all systems go; sleep 30").ready_marker("systems go");
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { supervise(&config, &cancel, tx).await })
        };

        rx.await.unwrap();
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_error() {
        let config = sh("exit 3").ready_marker("never printed");
        let cancel = CancellationToken::new();
        let (tx, mut rx) = oneshot::channel();

        let err = supervise(&config, &cancel, tx).await.unwrap_err();
        assert!(matches!(err, Error::Tunnel(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_program() {
        let config = ProcessConfig::new("ghost", PathBuf::from("/nonexistent/ghost"), Error::dns::<String>);
        let cancel = CancellationToken::new();
        let (tx, _rx) = oneshot::channel();
        let err = supervise(&config, &cancel, tx).await.unwrap_err();
        assert!(matches!(err, Error::Dns(_)));
    }

    #[tokio::test]
    async fn test_run_command_output() {
        let out = run_command(&PathBuf::from("echo"), &["hello".to_string()], Error::firewall::<String>)
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");

        let err = run_command(&PathBuf::from("false"), &[], Error::firewall::<String>)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Firewall(_)));
    }
}
