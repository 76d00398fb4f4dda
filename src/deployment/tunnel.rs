use crate::manifest::SshTunnelSettings;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reverse SSH tunnel so the VM can reach a registry listening locally.
#[derive(Debug, Clone)]
pub struct SshTunnelOptions {
    pub settings: SshTunnelSettings,
    /// Port opened on the VM side.
    pub remote_port: u16,
    /// Local port the tunnel forwards to.
    pub local_port: u16,
    pub program: PathBuf,
    pub restart_delay: Duration,
}

impl SshTunnelOptions {
    pub fn new(settings: SshTunnelSettings, remote_port: u16, local_port: u16) -> Self {
        Self {
            settings,
            remote_port,
            local_port,
            program: PathBuf::from("ssh"),
            restart_delay: Duration::from_secs(1),
        }
    }

    fn args(&self) -> Vec<String> {
        vec![
            "-N".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
            "-i".to_string(),
            self.settings.private_key.clone(),
            "-p".to_string(),
            self.settings.port.to_string(),
            "-R".to_string(),
            format!("{}:127.0.0.1:{}", self.remote_port, self.local_port),
            format!("{}@{}", self.settings.user, self.settings.host),
        ]
    }
}

pub struct SshTunnel;

impl SshTunnel {
    /// Spawn the tunnel in the background. The ssh process is restarted
    /// whenever it exits until the returned handle is stopped or dropped.
    pub fn start(options: SshTunnelOptions) -> SshTunnelHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let args = options.args();
            let mut attempt: u64 = 0;
            loop {
                attempt += 1;
                debug!("Starting ssh tunnel (attempt {}): {:?} {:?}", attempt, options.program, args);
                let child = tokio::process::Command::new(&options.program)
                    .args(&args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .spawn();

                match child {
                    Ok(mut child) => {
                        tokio::select! {
                            status = child.wait() => match status {
                                Ok(status) => warn!("SSH tunnel exited with {}, restarting", status),
                                Err(e) => warn!("Waiting for ssh tunnel failed: {}", e),
                            },
                            _ = shutdown_rx.changed() => {
                                if let Err(e) = child.kill().await {
                                    warn!("Killing ssh tunnel failed: {}", e);
                                }
                                break;
                            }
                        }
                    }
                    Err(e) => warn!("Starting ssh tunnel failed: {}", e),
                }

                tokio::select! {
                    _ = tokio::time::sleep(options.restart_delay) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("SSH tunnel supervisor exiting");
        });

        info!("SSH tunnel supervisor started");
        SshTunnelHandle {
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }
}

pub struct SshTunnelHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SshTunnelHandle {
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("SSH tunnel supervisor failed: {}", e);
            }
        }
        info!("SSH tunnel stopped");
    }
}

impl Drop for SshTunnelHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
