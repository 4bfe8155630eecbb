//! Remote execution channel to the gateway host
//!
//! Every operation against the gateway is a shell-level command executed over
//! SSH. Each invocation runs as its own `ssh` subprocess in batch mode, so a
//! dropped connection heals itself on the next call; there is no long-lived
//! session to babysit. The exit status drives the ack/failure decision.

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;
use wirevend_common::{Error, Result};

use crate::config::SshConfig;

/// ssh(1) reserves exit status 255 for its own (transport-level) failures;
/// anything else is the remote command's status.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Output of one remote command
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes shell commands on the gateway host.
///
/// A trait seam so tests can script the remote side without a network.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn exec(&self, command: &str) -> Result<ExecOutput>;
}

/// SSH-backed executor
pub struct SshExecutor {
    config: SshConfig,
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg("-p")
            .arg(self.config.port.to_string());
        if let Some(key) = &self.config.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{}@{}", self.config.username, self.config.host));
        cmd.arg(remote_command);
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        debug!("gateway exec: {}", command);

        let timeout = Duration::from_secs(self.config.command_timeout_secs);
        let output = tokio::time::timeout(timeout, self.build_command(command).output())
            .await
            .map_err(|_| {
                Error::GatewayUnreachable(format!(
                    "command timed out after {}s",
                    self.config.command_timeout_secs
                ))
            })?
            .map_err(|e| Error::GatewayUnreachable(format!("failed to spawn ssh: {}", e)))?;

        let exit_code = output.status.code();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if exit_code == Some(SSH_TRANSPORT_FAILURE) {
            return Err(Error::GatewayUnreachable(if stderr.is_empty() {
                "connection failed".to_string()
            } else {
                stderr
            }));
        }

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_shape() {
        let config = SshConfig {
            host: "gw.example.com".to_string(),
            port: 2222,
            username: "ops".to_string(),
            key_path: Some("/keys/id_ed25519".into()),
            command_timeout_secs: 30,
        };
        let exec = SshExecutor::new(config);
        let cmd = exec.build_command("wg show wg0");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"ops@gw.example.com".to_string()));
        assert_eq!(args.last().unwrap(), "wg show wg0");
    }
}
