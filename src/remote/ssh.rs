//! OpenSSH client transport.
//!
//! Every command spawns the system `ssh` binary through
//! `tokio::process::Command`, so callers stay async and no SSH library has to
//! agree with the SUT's sshd about ciphers.
//!
//! Exit status 255 is how `ssh` reports its own failures (refused, reset,
//! host key mismatch), so that is what gets classified as a lost connection.
//! Any other status belongs to the remote command.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{CommandOutput, RemoteShell, ShellError};
use crate::config::SshConfig;

/// Exit code `ssh` itself uses for transport errors.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// SSH options shared by every invocation.
///
/// * `LogLevel=ERROR` — suppress banner noise.
/// * `BatchMode=yes` — fail immediately if a password prompt would appear.
/// * `ServerAliveInterval=15` — notice half-dead sessions during long commands.
const SSH_OPTS: &[&str] = &[
    "-o", "LogLevel=ERROR",
    "-o", "BatchMode=yes",
    "-o", "ServerAliveInterval=15",
];

/// SSH session to one host (the SUT, or a guest reached by IP).
#[derive(Debug, Clone)]
pub struct SshShell {
    host: String,
    user: String,
    port: u16,
    identity_file: Option<PathBuf>,
    known_hosts: Option<PathBuf>,
    connect_timeout: Duration,
}

impl SshShell {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: 22,
            identity_file: None,
            known_hosts: None,
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn from_config(config: &SshConfig) -> Self {
        Self {
            host: config.host.clone(),
            user: config.user.clone(),
            port: config.port,
            identity_file: config.identity_file.clone(),
            known_hosts: config.known_hosts_file.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Build the full `ssh` argument vector for `command`.
    pub fn build_args(&self, command: &str) -> Vec<String> {
        let mut args: Vec<String> = SSH_OPTS.iter().map(|s| s.to_string()).collect();

        match &self.known_hosts {
            // Reinstalled SUTs change host keys; `reconnect` drops the stale one.
            Some(path) => args.extend([
                "-o".to_string(),
                format!("UserKnownHostsFile={}", path.display()),
                "-o".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
            ]),
            // Ephemeral guests: never record their keys.
            None => args.extend([
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
            ]),
        }

        args.extend([
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            self.port.to_string(),
        ]);
        if let Some(identity) = &self.identity_file {
            args.extend(["-i".to_string(), identity.display().to_string()]);
        }
        args.push(format!("{}@{}", self.user, self.host));
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    fn host(&self) -> &str {
        &self.host
    }

    async fn reconnect(&self) -> Result<(), ShellError> {
        let Some(known_hosts) = &self.known_hosts else {
            // Nothing cached between invocations.
            return Ok(());
        };

        info!(host = %self.host, "dropping cached host key before reconnect");
        let status = Command::new("ssh-keygen")
            .arg("-f")
            .arg(known_hosts)
            .arg("-R")
            .arg(&self.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ShellError::ConnectionLost(format!("failed to spawn ssh-keygen: {e}")))?;

        if status.success() {
            Ok(())
        } else {
            Err(ShellError::ConnectionLost(format!(
                "ssh-keygen -R {} exited with {}",
                self.host,
                status.code().unwrap_or(-1)
            )))
        }
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ShellError> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.build_args(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| ShellError::ConnectionLost(format!("failed to spawn ssh: {e}")))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ShellError::ConnectionLost(e.to_string()))?,
            Err(_) => return Err(ShellError::Timeout),
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if exit_code == SSH_TRANSPORT_EXIT {
            return Err(ShellError::ConnectionLost(stderr.trim().to_string()));
        }

        debug!(host = %self.host, command, exit_code, "ssh command returned");
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}
