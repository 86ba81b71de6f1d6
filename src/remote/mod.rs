//! Remote command execution against the SUT or a guest.
//!
//! [`RemoteShell`] is the raw transport (an SSH client, a serial console, a
//! test double). [`CommandExecutor`] wraps it with the policy every other
//! component relies on:
//!
//! ```text
//! execute(cmd)
//!     ├─► shell.run ── Ok(exit 0) ──────────────► Ok(output)
//!     ├─► shell.run ── Ok(exit != 0) ───────────► Err(CommandFailed)   never retried
//!     ├─► shell.run ── Timeout ─────────────────► Err(CommandTimeout)  never retried
//!     └─► shell.run ── ConnectionLost ─► backoff, shell.reconnect, retry
//!                                         (budget spent) ─► Err(ConnectionLost)
//! ```
//!
//! Only transport failures are retried: a command that ran and failed may
//! already have had side effects on the target.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::{Advisory, AdvisoryError, Error, Result};

pub mod ssh;

pub use ssh::SshShell;

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Transport-level failure reported by a [`RemoteShell`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellError {
    /// Session dropped, handshake refused, host key changed, ...
    ConnectionLost(String),
    /// The command did not return within the bound. The remote side may
    /// still be running it.
    Timeout,
}

/// Raw command transport to one host.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Host this shell talks to, used in logs and errors.
    fn host(&self) -> &str;

    /// Re-establish the session (drop cached sessions, refresh host keys).
    async fn reconnect(&self) -> std::result::Result<(), ShellError>;

    /// Run `command` and wait for it up to `timeout`.
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
    ) -> std::result::Result<CommandOutput, ShellError>;
}

/// Reconnect-and-retry budget for transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Resilient command runner shared by every component that touches a host.
#[derive(Clone)]
pub struct CommandExecutor {
    shell: Arc<dyn RemoteShell>,
    retry: RetryPolicy,
    default_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(shell: Arc<dyn RemoteShell>, retry: RetryPolicy, default_timeout: Duration) -> Self {
        Self {
            shell,
            retry,
            default_timeout,
        }
    }

    pub fn host(&self) -> &str {
        self.shell.host()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run `command`, failing on non-zero exit.
    pub async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        self.execute_quiet(command, timeout).await.inspect_err(|err| {
            error!(
                host = self.host(),
                command,
                error = %err,
                stderr = err.stderr().map(str::trim).unwrap_or_default(),
                "remote command failed"
            );
        })
    }

    /// [`execute`](Self::execute) with the configured default timeout.
    pub async fn run(&self, command: &str) -> Result<CommandOutput> {
        self.execute(command, self.default_timeout).await
    }

    /// Run an advisory command. Any failure comes back as an
    /// [`AdvisoryError`] carrying whatever output was produced.
    pub async fn execute_best_effort(&self, command: &str, timeout: Duration) -> Advisory<CommandOutput> {
        self.execute_quiet(command, timeout).await.map_err(|err| {
            debug!(host = self.host(), command, error = %err, "advisory command failed");
            AdvisoryError::from(err)
        })
    }

    /// Same contract as [`execute`](Self::execute), but failures are left
    /// for the caller to log. For commands whose non-zero exit is an answer
    /// ("no such pool") rather than a fault.
    pub async fn execute_quiet(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let started = Instant::now();
        let output = self.run_with_reconnect(command, timeout, started).await?;

        if !output.success() {
            return Err(Error::CommandFailed {
                host: self.host().to_string(),
                command: command.to_string(),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
                elapsed: started.elapsed(),
            });
        }

        debug!(host = self.host(), command, stdout = %output.stdout.trim(), "remote command ok");
        Ok(output)
    }

    async fn run_with_reconnect(
        &self,
        command: &str,
        timeout: Duration,
        started: Instant,
    ) -> Result<CommandOutput> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.shell.run(command, timeout).await {
                Ok(output) => return Ok(output),
                Err(ShellError::Timeout) => {
                    return Err(Error::CommandTimeout {
                        host: self.host().to_string(),
                        command: command.to_string(),
                        elapsed: started.elapsed(),
                    });
                }
                Err(ShellError::ConnectionLost(reason)) => {
                    if attempt >= max_attempts {
                        return Err(Error::ConnectionLost {
                            host: self.host().to_string(),
                            command: command.to_string(),
                            attempts: attempt,
                            reason,
                            elapsed: started.elapsed(),
                        });
                    }

                    warn!(
                        host = self.host(),
                        attempt,
                        max_attempts,
                        reason = %reason,
                        "connection lost, reconnecting"
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                    if let Err(e) = self.shell.reconnect().await {
                        warn!(host = self.host(), error = ?e, "reconnect failed");
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted transport: pops one reply per `run` call.
    struct ScriptedShell {
        replies: Mutex<Vec<std::result::Result<CommandOutput, ShellError>>>,
        runs: AtomicU32,
        reconnects: AtomicU32,
    }

    impl ScriptedShell {
        fn new(mut replies: Vec<std::result::Result<CommandOutput, ShellError>>) -> Arc<Self> {
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
                runs: AtomicU32::new(0),
                reconnects: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RemoteShell for ScriptedShell {
        fn host(&self) -> &str {
            "sut"
        }

        async fn reconnect(&self) -> std::result::Result<(), ShellError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn run(
            &self,
            _command: &str,
            _timeout: Duration,
        ) -> std::result::Result<CommandOutput, ShellError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(CommandOutput::default()))
        }
    }

    fn ok(stdout: &str) -> std::result::Result<CommandOutput, ShellError> {
        Ok(CommandOutput {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    fn lost() -> std::result::Result<CommandOutput, ShellError> {
        Err(ShellError::ConnectionLost("broken pipe".into()))
    }

    fn executor(shell: Arc<ScriptedShell>) -> CommandExecutor {
        CommandExecutor::new(shell, RetryPolicy::default(), Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_fifth_attempt_after_four_connection_losses() {
        let shell = ScriptedShell::new(vec![lost(), lost(), lost(), lost(), ok("done")]);
        let out = executor(shell.clone()).run("uptime").await.unwrap();
        assert_eq!(out.stdout, "done");
        assert_eq!(shell.runs.load(Ordering::SeqCst), 5);
        assert_eq!(shell.reconnects.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_when_connection_never_recovers() {
        let shell = ScriptedShell::new((0..6).map(|_| lost()).collect());
        let err = executor(shell.clone()).run("uptime").await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost { attempts: 5, .. }), "got: {err:?}");
        assert_eq!(shell.runs.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn non_zero_exit_is_not_retried() {
        let shell = ScriptedShell::new(vec![Ok(CommandOutput {
            stdout: "partial".into(),
            stderr: "no such domain".into(),
            exit_code: 1,
        })]);
        let err = executor(shell.clone()).run("virsh start x").await.unwrap_err();
        assert_eq!(err.stderr(), Some("no such domain"));
        assert_eq!(err.stdout(), Some("partial"));
        assert_eq!(shell.runs.load(Ordering::SeqCst), 1);
        assert_eq!(shell.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_reported_without_retry() {
        let shell = ScriptedShell::new(vec![Err(ShellError::Timeout)]);
        let err = executor(shell.clone()).run("sleep 999").await.unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));
        assert_eq!(shell.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn best_effort_returns_partial_output() {
        let shell = ScriptedShell::new(vec![Ok(CommandOutput {
            stdout: "half".into(),
            stderr: String::new(),
            exit_code: 3,
        })]);
        let advisory = executor(shell)
            .execute_best_effort("cleanup", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(advisory.into_partial().stdout, "half");
    }

    /// Records the level of every event emitted while installed.
    #[derive(Clone, Default)]
    struct Levels(Arc<Mutex<Vec<tracing::Level>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Levels {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            self.0.lock().unwrap().push(*event.metadata().level());
        }
    }

    fn failing_ping() -> Arc<ScriptedShell> {
        ScriptedShell::new(vec![Ok(CommandOutput {
            stdout: "4 packets transmitted, 0 received, 100% packet loss".into(),
            stderr: String::new(),
            exit_code: 1,
        })])
    }

    #[tokio::test(start_paused = true)]
    async fn advisory_failures_are_not_logged_as_errors() {
        use tracing_subscriber::layer::SubscriberExt;

        let levels = Levels::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(levels.clone()));

        let exec = executor(failing_ping());
        assert!(exec
            .execute_best_effort("ping -c 4 10.0.0.9", Duration::from_secs(5))
            .await
            .is_err());
        assert!(exec
            .execute_quiet("ping -c 4 10.0.0.9", Duration::from_secs(5))
            .await
            .is_ok());

        let seen = levels.0.lock().unwrap().clone();
        assert!(!seen.is_empty());
        assert!(!seen.contains(&tracing::Level::ERROR), "got: {seen:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn hard_failures_are_logged_as_errors() {
        use tracing_subscriber::layer::SubscriberExt;

        let levels = Levels::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(levels.clone()));

        assert!(executor(failing_ping()).run("ping -c 4 10.0.0.9").await.is_err());
        assert!(levels.0.lock().unwrap().contains(&tracing::Level::ERROR));
    }
}
