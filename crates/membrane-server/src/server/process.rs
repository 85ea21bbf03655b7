//! Application process lifecycle.
//!
//! [`ProcessManager`] is the seam the membrane uses to run setup commands,
//! launch the application that connects back as workers, notice when it dies
//! and tear everything down. [`ChildProcessManager`] implements it with
//! local child processes.

use anyhow::{Context, anyhow, bail};
use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use tokio::{process::Command, sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// Runs and supervises the processes around the membrane.
#[tonic::async_trait]
pub trait ProcessManager: Send + Sync {
    /// Runs every setup command to completion, failing on the first one that
    /// does not succeed.
    async fn start_pre_processes(&self) -> anyhow::Result<()>;

    /// Launches the application with `extra_env` added to the inherited
    /// environment.
    async fn start_user_process(&self, extra_env: &[(String, String)]) -> anyhow::Result<()>;

    /// Resolves once the application has exited. Never resolves when there
    /// is no application.
    async fn monitor(&self) -> anyhow::Result<()>;

    /// Terminates everything still running.
    async fn stop_all(&self) -> anyhow::Result<()>;
}

type Exit = Option<Result<ExitStatus, String>>;

struct UserProcess {
    exited: watch::Receiver<Exit>,
    supervisor: JoinHandle<()>,
}

/// [`ProcessManager`] backed by `tokio::process`.
///
/// Children inherit stdio, so application logs interleave with the
/// membrane's own output.
pub struct ChildProcessManager {
    pre_commands: Vec<Vec<String>>,
    command: Vec<String>,
    shutdown: CancellationToken,
    user: Mutex<Option<UserProcess>>,
}

impl ChildProcessManager {
    /// `command` may be empty, in which case workers are expected to connect
    /// on their own.
    pub fn new(pre_commands: Vec<Vec<String>>, command: Vec<String>) -> Self {
        Self {
            pre_commands,
            command,
            shutdown: CancellationToken::new(),
            user: Mutex::new(None),
        }
    }
}

fn command(argv: &[String]) -> anyhow::Result<Command> {
    let Some((program, args)) = argv.split_first() else {
        bail!("empty command");
    };
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    Ok(command)
}

#[tonic::async_trait]
impl ProcessManager for ChildProcessManager {
    async fn start_pre_processes(&self) -> anyhow::Result<()> {
        for argv in &self.pre_commands {
            let line = argv.join(" ");
            tracing::info!(command = %line, "running pre-command");
            let status = command(argv)?
                .status()
                .await
                .with_context(|| format!("failed to run pre-command `{line}`"))?;
            if !status.success() {
                bail!("pre-command `{line}` failed with {status}");
            }
        }
        Ok(())
    }

    async fn start_user_process(&self, extra_env: &[(String, String)]) -> anyhow::Result<()> {
        if self.command.is_empty() {
            tracing::info!("no application command given, waiting for external workers");
            return Ok(());
        }

        let line = self.command.join(" ");
        let mut child = command(&self.command)?
            .envs(extra_env.iter().map(|(key, value)| (key, value)))
            .spawn()
            .with_context(|| format!("failed to start `{line}`"))?;
        tracing::info!(command = %line, pid = ?child.id(), "started application");

        let (exit_tx, exited) = watch::channel(None);
        let shutdown = self.shutdown.clone();
        let supervisor = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                () = shutdown.cancelled() => {
                    if let Err(err) = child.start_kill() {
                        tracing::warn!(error = %err, "failed to signal application");
                    }
                    child.wait().await
                }
            };
            exit_tx.send_replace(Some(status.map_err(|err| err.to_string())));
        });

        let previous = self.user.lock().replace(UserProcess { exited, supervisor });
        if let Some(previous) = previous {
            previous.supervisor.abort();
        }
        Ok(())
    }

    async fn monitor(&self) -> anyhow::Result<()> {
        let exited = self.user.lock().as_ref().map(|user| user.exited.clone());
        let Some(mut exited) = exited else {
            return futures::future::pending().await;
        };

        let exit = exited
            .wait_for(Option::is_some)
            .await
            .map_err(|_| anyhow!("application supervisor stopped"))?
            .clone();
        match exit {
            Some(Ok(status)) if status.success() => Ok(()),
            Some(Ok(status)) => Err(anyhow!("application exited with {status}")),
            Some(Err(err)) => Err(anyhow!("failed to wait for application: {err}")),
            None => Err(anyhow!("application exit status unavailable")),
        }
    }

    async fn stop_all(&self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        let user = self.user.lock().take();
        if let Some(user) = user {
            user.supervisor
                .await
                .context("application supervisor panicked")?;
            tracing::info!("application stopped");
        }
        Ok(())
    }
}
