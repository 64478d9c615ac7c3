//! Cancellation-aware supervision of one external command.
//!
//! ```text
//! Starting ──► Running ──┬──► Draining ──┬──► Completed  (output closed first)
//!    │                   │               └──► Killed     (context finished first)
//!    │                   ├──► Killed                     (context finished first)
//!    │                   └──► Killed                     (wait failed)
//!    └──► start error
//! ```
//!
//! Completion and cancellation race inside a `select!`, first on the exit of
//! the command and then on the close of its output, which descendants left
//! behind can hold open. The wait arm is polled first and is the only place
//! the child gets reaped, so a kill sent while running targets a process
//! that has not been reaped yet. While draining, the kill goes to the
//! group, which the surviving descendants keep alive. Exactly one kill is
//! issued per abandoned invocation, and none at all when the command and
//! its output finish on their own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use super::Invoker;
use super::command::{
    CommandRunner, CommandSpec, NixSignalSender, RunningCommand, SignalSender, TokioCommandRunner,
};
use crate::env::DriverEnv;
use crate::error::InvokeError;

/// How long to keep collecting output after a kill before giving up on it.
const KILLED_OUTPUT_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Copy)]
enum KillScope<'a> {
    Group(&'a dyn SignalSender),
    Process,
}

/// Runs commands in their own process group and kills the whole group when
/// the governing context finishes first.
#[derive(Clone, Debug)]
pub struct ProcessGroupInvoker {
    runner: Arc<dyn CommandRunner>,
    signals: Arc<dyn SignalSender>,
}

impl ProcessGroupInvoker {
    pub fn new() -> Self {
        Self::with_exec(Arc::new(TokioCommandRunner), Arc::new(NixSignalSender))
    }

    pub fn with_exec(runner: Arc<dyn CommandRunner>, signals: Arc<dyn SignalSender>) -> Self {
        Self { runner, signals }
    }
}

impl Default for ProcessGroupInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Invoker for ProcessGroupInvoker {
    async fn invoke(
        &self,
        env: &DriverEnv,
        executable: &str,
        args: &[String],
    ) -> Result<Vec<u8>, InvokeError> {
        let env = env.session("invoking-command-pgroup");
        info!(parent: env.span(), executable, ?args, "start");

        let spec = CommandSpec::new(executable, args).in_new_process_group();
        let scope = KillScope::Group(self.signals.as_ref());
        let result = supervise(&env, self.runner.as_ref(), &spec, scope).await;

        info!(parent: env.span(), "end");
        result
    }
}

/// Runs commands in the caller's process group and kills only the direct
/// child on cancellation. Helpers that fork should go through
/// [`ProcessGroupInvoker`] instead.
#[derive(Clone, Debug)]
pub struct DirectInvoker {
    runner: Arc<dyn CommandRunner>,
}

impl DirectInvoker {
    pub fn new() -> Self {
        Self::with_exec(Arc::new(TokioCommandRunner))
    }

    pub fn with_exec(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl Default for DirectInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Invoker for DirectInvoker {
    async fn invoke(
        &self,
        env: &DriverEnv,
        executable: &str,
        args: &[String],
    ) -> Result<Vec<u8>, InvokeError> {
        let env = env.session("invoking-command");
        info!(parent: env.span(), executable, ?args, "start");

        let spec = CommandSpec::new(executable, args);
        let result = supervise(&env, self.runner.as_ref(), &spec, KillScope::Process).await;

        info!(parent: env.span(), "end");
        result
    }
}

async fn supervise(
    env: &DriverEnv,
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
    scope: KillScope<'_>,
) -> Result<Vec<u8>, InvokeError> {
    let ctx = env.context();
    let exe = spec.program.as_str();

    if let Some(reason) = ctx.err() {
        info!(parent: env.span(), exe, %reason, "context done before start");
        return Err(InvokeError::Cancelled {
            reason,
            output: Vec::new(),
        });
    }

    let mut cmd = runner.start(spec).map_err(|source| {
        error!(parent: env.span(), exe, error = %source, "command-start-failed");
        InvokeError::Start {
            executable: exe.to_owned(),
            source,
        }
    })?;
    let pid = cmd.id();
    debug!(parent: env.span(), exe, ?pid, "command started");

    let exited = tokio::select! {
        biased;
        status = cmd.wait() => Ok(status),
        reason = ctx.done() => Err(reason),
    };

    let status = match exited {
        Ok(Ok(status)) => status,
        Ok(Err(source)) => {
            error!(parent: env.span(), exe, error = %source, "command-wait-failed");
            kill(env, cmd.as_mut(), pid, scope, exe);
            reap(env, cmd.as_mut(), exe).await;
            return Err(InvokeError::Wait {
                executable: exe.to_owned(),
                source,
                output: killed_output(env, cmd.as_mut(), exe).await,
            });
        }
        Err(reason) => {
            kill(env, cmd.as_mut(), pid, scope, exe);
            reap(env, cmd.as_mut(), exe).await;
            return Err(InvokeError::Cancelled {
                reason,
                output: killed_output(env, cmd.as_mut(), exe).await,
            });
        }
    };

    // The leader is reaped, but descendants that inherited the output pipe
    // may still be running in its group.
    let drained = tokio::select! {
        biased;
        output = cmd.output() => Ok(output),
        reason = ctx.done() => Err(reason),
    };

    let output = match drained {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(InvokeError::Wait {
                executable: exe.to_owned(),
                source,
                output: Vec::new(),
            });
        }
        Err(reason) => {
            info!(parent: env.span(), exe, %status, "command exited, descendants still hold its output");
            kill(env, cmd.as_mut(), pid, scope, exe);
            return Err(InvokeError::Cancelled {
                reason,
                output: killed_output(env, cmd.as_mut(), exe).await,
            });
        }
    };

    if !status.success() {
        error!(
            parent: env.span(),
            exe,
            %status,
            output = %String::from_utf8_lossy(&output),
            "command-failed"
        );
        return Err(InvokeError::Failed { status, output });
    }

    Ok(output)
}

async fn reap(env: &DriverEnv, cmd: &mut dyn RunningCommand, exe: &str) {
    match tokio::time::timeout(KILLED_OUTPUT_GRACE, cmd.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(parent: env.span(), exe, error = %e, "failed to reap killed command"),
        Err(_) => warn!(parent: env.span(), exe, "killed command not reaped in time"),
    }
}

/// Whatever output a killed command left, bounded by [`KILLED_OUTPUT_GRACE`].
async fn killed_output(env: &DriverEnv, cmd: &mut dyn RunningCommand, exe: &str) -> Vec<u8> {
    match tokio::time::timeout(KILLED_OUTPUT_GRACE, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(parent: env.span(), exe, error = %e, "lost output of killed command");
            Vec::new()
        }
        Err(_) => {
            warn!(parent: env.span(), exe, "output of killed command still open");
            Vec::new()
        }
    }
}

/// Issue the single kill for an invocation that is being abandoned. Failures
/// are logged, never returned: the reason for abandoning it stays the
/// authoritative error.
fn kill(
    env: &DriverEnv,
    cmd: &mut dyn RunningCommand,
    pid: Option<u32>,
    scope: KillScope<'_>,
    exe: &str,
) {
    let pid = pid.and_then(|p| i32::try_from(p).ok());
    match (scope, pid) {
        (KillScope::Group(signals), Some(pid)) => {
            let group = Pid::from_raw(-pid);
            info!(parent: env.span(), exe, pid = group.as_raw(), "command-sigkill");
            if let Err(errno) = signals.kill(group, Signal::SIGKILL) {
                warn!(parent: env.span(), exe, %errno, "process group kill failed, killing leader");
                if let Err(e) = cmd.start_kill() {
                    debug!(parent: env.span(), exe, error = %e, "leader already gone");
                }
            }
        }
        (_, pid) => {
            info!(parent: env.span(), exe, ?pid, "command-sigkill");
            if let Err(e) = cmd.start_kill() {
                warn!(parent: env.span(), exe, error = %e, "kill failed");
            }
        }
    }
}
