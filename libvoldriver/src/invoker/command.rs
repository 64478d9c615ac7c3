//! OS seams used by the invokers: starting commands and sending signals.
//!
//! Production code uses [`TokioCommandRunner`] and [`NixSignalSender`];
//! tests substitute their own implementations so no real process is
//! spawned or signalled.

use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use nix::fcntl::OFlag;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;

/// What to run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Start the command as the leader of a new process group
    /// (process-group id = pid).
    pub new_process_group: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[String]) -> Self {
        Self {
            program: program.into(),
            args: args.to_vec(),
            new_process_group: false,
        }
    }

    pub fn in_new_process_group(mut self) -> Self {
        self.new_process_group = true;
        self
    }
}

/// A started external command.
#[async_trait]
pub trait RunningCommand: Send {
    /// OS process id, while the process has not been reaped.
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit and reap it.
    ///
    /// Must be cancel-safe: dropping the future before it resolves leaves the
    /// process unreaped, and `wait` may be called again.
    async fn wait(&mut self) -> io::Result<ExitStatus>;

    /// Send SIGKILL to this process only.
    fn start_kill(&mut self) -> io::Result<()>;

    /// Combined stdout and stderr. Resolves once every writer has closed the
    /// output, so call it after [`RunningCommand::wait`]. Descendants that
    /// inherited the output keep it open after the command itself exits.
    ///
    /// Must be cancel-safe: a dropped call loses nothing and the next call
    /// resumes collecting.
    async fn output(&mut self) -> io::Result<Vec<u8>>;
}

/// Starts external commands.
pub trait CommandRunner: Send + Sync + fmt::Debug {
    fn start(&self, spec: &CommandSpec) -> io::Result<Box<dyn RunningCommand>>;
}

/// Sends signals to processes or, with a negative pid, process groups.
pub trait SignalSender: Send + Sync + fmt::Debug {
    fn kill(&self, pid: Pid, signal: Signal) -> nix::Result<()>;
}

/// [`SignalSender`] backed by `kill(2)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NixSignalSender;

impl SignalSender for NixSignalSender {
    fn kill(&self, pid: Pid, signal: Signal) -> nix::Result<()> {
        signal::kill(pid, signal)
    }
}

/// [`CommandRunner`] backed by `tokio::process`.
///
/// stdout and stderr share one pipe so the captured output keeps the
/// interleaving the program produced. stdin is closed.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioCommandRunner;

impl CommandRunner for TokioCommandRunner {
    fn start(&self, spec: &CommandSpec) -> io::Result<Box<dyn RunningCommand>> {
        let (reader, writer) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;

        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer.try_clone()?))
            .stderr(Stdio::from(writer));
        if spec.new_process_group {
            cmd.process_group(0);
        }

        let child = cmd.spawn()?;
        // The command still owns the parent's copies of the write end.
        drop(cmd);

        let output = tokio::spawn(read_all(reader));
        Ok(Box::new(TokioCommand {
            child,
            output: Some(output),
        }))
    }
}

async fn read_all(fd: OwnedFd) -> io::Result<Vec<u8>> {
    let mut rx = pipe::Receiver::from_owned_fd(fd)?;
    let mut buf = Vec::new();
    rx.read_to_end(&mut buf).await?;
    Ok(buf)
}

struct TokioCommand {
    child: tokio::process::Child,
    output: Option<JoinHandle<io::Result<Vec<u8>>>>,
}

#[async_trait]
impl RunningCommand for TokioCommand {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn output(&mut self) -> io::Result<Vec<u8>> {
        let Some(reader) = self.output.as_mut() else {
            return Ok(Vec::new());
        };
        let collected = reader.await;
        self.output = None;
        collected.map_err(io::Error::other)?
    }
}
