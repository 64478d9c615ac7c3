//! External command invokers.
//!
//! Driver operations shell out to mount helpers (`mount.nfs`, `umount`,
//! `fusermount3`, ...). An [`Invoker`] runs one such command under the
//! [`Context`](crate::context::Context) carried by a [`DriverEnv`], so a
//! cancelled request never leaves a helper running behind it.
//!
//! | Invoker | On cancellation |
//! |---|---|
//! | [`ProcessGroupInvoker`] | SIGKILL to the whole process group |
//! | [`DirectInvoker`] | SIGKILL to the direct child only |

use async_trait::async_trait;

use crate::env::DriverEnv;
use crate::error::InvokeError;

pub mod command;
mod supervisor;

pub use command::{
    CommandRunner, CommandSpec, NixSignalSender, RunningCommand, SignalSender, TokioCommandRunner,
};
pub use supervisor::{DirectInvoker, ProcessGroupInvoker};

/// Runs an external program and returns its combined stdout/stderr.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(
        &self,
        env: &DriverEnv,
        executable: &str,
        args: &[String],
    ) -> Result<Vec<u8>, InvokeError>;
}
