//! Error types for the execution core.
//!
//! Each failure domain gets its own [`thiserror`] enum:
//!
//! - [`ContextError`]: why a [`Context`](crate::context::Context) is done.
//! - [`RetryError`]: how a retry loop gave up.
//! - [`InvokeError`]: how an external command invocation failed.
//!
//! None of these are fatal to the host process; every failure is a value
//! handed back to the immediate caller.

use std::io;
use std::process::ExitStatus;

use thiserror::Error;

/// Reason a context finished.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// The context was cancelled explicitly, or a peer disconnect was bridged into it.
    #[error("context canceled")]
    Cancelled,

    /// The context's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Outcome of a retry loop that did not succeed.
///
/// `Exhausted` renders as the last operation error so callers that only
/// print the error see exactly what the operation reported.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The carried context was cancelled or its deadline passed.
    #[error(transparent)]
    Cancelled(ContextError),

    /// The intrinsic elapsed-time budget ran out before any attempt succeeded.
    #[error("{last}")]
    Exhausted {
        /// Number of attempts made, including the last one.
        attempts: u32,
        /// Error returned by the most recent attempt.
        last: E,
    },
}

impl<E> RetryError<E> {
    /// `true` if the loop stopped because its context was done.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// `true` if the loop stopped because the elapsed-time budget ran out.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// The last operation error, if the loop was exhausted.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::Cancelled(_) => None,
        }
    }
}

/// Failure of an external command invocation.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The executable could not be launched.
    #[error("failed to start {executable}: {source}")]
    Start {
        /// Program that failed to launch.
        executable: String,
        #[source]
        source: io::Error,
    },

    /// Waiting for the process or collecting its output failed.
    #[error("failed to wait for {executable}: {source}")]
    Wait {
        /// Program being waited on.
        executable: String,
        #[source]
        source: io::Error,
        /// Output captured before the failure.
        output: Vec<u8>,
    },

    /// The process exited unsuccessfully on its own.
    #[error("{status} - details:\n{}", String::from_utf8_lossy(.output))]
    Failed {
        /// Exit status reported by the OS.
        status: ExitStatus,
        /// Combined stdout/stderr.
        output: Vec<u8>,
    },

    /// The governing context finished before the process exited, and the
    /// process was killed.
    #[error("{reason}")]
    Cancelled {
        /// Why the governing context finished.
        reason: ContextError,
        /// Combined output captured up to the kill, best effort.
        output: Vec<u8>,
    },
}

impl InvokeError {
    /// Combined output captured before the failure, if the process ran.
    pub fn output(&self) -> &[u8] {
        match self {
            Self::Start { .. } => &[],
            Self::Wait { output, .. }
            | Self::Failed { output, .. }
            | Self::Cancelled { output, .. } => output,
        }
    }

    /// The context error, if the invocation was cancelled.
    pub fn cancellation(&self) -> Option<ContextError> {
        match self {
            Self::Cancelled { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
