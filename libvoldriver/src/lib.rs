//! # libvoldriver — cancellation-aware plumbing for volume drivers
//!
//! Volume plugins talk to remote drivers over flaky links and shell out to
//! mount helpers. Both must stop promptly when the request that started
//! them goes away. This crate provides the three pieces that make that
//! happen, all driven by one [`Context`] carried in a [`DriverEnv`]:
//!
//! - a retry controller that gives up when its own budget is spent or the
//!   context is done, whichever comes first;
//! - a bridge that turns a peer disconnect into context cancellation;
//! - a supervisor that kills a helper's whole process group on cancellation.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`context`] | [`Context`] cancellation/deadline signal and its [`Canceller`]. |
//! | [`env`] | [`DriverEnv`]: context plus logging span. |
//! | [`clock`] | [`Clock`] trait, [`SystemClock`], [`FakeClock`] for tests. |
//! | [`backoff`] | [`ExponentialBackoff`] retry controller. |
//! | [`bridge`] | [`with_cancel`] peer-disconnect bridge. |
//! | [`invoker`] | [`ProcessGroupInvoker`] and [`DirectInvoker`]. |
//! | [`config`] | [`RetryConfig`] from serde documents or the environment. |
//! | [`logging`] | `tracing` subscriber setup. |
//! | [`error`] | [`ContextError`], [`RetryError`], [`InvokeError`]. |

pub mod backoff;
pub mod bridge;
pub mod clock;
pub mod config;
pub mod context;
pub mod env;
pub mod error;
pub mod invoker;
pub mod logging;

pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use bridge::{CancelGuard, NoPeerNotification, PeerDisconnect, PeerTransport, with_cancel};
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::RetryConfig;
pub use context::{Canceller, Context};
pub use env::DriverEnv;
pub use error::{ContextError, InvokeError, RetryError};
pub use invoker::{DirectInvoker, Invoker, ProcessGroupInvoker};
