//! Cancellation bridge: peer disconnect → context cancellation.
//!
//! A server handling a plugin request must not keep mounting, retrying or
//! running helpers once the client that asked has gone away. [`with_cancel`]
//! derives a context from the request's own and, when the transport can
//! report a disconnect, spawns one watcher that cancels the derived context
//! on the first of:
//!
//! - the peer disconnecting → derived context cancelled;
//! - the derived context finishing for any other reason → watcher exits;
//! - the [`CancelGuard`] being released → watcher exits, context untouched.
//!
//! Transports without the capability get a derived context that only
//! finishes with its parent, and no watcher at all.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::context::{Canceller, Context};
use crate::env::DriverEnv;

/// Transport-level view of the remote peer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Whether [`PeerTransport::peer_disconnected`] ever resolves.
    fn can_notify_disconnect(&self) -> bool {
        false
    }

    /// Resolve once the peer has closed its side of the connection.
    async fn peer_disconnected(&self) {
        std::future::pending::<()>().await
    }
}

/// A transport that cannot report disconnects.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPeerNotification;

#[async_trait]
impl PeerTransport for NoPeerNotification {}

/// In-process disconnect notification.
///
/// Server glue keeps one clone and calls [`PeerDisconnect::notify`] when
/// the client goes away; the bridge observes another clone. Notifying is
/// one-shot and idempotent.
#[derive(Clone, Debug, Default)]
pub struct PeerDisconnect {
    token: CancellationToken,
}

impl PeerDisconnect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.token.cancel();
    }

    pub fn is_notified(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[async_trait]
impl PeerTransport for PeerDisconnect {
    fn can_notify_disconnect(&self) -> bool {
        true
    }

    async fn peer_disconnected(&self) {
        self.token.cancelled().await
    }
}

#[cfg(feature = "quic")]
#[async_trait]
impl PeerTransport for quinn::Connection {
    fn can_notify_disconnect(&self) -> bool {
        true
    }

    async fn peer_disconnected(&self) {
        let reason = self.closed().await;
        tracing::debug!(remote = %self.remote_address(), %reason, "QUIC connection closed");
    }
}

/// Releases the bridge watcher.
///
/// Must be released on every exit path; dropping the guard releases it.
/// Releasing never cancels the derived context.
#[derive(Debug)]
pub struct CancelGuard {
    stop: CancellationToken,
    watcher: Option<JoinHandle<()>>,
    canceller: Canceller,
}

impl CancelGuard {
    /// Stop the watcher. Safe to call any number of times.
    pub fn release(&self) {
        self.stop.cancel();
    }

    pub fn is_released(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Cancel the derived context explicitly, e.g. when the handler gives up.
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    /// Release and wait for the watcher task to finish.
    pub async fn join(mut self) {
        self.release();
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.await;
        }
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Derive an env whose context is also cancelled when the peer disconnects.
///
/// Must be called from within a Tokio runtime when `transport` can notify.
pub fn with_cancel(
    env: &DriverEnv,
    transport: Arc<dyn PeerTransport>,
) -> (DriverEnv, CancelGuard) {
    let env = env.session("with-cancel");
    info!(parent: env.span(), "start");

    let (ctx, canceller) = Context::with_cancel(env.context());
    let derived = env.with_context(ctx.clone());
    let stop = CancellationToken::new();

    let watcher = transport.can_notify_disconnect().then(|| {
        let span = env.span().clone();
        let stop = stop.clone();
        let canceller = canceller.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {}
                _ = ctx.done() => {}
                _ = transport.peer_disconnected() => {
                    info!(parent: &span, "signalling cancel");
                    canceller.cancel();
                }
            }
        })
    });

    info!(parent: env.span(), bridged = watcher.is_some(), "end");
    (
        derived,
        CancelGuard {
            stop,
            watcher,
            canceller,
        },
    )
}
