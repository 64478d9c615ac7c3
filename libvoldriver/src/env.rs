//! Execution context carrier.
//!
//! [`DriverEnv`] bundles the [`Context`] governing an operation with the
//! [`tracing::Span`] its log events are attached to. One is created per
//! inbound request or outbound call and handed down to everything that
//! operation touches.

use tracing::Span;

use crate::context::Context;

/// Cancellation signal plus session-scoped logger.
#[derive(Clone, Debug)]
pub struct DriverEnv {
    span: Span,
    ctx: Context,
}

impl DriverEnv {
    pub fn new(span: Span, ctx: Context) -> Self {
        Self { span, ctx }
    }

    /// An env with a background context, logging under the current span.
    pub fn background() -> Self {
        Self::new(Span::current(), Context::background())
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Same logger, different context.
    pub fn with_context(&self, ctx: Context) -> Self {
        Self::new(self.span.clone(), ctx)
    }

    /// Child logging session named `name`, sharing this env's context.
    pub fn session(&self, name: &'static str) -> Self {
        let span = tracing::info_span!(parent: &self.span, "session", session = name);
        Self::new(span, self.ctx.clone())
    }
}

impl Default for DriverEnv {
    fn default() -> Self {
        Self::background()
    }
}
