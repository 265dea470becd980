//! Handler traits and the handler chain
//!
//! A handler may serve one or more lifecycle phases: message dispatch,
//! socket open, socket close. Plain async functions are lifted into
//! handlers with [`HandlerFn`] and are valid in any phase. Registration
//! validates that every handler actually serves the phase it is being
//! bound to.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::context::Context;
use crate::error::Error;
use crate::pattern::Pattern;

/// Lifecycle phase a handler node is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindType {
    /// Inbound message dispatch, gated by the node's pattern
    Message,
    /// Runs once after the connection is accepted, before the read loop
    Open,
    /// Runs once after the read loop ends
    Close,
}

/// The set of phases a handler implements
///
/// `FUNCTION` marks a bare function handler, which is accepted by every
/// registration call but is not multiplexed into extra phases by
/// [`Server::on`](crate::server::Server::on).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    bits: u8,
}

impl Capabilities {
    /// Implements `handle` for message dispatch
    pub const MESSAGE: Self = Self { bits: 1 };
    /// Implements `handle_open`
    pub const OPEN: Self = Self { bits: 2 };
    /// Implements `handle_close`
    pub const CLOSE: Self = Self { bits: 4 };
    /// A bare function, runnable in any phase
    pub const FUNCTION: Self = Self { bits: 8 };

    /// Combine two capability sets
    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    /// Whether any capability in `other` is present in `self`
    pub const fn intersects(self, other: Self) -> bool {
        self.bits & other.bits != 0
    }

    /// Whether every capability in `other` is present in `self`
    pub const fn contains(self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        self.union(other)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::MESSAGE) {
            names.push("message");
        }
        if self.contains(Self::OPEN) {
            names.push("open");
        }
        if self.contains(Self::CLOSE) {
            names.push("close");
        }
        if self.contains(Self::FUNCTION) {
            names.push("function");
        }
        f.write_str(&names.join("|"))
    }
}

/// An event or lifecycle handler
///
/// Implement the phase methods matching the declared capabilities; the
/// defaults are no-ops so a handler only writes the phases it serves.
/// Message-phase handlers acting as middleware must call
/// `ctx.next().await` to pass control on; open and close chains
/// continue automatically.
#[async_trait]
pub trait Handler: Send + Sync {
    /// The phases this handler serves; checked at registration
    fn capabilities(&self) -> Capabilities {
        Capabilities::MESSAGE
    }

    /// Message-phase entry point
    async fn handle(&self, ctx: &mut Context) {
        let _ = ctx;
    }

    /// Open-phase entry point
    async fn handle_open(&self, ctx: &mut Context) {
        let _ = ctx;
    }

    /// Close-phase entry point
    async fn handle_close(&self, ctx: &mut Context) {
        let _ = ctx;
    }
}

/// Adapter lifting a plain function into a handler
///
/// The wrapped function runs for whichever phase the node is bound to.
/// Plain `fn` items returning a boxed future coerce cleanly:
///
/// ```ignore
/// fn greet(ctx: &mut Context) -> BoxFuture<'_, ()> {
///     Box::pin(async move {
///         let _ = ctx.send("hello").await;
///     })
/// }
/// server.use_open(handlers![HandlerFn::new(greet)])?;
/// ```
pub struct HandlerFn<F> {
    f: F,
}

impl<F> HandlerFn<F>
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync,
{
    fn capabilities(&self) -> Capabilities {
        Capabilities::FUNCTION
    }

    async fn handle(&self, ctx: &mut Context) {
        (self.f)(ctx).await;
    }

    async fn handle_open(&self, ctx: &mut Context) {
        (self.f)(ctx).await;
    }

    async fn handle_close(&self, ctx: &mut Context) {
        (self.f)(ctx).await;
    }
}

/// Build a `Vec<Arc<dyn Handler>>` from handler values
#[macro_export]
macro_rules! handlers {
    ($($handler:expr),+ $(,)?) => {
        vec![$(::std::sync::Arc::new($handler) as ::std::sync::Arc<dyn $crate::handler::Handler>),+]
    };
}

/// One link in a handler chain
///
/// Message nodes carry the pattern that gates them; open and close
/// nodes match unconditionally. Registration order is invocation order.
#[derive(Clone)]
pub struct HandlerNode {
    pub bind: BindType,
    pub pattern: Option<Pattern>,
    pub handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerNode {
    /// Whether this node should see the given event
    pub fn matches(&self, event: &str) -> bool {
        match &self.pattern {
            Some(pattern) => pattern.matches(event),
            None => true,
        }
    }
}

impl fmt::Debug for HandlerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerNode")
            .field("bind", &self.bind)
            .field("pattern", &self.pattern.as_ref().map(Pattern::as_str))
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Validate a handler list against the capabilities a phase accepts
pub(crate) fn validate_handlers(
    handlers: &[Arc<dyn Handler>],
    allowed: Capabilities,
) -> Result<(), Error> {
    if handlers.is_empty() {
        return Err(Error::NoHandlers);
    }
    for handler in handlers {
        let got = handler.capabilities();
        if !got.intersects(allowed) {
            return Err(Error::InvalidHandler {
                expected: allowed,
                got,
            });
        }
    }
    Ok(())
}
