//! Stock middleware
//!
//! Cross-cutting handlers for the message pipeline: event logging,
//! panic masking, request IDs, per-dispatch timeouts, origin checks,
//! rate limiting and value injection. All of them are middleware in the
//! conventional sense: they do their work and call `ctx.next().await`
//! to pass control on (or record an error and stop the pipeline).

pub mod json;

use std::any::Any;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

use crate::context::Context;
use crate::error::Error;
use crate::handler::{Capabilities, Handler};

/// Logs each processed event with its dispatch duration
pub fn logger() -> Logger {
    Logger
}

pub struct Logger;

#[async_trait]
impl Handler for Logger {
    async fn handle(&self, ctx: &mut Context) {
        let start = Instant::now();
        let event = ctx.event().to_string();
        let socket_id = ctx.socket_id().to_string();
        ctx.next().await;
        debug!(%event, %socket_id, elapsed = ?start.elapsed(), "event processed");
    }
}

/// Logs recorded handler panics and masks them with an opaque error
///
/// The pipeline driver already converts panics into `ctx` errors; this
/// middleware keeps the details out of anything user-visible.
pub fn recovery() -> Recovery {
    Recovery
}

pub struct Recovery;

#[async_trait]
impl Handler for Recovery {
    async fn handle(&self, ctx: &mut Context) {
        ctx.next().await;
        let panicked = match ctx.error().map(|e| e.as_ref()) {
            Some(Error::HandlerPanic(message)) => Some(message.clone()),
            _ => None,
        };
        if let Some(message) = panicked {
            error!(
                panic = %message,
                stack = %ctx.error_stack(),
                event = %ctx.event(),
                socket_id = %ctx.socket_id(),
                "panic recovered in handler"
            );
            ctx.set_error(Error::Handler("internal server error".to_string()));
        }
    }
}

/// Tags every dispatch with a fresh UUID under the `request_id` key
pub fn request_id() -> RequestId {
    RequestId
}

pub struct RequestId;

#[async_trait]
impl Handler for RequestId {
    async fn handle(&self, ctx: &mut Context) {
        ctx.set("request_id", Uuid::new_v4().to_string());
        ctx.next().await;
    }
}

/// Bounds the rest of the pipeline to a deadline
pub fn timeout(duration: Duration) -> Timeout {
    Timeout { duration }
}

pub struct Timeout {
    duration: Duration,
}

#[async_trait]
impl Handler for Timeout {
    async fn handle(&self, ctx: &mut Context) {
        if tokio::time::timeout(self.duration, ctx.next())
            .await
            .is_err()
        {
            ctx.set_error(Error::HandlerTimeout(self.duration));
        }
    }
}

/// Rejects dispatches from connections with a disallowed Origin header
///
/// An empty list allows everything; `*` in the list allows everything.
pub fn origin_allowlist(origins: Vec<String>) -> OriginAllowlist {
    OriginAllowlist { origins }
}

pub struct OriginAllowlist {
    origins: Vec<String>,
}

#[async_trait]
impl Handler for OriginAllowlist {
    async fn handle(&self, ctx: &mut Context) {
        let origin = ctx
            .headers()
            .get("origin")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let allowed = self.origins.is_empty()
            || self
                .origins
                .iter()
                .any(|candidate| candidate == "*" || *candidate == origin);
        if !allowed {
            ctx.set_error(Error::OriginNotAllowed(origin));
            return;
        }
        ctx.next().await;
    }
}

/// Caps the number of dispatches per socket within a sliding window
pub fn rate_limit(max_requests: u32, window: Duration) -> RateLimit {
    RateLimit {
        max_requests,
        window,
    }
}

pub struct RateLimit {
    max_requests: u32,
    window: Duration,
}

struct RateWindow {
    count: u32,
    reset_at: Instant,
}

#[async_trait]
impl Handler for RateLimit {
    async fn handle(&self, ctx: &mut Context) {
        let state = ctx.socket().get_or_set_with("rate_limit", || {
            Mutex::new(RateWindow {
                count: 0,
                reset_at: Instant::now() + self.window,
            })
        });
        let allowed = {
            let mut window = state.lock();
            let now = Instant::now();
            if now >= window.reset_at {
                window.count = 0;
                window.reset_at = now + self.window;
            }
            window.count += 1;
            window.count <= self.max_requests
        };
        if !allowed {
            ctx.set_error(Error::Handler("rate limit exceeded".to_string()));
            return;
        }
        ctx.next().await;
    }
}

/// Injects a per-message value before the rest of the pipeline runs
pub fn set<T>(key: &str, value: T) -> SetValue<T>
where
    T: Any + Send + Sync + Clone,
{
    SetValue {
        key: key.to_string(),
        value,
    }
}

pub struct SetValue<T> {
    key: String,
    value: T,
}

#[async_trait]
impl<T> Handler for SetValue<T>
where
    T: Any + Send + Sync + Clone,
{
    fn capabilities(&self) -> Capabilities {
        Capabilities::FUNCTION
    }

    async fn handle(&self, ctx: &mut Context) {
        ctx.set(self.key.clone(), self.value.clone());
        ctx.next().await;
    }

    async fn handle_open(&self, ctx: &mut Context) {
        ctx.set(self.key.clone(), self.value.clone());
        ctx.next().await;
    }

    async fn handle_close(&self, ctx: &mut Context) {
        ctx.set(self.key.clone(), self.value.clone());
        ctx.next().await;
    }
}

/// Injects a per-socket value before the rest of the pipeline runs
pub fn set_on_socket<T>(key: &str, value: T) -> SetSocketValue<T>
where
    T: Any + Send + Sync + Clone,
{
    SetSocketValue {
        key: key.to_string(),
        value,
    }
}

pub struct SetSocketValue<T> {
    key: String,
    value: T,
}

#[async_trait]
impl<T> Handler for SetSocketValue<T>
where
    T: Any + Send + Sync + Clone,
{
    fn capabilities(&self) -> Capabilities {
        Capabilities::FUNCTION
    }

    async fn handle(&self, ctx: &mut Context) {
        ctx.set_on_socket(self.key.clone(), self.value.clone());
        ctx.next().await;
    }

    async fn handle_open(&self, ctx: &mut Context) {
        ctx.set_on_socket(self.key.clone(), self.value.clone());
        ctx.next().await;
    }

    async fn handle_close(&self, ctx: &mut Context) {
        ctx.set_on_socket(self.key.clone(), self.value.clone());
        ctx.next().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{BindType, HandlerNode};
    use crate::handlers;
    use crate::message::{InboundMessage, MessageKind};
    use crate::pattern::Pattern;
    use crate::testing::mock_socket;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Tail {
        log: Log,
    }

    #[async_trait]
    impl Handler for Tail {
        async fn handle(&self, _ctx: &mut Context) {
            self.log.lock().push("tail".to_string());
        }
    }

    fn chain_of(handlers: Vec<Vec<Arc<dyn Handler>>>) -> Arc<Vec<HandlerNode>> {
        Arc::new(
            handlers
                .into_iter()
                .map(|list| HandlerNode {
                    bind: BindType::Message,
                    pattern: Some(Pattern::compile("**").unwrap()),
                    handlers: list,
                })
                .collect(),
        )
    }

    fn dispatch_ctx(socket: Arc<crate::socket::Socket>, chain: Arc<Vec<HandlerNode>>) -> Context {
        Context::new(
            socket,
            InboundMessage::empty(),
            chain,
            BindType::Message,
            MessageKind::Text,
        )
    }

    #[tokio::test]
    async fn test_timeout_records_error() {
        struct Sleeper;

        #[async_trait]
        impl Handler for Sleeper {
            async fn handle(&self, _ctx: &mut Context) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        let (_tx, _conn, socket) = mock_socket();
        let chain = chain_of(vec![
            handlers![timeout(Duration::from_millis(10))],
            handlers![Sleeper],
        ]);
        let mut ctx = dispatch_ctx(socket, chain);
        ctx.next().await;
        assert!(matches!(
            ctx.error().map(|e| e.as_ref()),
            Some(Error::HandlerTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_trips_after_max() {
        let (_tx, _conn, socket) = mock_socket();
        let log: Log = Arc::default();
        let chain = chain_of(vec![
            handlers![rate_limit(2, Duration::from_secs(60))],
            handlers![Tail {
                log: Arc::clone(&log)
            }],
        ]);

        for _ in 0..3 {
            let mut ctx = dispatch_ctx(Arc::clone(&socket), Arc::clone(&chain));
            ctx.next().await;
        }
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_recovery_masks_panic_errors() {
        struct Panicker;

        #[async_trait]
        impl Handler for Panicker {
            async fn handle(&self, _ctx: &mut Context) {
                panic!("secret detail");
            }
        }

        let (_tx, _conn, socket) = mock_socket();
        let chain = chain_of(vec![handlers![recovery()], handlers![Panicker]]);
        let mut ctx = dispatch_ctx(socket, chain);
        ctx.next().await;
        assert!(matches!(
            ctx.error().map(|e| e.as_ref()),
            Some(Error::Handler(msg)) if msg == "internal server error"
        ));
    }

    #[tokio::test]
    async fn test_request_id_is_set_per_dispatch() {
        let (_tx, _conn, socket) = mock_socket();
        let chain = chain_of(vec![handlers![request_id()]]);
        let mut ctx = dispatch_ctx(socket, chain);
        ctx.next().await;
        let id = ctx.must_get::<String>("request_id").unwrap();
        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn test_set_helpers_inject_values() {
        let (_tx, _conn, socket) = mock_socket();
        let log: Log = Arc::default();
        let chain = chain_of(vec![
            handlers![set("tenant", "acme".to_string())],
            handlers![set_on_socket("version", 3u32)],
            handlers![Tail { log }],
        ]);
        let mut ctx = dispatch_ctx(Arc::clone(&socket), chain);
        ctx.next().await;
        assert_eq!(*ctx.get::<String>("tenant").unwrap(), "acme");
        assert_eq!(*socket.get::<u32>("version").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_origin_allowlist_blocks_unlisted_origin() {
        let (_tx, _conn, socket) = mock_socket();
        let log: Log = Arc::default();
        let chain = chain_of(vec![
            handlers![origin_allowlist(vec!["https://example.com".to_string()])],
            handlers![Tail {
                log: Arc::clone(&log)
            }],
        ]);
        // mock connections carry no Origin header at all
        let mut ctx = dispatch_ctx(socket, chain);
        ctx.next().await;
        assert!(log.lock().is_empty());
        assert!(matches!(
            ctx.error().map(|e| e.as_ref()),
            Some(Error::OriginNotAllowed(_))
        ));
    }
}
