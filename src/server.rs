//! Server: handler registration, HTTP upgrade and connection lifecycle
//!
//! The server keeps three handler chains (open, message, close), accepts
//! WebSocket upgrades off a TCP listener, and runs one connection task
//! per socket: open chain, read loop, close chain, transport close. A
//! server is a cheap cloneable handle; clones share chains, rooms and
//! the shutdown token. It also implements [`Handler`] itself so one
//! server can be mounted inside another as a subrouter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{parse_query, Connection, ConnectionInfo, WebSocketConnection};
use crate::context::Context;
use crate::error::Error;
use crate::handler::{validate_handlers, BindType, Capabilities, Handler, HandlerNode};
use crate::pattern::{Pattern, WILDCARD_DEEP};
use crate::room::RoomManager;
use crate::socket::Socket;
use crate::status::{CloseSource, CloseStatus};

/// Server configuration
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Origin headers accepted during the handshake
    ///
    /// An empty list allows any origin. That default suits development;
    /// production deployments should list their origins explicitly.
    pub origins: Vec<String>,
}

#[derive(Default)]
struct ChainSet {
    message: Arc<Vec<HandlerNode>>,
    open: Arc<Vec<HandlerNode>>,
    close: Arc<Vec<HandlerNode>>,
}

struct ServerInner {
    chains: RwLock<ChainSet>,
    config: RwLock<ServerConfig>,
    room_manager: Arc<RoomManager>,
    shutdown: CancellationToken,
}

/// The WebSocket application server
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                chains: RwLock::new(ChainSet::default()),
                config: RwLock::new(config),
                room_manager: Arc::new(RoomManager::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Replace the allowed-origin list
    pub fn set_origins(&self, origins: Vec<String>) {
        self.inner.config.write().origins = origins;
    }

    /// The room registry shared by this server's sockets
    pub fn rooms(&self) -> Arc<RoomManager> {
        Arc::clone(&self.inner.room_manager)
    }

    /// Stop the accept loop and cancel every socket
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    // Registration

    /// Append middleware to the message chain, matching every event
    pub fn use_handler(&self, handlers: Vec<Arc<dyn Handler>>) -> Result<(), Error> {
        self.register_message(WILDCARD_DEEP, handlers)
    }

    /// Append middleware bound to an event prefix
    ///
    /// Unless the pattern already ends in a wildcard, `.**` is appended
    /// so the middleware covers the whole subtree.
    pub fn use_handler_for(&self, event: &str, handlers: Vec<Arc<dyn Handler>>) -> Result<(), Error> {
        let event = if event.ends_with('*') {
            event.to_string()
        } else {
            format!("{event}.{WILDCARD_DEEP}")
        };
        self.register_message(&event, handlers)
    }

    /// Append handlers to the open chain
    pub fn use_open(&self, handlers: Vec<Arc<dyn Handler>>) -> Result<(), Error> {
        validate_handlers(&handlers, Capabilities::OPEN | Capabilities::FUNCTION)?;
        self.append_node(BindType::Open, None, handlers);
        Ok(())
    }

    /// Append handlers to the close chain
    pub fn use_close(&self, handlers: Vec<Arc<dyn Handler>>) -> Result<(), Error> {
        validate_handlers(&handlers, Capabilities::CLOSE | Capabilities::FUNCTION)?;
        self.append_node(BindType::Close, None, handlers);
        Ok(())
    }

    /// Bind handlers to a literal event pattern
    ///
    /// A handler that also carries the open or close capability is
    /// additionally appended to those chains, so one registration
    /// covers every phase it supports.
    pub fn on(&self, event: &str, handlers: Vec<Arc<dyn Handler>>) -> Result<(), Error> {
        self.register_message(event, handlers)
    }

    fn register_message(&self, event: &str, handlers: Vec<Arc<dyn Handler>>) -> Result<(), Error> {
        validate_handlers(&handlers, Capabilities::MESSAGE | Capabilities::FUNCTION)?;
        let pattern = Pattern::compile(event)?;
        for handler in &handlers {
            let capabilities = handler.capabilities();
            if capabilities.contains(Capabilities::OPEN) {
                self.append_node(BindType::Open, None, vec![Arc::clone(handler)]);
            }
            if capabilities.contains(Capabilities::CLOSE) {
                self.append_node(BindType::Close, None, vec![Arc::clone(handler)]);
            }
        }
        self.append_node(BindType::Message, Some(pattern), handlers);
        Ok(())
    }

    fn append_node(
        &self,
        bind: BindType,
        pattern: Option<Pattern>,
        handlers: Vec<Arc<dyn Handler>>,
    ) {
        let mut chains = self.inner.chains.write();
        let chain = match bind {
            BindType::Message => &mut chains.message,
            BindType::Open => &mut chains.open,
            BindType::Close => &mut chains.close,
        };
        let mut nodes = (**chain).clone();
        nodes.push(HandlerNode {
            bind,
            pattern,
            handlers,
        });
        *chain = Arc::new(nodes);
    }

    pub(crate) fn message_chain(&self) -> Arc<Vec<HandlerNode>> {
        Arc::clone(&self.inner.chains.read().message)
    }

    pub(crate) fn open_chain(&self) -> Arc<Vec<HandlerNode>> {
        Arc::clone(&self.inner.chains.read().open)
    }

    pub(crate) fn close_chain(&self) -> Arc<Vec<HandlerNode>> {
        Arc::clone(&self.inner.chains.read().close)
    }

    // Serving

    /// Bind an address and accept connections until shutdown
    pub async fn listen(&self, addr: &str) -> Result<(), Error> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "websocket server listening");
        self.serve(listener).await
    }

    /// Accept connections off an existing listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    info!("server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted tcp connection");
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_stream(stream).await {
                                error!(error = %e, "connection handler error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept connection"),
                },
            }
        }
    }

    /// Upgrade one TCP stream and run its connection lifecycle
    ///
    /// Non-upgrade HTTP requests are answered with a plain 400; the
    /// handshake callback enforces the allowed-origin list and captures
    /// the request headers and query parameters.
    pub async fn handle_stream(&self, stream: TcpStream) -> Result<(), Error> {
        let remote_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        if !upgrade_requested(&stream).await? {
            debug!(%remote_addr, "rejecting non-upgrade request");
            return reject_non_upgrade(stream).await;
        }

        let origins = self.inner.config.read().origins.clone();
        let mut captured: Option<(HeaderMap, HashMap<String, String>)> = None;
        let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            if !origin_allowed(&origins, req) {
                warn!(%remote_addr, "rejected connection from disallowed origin");
                let mut response = ErrorResponse::new(Some("Forbidden".to_string()));
                *response.status_mut() = StatusCode::FORBIDDEN;
                return Err(response);
            }
            let query = req.uri().query().map(parse_query).unwrap_or_default();
            captured = Some((req.headers().clone(), query));
            Ok(resp)
        })
        .await?;

        let (headers, query) = captured.unwrap_or_default();
        let info = ConnectionInfo {
            remote_addr,
            headers,
            query,
        };
        self.handle_connection(info, Box::new(WebSocketConnection::new(ws)))
            .await;
        Ok(())
    }

    /// Run one socket's lifecycle over an already-established transport
    ///
    /// Open chain, read loop, close chain, room cleanup, transport
    /// close. The open chain completes before the first message is
    /// read; in-flight dispatch tasks may still be running when the
    /// close chain starts.
    pub async fn handle_connection(&self, info: ConnectionInfo, connection: Box<dyn Connection>) {
        let socket = Socket::new_with_cancel(info, connection, self.inner.shutdown.child_token());
        socket.set_room_manager(Arc::clone(&self.inner.room_manager));
        let (message_chain, open_chain, close_chain) = {
            let chains = self.inner.chains.read();
            (
                Arc::clone(&chains.message),
                Arc::clone(&chains.open),
                Arc::clone(&chains.close),
            )
        };

        info!(socket_id = %socket.id(), remote_addr = %socket.remote_addr(), "socket connected");
        socket.handle_open(&open_chain).await;
        loop {
            match socket.handle_next_message(&message_chain).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!(socket_id = %socket.id(), error = %e,
                        "unrecoverable error reading socket message");
                    socket.close(CloseStatus::InternalError, "read failure", CloseSource::Server);
                    break;
                }
            }
        }
        socket.handle_close(&close_chain).await;
        socket.leave_all_rooms();
        if let Err(e) = socket.close_transport().await {
            warn!(socket_id = %socket.id(), error = %e, "failed to close connection");
        }
        info!(socket_id = %socket.id(), "socket disconnected");
    }

    async fn delegate(&self, ctx: &mut Context, chain: Arc<Vec<HandlerNode>>, bind: BindType) {
        let mut sub = Context::subcontext(ctx, chain, bind);
        sub.next().await;
        let exhausted = sub.is_exhausted();
        sub.merge_into(ctx);
        if !exhausted {
            ctx.next().await;
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Mounting support: a server is itself a handler for every phase,
/// delegating to a subcontext over its own chains.
#[async_trait]
impl Handler for Server {
    fn capabilities(&self) -> Capabilities {
        Capabilities::MESSAGE | Capabilities::OPEN | Capabilities::CLOSE
    }

    async fn handle(&self, ctx: &mut Context) {
        self.delegate(ctx, self.message_chain(), BindType::Message)
            .await;
    }

    async fn handle_open(&self, ctx: &mut Context) {
        self.delegate(ctx, self.open_chain(), BindType::Open).await;
    }

    async fn handle_close(&self, ctx: &mut Context) {
        self.delegate(ctx, self.close_chain(), BindType::Close).await;
    }
}

fn origin_allowed(origins: &[String], req: &Request) -> bool {
    if origins.is_empty() {
        return true;
    }
    let origin = req
        .headers()
        .get("origin")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    origins
        .iter()
        .any(|allowed| allowed == "*" || allowed == origin)
}

/// Peek the request head and check for an `Upgrade: websocket` header
async fn upgrade_requested(stream: &TcpStream) -> Result<bool, Error> {
    let mut buf = vec![0u8; 4096];
    let mut n = 0;
    for _ in 0..500 {
        n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(false);
        }
        if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") || n == buf.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    Ok(is_upgrade_request(&buf[..n]))
}

fn is_upgrade_request(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head);
    text.lines()
        .skip(1)
        .take_while(|line| !line.is_empty())
        .any(|line| {
            let Some((name, value)) = line.split_once(':') else {
                return false;
            };
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
        })
}

async fn reject_non_upgrade(mut stream: TcpStream) -> Result<(), Error> {
    let body = "Bad Request. Expected websocket upgrade request";
    let response = format!(
        "HTTP/1.1 400 Bad Request\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ReadEvent;
    use crate::handlers;
    use crate::message::{InboundMessage, MessageKind};
    use crate::testing::{mock_socket, MockConnection};
    use futures_util::{SinkExt, StreamExt};
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::time::Instant;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        label: &'static str,
        log: Log,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn handle(&self, _ctx: &mut Context) {
            self.log.lock().push(self.label.to_string());
        }
    }

    struct LifecycleProbe {
        log: Log,
    }

    #[async_trait]
    impl Handler for LifecycleProbe {
        fn capabilities(&self) -> Capabilities {
            Capabilities::MESSAGE | Capabilities::OPEN | Capabilities::CLOSE
        }

        async fn handle(&self, _ctx: &mut Context) {
            self.log.lock().push("message".to_string());
        }

        async fn handle_open(&self, _ctx: &mut Context) {
            self.log.lock().push("open".to_string());
        }

        async fn handle_close(&self, _ctx: &mut Context) {
            self.log.lock().push("close".to_string());
        }
    }

    #[test]
    fn test_use_handler_for_appends_deep_wildcard() {
        let server = Server::new();
        let log: Log = Arc::default();
        server
            .use_handler_for("user", handlers![Recorder { label: "a", log: Arc::clone(&log) }])
            .unwrap();
        server
            .use_handler_for("room.*", handlers![Recorder { label: "b", log: Arc::clone(&log) }])
            .unwrap();
        server
            .use_handler(handlers![Recorder { label: "c", log }])
            .unwrap();

        let chain = server.message_chain();
        let patterns: Vec<&str> = chain
            .iter()
            .map(|node| node.pattern.as_ref().unwrap().as_str())
            .collect();
        assert_eq!(patterns, vec!["user.**", "room.*", "**"]);
    }

    #[test]
    fn test_on_multiplexes_capable_handlers_into_phase_chains() {
        let server = Server::new();
        let log: Log = Arc::default();
        server
            .on("chat.send", handlers![LifecycleProbe { log }])
            .unwrap();

        assert_eq!(server.message_chain().len(), 1);
        assert_eq!(server.open_chain().len(), 1);
        assert_eq!(server.close_chain().len(), 1);
        assert_eq!(
            server.message_chain()[0].pattern.as_ref().unwrap().as_str(),
            "chat.send"
        );
    }

    #[test]
    fn test_registration_validation() {
        struct CloseOnly;

        #[async_trait]
        impl Handler for CloseOnly {
            fn capabilities(&self) -> Capabilities {
                Capabilities::CLOSE
            }

            async fn handle_close(&self, _ctx: &mut Context) {}
        }

        let server = Server::new();
        assert!(matches!(
            server.on("x", Vec::new()).unwrap_err(),
            Error::NoHandlers
        ));
        assert!(matches!(
            server.on("x", handlers![CloseOnly]).unwrap_err(),
            Error::InvalidHandler { .. }
        ));
        assert!(server.use_close(handlers![CloseOnly]).is_ok());
    }

    #[tokio::test]
    async fn test_connection_lifecycle_runs_phases_in_order() {
        let server = Server::new();
        let log: Log = Arc::default();
        server
            .use_open(handlers![LifecycleProbe { log: Arc::clone(&log) }])
            .unwrap();
        server
            .use_close(handlers![LifecycleProbe { log: Arc::clone(&log) }])
            .unwrap();

        let (tx, conn) = MockConnection::new();
        // dropping the sender makes the first read report a disconnect
        drop(tx);
        server
            .handle_connection(ConnectionInfo::default(), Box::new(Arc::clone(&conn)))
            .await;
        assert_eq!(*log.lock(), vec!["open", "close"]);
        // the transport was closed with the recorded client status
        let (status, _) = conn.closed.lock().clone().unwrap();
        assert_eq!(status, CloseStatus::Abnormal);
    }

    #[tokio::test]
    async fn test_open_completes_before_first_dispatch() {
        struct SlowOpen {
            opened_at: Arc<Mutex<Option<Instant>>>,
        }

        #[async_trait]
        impl Handler for SlowOpen {
            fn capabilities(&self) -> Capabilities {
                Capabilities::OPEN
            }

            async fn handle_open(&self, _ctx: &mut Context) {
                tokio::time::sleep(Duration::from_millis(50)).await;
                *self.opened_at.lock() = Some(Instant::now());
            }
        }

        struct DispatchProbe {
            dispatched_at: Arc<Mutex<Option<Instant>>>,
        }

        #[async_trait]
        impl Handler for DispatchProbe {
            async fn handle(&self, _ctx: &mut Context) {
                *self.dispatched_at.lock() = Some(Instant::now());
            }
        }

        let opened_at = Arc::new(Mutex::new(None));
        let dispatched_at = Arc::new(Mutex::new(None));
        let server = Server::new();
        server
            .use_open(handlers![SlowOpen {
                opened_at: Arc::clone(&opened_at)
            }])
            .unwrap();
        server
            .use_handler(handlers![DispatchProbe {
                dispatched_at: Arc::clone(&dispatched_at)
            }])
            .unwrap();

        let (tx, conn) = MockConnection::new();
        // the message is queued before the connection is even handled
        tx.send(Ok(ReadEvent::Message {
            kind: MessageKind::Text,
            data: b"{}".to_vec(),
        }))
        .unwrap();
        tx.send(Ok(ReadEvent::Closed {
            status: CloseStatus::Normal,
            reason: String::new(),
        }))
        .unwrap();

        server
            .handle_connection(ConnectionInfo::default(), Box::new(conn))
            .await;
        // dispatch runs on a detached task; wait for it
        for _ in 0..100 {
            if dispatched_at.lock().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let opened = opened_at.lock().unwrap();
        let dispatched = dispatched_at.lock().expect("message was never dispatched");
        assert!(dispatched >= opened);
    }

    #[tokio::test]
    async fn test_mounted_server_dispatches_and_propagates_errors() {
        struct ErrorSetter {
            log: Log,
        }

        #[async_trait]
        impl Handler for ErrorSetter {
            async fn handle(&self, ctx: &mut Context) {
                self.log.lock().push(format!("inner:{}", ctx.event()));
                ctx.set_error(Error::Handler("inner failure".to_string()));
            }
        }

        let log: Log = Arc::default();
        let inner = Server::new();
        inner
            .on("b.ping", handlers![ErrorSetter {
                log: Arc::clone(&log)
            }])
            .unwrap();

        let outer_chain = vec![HandlerNode {
            bind: BindType::Message,
            pattern: Some(Pattern::compile("b.**").unwrap()),
            handlers: handlers![inner],
        }];

        let (_tx, _conn, socket) = mock_socket();
        let message = InboundMessage {
            event: "b.ping".to_string(),
            ..InboundMessage::default()
        };
        let mut ctx = Context::new(
            socket,
            message,
            Arc::new(outer_chain),
            BindType::Message,
            MessageKind::Text,
        );
        ctx.next().await;

        assert_eq!(*log.lock(), vec!["inner:b.ping"]);
        assert!(matches!(
            ctx.error().map(|e| e.as_ref()),
            Some(Error::Handler(msg)) if msg == "inner failure"
        ));
    }

    #[tokio::test]
    async fn test_non_upgrade_request_gets_400() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new();
        let srv = server.clone();
        tokio::spawn(async move {
            let _ = srv.serve(listener).await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nhost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 400"));
        assert!(response.contains("Bad Request. Expected websocket upgrade request"));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_end_to_end_ping_over_real_websocket() {
        struct Ping;

        #[async_trait]
        impl Handler for Ping {
            async fn handle(&self, ctx: &mut Context) {
                let _ = ctx.reply("pong").await;
            }
        }

        let server = Server::new();
        server
            .use_handler(handlers![crate::middleware::json::JsonMiddleware])
            .unwrap();
        server.on("ping", handlers![Ping]).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = server.clone();
        tokio::spawn(async move {
            let _ = srv.serve(listener).await;
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/socket?room=lobby"))
            .await
            .unwrap();
        ws.send(tokio_tungstenite::tungstenite::Message::Text(
            r#"{"id":"1","event":"ping"}"#.into(),
        ))
        .await
        .unwrap();

        let reply = ws.next().await.unwrap().unwrap();
        let envelope: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        assert_eq!(envelope["id"], "1");
        assert_eq!(envelope["data"]["message"], "pong");

        server.shutdown();
    }
}
