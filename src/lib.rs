//! Event-Routed WebSocket Application Framework
//!
//! Accepts WebSocket upgrades, turns each connection into a long-lived
//! socket with identity and per-connection state, decodes frames into
//! named events and dispatches them through a middleware/handler
//! pipeline with `next()`-style progression.
//!
//! # Features
//! - Dotted event patterns with `*` and `**` wildcards gating dispatch
//! - Open/message/close handler chains with cooperative middleware
//! - Named rooms with exclusion-aware fan-out and multi-room emits
//! - Server-initiated request/response correlation over the socket
//! - Pluggable payload codecs; a JSON envelope middleware is included
//! - Per-socket cancellation propagated to every dispatch
//!
//! # Architecture
//! One accept task per listener, one connection task per socket and one
//! detached dispatch task per inbound message. The open chain completes
//! before the read loop starts; the close chain runs after it ends.
//! Rooms and per-socket state sit behind short-lived locks that are
//! never held across transport I/O.
//!
//! # Example
//! ```ignore
//! use async_trait::async_trait;
//! use socketflow::{handlers, middleware, Context, Handler, Server};
//!
//! struct Ping;
//!
//! #[async_trait]
//! impl Handler for Ping {
//!     async fn handle(&self, ctx: &mut Context) {
//!         let _ = ctx.reply("pong").await;
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new();
//!     server.use_handler(handlers![middleware::json::middleware()]).unwrap();
//!     server.on("ping", handlers![Ping]).unwrap();
//!     server.listen("127.0.0.1:8080").await.unwrap();
//! }
//! ```

pub mod connection;
pub mod context;
pub mod error;
pub mod handler;
pub mod message;
pub mod middleware;
pub mod pattern;
pub mod room;
pub mod server;
pub mod socket;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use connection::{Connection, ConnectionInfo, ReadEvent, WebSocketConnection};
pub use context::{Context, Marshaller, Unmarshaller, DEFAULT_REQUEST_TIMEOUT};
pub use error::Error;
pub use handler::{BindType, Capabilities, Handler, HandlerFn, HandlerNode};
pub use message::{InboundMessage, MessageKind, OutboundMessage};
pub use pattern::{Pattern, WILDCARD_DEEP, WILDCARD_SINGLE};
pub use room::{Room, RoomEmitter, RoomManager};
pub use server::{Server, ServerConfig};
pub use socket::Socket;
pub use status::{CloseSource, CloseStatus};
