//! Rooms demo server - entry point
//!
//! A small chat-room server over the JSON envelope protocol: join and
//! leave rooms, fan out chat messages, answer pings.

use std::env;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use socketflow::{handlers, middleware, Context, Handler, HandlerFn, Server};

/// Default server address
const DEFAULT_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Deserialize)]
struct JoinRoom {
    room: String,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    room: String,
    message: String,
}

struct JoinHandler;

#[async_trait]
impl Handler for JoinHandler {
    async fn handle(&self, ctx: &mut Context) {
        let msg: JoinRoom = match ctx.unmarshal() {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "failed to decode join message");
                return;
            }
        };
        ctx.join(&msg.room);
        info!(socket_id = %ctx.socket_id(), room = %msg.room, "socket joined room");
        let _ = ctx
            .to(&msg.room)
            .emit(json!({"event": "user_joined", "socketId": ctx.socket_id()}))
            .await;
        let _ = ctx.reply(json!({"status": "joined", "room": msg.room})).await;
    }
}

struct LeaveHandler;

#[async_trait]
impl Handler for LeaveHandler {
    async fn handle(&self, ctx: &mut Context) {
        let msg: JoinRoom = match ctx.unmarshal() {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "failed to decode leave message");
                return;
            }
        };
        ctx.leave(&msg.room);
        info!(socket_id = %ctx.socket_id(), room = %msg.room, "socket left room");
        let _ = ctx.reply(json!({"status": "left", "room": msg.room})).await;
    }
}

struct ChatHandler;

#[async_trait]
impl Handler for ChatHandler {
    async fn handle(&self, ctx: &mut Context) {
        let msg: ChatMessage = match ctx.unmarshal() {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "failed to decode chat message");
                return;
            }
        };
        let delivered = ctx
            .to(&msg.room)
            .emit(json!({
                "event": "chat",
                "from": ctx.socket_id(),
                "message": msg.message,
            }))
            .await;
        let _ = ctx.reply(json!({"status": "sent", "delivered": delivered})).await;
    }
}

struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, ctx: &mut Context) {
        let _ = ctx.reply("pong").await;
    }
}

fn log_open(ctx: &mut Context) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        info!(socket_id = %ctx.socket_id(), remote_addr = %ctx.remote_addr(), "socket connected");
    })
}

fn log_close(ctx: &mut Context) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        info!(socket_id = %ctx.socket_id(), status = ?ctx.close_status(), "socket disconnected");
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG to control log level, e.g. RUST_LOG=socketflow=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("socketflow=info")),
        )
        .init();

    // Get bind address from command line or use default
    let addr = env::args().nth(1).unwrap_or_else(|| DEFAULT_ADDR.to_string());

    let server = Server::new();
    server.use_handler(handlers![
        middleware::json::middleware(),
        middleware::logger()
    ])?;
    server.use_open(handlers![HandlerFn::new(log_open)])?;
    server.use_close(handlers![HandlerFn::new(log_close)])?;
    server.on("join", handlers![JoinHandler])?;
    server.on("leave", handlers![LeaveHandler])?;
    server.on("chat.send", handlers![ChatHandler])?;
    server.on("ping", handlers![PingHandler])?;

    server.listen(&addr).await?;
    Ok(())
}
