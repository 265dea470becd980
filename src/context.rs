//! Dispatch context: the per-message cursor over a handler chain
//!
//! A context is created for every inbound message (and once per open
//! and close phase), owns the message for the duration of the dispatch,
//! and exposes the user-facing send/reply/request and room API. The
//! pipeline driver lives here too: `next` advances the cursor, matches
//! patterns, invokes handlers behind a panic boundary and re-enters
//! itself for the open and close phases.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::connection::ConnectionInfo;
use crate::error::Error;
use crate::handler::{BindType, HandlerNode};
use crate::message::{InboundMessage, MessageKind, OutboundMessage};
use crate::room::{Room, RoomEmitter};
use crate::socket::Socket;
use crate::status::{CloseSource, CloseStatus};

/// How long `request` waits for a correlated response by default
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Encodes an outbound message to wire bytes; installed by middleware
pub type Marshaller = Arc<dyn Fn(&OutboundMessage) -> Result<Vec<u8>, Error> + Send + Sync>;

/// Decodes payload bytes to a value; installed by middleware
pub type Unmarshaller = Arc<dyn Fn(&[u8]) -> Result<Value, Error> + Send + Sync>;

/// Per-dispatch execution state and user API
///
/// Owned by exactly one dispatch task; handlers receive it as
/// `&mut Context`. Work spawned by a handler must not outlive the
/// handler's own await of it, since the context is dropped when the
/// dispatch task finishes.
pub struct Context {
    socket: Arc<Socket>,
    message: Option<InboundMessage>,
    kind: MessageKind,
    bind: BindType,
    chain: Arc<Vec<HandlerNode>>,
    node_index: usize,
    node_matches: bool,
    handler_index: usize,
    values: HashMap<String, Arc<dyn Any + Send + Sync>>,
    marshaller: Option<Marshaller>,
    unmarshaller: Option<Unmarshaller>,
    error: Option<Arc<Error>>,
    error_stack: String,
    cancel: CancellationToken,
}

impl Context {
    /// Build a context over a handler chain
    ///
    /// A message without an ID gets one synthesized here, so every
    /// dispatched message is reply-able.
    pub fn new(
        socket: Arc<Socket>,
        mut message: InboundMessage,
        chain: Arc<Vec<HandlerNode>>,
        bind: BindType,
        kind: MessageKind,
    ) -> Self {
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        let cancel = socket.child_token();
        Self {
            socket,
            message: Some(message),
            kind,
            bind,
            chain,
            node_index: 0,
            node_matches: false,
            handler_index: 0,
            values: HashMap::new(),
            marshaller: None,
            unmarshaller: None,
            error: None,
            error_stack: String::new(),
            cancel,
        }
    }

    /// Derive a subcontext over another chain
    ///
    /// Shares the socket, snapshots the message and per-message values,
    /// and inherits codec, error state and cancellation. Call
    /// [`merge_into`](Self::merge_into) when done to propagate results
    /// back to the parent.
    pub fn subcontext(parent: &Context, chain: Arc<Vec<HandlerNode>>, bind: BindType) -> Self {
        let mut sub = Self::new(
            Arc::clone(&parent.socket),
            parent.message.clone().unwrap_or_default(),
            chain,
            bind,
            parent.kind,
        );
        sub.cancel = parent.cancel.child_token();
        sub.marshaller = parent.marshaller.clone();
        sub.unmarshaller = parent.unmarshaller.clone();
        sub.values = parent.values.clone();
        sub.error = parent.error.clone();
        sub.error_stack = parent.error_stack.clone();
        sub
    }

    /// Propagate a finished subcontext's error and values to its parent
    pub fn merge_into(mut self, parent: &mut Context) {
        parent.error = self.error.take();
        parent.error_stack = std::mem::take(&mut self.error_stack);
        for (key, value) in std::mem::take(&mut self.values) {
            parent.values.insert(key, value);
        }
    }

    /// Whether the cursor ran off the end of the chain
    pub(crate) fn is_exhausted(&self) -> bool {
        self.node_index >= self.chain.len()
    }

    // Message accessors

    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    pub fn socket_id(&self) -> &str {
        self.socket.id()
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        self.socket.connection_info()
    }

    pub fn message_id(&self) -> &str {
        self.message.as_ref().map(|m| m.id.as_str()).unwrap_or("")
    }

    pub fn event(&self) -> &str {
        self.message
            .as_ref()
            .map(|m| m.event.as_str())
            .unwrap_or("")
    }

    /// The frame exactly as read from the transport
    pub fn raw_data(&self) -> &[u8] {
        self.message
            .as_ref()
            .map(|m| m.raw_data.as_slice())
            .unwrap_or(&[])
    }

    /// The payload portion extracted by parser middleware
    pub fn data(&self) -> &[u8] {
        self.message
            .as_ref()
            .map(|m| m.data.as_slice())
            .unwrap_or(&[])
    }

    pub fn message_kind(&self) -> MessageKind {
        self.kind
    }

    pub fn headers(&self) -> &HeaderMap {
        self.socket.headers()
    }

    pub fn remote_addr(&self) -> &str {
        self.socket.remote_addr()
    }

    /// A metadata entry extracted by parser middleware
    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.message.as_ref()?.meta.get(key)
    }

    // Message mutation (middleware surface)

    /// Install a message ID; flags the message for request interception
    pub fn set_message_id(&mut self, id: impl Into<String>) {
        if let Some(message) = self.message.as_mut() {
            message.id = id.into();
            message.has_set_id = true;
        }
    }

    /// Install the event name; flags the cursor for pattern re-checks
    pub fn set_message_event(&mut self, event: impl Into<String>) {
        if let Some(message) = self.message.as_mut() {
            message.event = event.into();
            message.has_set_event = true;
        }
    }

    pub fn set_message_raw_data(&mut self, raw_data: Vec<u8>) {
        if let Some(message) = self.message.as_mut() {
            message.raw_data = raw_data;
        }
    }

    pub fn set_message_data(&mut self, data: Vec<u8>) {
        if let Some(message) = self.message.as_mut() {
            message.data = data;
        }
    }

    pub fn set_message_meta(&mut self, meta: HashMap<String, Value>) {
        if let Some(message) = self.message.as_mut() {
            message.meta = meta;
        }
    }

    pub fn set_marshaller(&mut self, marshaller: Marshaller) {
        self.marshaller = Some(marshaller);
    }

    pub fn set_unmarshaller(&mut self, unmarshaller: Unmarshaller) {
        self.unmarshaller = Some(unmarshaller);
    }

    // Error surface

    /// The error recorded on this dispatch, if any
    pub fn error(&self) -> Option<&Arc<Error>> {
        self.error.as_ref()
    }

    /// Record an error; subsequent `next` calls short-circuit
    pub fn set_error(&mut self, error: Error) {
        self.error = Some(Arc::new(error));
    }

    /// Clear the recorded error so the pipeline can continue
    pub fn clear_error(&mut self) -> Option<Arc<Error>> {
        self.error_stack.clear();
        self.error.take()
    }

    /// Stack captured when a handler panicked
    pub fn error_stack(&self) -> &str {
        &self.error_stack
    }

    // Codec

    /// Decode the message payload through the installed unmarshaller
    pub fn unmarshal<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let unmarshaller = self.unmarshaller.as_ref().ok_or(Error::NoUnmarshaller)?;
        let value = (**unmarshaller)(self.data())?;
        Ok(serde_json::from_value(value)?)
    }

    fn marshal(&self, message: &OutboundMessage) -> Result<Vec<u8>, Error> {
        let marshaller = self.marshaller.as_ref().ok_or(Error::NoMarshaller)?;
        (**marshaller)(message)
    }

    // Sending

    /// Send a payload with no ID or event
    pub async fn send<T: Serialize>(&self, data: T) -> Result<(), Error> {
        let buf = self.marshal(&OutboundMessage {
            id: None,
            event: None,
            data: Some(serde_json::to_value(data)?),
        })?;
        self.socket.send(self.kind, buf).await
    }

    /// Send a payload under an event name
    pub async fn send_event<T: Serialize>(&self, event: &str, data: T) -> Result<(), Error> {
        let buf = self.marshal(&OutboundMessage {
            id: None,
            event: Some(event.to_string()),
            data: Some(serde_json::to_value(data)?),
        })?;
        self.socket.send(self.kind, buf).await
    }

    /// Send a payload correlated to the current message's ID
    pub async fn reply<T: Serialize>(&self, data: T) -> Result<(), Error> {
        self.reply_message(None, data).await
    }

    /// Like `reply`, with an event name
    pub async fn reply_event<T: Serialize>(&self, event: &str, data: T) -> Result<(), Error> {
        self.reply_message(Some(event.to_string()), data).await
    }

    async fn reply_message<T: Serialize>(
        &self,
        event: Option<String>,
        data: T,
    ) -> Result<(), Error> {
        let id = self.message_id();
        if id.is_empty() {
            return Err(Error::NoMessageId);
        }
        let buf = self.marshal(&OutboundMessage {
            id: Some(id.to_string()),
            event,
            data: Some(serde_json::to_value(data)?),
        })?;
        self.socket.send(self.kind, buf).await
    }

    // Request/response

    /// Server-initiated request; waits up to the default timeout
    ///
    /// Returns the raw payload bytes of the correlated response.
    pub async fn request<T: Serialize>(&self, data: T) -> Result<Vec<u8>, Error> {
        self.request_with_timeout(data, DEFAULT_REQUEST_TIMEOUT).await
    }

    pub async fn request_with_timeout<T: Serialize>(
        &self,
        data: T,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        let response = self
            .exchange(serde_json::to_value(data)?, Some(timeout), None)
            .await?;
        Ok(response.data)
    }

    /// Request whose wait is governed by a caller-supplied token
    pub async fn request_with_token<T: Serialize>(
        &self,
        data: T,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, Error> {
        let response = self
            .exchange(serde_json::to_value(data)?, None, Some(token))
            .await?;
        Ok(response.data)
    }

    /// Request and decode the response through the unmarshaller
    pub async fn request_into<T: Serialize, R: DeserializeOwned>(
        &self,
        data: T,
    ) -> Result<R, Error> {
        self.request_into_with_timeout(data, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    pub async fn request_into_with_timeout<T: Serialize, R: DeserializeOwned>(
        &self,
        data: T,
        timeout: Duration,
    ) -> Result<R, Error> {
        let response = self
            .exchange(serde_json::to_value(data)?, Some(timeout), None)
            .await?;
        let unmarshaller = self.unmarshaller.as_ref().ok_or(Error::NoUnmarshaller)?;
        let value = (**unmarshaller)(&response.data)?;
        Ok(serde_json::from_value(value)?)
    }

    async fn exchange(
        &self,
        data: Value,
        deadline: Option<Duration>,
        token: Option<&CancellationToken>,
    ) -> Result<InboundMessage, Error> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.socket.add_interceptor(&id, tx);
        let result = self.exchange_inner(&id, data, deadline, token, rx).await;
        self.socket.remove_interceptor(&id);
        result
    }

    async fn exchange_inner(
        &self,
        id: &str,
        data: Value,
        deadline: Option<Duration>,
        token: Option<&CancellationToken>,
        rx: oneshot::Receiver<InboundMessage>,
    ) -> Result<InboundMessage, Error> {
        let buf = self.marshal(&OutboundMessage {
            id: Some(id.to_string()),
            event: None,
            data: Some(data),
        })?;
        self.socket.send(self.kind, buf).await?;

        let caller_cancelled = async {
            match token {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        let deadline_elapsed = async {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            response = rx => response.map_err(|_| Error::RequestCancelled),
            _ = self.cancel.cancelled() => Err(Error::RequestCancelled),
            _ = caller_cancelled => Err(Error::RequestCancelled),
            _ = deadline_elapsed => Err(Error::RequestTimeout),
        }
    }

    // Closing

    /// Close the socket with a normal status
    pub fn close(&self) {
        self.socket
            .close(CloseStatus::Normal, "", CloseSource::Server);
    }

    pub fn close_with_status(&self, status: CloseStatus, reason: &str) {
        self.socket.close(status, reason, CloseSource::Server);
    }

    pub fn close_status(&self) -> Option<(CloseStatus, String, CloseSource)> {
        self.socket.close_status()
    }

    // Per-message associated values

    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.values.get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn must_get<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, Error> {
        self.get(key)
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    pub fn delete(&mut self, key: &str) {
        self.values.remove(key);
    }

    // Per-socket associated values

    pub fn set_on_socket<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.socket.set(key, value);
    }

    pub fn get_from_socket<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.socket.get(key)
    }

    pub fn must_get_from_socket<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, Error> {
        self.socket.must_get(key)
    }

    pub fn delete_from_socket(&self, key: &str) {
        self.socket.delete(key);
    }

    // Cancellation

    /// A token cancelled when this dispatch's socket closes
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    // Rooms

    pub fn join(&self, room_name: &str) {
        self.socket.join(room_name);
    }

    pub fn leave(&self, room_name: &str) {
        self.socket.leave(room_name);
    }

    /// Look up a room without creating it
    pub fn room(&self, room_name: &str) -> Option<Arc<Room>> {
        self.socket.room_manager()?.get_room(room_name)
    }

    /// Target one room; the sending socket is excluded by default
    pub fn to(&self, room_name: &str) -> RoomEmitter {
        let manager = self.socket.room_manager().cloned();
        let room = manager.as_ref().and_then(|m| m.get_room(room_name));
        RoomEmitter::for_room(
            manager,
            room,
            self.marshaller.clone(),
            self.kind,
            HashSet::from([self.socket.id().to_string()]),
        )
    }

    /// Target the union of several rooms, deduplicated
    pub fn to_rooms(&self, room_names: &[&str]) -> RoomEmitter {
        RoomEmitter::for_rooms(
            self.socket.room_manager().cloned(),
            room_names.iter().map(|name| name.to_string()).collect(),
            self.marshaller.clone(),
            self.kind,
            HashSet::from([self.socket.id().to_string()]),
        )
    }

    /// Send to every socket known to the room manager
    pub async fn broadcast<T: Serialize>(&self, data: T) -> usize {
        self.broadcast_inner(data, false).await
    }

    /// Like `broadcast`, excluding the sending socket
    pub async fn broadcast_except_me<T: Serialize>(&self, data: T) -> usize {
        self.broadcast_inner(data, true).await
    }

    async fn broadcast_inner<T: Serialize>(&self, data: T, except_me: bool) -> usize {
        let Some(manager) = self.socket.room_manager() else {
            return 0;
        };
        let value = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to encode broadcast data");
                return 0;
            }
        };
        let buf = match self.marshal(&OutboundMessage {
            id: None,
            event: None,
            data: Some(value),
        }) {
            Ok(buf) => buf,
            Err(e) => {
                warn!(error = %e, "failed to marshal broadcast message");
                return 0;
            }
        };
        let mut sent = 0;
        for socket in manager.all_sockets() {
            if except_me && socket.id() == self.socket.id() {
                continue;
            }
            if socket.send(self.kind, buf.clone()).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Send directly to one socket by ID
    pub async fn emit_to<T: Serialize>(&self, socket_id: &str, data: T) -> Result<(), Error> {
        let manager = self.socket.room_manager().ok_or(Error::NoRoomManager)?;
        let target = manager
            .socket_by_id(socket_id)
            .ok_or_else(|| Error::SocketNotFound(socket_id.to_string()))?;
        let buf = self.marshal(&OutboundMessage {
            id: None,
            event: None,
            data: Some(serde_json::to_value(data)?),
        })?;
        target.send(self.kind, buf).await
    }

    // Pipeline driver

    /// Advance the pipeline to the next runnable handler and invoke it
    ///
    /// Message-phase middleware calls this to pass control on; open and
    /// close chains re-enter automatically so they run to completion.
    /// Returns immediately when an error is recorded or (outside the
    /// close phase) when the socket has closed.
    pub fn next(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let is_close_phase = self.bind == BindType::Close;
            if self.error.is_some() || (!is_close_phase && self.socket.is_closed()) {
                return;
            }

            // A middleware-installed ID may address an outstanding
            // request; the message is then a response, not an event.
            if self.message.as_ref().is_some_and(|m| m.has_set_id) {
                let id = self
                    .message
                    .as_ref()
                    .map(|m| m.id.clone())
                    .unwrap_or_default();
                if let Some(interceptor) = self.socket.take_interceptor(&id) {
                    if let Some(mut message) = self.message.take() {
                        message.has_set_id = false;
                        let _ = interceptor.send(message);
                    }
                    return;
                }
                if let Some(message) = self.message.as_mut() {
                    message.has_set_id = false;
                }
            }

            // The event changed mid-node: re-check the current pattern
            // and fall forward if it no longer applies.
            if self.message.as_ref().is_some_and(|m| m.has_set_event) {
                if self.node_matches && !self.node_matches_at(self.node_index) {
                    self.node_index += 1;
                    self.node_matches = false;
                    self.handler_index = 0;
                }
                if let Some(message) = self.message.as_mut() {
                    message.has_set_event = false;
                }
            }

            let chain = Arc::clone(&self.chain);
            let handler = loop {
                if !self.node_matches {
                    while self.node_index < chain.len() && !self.node_matches_at(self.node_index) {
                        self.node_index += 1;
                    }
                    if self.node_index >= chain.len() {
                        break None;
                    }
                    self.node_matches = true;
                }
                let node = &chain[self.node_index];
                if self.handler_index < node.handlers.len() {
                    let handler = Arc::clone(&node.handlers[self.handler_index]);
                    self.handler_index += 1;
                    break Some(handler);
                }
                self.node_index += 1;
                self.node_matches = false;
                self.handler_index = 0;
            };
            let Some(handler) = handler else { return };

            let bind = self.bind;
            let invocation = match bind {
                BindType::Message => handler.handle(self),
                BindType::Open => handler.handle_open(self),
                BindType::Close => handler.handle_close(self),
            };
            if let Err(payload) = AssertUnwindSafe(invocation).catch_unwind().await {
                self.error = Some(Arc::new(Error::HandlerPanic(panic_message(
                    payload.as_ref(),
                ))));
                self.error_stack = captured_stack();
            }

            if (bind == BindType::Open && !self.socket.is_closed()) || bind == BindType::Close {
                self.next().await;
            }

            self.node_index = self.chain.len();
            self.node_matches = false;
            self.handler_index = 0;
        })
    }

    fn node_matches_at(&self, index: usize) -> bool {
        self.chain[index].matches(self.event())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn captured_stack() -> String {
    let backtrace = std::backtrace::Backtrace::force_capture().to_string();
    // The first frames belong to the capture machinery itself.
    backtrace.lines().skip(6).collect::<Vec<_>>().join("\n")
}
