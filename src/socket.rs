//! Socket: one connected peer
//!
//! Wraps a transport connection with identity, per-connection state,
//! room membership, the request/response interceptor table and a
//! cancellation token that trips exactly once, when the socket closes.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::connection::{Connection, ConnectionInfo, ReadEvent};
use crate::context::Context;
use crate::error::Error;
use crate::handler::{BindType, HandlerNode};
use crate::message::{InboundMessage, MessageKind};
use crate::room::{Room, RoomManager};
use crate::status::{CloseSource, CloseStatus};

#[derive(Debug, Clone)]
struct CloseRecord {
    status: CloseStatus,
    reason: String,
    source: CloseSource,
}

/// One connected peer
///
/// Shared across the read loop, dispatch tasks and room broadcasts via
/// `Arc`. Each piece of mutable state sits behind its own short-lived
/// lock; no lock is held across transport I/O.
pub struct Socket {
    id: String,
    info: ConnectionInfo,
    connection: Box<dyn Connection>,
    interceptors: Mutex<HashMap<String, oneshot::Sender<InboundMessage>>>,
    values: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    room_manager: OnceLock<Arc<RoomManager>>,
    close_state: Mutex<Option<CloseRecord>>,
    cancel: CancellationToken,
    weak_self: Weak<Socket>,
}

impl Socket {
    /// Create a socket with its own root cancellation token
    pub fn new(info: ConnectionInfo, connection: Box<dyn Connection>) -> Arc<Self> {
        Self::new_with_cancel(info, connection, CancellationToken::new())
    }

    /// Create a socket whose lifetime is scoped to the given token
    ///
    /// The server passes a child of its shutdown token here so that
    /// terminating the server cancels every socket.
    pub fn new_with_cancel(
        info: ConnectionInfo,
        connection: Box<dyn Connection>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            id: Uuid::new_v4().to_string(),
            info,
            connection,
            interceptors: Mutex::new(HashMap::new()),
            values: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashMap::new()),
            room_manager: OnceLock::new(),
            close_state: Mutex::new(None),
            cancel,
            weak_self: weak_self.clone(),
        })
    }

    /// The unique ID assigned at construction
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Request headers captured during the upgrade
    pub fn headers(&self) -> &HeaderMap {
        &self.info.headers
    }

    /// First value of a query parameter from the connection URL
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.info.query.get(key).map(String::as_str)
    }

    /// All query parameters from the connection URL
    pub fn query_params(&self) -> &HashMap<String, String> {
        &self.info.query
    }

    pub fn remote_addr(&self) -> &str {
        &self.info.remote_addr
    }

    /// Flip the close latch and cancel everything scoped to this socket
    ///
    /// Idempotent: only the first call records status, reason and
    /// source; later calls are no-ops.
    pub fn close(&self, status: CloseStatus, reason: &str, source: CloseSource) {
        {
            let mut state = self.close_state.lock();
            if state.is_some() {
                return;
            }
            *state = Some(CloseRecord {
                status,
                reason: reason.to_string(),
                source,
            });
        }
        debug!(socket_id = %self.id, %status, ?source, "socket closed");
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close_state.lock().is_some()
    }

    /// The recorded close status, reason and source, if closed
    pub fn close_status(&self) -> Option<(CloseStatus, String, CloseSource)> {
        self.close_state
            .lock()
            .as_ref()
            .map(|record| (record.status, record.reason.clone(), record.source))
    }

    /// Transmit one raw frame
    ///
    /// Races the write against the socket's cancellation so sends to a
    /// closing socket fail promptly instead of blocking.
    pub async fn send(&self, kind: MessageKind, data: Vec<u8>) -> Result<(), Error> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::SocketClosed),
            result = self.connection.write(kind, data) => result,
        }
    }

    /// A token cancelled when this socket closes
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the socket to close
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    // Per-socket associated values

    /// Store a value under a string key
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.values.lock().insert(key.into(), Arc::new(value));
    }

    /// Fetch a value, downcast to its concrete type
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.values.lock().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Like `get`, but an absent key is an error
    pub fn must_get<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, Error> {
        self.get(key)
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    /// Fetch a value, inserting the result of `init` if absent
    pub fn get_or_set_with<T: Any + Send + Sync>(
        &self,
        key: &str,
        init: impl FnOnce() -> T,
    ) -> Arc<T> {
        let mut values = self.values.lock();
        if let Some(existing) = values.get(key).cloned() {
            if let Ok(value) = existing.downcast::<T>() {
                return value;
            }
        }
        let value = Arc::new(init());
        values.insert(
            key.to_string(),
            Arc::clone(&value) as Arc<dyn Any + Send + Sync>,
        );
        value
    }

    pub fn delete(&self, key: &str) {
        self.values.lock().remove(key);
    }

    // Rooms

    pub(crate) fn set_room_manager(&self, manager: Arc<RoomManager>) {
        let _ = self.room_manager.set(manager);
    }

    pub(crate) fn room_manager(&self) -> Option<&Arc<RoomManager>> {
        self.room_manager.get()
    }

    /// Join a room, creating it on first use
    ///
    /// No-op when no room manager is attached (sockets constructed
    /// outside a server).
    pub fn join(&self, room_name: &str) {
        let Some(manager) = self.room_manager.get() else {
            return;
        };
        let Some(me) = self.weak_self.upgrade() else {
            return;
        };
        let mut rooms = self.rooms.lock();
        let room = manager.room(room_name);
        rooms.insert(room_name.to_string(), Arc::clone(&room));
        room.add_socket(&me);
    }

    /// Leave a room; the room persists even when empty
    pub fn leave(&self, room_name: &str) {
        let room = self.rooms.lock().remove(room_name);
        if let Some(room) = room {
            room.remove_socket(&self.id);
        }
    }

    /// Names of the rooms this socket has joined
    pub fn rooms(&self) -> Vec<String> {
        self.rooms.lock().keys().cloned().collect()
    }

    pub(crate) fn insert_room(&self, name: &str, room: &Arc<Room>) {
        self.rooms.lock().insert(name.to_string(), Arc::clone(room));
    }

    pub(crate) fn forget_room(&self, name: &str) {
        self.rooms.lock().remove(name);
    }

    pub(crate) fn leave_all_rooms(&self) {
        let rooms = std::mem::take(&mut *self.rooms.lock());
        for room in rooms.values() {
            room.remove_socket(&self.id);
        }
    }

    // Request/response interceptors

    /// Register a one-shot response channel under a message ID
    pub fn add_interceptor(&self, id: impl Into<String>, tx: oneshot::Sender<InboundMessage>) {
        self.interceptors.lock().insert(id.into(), tx);
    }

    /// Remove an interceptor without delivering to it
    pub fn remove_interceptor(&self, id: &str) {
        self.interceptors.lock().remove(id);
    }

    /// Claim the interceptor for an ID, consuming the registration
    ///
    /// Delivery happens by sending on the returned channel; taking the
    /// entry out of the map first is what makes delivery exactly-once.
    pub fn take_interceptor(&self, id: &str) -> Option<oneshot::Sender<InboundMessage>> {
        self.interceptors.lock().remove(id)
    }

    #[cfg(test)]
    pub(crate) fn interceptor_count(&self) -> usize {
        self.interceptors.lock().len()
    }

    // Lifecycle

    /// Read one frame and dispatch it
    ///
    /// Returns `Ok(true)` while the loop should continue. A close frame
    /// or abrupt disconnect records a client-origin close and returns
    /// `Ok(false)`; cancellation returns `Ok(false)`; any other
    /// transport error is unrecoverable and propagates. Dispatch runs
    /// on a detached task so the next frame can be read while the
    /// previous one is still being handled.
    pub async fn handle_next_message(
        self: &Arc<Self>,
        chain: &Arc<Vec<HandlerNode>>,
    ) -> Result<bool, Error> {
        let event = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(false),
            event = self.connection.read() => event?,
        };
        match event {
            ReadEvent::Message { kind, data } => {
                let socket = Arc::clone(self);
                let chain = Arc::clone(chain);
                tokio::spawn(async move {
                    let message = InboundMessage::from_raw(data);
                    let mut ctx = Context::new(socket, message, chain, BindType::Message, kind);
                    ctx.next().await;
                });
                Ok(true)
            }
            ReadEvent::Closed { status, reason } => {
                self.close(status, &reason, CloseSource::Client);
                Ok(false)
            }
        }
    }

    /// Run the open handler chain to completion
    pub async fn handle_open(self: &Arc<Self>, chain: &Arc<Vec<HandlerNode>>) {
        let mut ctx = Context::new(
            Arc::clone(self),
            InboundMessage::empty(),
            Arc::clone(chain),
            BindType::Open,
            MessageKind::Text,
        );
        ctx.next().await;
    }

    /// Run the close handler chain to completion
    pub async fn handle_close(self: &Arc<Self>, chain: &Arc<Vec<HandlerNode>>) {
        let mut ctx = Context::new(
            Arc::clone(self),
            InboundMessage::empty(),
            Arc::clone(chain),
            BindType::Close,
            MessageKind::Text,
        );
        ctx.next().await;
    }

    /// Close the underlying transport with the recorded status
    pub(crate) async fn close_transport(&self) -> Result<(), Error> {
        let (status, reason) = self
            .close_status()
            .map(|(status, reason, _)| (status, reason))
            .unwrap_or((CloseStatus::Normal, String::new()));
        self.connection.close(status, &reason).await
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("remote_addr", &self.info.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
