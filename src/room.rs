//! Rooms: named socket sets for fan-out
//!
//! Rooms are created lazily on first join and persist until explicitly
//! deleted. Membership is bidirectional: the room holds the socket and
//! the socket remembers the room. Emits snapshot the membership under a
//! read lock and send outside it, so no room lock is ever held across
//! transport I/O.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::context::Marshaller;
use crate::message::{MessageKind, OutboundMessage};
use crate::socket::Socket;

/// A named set of sockets
pub struct Room {
    name: String,
    sockets: RwLock<HashMap<String, Arc<Socket>>>,
    weak_self: Weak<Room>,
}

impl Room {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            name: name.to_string(),
            sockets: RwLock::new(HashMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a socket to this room and record the membership on the socket
    pub fn join(&self, socket: &Arc<Socket>) {
        if let Some(me) = self.weak_self.upgrade() {
            socket.insert_room(&self.name, &me);
        }
        self.add_socket(socket);
    }

    /// Remove a socket from this room and from the socket's room set
    pub fn leave(&self, socket: &Arc<Socket>) {
        socket.forget_room(&self.name);
        self.remove_socket(socket.id());
    }

    pub(crate) fn add_socket(&self, socket: &Arc<Socket>) {
        self.sockets
            .write()
            .insert(socket.id().to_string(), Arc::clone(socket));
        debug!(room = %self.name, socket_id = %socket.id(), "socket joined room");
    }

    pub(crate) fn remove_socket(&self, socket_id: &str) {
        self.sockets.write().remove(socket_id);
        debug!(room = %self.name, socket_id, "socket left room");
    }

    /// Drop every member
    pub fn remove_all(&self) {
        self.sockets.write().clear();
    }

    pub fn has(&self, socket_id: &str) -> bool {
        self.sockets.read().contains_key(socket_id)
    }

    pub fn len(&self) -> usize {
        self.sockets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.read().is_empty()
    }

    /// A snapshot of the current membership
    ///
    /// Iteration order is unspecified.
    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        self.sockets.read().values().cloned().collect()
    }

    /// Marshal once and send to every member not excluded
    ///
    /// Returns the number of successful sends; per-socket failures are
    /// logged and do not abort the emit.
    pub async fn emit<T: Serialize>(
        &self,
        data: T,
        marshaller: &Marshaller,
        kind: MessageKind,
        exclude: &HashSet<String>,
    ) -> usize {
        let Some(bytes) = marshal_emit_data(data, marshaller) else {
            return 0;
        };
        self.broadcast(&bytes, kind, exclude).await
    }

    /// Send pre-marshalled bytes to every member not excluded
    pub async fn broadcast(
        &self,
        data: &[u8],
        kind: MessageKind,
        exclude: &HashSet<String>,
    ) -> usize {
        let mut sent = 0;
        for socket in self.sockets() {
            if exclude.contains(socket.id()) {
                continue;
            }
            match socket.send(kind, data.to_vec()).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(room = %self.name, socket_id = %socket.id(), error = %e,
                        "failed to send to socket in room");
                }
            }
        }
        sent
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("size", &self.len())
            .finish()
    }
}

/// The room registry of one server
#[derive(Default)]
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a room, creating it on first use
    pub fn room(&self, name: &str) -> Arc<Room> {
        let mut rooms = self.rooms.write();
        if let Some(room) = rooms.get(name) {
            return Arc::clone(room);
        }
        let room = Room::new(name);
        rooms.insert(name.to_string(), Arc::clone(&room));
        room
    }

    /// Look up a room without creating it
    pub fn get_room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().get(name).cloned()
    }

    /// Clear a room's membership and remove it from the registry
    pub fn delete_room(&self, name: &str) {
        let removed = self.rooms.write().remove(name);
        if let Some(room) = removed {
            room.remove_all();
        }
    }

    /// Names of all rooms, including empty ones
    pub fn rooms(&self) -> Vec<String> {
        self.rooms.read().keys().cloned().collect()
    }

    /// The deduplicated union of every room's membership
    pub fn all_sockets(&self) -> Vec<Arc<Socket>> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().values().cloned().collect();
        let mut by_id: HashMap<String, Arc<Socket>> = HashMap::new();
        for room in rooms {
            for socket in room.sockets() {
                by_id.entry(socket.id().to_string()).or_insert(socket);
            }
        }
        by_id.into_values().collect()
    }

    /// Scan rooms for a socket with the given ID
    ///
    /// Linear in the total number of sockets.
    pub fn socket_by_id(&self, id: &str) -> Option<Arc<Socket>> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().values().cloned().collect();
        rooms
            .iter()
            .find_map(|room| room.sockets.read().get(id).cloned())
    }
}

/// Deferred multi-target emit built by `Context::to` / `Context::to_rooms`
///
/// Carries the exclusion set (the sending socket by default) and the
/// marshaller of the context that created it.
pub struct RoomEmitter {
    manager: Option<Arc<RoomManager>>,
    room: Option<Arc<Room>>,
    rooms: Vec<String>,
    marshaller: Option<Marshaller>,
    kind: MessageKind,
    exclude: HashSet<String>,
}

impl RoomEmitter {
    pub(crate) fn for_room(
        manager: Option<Arc<RoomManager>>,
        room: Option<Arc<Room>>,
        marshaller: Option<Marshaller>,
        kind: MessageKind,
        exclude: HashSet<String>,
    ) -> Self {
        Self {
            manager,
            room,
            rooms: Vec::new(),
            marshaller,
            kind,
            exclude,
        }
    }

    pub(crate) fn for_rooms(
        manager: Option<Arc<RoomManager>>,
        rooms: Vec<String>,
        marshaller: Option<Marshaller>,
        kind: MessageKind,
        exclude: HashSet<String>,
    ) -> Self {
        Self {
            manager,
            room: None,
            rooms,
            marshaller,
            kind,
            exclude,
        }
    }

    /// Exclude an additional socket from the emit
    pub fn except(mut self, socket_id: &str) -> Self {
        self.exclude.insert(socket_id.to_string());
        self
    }

    /// Marshal once and fan out; returns the number of successful sends
    pub async fn emit<T: Serialize>(self, data: T) -> usize {
        let Some(marshaller) = &self.marshaller else {
            warn!("no marshaller set for room emit");
            return 0;
        };
        if !self.rooms.is_empty() {
            return self.emit_to_multiple_rooms(data, marshaller).await;
        }
        let Some(room) = &self.room else {
            return 0;
        };
        room.emit(data, marshaller, self.kind, &self.exclude).await
    }

    /// Union the target rooms' members, deduplicate, then send
    async fn emit_to_multiple_rooms<T: Serialize>(
        &self,
        data: T,
        marshaller: &Marshaller,
    ) -> usize {
        let Some(manager) = &self.manager else {
            return 0;
        };
        let mut targets: HashMap<String, Arc<Socket>> = HashMap::new();
        for room_name in &self.rooms {
            if let Some(room) = manager.get_room(room_name) {
                for socket in room.sockets() {
                    targets.entry(socket.id().to_string()).or_insert(socket);
                }
            }
        }
        let Some(bytes) = marshal_emit_data(data, marshaller) else {
            return 0;
        };
        let mut sent = 0;
        for socket in targets.values() {
            if self.exclude.contains(socket.id()) {
                continue;
            }
            if socket.send(self.kind, bytes.clone()).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }
}

fn marshal_emit_data<T: Serialize>(data: T, marshaller: &Marshaller) -> Option<Vec<u8>> {
    let value = match serde_json::to_value(data) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "failed to encode data for room emit");
            return None;
        }
    };
    let outbound = OutboundMessage {
        id: None,
        event: None,
        data: Some(value),
    };
    match (**marshaller)(&outbound) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(error = %e, "failed to marshal message for room emit");
            None
        }
    }
}
