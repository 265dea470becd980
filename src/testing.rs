//! In-memory transport for tests
//!
//! Scripts inbound frames through a channel and captures everything the
//! framework writes, so pipeline and room behavior can be exercised
//! without a network.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connection::{Connection, ConnectionInfo, ReadEvent};
use crate::error::Error;
use crate::message::{MessageKind, OutboundMessage};
use crate::socket::Socket;
use crate::status::CloseStatus;

pub(crate) struct MockConnection {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<ReadEvent, Error>>>,
    pub sent: Mutex<Vec<(MessageKind, Vec<u8>)>>,
    pub closed: Mutex<Option<(CloseStatus, String)>>,
}

impl MockConnection {
    pub fn new() -> (mpsc::UnboundedSender<Result<ReadEvent, Error>>, Arc<Self>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            inbound: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            closed: Mutex::new(None),
        });
        (tx, conn)
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().iter().map(|(_, data)| data.clone()).collect()
    }
}

#[async_trait::async_trait]
impl Connection for Arc<MockConnection> {
    async fn read(&self) -> Result<ReadEvent, Error> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(event) => event,
            None => Ok(ReadEvent::Closed {
                status: CloseStatus::Abnormal,
                reason: String::new(),
            }),
        }
    }

    async fn write(&self, kind: MessageKind, data: Vec<u8>) -> Result<(), Error> {
        self.sent.lock().push((kind, data));
        Ok(())
    }

    async fn close(&self, status: CloseStatus, reason: &str) -> Result<(), Error> {
        *self.closed.lock() = Some((status, reason.to_string()));
        Ok(())
    }
}

/// A socket over a fresh mock connection
pub(crate) fn mock_socket() -> (
    mpsc::UnboundedSender<Result<ReadEvent, Error>>,
    Arc<MockConnection>,
    Arc<Socket>,
) {
    let (tx, conn) = MockConnection::new();
    let socket = Socket::new(ConnectionInfo::default(), Box::new(Arc::clone(&conn)));
    (tx, conn, socket)
}

/// A plain JSON envelope marshaller for pipeline tests
pub(crate) fn json_marshaller() -> crate::context::Marshaller {
    Arc::new(|msg: &OutboundMessage| -> Result<Vec<u8>, Error> {
        let mut envelope = serde_json::Map::new();
        if let Some(id) = &msg.id {
            envelope.insert("id".to_string(), serde_json::Value::String(id.clone()));
        }
        if let Some(event) = &msg.event {
            envelope.insert("event".to_string(), serde_json::Value::String(event.clone()));
        }
        if let Some(data) = &msg.data {
            envelope.insert("data".to_string(), data.clone());
        }
        Ok(serde_json::to_vec(&serde_json::Value::Object(envelope))?)
    })
}
