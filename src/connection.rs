//! Transport abstraction over the WebSocket wire
//!
//! The framework never touches tokio-tungstenite directly outside this
//! module: sockets talk to a `Connection` trait object so tests can
//! substitute an in-memory transport and other wire implementations can
//! be plugged in.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::error::Error;
use crate::message::MessageKind;
use crate::status::CloseStatus;

/// Immutable facts about an accepted connection
///
/// Captured once during the HTTP upgrade: the peer address, the request
/// headers, and the query string reduced to the first value per key.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub remote_addr: String,
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
}

/// Outcome of one transport read
#[derive(Debug)]
pub enum ReadEvent {
    /// A data frame arrived
    Message { kind: MessageKind, data: Vec<u8> },
    /// The peer closed the connection
    ///
    /// A clean close frame carries its code and reason; an abrupt
    /// termination (EOF, reset, broken pipe) surfaces as status 1006.
    Closed { status: CloseStatus, reason: String },
}

/// One full-duplex transport connection
///
/// `read` is only ever called from the socket's read loop; `write` and
/// `close` may be called from any task.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Read the next data frame or close notification
    ///
    /// Errors are reserved for unrecoverable transport failures; routine
    /// disconnects come back as `ReadEvent::Closed`.
    async fn read(&self) -> Result<ReadEvent, Error>;

    /// Transmit one frame
    async fn write(&self, kind: MessageKind, data: Vec<u8>) -> Result<(), Error>;

    /// Send a close frame with the given status and reason
    async fn close(&self, status: CloseStatus, reason: &str) -> Result<(), Error>;
}

/// `Connection` backed by a tokio-tungstenite stream
///
/// The stream is split so reads and writes proceed independently; each
/// half sits behind its own async mutex since room broadcasts write
/// from arbitrary tasks.
pub struct WebSocketConnection<S> {
    reader: tokio::sync::Mutex<SplitStream<WebSocketStream<S>>>,
    writer: tokio::sync::Mutex<SplitSink<WebSocketStream<S>, Message>>,
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: WebSocketStream<S>) -> Self {
        let (writer, reader) = stream.split();
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<S> Connection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&self) -> Result<ReadEvent, Error> {
        let mut reader = self.reader.lock().await;
        loop {
            let frame = match reader.next().await {
                Some(frame) => frame,
                None => {
                    return Ok(ReadEvent::Closed {
                        status: CloseStatus::Abnormal,
                        reason: String::new(),
                    })
                }
            };
            match frame {
                Ok(Message::Text(text)) => {
                    return Ok(ReadEvent::Message {
                        kind: MessageKind::Text,
                        data: text.as_bytes().to_vec(),
                    })
                }
                Ok(Message::Binary(data)) => {
                    return Ok(ReadEvent::Message {
                        kind: MessageKind::Binary,
                        data: data.to_vec(),
                    })
                }
                // Pongs are queued automatically by tungstenite
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Close(Some(frame))) => {
                    return Ok(ReadEvent::Closed {
                        status: CloseStatus::from_u16(u16::from(frame.code)),
                        reason: frame.reason.as_str().to_string(),
                    })
                }
                Ok(Message::Close(None)) => {
                    return Ok(ReadEvent::Closed {
                        status: CloseStatus::NoStatusReceived,
                        reason: String::new(),
                    })
                }
                Err(e) if is_abrupt_disconnect(&e) => {
                    return Ok(ReadEvent::Closed {
                        status: CloseStatus::Abnormal,
                        reason: String::new(),
                    })
                }
                Err(e) => return Err(Error::Transport(e)),
            }
        }
    }

    async fn write(&self, kind: MessageKind, data: Vec<u8>) -> Result<(), Error> {
        let message = match kind {
            MessageKind::Text => {
                let text = String::from_utf8(data).map_err(|e| {
                    Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                })?;
                Message::Text(text.into())
            }
            MessageKind::Binary => Message::Binary(data.into()),
        };
        let mut writer = self.writer.lock().await;
        writer.send(message).await?;
        Ok(())
    }

    async fn close(&self, status: CloseStatus, reason: &str) -> Result<(), Error> {
        let frame = CloseFrame {
            code: CloseCode::from(status.as_u16()),
            reason: reason.to_string().into(),
        };
        let mut writer = self.writer.lock().await;
        match writer.send(Message::Close(Some(frame))).await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(Error::Transport(e)),
        }
    }
}

/// Whether a read error is a routine disconnect rather than a fault
///
/// EOF without a closing handshake, resets and IO errors are how most
/// peers vanish in practice; those end the read loop as a client-origin
/// abnormal close. Everything else stays fatal.
fn is_abrupt_disconnect(e: &tungstenite::Error) -> bool {
    matches!(
        e,
        tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Io(_)
            | tungstenite::Error::Protocol(
                tungstenite::error::ProtocolError::ResetWithoutClosingHandshake
            )
    )
}

/// Parse a query string into a first-value-per-key map
pub(crate) fn parse_query(raw: &str) -> HashMap<String, String> {
    let mut query = HashMap::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = percent_decode(key);
        query.entry(key).or_insert_with(|| percent_decode(value));
    }
    query
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                match (hex_value(bytes.get(i + 1)), hex_value(bytes.get(i + 2))) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: Option<&u8>) -> Option<u8> {
    match byte? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_first_value_wins() {
        let query = parse_query("a=1&b=2&a=3");
        assert_eq!(query.get("a").map(String::as_str), Some("1"));
        assert_eq!(query.get("b").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_parse_query_decodes_escapes() {
        let query = parse_query("name=hello%20world&plus=a+b&raw=%zz");
        assert_eq!(query.get("name").map(String::as_str), Some("hello world"));
        assert_eq!(query.get("plus").map(String::as_str), Some("a b"));
        assert_eq!(query.get("raw").map(String::as_str), Some("%zz"));
    }

    #[test]
    fn test_parse_query_bare_keys() {
        let query = parse_query("flag&x=1&");
        assert_eq!(query.get("flag").map(String::as_str), Some(""));
        assert_eq!(query.get("x").map(String::as_str), Some("1"));
        assert_eq!(query.len(), 2);
    }

    #[test]
    fn test_abrupt_disconnect_classification() {
        let io = tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_abrupt_disconnect(&io));
        assert!(is_abrupt_disconnect(&tungstenite::Error::ConnectionClosed));
        let capacity =
            tungstenite::Error::Capacity(tungstenite::error::CapacityError::TooManyHeaders);
        assert!(!is_abrupt_disconnect(&capacity));
    }
}
