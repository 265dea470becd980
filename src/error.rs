//! Error types for the framework
//!
//! A single error enum covers registration, dispatch, transport and
//! room failures. Uses thiserror for ergonomic error definitions.

use std::time::Duration;

use thiserror::Error;

use crate::handler::Capabilities;

/// Framework-level errors
///
/// Covers registration-time errors (returned from `Server::on` and
/// friends), dispatch-time errors (recorded on a `Context` or returned
/// from its send/reply/request surface) and transport failures.
#[derive(Debug, Error)]
pub enum Error {
    /// A registration call received an empty handler list
    #[error("no handlers provided")]
    NoHandlers,

    /// A handler was registered for a phase it does not implement
    #[error("invalid handler: expected one of [{expected}], got [{got}]")]
    InvalidHandler {
        expected: Capabilities,
        got: Capabilities,
    },

    /// An event pattern failed to compile
    #[error("invalid event pattern {pattern:?}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Send/emit called before a marshaller was installed
    #[error("no message marshaller set; use set_marshaller or add an encoder middleware")]
    NoMarshaller,

    /// Unmarshal called before an unmarshaller was installed
    #[error("no message unmarshaller set; use set_unmarshaller or add a parser middleware")]
    NoUnmarshaller,

    /// Reply called on a message without an ID
    #[error("cannot reply to a message without an ID")]
    NoMessageId,

    /// Room operation attempted with no room manager attached
    #[error("room manager not initialized")]
    NoRoomManager,

    /// Named room does not exist
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// No socket with the given ID is known to the room manager
    #[error("socket not found: {0}")]
    SocketNotFound(String),

    /// `must_get` was called for an absent key
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Operation attempted on a closed socket
    #[error("socket is closed")]
    SocketClosed,

    /// A request/response exchange hit its deadline
    #[error("request timed out")]
    RequestTimeout,

    /// A request/response exchange was cancelled before a response arrived
    #[error("request cancelled")]
    RequestCancelled,

    /// A handler panicked during dispatch; the payload is preserved
    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    /// A middleware-imposed deadline elapsed around `next()`
    #[error("handler timed out after {0:?}")]
    HandlerTimeout(Duration),

    /// Connection negotiated a subprotocol the installed codec cannot serve
    #[error("unsupported websocket subprotocol: {0}")]
    UnsupportedSubprotocol(String),

    /// Connection origin rejected by an allowlist
    #[error("origin not allowed: {0}")]
    OriginNotAllowed(String),

    /// Free-form handler error recorded on a context
    #[error("{0}")]
    Handler(String),

    /// WebSocket protocol error (fatal)
    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_handler_display() {
        let err = Error::InvalidHandler {
            expected: Capabilities::MESSAGE.union(Capabilities::FUNCTION),
            got: Capabilities::OPEN,
        };
        let text = err.to_string();
        assert!(text.contains("message"));
        assert!(text.contains("open"));
    }

    #[test]
    fn test_invalid_pattern_source_preserved() {
        use std::error::Error as _;
        let cause = regex::Regex::new("[").unwrap_err();
        let err = Error::InvalidPattern {
            pattern: "[".to_string(),
            source: cause,
        };
        assert!(err.to_string().contains("invalid event pattern"));
        assert!(err.source().is_some());
    }
}
