//! JSON envelope middleware
//!
//! Parses the conventional envelope `{id?, event?, meta?, data?}` out
//! of inbound frames and installs a matching marshaller/unmarshaller
//! pair, so the core stays payload-agnostic while applications get a
//! working JSON protocol with one registration:
//!
//! ```ignore
//! server.use_handler(handlers![middleware::json::middleware()])?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{Map, Value};

use crate::context::Context;
use crate::error::Error;
use crate::handler::Handler;
use crate::message::OutboundMessage;

/// The JSON envelope middleware
pub fn middleware() -> JsonMiddleware {
    JsonMiddleware
}

pub struct JsonMiddleware;

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    meta: Option<HashMap<String, Value>>,
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

#[async_trait]
impl Handler for JsonMiddleware {
    async fn handle(&self, ctx: &mut Context) {
        let subprotocol = ctx
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !subprotocol.is_empty() && subprotocol != "json" {
            ctx.set_error(Error::UnsupportedSubprotocol(subprotocol));
            return;
        }

        let envelope: Envelope = match serde_json::from_slice(ctx.raw_data()) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Without a negotiated subprotocol, non-JSON frames pass
                // through untouched for later handlers to interpret.
                if subprotocol.is_empty() {
                    ctx.next().await;
                } else {
                    ctx.set_error(Error::Json(e));
                }
                return;
            }
        };

        if let Some(id) = envelope.id.filter(|id| !id.is_empty()) {
            ctx.set_message_id(id);
        }
        if let Some(event) = envelope.event.filter(|event| !event.is_empty()) {
            ctx.set_message_event(event);
        }
        if let Some(meta) = envelope.meta {
            ctx.set_message_meta(meta);
        }
        if let Some(data) = envelope.data {
            ctx.set_message_data(data.get().as_bytes().to_vec());
        }
        ctx.set_unmarshaller(Arc::new(|data: &[u8]| -> Result<Value, Error> {
            Ok(serde_json::from_slice(data)?)
        }));
        ctx.set_marshaller(Arc::new(marshal_envelope));
        ctx.next().await;
    }
}

/// Encode an outbound message as `{id?, event?, data?}`
///
/// Plain string payloads are wrapped as `{"message": "<s>"}` so clients
/// always receive an object under `data`.
fn marshal_envelope(message: &OutboundMessage) -> Result<Vec<u8>, Error> {
    let mut envelope = Map::new();
    if let Some(id) = &message.id {
        envelope.insert("id".to_string(), Value::String(id.clone()));
    }
    if let Some(event) = &message.event {
        envelope.insert("event".to_string(), Value::String(event.clone()));
    }
    if let Some(data) = &message.data {
        let data = match data {
            Value::String(text) => {
                let mut wrapped = Map::new();
                wrapped.insert("message".to_string(), Value::String(text.clone()));
                Value::Object(wrapped)
            }
            other => other.clone(),
        };
        envelope.insert("data".to_string(), data);
    }
    Ok(serde_json::to_vec(&Value::Object(envelope))?)
}

/// A field-level validation failure
#[derive(Debug, Clone)]
pub struct FieldError {
    pub field: String,
    pub error: String,
}

impl FieldError {
    pub fn new(field: &str, error: &str) -> Self {
        Self {
            field: field.to_string(),
            error: error.to_string(),
        }
    }
}

/// The canonical validation-error payload
///
/// `{"error": "Validation error", "fields": [{"<field>": "<error>"}]}`
pub fn validation_error(errors: &[FieldError]) -> Value {
    let fields: Vec<Value> = errors
        .iter()
        .map(|field_error| {
            let mut entry = Map::new();
            entry.insert(
                field_error.field.clone(),
                Value::String(field_error.error.clone()),
            );
            Value::Object(entry)
        })
        .collect();
    let mut envelope = Map::new();
    envelope.insert(
        "error".to_string(),
        Value::String("Validation error".to_string()),
    );
    envelope.insert("fields".to_string(), Value::Array(fields));
    Value::Object(envelope)
}

/// A plain error payload: `{"error": "<message>"}`
pub fn error_value(message: &str) -> Value {
    let mut envelope = Map::new();
    envelope.insert("error".to_string(), Value::String(message.to_string()));
    Value::Object(envelope)
}
