//! Service registry and reply envelopes
//!
//! A request payload is the service name followed by the arguments encoded
//! with the service's [`Schema`]. Every request yields a [`ReplyEnvelope`]:
//! a status code, a message, and (on success only) the encoded return value.

use crate::codec::{write_str, ByteOrder, Codec, CodecError, FieldType, Schema, Value};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Argument and return types of one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSchema {
    pub args: Schema,
    /// `None` for services that return nothing
    pub returns: Option<FieldType>,
}

impl ServiceSchema {
    pub fn new(args: Vec<FieldType>, returns: Option<FieldType>) -> Self {
        Self {
            args: Schema::new(args),
            returns,
        }
    }
}

/// Failure inside a handler
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("Bad arguments: {0}")]
    BadArgs(#[from] CodecError),

    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Status, message and value returned for every request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEnvelope {
    pub code: u16,
    pub message: String,
    /// Encoded return value; empty for void services and for errors
    pub value: Vec<u8>,
}

impl ReplyEnvelope {
    pub const OK: u16 = 0;
    pub const NOT_FOUND: u16 = 1;
    pub const BAD_ARGS: u16 = 2;
    pub const HANDLER_FAILED: u16 = 3;
    pub const UNAVAILABLE: u16 = 4;

    pub fn ok(value: Vec<u8>) -> Self {
        Self {
            code: Self::OK,
            message: String::new(),
            value,
        }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            value: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Self::OK
    }

    pub fn to_bytes(&self, order: ByteOrder) -> Result<Vec<u8>, CodecError> {
        let mut codec = Codec::with_order(order);
        codec.write(&self.code)?;
        write_str(&mut codec, &self.message)?;
        if self.is_ok() {
            codec.write_raw(&self.value);
        }
        Ok(codec.into_bytes())
    }

    pub fn from_bytes(data: &[u8], order: ByteOrder) -> Result<Self, CodecError> {
        let mut codec = Codec::from_bytes(data, order);
        let code: u16 = codec.read()?;
        let message: String = codec.read()?;
        let value = if code == Self::OK {
            codec.rest().to_vec()
        } else {
            Vec::new()
        };
        Ok(Self { code, message, value })
    }

    /// Decode the carried value as `returns`
    pub fn decode_value(&self, returns: Option<&FieldType>, order: ByteOrder) -> Result<Option<Value>, CodecError> {
        match returns {
            None if self.value.is_empty() => Ok(None),
            None => Err(CodecError::SchemaMismatch(format!(
                "void service replied with {} bytes",
                self.value.len()
            ))),
            Some(ty) => {
                let mut codec = Codec::from_bytes(self.value.as_slice(), order);
                let value = Value::decode(&mut codec, ty)?;
                if !codec.is_eof() {
                    return Err(CodecError::SchemaMismatch(format!(
                        "{} trailing bytes after return value",
                        codec.remaining()
                    )));
                }
                Ok(Some(value))
            }
        }
    }
}

type RawHandler = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, ServiceError> + Send + Sync>;

/// Name → handler table owned by the hosting context
pub struct ServiceRegistry {
    handlers: RwLock<HashMap<String, RawHandler>>,
    order: ByteOrder,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(ByteOrder::default())
    }
}

impl ServiceRegistry {
    pub fn new(order: ByteOrder) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            order,
        }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    fn insert(&self, name: &str, handler: RawHandler) {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        if handlers.insert(name.to_string(), handler).is_some() {
            warn!("Service '{}' registered twice, the last registration wins", name);
        } else {
            debug!("Registered service '{}'", name);
        }
    }

    /// Register a typed handler; arguments are decoded and the return value
    /// encoded with `schema`
    pub fn register<F>(&self, name: &str, schema: ServiceSchema, handler: F)
    where
        F: Fn(&[Value]) -> Result<Option<Value>, ServiceError> + Send + Sync + 'static,
    {
        let order = self.order;
        let raw = move |args: &[u8]| -> Result<Vec<u8>, ServiceError> {
            let mut codec = Codec::from_bytes(args, order);
            let values = schema.args.decode(&mut codec)?;
            if !codec.is_eof() {
                return Err(CodecError::SchemaMismatch(format!(
                    "{} unread argument bytes",
                    codec.remaining()
                ))
                .into());
            }

            let mut out = Codec::with_order(order);
            match (handler(&values)?, &schema.returns) {
                (None, None) => {}
                (Some(value), Some(ty)) if value.field_type() == *ty => value.encode(&mut out)?,
                (value, ty) => {
                    return Err(ServiceError::Failed(format!(
                        "handler returned {:?}, declared {:?}",
                        value.map(|v| v.field_type()),
                        ty
                    )))
                }
            }
            Ok(out.into_bytes())
        };
        self.insert(name, Arc::new(raw));
    }

    /// Register a handler over raw argument bytes
    pub fn register_raw<F>(&self, name: &str, handler: F)
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.insert(name, Arc::new(move |args: &[u8]| Ok(handler(args))));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Run the handler for `name` on raw arguments
    pub fn dispatch(&self, name: &str, args: &[u8]) -> ReplyEnvelope {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned();
        let Some(handler) = handler else {
            error!("No handler registered for service '{}'", name);
            return ReplyEnvelope::error(ReplyEnvelope::NOT_FOUND, format!("unknown service '{}'", name));
        };

        match handler(args) {
            Ok(value) => ReplyEnvelope::ok(value),
            Err(ServiceError::BadArgs(e)) => {
                warn!("Service '{}' rejected its arguments: {}", name, e);
                ReplyEnvelope::error(ReplyEnvelope::BAD_ARGS, e.to_string())
            }
            Err(ServiceError::Failed(msg)) => {
                warn!("Service '{}' failed: {}", name, msg);
                ReplyEnvelope::error(ReplyEnvelope::HANDLER_FAILED, msg)
            }
        }
    }

    /// Serve one request payload (name + arguments), returning the encoded envelope
    pub fn dispatch_request(&self, payload: &[u8]) -> Vec<u8> {
        let mut codec = Codec::from_bytes(payload, self.order);
        let envelope = match codec.read::<String>() {
            Ok(name) => self.dispatch(&name, codec.rest()),
            Err(e) => {
                warn!("Request without a readable service name: {}", e);
                ReplyEnvelope::error(ReplyEnvelope::BAD_ARGS, e.to_string())
            }
        };
        envelope.to_bytes(self.order).unwrap_or_else(|e| {
            error!("Cannot encode reply envelope: {}", e);
            Vec::new()
        })
    }
}

/// Encode a request payload: the service name, then each argument
pub fn encode_request(
    service: &str,
    schema: &ServiceSchema,
    args: &[Value],
    order: ByteOrder,
) -> Result<Vec<u8>, CodecError> {
    let mut codec = Codec::with_order(order);
    write_str(&mut codec, service)?;
    schema.args.encode(args, &mut codec)?;
    Ok(codec.into_bytes())
}
