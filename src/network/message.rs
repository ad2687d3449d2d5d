//! Wire records exchanged over the bus
//!
//! Every request travels as an [`Operation`] and every reply as an
//! [`OperationResult`]. Both are encoded with the crate codec in little-endian
//! order so that peers configured with different call codecs still agree on
//! the envelope.

use crate::codec::{ByteOrder, Codec, CodecError};
use log::debug;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Correlation ids and backend identities
pub type Guid = Uuid;

/// Largest payload carried by a single operation
pub const MAX_TRANSFER_SIZE: usize = 200_000;

/// The call is not bound to any enclave
pub const ENCLAVE_UNRELATED: i32 = -1;

/// The call targets an enclave that has not been allocated yet
pub const ENCLAVE_UNKNOWN: i32 = 0;

/// Prefix shared by every topic the crate creates
pub const TOPIC_ROOT: &str = "dtee";

/// Purpose of an operation or result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Backend announcement and its acknowledgement
    Notification,
    /// A call or its reply
    Normal,
    /// Keep-alive sent while a call is being processed
    Dummy,
    /// Kind value this build does not understand
    Unknown(i32),
}

impl MessageKind {
    pub fn code(self) -> i32 {
        match self {
            MessageKind::Notification => 0,
            MessageKind::Normal => 1,
            MessageKind::Dummy => 2,
            MessageKind::Unknown(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => MessageKind::Notification,
            1 => MessageKind::Normal,
            2 => MessageKind::Dummy,
            other => MessageKind::Unknown(other),
        }
    }
}

fn write_guid(codec: &mut Codec, guid: &Guid) {
    codec.write_raw(guid.as_bytes());
}

fn read_guid(codec: &mut Codec) -> Result<Guid, CodecError> {
    let raw = codec.read_raw(16)?;
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(raw);
    Ok(Uuid::from_bytes(bytes))
}

/// A request published on a service's operation topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub correlation_id: Guid,
    pub kind: MessageKind,
    pub enclave_id: i32,
    pub payload: Vec<u8>,
    pub fragment_index: i32,
    pub total_fragments: i32,
}

impl Operation {
    /// Single-fragment operation
    pub fn new(kind: MessageKind, enclave_id: i32, payload: Vec<u8>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            kind,
            enclave_id,
            payload,
            fragment_index: 0,
            total_fragments: 1,
        }
    }

    /// Backend announcement carrying the backend's guid
    pub fn notification(backend: Guid) -> Self {
        Self::new(
            MessageKind::Notification,
            ENCLAVE_UNRELATED,
            backend.as_bytes().to_vec(),
        )
    }

    /// Split a payload into operations sharing one correlation id
    ///
    /// An empty payload still yields one fragment.
    pub fn fragments(
        correlation_id: Guid,
        enclave_id: i32,
        payload: &[u8],
        max_transfer_size: usize,
    ) -> Vec<Operation> {
        let chunk = max_transfer_size.max(1);
        let pieces: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(chunk).collect()
        };
        let total = pieces.len() as i32;
        pieces
            .into_iter()
            .enumerate()
            .map(|(index, piece)| Operation {
                correlation_id,
                kind: MessageKind::Normal,
                enclave_id,
                payload: piece.to_vec(),
                fragment_index: index as i32,
                total_fragments: total,
            })
            .collect()
    }

    pub fn is_last_fragment(&self) -> bool {
        self.fragment_index + 1 >= self.total_fragments
    }

    /// Result of the given kind answering this operation
    pub fn reply(&self, kind: MessageKind, payload: Vec<u8>) -> OperationResult {
        OperationResult {
            correlation_id: self.correlation_id,
            kind,
            enclave_id: self.enclave_id,
            ack_index: self.fragment_index,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut codec = Codec::with_order(ByteOrder::Little);
        write_guid(&mut codec, &self.correlation_id);
        codec
            .write(&self.kind.code())?
            .write(&self.enclave_id)?
            .write(&self.fragment_index)?
            .write(&self.total_fragments)?;
        codec.write_bytes(&self.payload)?;
        Ok(codec.into_bytes())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        let mut codec = Codec::from_bytes(data, ByteOrder::Little);
        let correlation_id = read_guid(&mut codec)?;
        let kind = MessageKind::from_code(codec.read()?);
        let enclave_id = codec.read()?;
        let fragment_index = codec.read()?;
        let total_fragments = codec.read()?;
        let payload = codec.read_bytes()?;
        Ok(Self {
            correlation_id,
            kind,
            enclave_id,
            payload,
            fragment_index,
            total_fragments,
        })
    }
}

/// A reply published on a service's result topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub correlation_id: Guid,
    pub kind: MessageKind,
    pub enclave_id: i32,
    pub ack_index: i32,
    pub payload: Vec<u8>,
}

impl OperationResult {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut codec = Codec::with_order(ByteOrder::Little);
        write_guid(&mut codec, &self.correlation_id);
        codec
            .write(&self.kind.code())?
            .write(&self.enclave_id)?
            .write(&self.ack_index)?;
        codec.write_bytes(&self.payload)?;
        Ok(codec.into_bytes())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        let mut codec = Codec::from_bytes(data, ByteOrder::Little);
        let correlation_id = read_guid(&mut codec)?;
        let kind = MessageKind::from_code(codec.read()?);
        let enclave_id = codec.read()?;
        let ack_index = codec.read()?;
        let payload = codec.read_bytes()?;
        Ok(Self {
            correlation_id,
            kind,
            enclave_id,
            ack_index,
            payload,
        })
    }

    /// Whether this result acknowledges the given fragment of a call
    pub fn acknowledges(&self, correlation_id: &Guid, fragment_index: i32) -> bool {
        self.kind == MessageKind::Normal
            && &self.correlation_id == correlation_id
            && self.ack_index == fragment_index
    }
}

/// Outcome of feeding one fragment into a [`Reassembly`]
#[derive(Debug, PartialEq, Eq)]
pub enum Assembled {
    /// More fragments are expected
    Partial,
    /// The payload is complete
    Complete(Vec<u8>),
    /// The fragment does not continue the buffered sequence
    OutOfOrder { expected: i32, got: i32 },
}

/// Unfinished calls with no fragment for this long are dropped
pub const REASSEMBLY_IDLE: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Pending {
    next: i32,
    buf: Vec<u8>,
    last_seen: Instant,
}

/// Per-correlation-id fragment buffer kept by servers
#[derive(Debug)]
pub struct Reassembly {
    pending: HashMap<Guid, Pending>,
    idle: Duration,
    next_prune: Instant,
}

impl Default for Reassembly {
    fn default() -> Self {
        Self::with_idle(REASSEMBLY_IDLE)
    }
}

impl Reassembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer that forgets calls idle for longer than `idle`
    pub fn with_idle(idle: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            idle,
            next_prune: Instant::now(),
        }
    }

    pub fn push(&mut self, op: &Operation) -> Assembled {
        self.push_at(op, Instant::now())
    }

    /// [`Reassembly::push`] as seen at `now`
    pub fn push_at(&mut self, op: &Operation, now: Instant) -> Assembled {
        if now >= self.next_prune {
            self.prune(now);
        }
        if op.total_fragments <= 1 {
            self.pending.remove(&op.correlation_id);
            return Assembled::Complete(op.payload.clone());
        }
        if op.fragment_index == 0 {
            self.pending.insert(
                op.correlation_id,
                Pending {
                    next: 0,
                    buf: Vec::new(),
                    last_seen: now,
                },
            );
        }
        let Some(pending) = self.pending.get_mut(&op.correlation_id) else {
            return Assembled::OutOfOrder {
                expected: 0,
                got: op.fragment_index,
            };
        };
        pending.last_seen = now;
        if pending.next != op.fragment_index {
            // A resend of the fragment we just took is acknowledged again
            if pending.next == op.fragment_index + 1 {
                return Assembled::Partial;
            }
            return Assembled::OutOfOrder {
                expected: pending.next,
                got: op.fragment_index,
            };
        }
        pending.buf.extend_from_slice(&op.payload);
        pending.next += 1;
        if op.is_last_fragment() {
            let payload = self
                .pending
                .remove(&op.correlation_id)
                .map(|p| p.buf)
                .unwrap_or_default();
            Assembled::Complete(payload)
        } else {
            Assembled::Partial
        }
    }

    /// Drop calls whose next fragment never came
    pub fn prune(&mut self, now: Instant) {
        let idle = self.idle;
        let before = self.pending.len();
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.last_seen) < idle);
        if self.pending.len() < before {
            debug!("Dropped {} abandoned fragmented calls", before - self.pending.len());
        }
        self.next_prune = now + Duration::from_secs(1);
    }

    pub fn in_progress(&self) -> usize {
        self.pending.len()
    }
}

/// Operation/result topic pair of one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceTopics {
    pub operation: String,
    pub result: String,
}

impl ServiceTopics {
    /// Topics a service is called on
    pub fn service(name: &str) -> Self {
        Self::with_prefix(format!("{}/{}", TOPIC_ROOT, name))
    }

    /// Topics a router answers on so servers can detect it
    pub fn detect(name: &str) -> Self {
        Self::with_prefix(format!("{}/{}/detect", TOPIC_ROOT, name))
    }

    /// Topics private to one backend server behind a router
    pub fn backend(name: &str, guid: &Guid) -> Self {
        Self::with_prefix(format!("{}/{}/{}", TOPIC_ROOT, name, guid.simple()))
    }

    fn with_prefix(prefix: String) -> Self {
        Self {
            operation: format!("{}/operation", prefix),
            result: format!("{}/result", prefix),
        }
    }
}
