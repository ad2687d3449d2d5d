//! Publish/subscribe seam
//!
//! Endpoints are created per topic in one of two roles. Each endpoint owns a
//! channel of [`BusEvent`]s: match changes whenever a counterpart appears or
//! goes away, and data for readers. The transport binding counts matches to
//! decide readiness.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Bus failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(u64),

    #[error("Endpoint {0} cannot publish: it is a reader")]
    NotAWriter(u64),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Event delivered to an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A counterpart endpoint matched (+1) or unmatched (-1)
    MatchChanged { delta: i32 },
    /// A message published on the reader's topic
    Data(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Writer,
    Reader,
}

impl Role {
    pub fn counterpart(self) -> Role {
        match self {
            Role::Writer => Role::Reader,
            Role::Reader => Role::Writer,
        }
    }
}

/// Cloneable reference to an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointHandle {
    pub id: u64,
    pub topic: String,
    pub role: Role,
}

/// An endpoint plus its event stream
#[derive(Debug)]
pub struct Endpoint {
    pub handle: EndpointHandle,
    pub events: mpsc::UnboundedReceiver<BusEvent>,
}

/// The messaging collaborator
pub trait PubSub: Send + Sync {
    /// Create a writer on a topic
    fn advertise(&self, topic: &str) -> Result<Endpoint, BusError>;

    /// Create a reader on a topic
    fn subscribe(&self, topic: &str) -> Result<Endpoint, BusError>;

    /// Publish through a writer
    fn publish(&self, writer: &EndpointHandle, data: Vec<u8>) -> Result<(), BusError>;

    /// Remove an endpoint, unmatching its counterparts
    fn close(&self, endpoint: &EndpointHandle) -> Result<(), BusError>;
}

pub type SharedBus = Arc<dyn PubSub>;

#[derive(Debug)]
struct Slot {
    id: u64,
    tx: mpsc::UnboundedSender<BusEvent>,
}

#[derive(Debug, Default)]
struct TopicEntry {
    writers: Vec<Slot>,
    readers: Vec<Slot>,
}

impl TopicEntry {
    fn side(&self, role: Role) -> &Vec<Slot> {
        match role {
            Role::Writer => &self.writers,
            Role::Reader => &self.readers,
        }
    }

    fn side_mut(&mut self, role: Role) -> &mut Vec<Slot> {
        match role {
            Role::Writer => &mut self.writers,
            Role::Reader => &mut self.readers,
        }
    }
}

/// In-process bus: every endpoint in the process sees every other one
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: Mutex<HashMap<String, TopicEntry>>,
    next_id: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedBus {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TopicEntry>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(&self, topic: &str, role: Role) -> Endpoint {
        let (tx, events) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        let mut topics = self.lock();
        let entry = topics.entry(topic.to_string()).or_default();
        for peer in entry.side(role.counterpart()) {
            let _ = peer.tx.send(BusEvent::MatchChanged { delta: 1 });
            let _ = tx.send(BusEvent::MatchChanged { delta: 1 });
        }
        entry.side_mut(role).push(Slot { id, tx });
        debug!("Opened {:?} endpoint {} on {}", role, id, topic);

        Endpoint {
            handle: EndpointHandle {
                id,
                topic: topic.to_string(),
                role,
            },
            events,
        }
    }

    /// Number of local endpoints of a role on a topic
    pub fn count(&self, topic: &str, role: Role) -> usize {
        self.lock()
            .get(topic)
            .map(|entry| entry.side(role).len())
            .unwrap_or(0)
    }

    /// Report remote counterparts to one local endpoint
    pub(crate) fn inject_match(&self, handle: &EndpointHandle, delta: i32) {
        let topics = self.lock();
        if let Some(slot) = topics
            .get(&handle.topic)
            .and_then(|entry| entry.side(handle.role).iter().find(|s| s.id == handle.id))
        {
            let _ = slot.tx.send(BusEvent::MatchChanged { delta });
        }
    }

    /// Report a remote counterpart change to every local endpoint of a role
    pub(crate) fn inject_remote_match(&self, topic: &str, role: Role, delta: i32) {
        let topics = self.lock();
        if let Some(entry) = topics.get(topic) {
            for slot in entry.side(role) {
                let _ = slot.tx.send(BusEvent::MatchChanged { delta });
            }
        }
    }

    /// Deliver a remotely published message to local readers
    pub(crate) fn inject_remote_data(&self, topic: &str, data: &[u8]) {
        let topics = self.lock();
        if let Some(entry) = topics.get(topic) {
            for slot in &entry.readers {
                let _ = slot.tx.send(BusEvent::Data(data.to_vec()));
            }
        }
    }
}

impl PubSub for LocalBus {
    fn advertise(&self, topic: &str) -> Result<Endpoint, BusError> {
        Ok(self.open(topic, Role::Writer))
    }

    fn subscribe(&self, topic: &str) -> Result<Endpoint, BusError> {
        Ok(self.open(topic, Role::Reader))
    }

    fn publish(&self, writer: &EndpointHandle, data: Vec<u8>) -> Result<(), BusError> {
        if writer.role != Role::Writer {
            return Err(BusError::NotAWriter(writer.id));
        }
        let topics = self.lock();
        let entry = topics
            .get(&writer.topic)
            .filter(|entry| entry.writers.iter().any(|s| s.id == writer.id))
            .ok_or(BusError::UnknownEndpoint(writer.id))?;
        for slot in &entry.readers {
            let _ = slot.tx.send(BusEvent::Data(data.clone()));
        }
        Ok(())
    }

    fn close(&self, endpoint: &EndpointHandle) -> Result<(), BusError> {
        let mut topics = self.lock();
        let entry = topics
            .get_mut(&endpoint.topic)
            .ok_or(BusError::UnknownEndpoint(endpoint.id))?;
        let side = entry.side_mut(endpoint.role);
        let before = side.len();
        side.retain(|s| s.id != endpoint.id);
        if side.len() == before {
            return Err(BusError::UnknownEndpoint(endpoint.id));
        }
        for peer in entry.side(endpoint.role.counterpart()) {
            let _ = peer.tx.send(BusEvent::MatchChanged { delta: -1 });
        }
        if entry.writers.is_empty() && entry.readers.is_empty() {
            topics.remove(&endpoint.topic);
        }
        debug!("Closed endpoint {} on {}", endpoint.id, endpoint.topic);
        Ok(())
    }
}

/// Close an endpoint, logging instead of failing
pub fn close_quietly(bus: &dyn PubSub, handle: &EndpointHandle) {
    if let Err(e) = bus.close(handle) {
        warn!("Failed to close endpoint on {}: {}", handle.topic, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(endpoint: &mut Endpoint) -> Vec<BusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = endpoint.events.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_match_on_both_sides() {
        let bus = LocalBus::new();
        let mut writer = bus.advertise("t").unwrap();
        assert!(drain(&mut writer).is_empty());

        let mut reader = bus.subscribe("t").unwrap();
        assert_eq!(drain(&mut writer), vec![BusEvent::MatchChanged { delta: 1 }]);
        assert_eq!(drain(&mut reader), vec![BusEvent::MatchChanged { delta: 1 }]);
    }

    #[test]
    fn test_publish_reaches_readers_only_on_topic() {
        let bus = LocalBus::new();
        let writer = bus.advertise("a").unwrap();
        let mut reader_a = bus.subscribe("a").unwrap();
        let mut reader_b = bus.subscribe("b").unwrap();
        drain(&mut reader_a);

        bus.publish(&writer.handle, b"hello".to_vec()).unwrap();
        assert_eq!(drain(&mut reader_a), vec![BusEvent::Data(b"hello".to_vec())]);
        assert!(drain(&mut reader_b).is_empty());
    }

    #[test]
    fn test_close_unmatches() {
        let bus = LocalBus::new();
        let mut writer = bus.advertise("t").unwrap();
        let reader = bus.subscribe("t").unwrap();
        drain(&mut writer);

        bus.close(&reader.handle).unwrap();
        assert_eq!(drain(&mut writer), vec![BusEvent::MatchChanged { delta: -1 }]);
        assert_eq!(bus.count("t", Role::Reader), 0);
        assert!(bus.close(&reader.handle).is_err());
    }

    #[test]
    fn test_reader_cannot_publish() {
        let bus = LocalBus::new();
        let reader = bus.subscribe("t").unwrap();
        assert_eq!(
            bus.publish(&reader.handle, Vec::new()),
            Err(BusError::NotAWriter(reader.handle.id))
        );
    }

    #[test]
    fn test_injected_remote_events() {
        let bus = LocalBus::new();
        let mut reader = bus.subscribe("t").unwrap();
        bus.inject_remote_match("t", Role::Reader, 1);
        bus.inject_remote_data("t", b"x");
        assert_eq!(
            drain(&mut reader),
            vec![
                BusEvent::MatchChanged { delta: 1 },
                BusEvent::Data(b"x".to_vec())
            ]
        );
    }
}
