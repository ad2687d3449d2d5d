//! Client side of the call transport
//!
//! A [`TransportClient`] owns one writer on a service's operation topic and
//! one reader on its result topic. A background task counts matches and
//! routes each result to the call waiting on its correlation id.
//! [`RpcClient`] marshals typed calls and memoizes one binding per service.

use super::registry::{encode_request, ReplyEnvelope, ServiceSchema};
use crate::codec::{CodecError, Value};
use crate::config::TransportSettings;
use crate::network::{
    close_quietly, BusError, BusEvent, EndpointHandle, Guid, MessageKind, Operation,
    OperationResult, ServiceTopics, SharedBus,
};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Call failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error("Timed out waiting for a reply")]
    Timeout,

    #[error("No endpoint matched on {0}")]
    NotReady(String),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Remote error {code}: {message}")]
    Remote { code: u16, message: String },

    #[error("Transport binding closed")]
    Closed,
}

impl RpcError {
    /// Worth calling again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Timeout | RpcError::NotReady(_))
    }
}

/// Matched remote endpoints of a binding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkState {
    pub writer_matches: i32,
    pub reader_matches: i32,
}

impl LinkState {
    pub fn is_ready(&self) -> bool {
        self.writer_matches > 0 && self.reader_matches > 0
    }
}

type Pending = Arc<Mutex<HashMap<Guid, mpsc::UnboundedSender<OperationResult>>>>;

struct PendingGuard<'a> {
    pending: &'a Pending,
    id: Guid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.id);
    }
}

/// One service's writer/reader pair
pub struct TransportClient {
    bus: SharedBus,
    topics: ServiceTopics,
    writer: EndpointHandle,
    reader: EndpointHandle,
    pending: Pending,
    link: watch::Receiver<LinkState>,
    settings: TransportSettings,
    calls: AtomicU64,
    task: JoinHandle<()>,
}

impl TransportClient {
    /// Open the endpoints and start routing results; needs a tokio runtime
    pub fn connect(bus: SharedBus, topics: ServiceTopics, settings: &TransportSettings) -> Result<Self, RpcError> {
        let mut writer = bus.advertise(&topics.operation)?;
        let mut reader = match bus.subscribe(&topics.result) {
            Ok(reader) => reader,
            Err(e) => {
                close_quietly(bus.as_ref(), &writer.handle);
                return Err(e.into());
            }
        };

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (link_tx, link) = watch::channel(LinkState::default());
        let routes = pending.clone();
        let label = topics.operation.clone();
        let writer_handle = writer.handle.clone();
        let reader_handle = reader.handle.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = writer.events.recv() => match event {
                        Some(BusEvent::MatchChanged { delta }) => {
                            link_tx.send_modify(|s| s.writer_matches += delta);
                        }
                        Some(BusEvent::Data(_)) => {}
                        None => break,
                    },
                    event = reader.events.recv() => match event {
                        Some(BusEvent::MatchChanged { delta }) => {
                            link_tx.send_modify(|s| s.reader_matches += delta);
                        }
                        Some(BusEvent::Data(bytes)) => route(&routes, &bytes),
                        None => break,
                    },
                }
            }
            debug!("Binding {} stopped", label);
        });

        Ok(Self {
            bus,
            topics,
            writer: writer_handle,
            reader: reader_handle,
            pending,
            link,
            settings: settings.clone(),
            calls: AtomicU64::new(0),
            task,
        })
    }

    pub fn topics(&self) -> &ServiceTopics {
        &self.topics
    }

    pub fn is_ready(&self) -> bool {
        self.link.borrow().is_ready()
    }

    /// Watch match counts, e.g. to notice a backend going away
    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.clone()
    }

    /// Completed calls through this binding
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Poll for readiness up to `retry_count` times
    pub async fn wait_ready(&self) -> Result<(), RpcError> {
        for _ in 0..self.settings.retry_count.max(1) {
            if self.is_ready() {
                return Ok(());
            }
            tokio::time::sleep(self.settings.retry_interval()).await;
        }
        if self.is_ready() {
            Ok(())
        } else {
            Err(RpcError::NotReady(self.topics.operation.clone()))
        }
    }

    /// Wait for readiness without polling; false when `limit` passes first
    pub async fn ready_within(&self, limit: Duration) -> bool {
        let mut link = self.link.clone();
        let ready = matches!(
            tokio::time::timeout(limit, link.wait_for(|s| s.is_ready())).await,
            Ok(Ok(_))
        );
        ready
    }

    /// Send `payload` as one call and return the final fragment's result
    pub async fn call(&self, payload: &[u8], enclave_id: i32) -> Result<OperationResult, RpcError> {
        self.wait_ready().await?;

        let id = Uuid::new_v4();
        let fragments = Operation::fragments(id, enclave_id, payload, self.settings.max_transfer_size);
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let mut last = None;
        for op in &fragments {
            last = Some(self.exchange(op, &mut rx, &mut |_: &OperationResult| {}).await?);
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
        last.ok_or(RpcError::Closed)
    }

    /// Forward a prebuilt operation and wait for its acknowledgement
    pub async fn send_operation(&self, op: &Operation) -> Result<OperationResult, RpcError> {
        self.forward(op, |_: &OperationResult| {}).await
    }

    /// [`TransportClient::send_operation`], reporting each keep-alive seen
    /// while waiting
    pub async fn forward<F>(&self, op: &Operation, mut on_keepalive: F) -> Result<OperationResult, RpcError>
    where
        F: FnMut(&OperationResult),
    {
        self.wait_ready().await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(op.correlation_id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: op.correlation_id,
        };
        let result = self.exchange(op, &mut rx, &mut on_keepalive).await?;
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    async fn exchange<F>(
        &self,
        op: &Operation,
        rx: &mut mpsc::UnboundedReceiver<OperationResult>,
        on_keepalive: &mut F,
    ) -> Result<OperationResult, RpcError>
    where
        F: FnMut(&OperationResult),
    {
        let expected = match op.kind {
            MessageKind::Notification => MessageKind::Notification,
            _ => MessageKind::Normal,
        };
        self.bus.publish(&self.writer, op.to_bytes()?)?;

        let budget = self.settings.call_budget();
        let mut deadline = Instant::now() + budget;
        loop {
            let result = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => {
                    warn!(
                        "Call {} on {} timed out at fragment {}",
                        op.correlation_id, self.topics.operation, op.fragment_index
                    );
                    return Err(RpcError::Timeout);
                }
                Ok(None) => return Err(RpcError::Closed),
                Ok(Some(result)) => result,
            };

            if result.kind == MessageKind::Dummy {
                // Keep-alive from a busy server
                on_keepalive(&result);
                deadline = Instant::now() + budget;
                continue;
            }
            if result.kind == expected && result.ack_index == op.fragment_index {
                return Ok(result);
            }
            debug!(
                "Discarding {:?} result for {} (ack {}, waiting for {})",
                result.kind, result.correlation_id, result.ack_index, op.fragment_index
            );
        }
    }
}

fn route(pending: &Pending, bytes: &[u8]) {
    let result = match OperationResult::from_bytes(bytes) {
        Ok(result) => result,
        Err(e) => {
            warn!("Dropping malformed result: {}", e);
            return;
        }
    };
    let pending = pending.lock().unwrap_or_else(|p| p.into_inner());
    match pending.get(&result.correlation_id) {
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => debug!("No call waiting for {}", result.correlation_id),
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.task.abort();
        close_quietly(self.bus.as_ref(), &self.writer);
        close_quietly(self.bus.as_ref(), &self.reader);
    }
}

/// Typed calls over memoized per-service bindings
pub struct RpcClient {
    bus: SharedBus,
    settings: TransportSettings,
    bindings: tokio::sync::Mutex<HashMap<String, Arc<TransportClient>>>,
}

impl RpcClient {
    pub fn new(bus: SharedBus, settings: &TransportSettings) -> Self {
        Self {
            bus,
            settings: settings.clone(),
            bindings: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The binding for `service`, created on first use
    pub async fn binding(&self, service: &str) -> Result<Arc<TransportClient>, RpcError> {
        let mut bindings = self.bindings.lock().await;
        if let Some(binding) = bindings.get(service) {
            return Ok(binding.clone());
        }
        let binding = Arc::new(TransportClient::connect(
            self.bus.clone(),
            ServiceTopics::service(service),
            &self.settings,
        )?);
        info!("Bound service '{}'", service);
        bindings.insert(service.to_string(), binding.clone());
        Ok(binding)
    }

    pub async fn call(
        &self,
        service: &str,
        enclave_id: i32,
        schema: &ServiceSchema,
        args: &[Value],
    ) -> Result<Option<Value>, RpcError> {
        self.call_bound(service, enclave_id, schema, args)
            .await
            .map(|(value, _)| value)
    }

    /// Like [`RpcClient::call`], also returning the enclave id the reply is bound to
    pub async fn call_bound(
        &self,
        service: &str,
        enclave_id: i32,
        schema: &ServiceSchema,
        args: &[Value],
    ) -> Result<(Option<Value>, i32), RpcError> {
        let order = self.settings.byte_order;
        let payload = encode_request(service, schema, args, order)?;
        let binding = self.binding(service).await?;
        let result = binding.call(&payload, enclave_id).await?;

        let envelope = ReplyEnvelope::from_bytes(&result.payload, order)?;
        if !envelope.is_ok() {
            return Err(RpcError::Remote {
                code: envelope.code,
                message: envelope.message,
            });
        }
        let value = envelope.decode_value(schema.returns.as_ref(), order)?;
        Ok((value, result.enclave_id))
    }

    /// Completed calls on `service`; 0 when it was never bound
    pub async fn call_count(&self, service: &str) -> u64 {
        self.bindings
            .lock()
            .await
            .get(service)
            .map(|b| b.call_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{LocalBus, PubSub};

    fn fast_settings() -> TransportSettings {
        TransportSettings {
            retry_count: 5,
            retry_interval_ms: 10,
            ..TransportSettings::default()
        }
    }

    #[tokio::test]
    async fn test_not_ready_without_server() {
        let bus = LocalBus::shared();
        let client = TransportClient::connect(bus, ServiceTopics::service("echo"), &fast_settings()).unwrap();
        assert!(!client.is_ready());
        assert!(matches!(client.call(b"x", -1).await, Err(RpcError::NotReady(_))));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_dummy_resets_budget_and_mismatches_are_discarded() {
        let bus = LocalBus::shared();
        let topics = ServiceTopics::service("slow");
        let mut ops = bus.subscribe(&topics.operation).unwrap();
        let results = bus.advertise(&topics.result).unwrap();
        let client = TransportClient::connect(bus.clone(), topics, &fast_settings()).unwrap();

        let server_bus = bus.clone();
        let server = tokio::spawn(async move {
            while let Some(event) = ops.events.recv().await {
                let BusEvent::Data(bytes) = event else { continue };
                let op = Operation::from_bytes(&bytes).unwrap();
                // Keep the call alive past one budget (5 x 10ms)
                for _ in 0..4 {
                    let dummy = op.reply(MessageKind::Dummy, Vec::new());
                    server_bus.publish(&results.handle, dummy.to_bytes().unwrap()).unwrap();
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                let mut stale = op.reply(MessageKind::Normal, b"stale".to_vec());
                stale.ack_index = 7;
                server_bus.publish(&results.handle, stale.to_bytes().unwrap()).unwrap();
                let done = op.reply(MessageKind::Normal, b"done".to_vec());
                server_bus.publish(&results.handle, done.to_bytes().unwrap()).unwrap();
                break;
            }
        });

        let result = client.call(b"work", 3).await.unwrap();
        assert_eq!(result.payload, b"done");
        assert_eq!(result.enclave_id, 3);
        assert_eq!(client.call_count(), 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let bus = LocalBus::shared();
        let topics = ServiceTopics::service("mute");
        let _ops = bus.subscribe(&topics.operation).unwrap();
        let _results = bus.advertise(&topics.result).unwrap();
        let client = TransportClient::connect(bus, topics, &fast_settings()).unwrap();

        let err = client.call(b"hello", -1).await.unwrap_err();
        assert_eq!(err, RpcError::Timeout);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_link_state_follows_matches() {
        let bus = LocalBus::shared();
        let topics = ServiceTopics::service("link");
        let client = TransportClient::connect(bus.clone(), topics.clone(), &fast_settings()).unwrap();

        let ops = bus.subscribe(&topics.operation).unwrap();
        let results = bus.advertise(&topics.result).unwrap();
        assert!(client.ready_within(Duration::from_secs(1)).await);

        bus.close(&ops.handle).unwrap();
        let mut link = client.link_state();
        link.wait_for(|s| !s.is_ready()).await.unwrap();
        assert_eq!(link.borrow().reader_matches, 1);
        bus.close(&results.handle).unwrap();
    }
}
