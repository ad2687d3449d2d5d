//! Server side of the call transport
//!
//! A published service reads operations and answers on the result topic:
//! - Notification → Notification acknowledgement
//! - Normal → a Dummy first, then either an empty acknowledgement for a
//!   non-final fragment or the registry's reply for the final one
//! - anything else → Dummy
//!
//! Before serving, the server looks for a router on the detection topics. If
//! one answers, it registers itself with a Notification and serves on topics
//! private to its guid; otherwise it serves the service topics directly.

use super::client::{RpcError, TransportClient};
use super::registry::{ReplyEnvelope, ServiceRegistry};
use crate::config::TransportSettings;
use crate::network::{
    close_quietly, Assembled, BusEvent, Endpoint, EndpointHandle, Guid, MessageKind, Operation,
    OperationResult, Reassembly, ServiceTopics, SharedBus,
};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A service being served on the bus
pub struct ServiceServer {
    name: String,
    guid: Option<Guid>,
    topics: ServiceTopics,
    bus: SharedBus,
    reader: EndpointHandle,
    writer: EndpointHandle,
    served: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl ServiceServer {
    /// Detect a router, then start serving `name` from `registry`
    pub async fn publish_service(
        bus: SharedBus,
        name: &str,
        registry: Arc<ServiceRegistry>,
        settings: &TransportSettings,
    ) -> Result<Self, RpcError> {
        let detect = TransportClient::connect(bus.clone(), ServiceTopics::detect(name), settings)?;
        let routed = detect.ready_within(settings.detect_timeout()).await;

        let guid = routed.then(Uuid::new_v4);
        let topics = match &guid {
            Some(guid) => ServiceTopics::backend(name, guid),
            None => ServiceTopics::service(name),
        };

        let reader = bus.subscribe(&topics.operation)?;
        let writer = match bus.advertise(&topics.result) {
            Ok(writer) => writer,
            Err(e) => {
                close_quietly(bus.as_ref(), &reader.handle);
                return Err(e.into());
            }
        };
        let reader_handle = reader.handle.clone();
        let writer_handle = writer.handle.clone();

        let served = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(serve(
            bus.clone(),
            reader,
            writer,
            registry,
            served.clone(),
            settings.call_budget() / 2,
            settings.call_budget() * 2,
        ));

        let server = Self {
            name: name.to_string(),
            guid,
            topics,
            bus,
            reader: reader_handle,
            writer: writer_handle,
            served,
            task,
        };

        if let Some(guid) = guid {
            detect.send_operation(&Operation::notification(guid)).await?;
            info!("Service '{}' registered with router as {}", name, guid.simple());
        } else {
            info!("Service '{}' serving without a router", name);
        }
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Guid announced to the router, if one was found
    pub fn guid(&self) -> Option<Guid> {
        self.guid
    }

    pub fn topics(&self) -> &ServiceTopics {
        &self.topics
    }

    /// Requests answered with a registry reply
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }
}

impl Drop for ServiceServer {
    fn drop(&mut self) {
        self.task.abort();
        close_quietly(self.bus.as_ref(), &self.reader);
        close_quietly(self.bus.as_ref(), &self.writer);
    }
}

fn publish(bus: &SharedBus, writer: &EndpointHandle, result: OperationResult) {
    let bytes = match result.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Cannot encode result for {}: {}", result.correlation_id, e);
            return;
        }
    };
    if let Err(e) = bus.publish(writer, bytes) {
        warn!("Failed to publish result for {}: {}", result.correlation_id, e);
    }
}

async fn serve(
    bus: SharedBus,
    mut reader: Endpoint,
    writer: Endpoint,
    registry: Arc<ServiceRegistry>,
    served: Arc<AtomicU64>,
    keepalive: Duration,
    abandon_after: Duration,
) {
    let writer = writer.handle;
    let mut reassembly = Reassembly::with_idle(abandon_after);

    while let Some(event) = reader.events.recv().await {
        let bytes = match event {
            BusEvent::Data(bytes) => bytes,
            BusEvent::MatchChanged { delta } => {
                debug!("{} match changed by {}", reader.handle.topic, delta);
                continue;
            }
        };
        let op = match Operation::from_bytes(&bytes) {
            Ok(op) => op,
            Err(e) => {
                warn!("Dropping malformed operation on {}: {}", reader.handle.topic, e);
                continue;
            }
        };

        match op.kind {
            MessageKind::Notification => {
                publish(&bus, &writer, op.reply(MessageKind::Notification, Vec::new()));
            }
            MessageKind::Normal => {
                publish(&bus, &writer, op.reply(MessageKind::Dummy, Vec::new()));
                match reassembly.push(&op) {
                    Assembled::Partial => {
                        publish(&bus, &writer, op.reply(MessageKind::Normal, Vec::new()));
                    }
                    Assembled::OutOfOrder { expected, got } => {
                        warn!(
                            "Call {} sent fragment {} while {} was expected",
                            op.correlation_id, got, expected
                        );
                    }
                    Assembled::Complete(payload) => {
                        tokio::spawn(answer(
                            bus.clone(),
                            writer.clone(),
                            registry.clone(),
                            served.clone(),
                            op,
                            payload,
                            keepalive,
                        ));
                    }
                }
            }
            _ => publish(&bus, &writer, op.reply(MessageKind::Dummy, Vec::new())),
        }
    }
    debug!("Server on {} stopped", reader.handle.topic);
}

/// Dispatch one complete request, sending keep-alives while the handler runs
async fn answer(
    bus: SharedBus,
    writer: EndpointHandle,
    registry: Arc<ServiceRegistry>,
    served: Arc<AtomicU64>,
    op: Operation,
    payload: Vec<u8>,
    keepalive: Duration,
) {
    let order = registry.order();
    let mut work = tokio::task::spawn_blocking(move || registry.dispatch_request(&payload));
    let mut ticker = tokio::time::interval(keepalive.max(Duration::from_millis(1)));
    ticker.tick().await;

    let reply = loop {
        tokio::select! {
            done = &mut work => break done,
            _ = ticker.tick() => {
                publish(&bus, &writer, op.reply(MessageKind::Dummy, Vec::new()));
            }
        }
    };

    match reply {
        Ok(bytes) => {
            served.fetch_add(1, Ordering::Relaxed);
            publish(&bus, &writer, op.reply(MessageKind::Normal, bytes));
        }
        Err(e) => {
            error!("Handler for call {} panicked: {}", op.correlation_id, e);
            let envelope = ReplyEnvelope::error(ReplyEnvelope::HANDLER_FAILED, "handler panicked");
            match envelope.to_bytes(order) {
                Ok(bytes) => publish(&bus, &writer, op.reply(MessageKind::Normal, bytes)),
                Err(e) => error!("Cannot encode failure for {}: {}", op.correlation_id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ByteOrder, FieldType, Value};
    use crate::network::LocalBus;
    use crate::rpc::client::RpcClient;
    use crate::rpc::registry::ServiceSchema;

    fn fast_settings() -> TransportSettings {
        TransportSettings {
            retry_count: 20,
            retry_interval_ms: 10,
            detect_timeout_ms: 50,
            ..TransportSettings::default()
        }
    }

    fn echo_registry() -> Arc<ServiceRegistry> {
        let registry = ServiceRegistry::new(ByteOrder::Little);
        registry.register(
            "echo",
            ServiceSchema::new(vec![FieldType::I32], Some(FieldType::I32)),
            |args| Ok(Some(args[0].clone())),
        );
        registry.register(
            "boom",
            ServiceSchema::new(vec![FieldType::I32], Some(FieldType::I32)),
            |_args| panic!("handler bug"),
        );
        registry.register(
            "len",
            ServiceSchema::new(vec![FieldType::Bytes], Some(FieldType::U32)),
            |args| Ok(args[0].as_bytes().map(|b| Value::U32(b.len() as u32))),
        );
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_serves_without_router() {
        let bus = LocalBus::shared();
        let server = ServiceServer::publish_service(bus.clone(), "echo", echo_registry(), &fast_settings())
            .await
            .unwrap();
        assert!(server.guid().is_none());
        assert_eq!(server.topics(), &ServiceTopics::service("echo"));

        let client = RpcClient::new(bus, &fast_settings());
        let schema = ServiceSchema::new(vec![FieldType::I32], Some(FieldType::I32));
        let value = client.call("echo", -1, &schema, &[Value::I32(42)]).await.unwrap();
        assert_eq!(value, Some(Value::I32(42)));
        assert_eq!(client.call_count("echo").await, 1);
        assert_eq!(server.served(), 1);
    }

    #[tokio::test]
    async fn test_fragmented_request() {
        let bus = LocalBus::shared();
        let settings = TransportSettings {
            max_transfer_size: 1000,
            ..fast_settings()
        };
        let server = ServiceServer::publish_service(bus.clone(), "len", echo_registry(), &settings)
            .await
            .unwrap();

        let client = RpcClient::new(bus, &settings);
        let schema = ServiceSchema::new(vec![FieldType::Bytes], Some(FieldType::U32));
        let blob = vec![7u8; 4500];
        let value = client.call("len", -1, &schema, &[Value::Bytes(blob)]).await.unwrap();
        assert_eq!(value, Some(Value::U32(4500)));
        assert_eq!(server.served(), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_replies_with_failure() {
        let bus = LocalBus::shared();
        let server = ServiceServer::publish_service(bus.clone(), "boom", echo_registry(), &fast_settings())
            .await
            .unwrap();

        let client = RpcClient::new(bus, &fast_settings());
        let schema = ServiceSchema::new(vec![FieldType::I32], Some(FieldType::I32));
        let started = std::time::Instant::now();
        let err = client.call("boom", -1, &schema, &[Value::I32(1)]).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote { code: ReplyEnvelope::HANDLER_FAILED, .. }));
        assert!(started.elapsed() < fast_settings().call_budget());
        assert_eq!(server.served(), 0);
    }

    #[tokio::test]
    async fn test_unknown_service_reply() {
        let bus = LocalBus::shared();
        // Served under "echo" topics but asking for a name the registry lacks
        let _server = ServiceServer::publish_service(bus.clone(), "echo", echo_registry(), &fast_settings())
            .await
            .unwrap();
        let client = TransportClient::connect(bus, ServiceTopics::service("echo"), &fast_settings()).unwrap();

        let mut codec = crate::codec::Codec::new();
        crate::codec::write_str(&mut codec, "missing").unwrap();
        let result = client.call(codec.as_bytes(), -1).await.unwrap();
        let envelope = ReplyEnvelope::from_bytes(&result.payload, ByteOrder::Little).unwrap();
        assert_eq!(envelope.code, ReplyEnvelope::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_notification_is_acknowledged() {
        let bus = LocalBus::shared();
        let _server = ServiceServer::publish_service(bus.clone(), "echo", echo_registry(), &fast_settings())
            .await
            .unwrap();
        let client = TransportClient::connect(bus, ServiceTopics::service("echo"), &fast_settings()).unwrap();

        let result = client.send_operation(&Operation::notification(Uuid::new_v4())).await.unwrap();
        assert_eq!(result.kind, MessageKind::Notification);
    }
}
