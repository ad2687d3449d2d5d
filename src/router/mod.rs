//! Router: spreads one service's calls over several backend servers
//!
//! Backends announce themselves on the detection topics with a Notification
//! carrying their guid. The router binds to each backend's private topics and
//! forwards Normal operations:
//! - all fragments of one call go to the same backend
//! - an enclave id bound to a backend keeps going to it
//! - everything else is round robin over live backends
//!
//! A backend whose binding loses its match is marked Closed and compacted
//! out of the pool.

use crate::config::TransportSettings;
use crate::network::{
    close_quietly, BusError, BusEvent, Endpoint, EndpointHandle, Guid, MessageKind, Operation,
    OperationResult, PubSub, ServiceTopics, SharedBus,
};
use crate::rpc::{ReplyEnvelope, RpcError, TransportClient};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackendStatus {
    Running,
    Busy,
    Closed,
}

/// Bound enclave ids idle this long are forgotten
pub const AFFINITY_IDLE: Duration = Duration::from_secs(600);
/// Most enclave bindings kept at once; the least recently used goes first
pub const AFFINITY_LIMIT: usize = 4096;
/// Fragmented calls with no fragment for this long are dropped
pub const IN_FLIGHT_IDLE: Duration = Duration::from_secs(60);
const PRUNE_EVERY: Duration = Duration::from_secs(1);

/// One registered backend server
#[derive(Debug, Clone)]
pub struct BackendServerRecord<T> {
    pub guid: Guid,
    pub status: BackendStatus,
    pub binding: T,
    pub registered_at: DateTime<Utc>,
    /// Calls currently forwarded to this backend
    pub active: usize,
}

/// Where one operation should go
#[derive(Debug, Clone, PartialEq)]
pub struct Selection<T> {
    pub guid: Guid,
    pub binding: T,
    /// Enclave id the forwarded operation carries
    pub enclave_id: i32,
}

#[derive(Debug, Clone, Copy)]
struct Sticky {
    guid: Guid,
    enclave_id: i32,
    last_used: Instant,
}

/// Live backends, the round-robin cursor and stickiness tables
#[derive(Debug)]
pub struct BackendPool<T> {
    records: Vec<BackendServerRecord<T>>,
    cursor: usize,
    affinity: HashMap<i32, Sticky>,
    in_flight: HashMap<Guid, Sticky>,
    next_enclave_id: i32,
    affinity_idle: Duration,
    affinity_limit: usize,
    in_flight_idle: Duration,
    next_prune: Instant,
}

impl<T> Default for BackendPool<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            cursor: 0,
            affinity: HashMap::new(),
            in_flight: HashMap::new(),
            next_enclave_id: 1,
            affinity_idle: AFFINITY_IDLE,
            affinity_limit: AFFINITY_LIMIT,
            in_flight_idle: IN_FLIGHT_IDLE,
            next_prune: Instant::now(),
        }
    }
}

impl<T: Clone> BackendPool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool with custom expiry for enclave bindings and unfinished calls
    pub fn with_limits(affinity_idle: Duration, affinity_limit: usize, in_flight_idle: Duration) -> Self {
        Self {
            affinity_idle,
            affinity_limit: affinity_limit.max(1),
            in_flight_idle,
            ..Self::default()
        }
    }

    /// Add a backend; false if the guid is already known
    pub fn add(&mut self, guid: Guid, binding: T) -> bool {
        if self.contains(&guid) {
            return false;
        }
        self.records.push(BackendServerRecord {
            guid,
            status: BackendStatus::Running,
            binding,
            registered_at: Utc::now(),
            active: 0,
        });
        true
    }

    pub fn contains(&self, guid: &Guid) -> bool {
        self.records.iter().any(|r| &r.guid == guid)
    }

    pub fn records(&self) -> &[BackendServerRecord<T>] {
        &self.records
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Enclave ids currently bound to a backend
    pub fn affinity_len(&self) -> usize {
        self.affinity.len()
    }

    /// Fragmented calls still waiting for their last fragment
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Backends that are not Closed
    pub fn live(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status != BackendStatus::Closed)
            .count()
    }

    pub fn set_status(&mut self, guid: &Guid, status: BackendStatus) -> bool {
        match self.records.iter_mut().find(|r| &r.guid == guid) {
            Some(record) => {
                record.status = status;
                true
            }
            None => false,
        }
    }

    pub fn mark_closed(&mut self, guid: &Guid) -> bool {
        self.set_status(guid, BackendStatus::Closed)
    }

    /// A call was forwarded to `guid`; the backend shows Busy until it finishes
    pub fn begin(&mut self, guid: &Guid) {
        if let Some(record) = self.records.iter_mut().find(|r| &r.guid == guid) {
            record.active += 1;
            if record.status == BackendStatus::Running {
                record.status = BackendStatus::Busy;
            }
        }
    }

    pub fn finish(&mut self, guid: &Guid) {
        if let Some(record) = self.records.iter_mut().find(|r| &r.guid == guid) {
            record.active = record.active.saturating_sub(1);
            if record.active == 0 && record.status == BackendStatus::Busy {
                record.status = BackendStatus::Running;
            }
        }
    }

    /// Next live backend after the cursor, advancing it
    pub fn next(&mut self) -> Option<&BackendServerRecord<T>> {
        let n = self.records.len();
        for step in 0..n {
            let index = (self.cursor + step) % n;
            if self.records[index].status != BackendStatus::Closed {
                self.cursor = (index + 1) % n;
                return Some(&self.records[index]);
            }
        }
        None
    }

    /// Drop Closed records and re-flow the cursor onto the survivors
    pub fn adjust_index(&mut self) {
        let removed_before = self.records[..self.cursor.min(self.records.len())]
            .iter()
            .filter(|r| r.status == BackendStatus::Closed)
            .count();
        self.records.retain(|r| r.status != BackendStatus::Closed);
        self.cursor -= removed_before;
        if self.cursor >= self.records.len() {
            self.cursor = 0;
        }

        let records = &self.records;
        let live = |guid: &Guid| records.iter().any(|r| &r.guid == guid);
        self.affinity.retain(|_, s| live(&s.guid));
        self.in_flight.retain(|_, s| live(&s.guid));
    }

    /// Forget enclave bindings and unfinished calls idle past their limits
    pub fn prune(&mut self, now: Instant) {
        let (affinity_idle, in_flight_idle) = (self.affinity_idle, self.in_flight_idle);
        let before = (self.affinity.len(), self.in_flight.len());
        self.affinity
            .retain(|_, s| now.saturating_duration_since(s.last_used) < affinity_idle);
        self.in_flight
            .retain(|_, s| now.saturating_duration_since(s.last_used) < in_flight_idle);
        let dropped = (before.0 - self.affinity.len(), before.1 - self.in_flight.len());
        if dropped != (0, 0) {
            debug!(
                "Pruned {} idle enclave bindings and {} abandoned calls",
                dropped.0, dropped.1
            );
        }
        self.next_prune = now + PRUNE_EVERY;
    }

    fn bind_enclave(&mut self, enclave_id: i32, guid: Guid, now: Instant) {
        self.affinity.insert(
            enclave_id,
            Sticky {
                guid,
                enclave_id,
                last_used: now,
            },
        );
        if self.affinity.len() > self.affinity_limit {
            let oldest = self
                .affinity
                .iter()
                .min_by_key(|(_, s)| s.last_used)
                .map(|(id, _)| *id);
            if let Some(id) = oldest {
                self.affinity.remove(&id);
            }
        }
    }

    fn live_binding(&self, guid: &Guid) -> Option<&BackendServerRecord<T>> {
        self.records
            .iter()
            .find(|r| &r.guid == guid && r.status != BackendStatus::Closed)
    }

    /// Pick the backend for `op`
    pub fn select(&mut self, op: &Operation) -> Option<Selection<T>> {
        self.select_at(op, Instant::now())
    }

    /// [`BackendPool::select`] as seen at `now`
    pub fn select_at(&mut self, op: &Operation, now: Instant) -> Option<Selection<T>> {
        if now >= self.next_prune {
            self.prune(now);
        }

        let mut sticky = self.in_flight.get_mut(&op.correlation_id);
        if sticky.is_none() && op.enclave_id > 0 {
            sticky = self.affinity.get_mut(&op.enclave_id);
        }
        let sticky = sticky.map(|s| {
            s.last_used = now;
            *s
        });
        let sticky = sticky.and_then(|s| {
            self.live_binding(&s.guid).map(|r| Selection {
                guid: s.guid,
                binding: r.binding.clone(),
                enclave_id: s.enclave_id,
            })
        });

        let selection = match sticky {
            Some(selection) => selection,
            None => {
                let (guid, binding) = {
                    let record = self.next()?;
                    (record.guid, record.binding.clone())
                };
                let enclave_id = match op.enclave_id {
                    0 => {
                        let id = self.next_enclave_id;
                        self.next_enclave_id = self.next_enclave_id.checked_add(1).unwrap_or(1);
                        self.bind_enclave(id, guid, now);
                        id
                    }
                    id if id > 0 => {
                        self.bind_enclave(id, guid, now);
                        id
                    }
                    id => id,
                };
                Selection {
                    guid,
                    binding,
                    enclave_id,
                }
            }
        };

        if op.is_last_fragment() {
            self.in_flight.remove(&op.correlation_id);
        } else {
            self.in_flight.insert(
                op.correlation_id,
                Sticky {
                    guid: selection.guid,
                    enclave_id: selection.enclave_id,
                    last_used: now,
                },
            );
        }
        Some(selection)
    }
}

type Pool = Arc<Mutex<BackendPool<Arc<TransportClient>>>>;

fn lock(pool: &Pool) -> MutexGuard<'_, BackendPool<Arc<TransportClient>>> {
    pool.lock().unwrap_or_else(|p| p.into_inner())
}

/// Router for one service
pub struct Router {
    service: String,
    bus: SharedBus,
    pool: Pool,
    endpoints: Vec<EndpointHandle>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Router {
    /// Open the detection and service topic pairs and start routing
    pub fn start(bus: SharedBus, service: &str, settings: &TransportSettings) -> Result<Self, RpcError> {
        let detect = ServiceTopics::detect(service);
        let topics = ServiceTopics::service(service);

        let mut opened: Vec<EndpointHandle> = Vec::new();
        let (detect_reader, detect_writer, op_reader, result_writer) =
            match open_endpoints(bus.as_ref(), &detect, &topics, &mut opened) {
                Ok(endpoints) => endpoints,
                Err(e) => {
                    for handle in &opened {
                        close_quietly(bus.as_ref(), handle);
                    }
                    return Err(e.into());
                }
            };

        let pool: Pool = Arc::new(Mutex::new(BackendPool::with_limits(
            AFFINITY_IDLE,
            AFFINITY_LIMIT,
            settings.call_budget() * 2,
        )));
        let tasks = Arc::new(Mutex::new(Vec::new()));

        let detect_task = tokio::spawn(detect_loop(
            bus.clone(),
            service.to_string(),
            settings.clone(),
            pool.clone(),
            tasks.clone(),
            detect_reader,
            detect_writer.handle,
        ));
        let route_task = tokio::spawn(route_loop(
            bus.clone(),
            pool.clone(),
            op_reader,
            result_writer.handle,
            settings.byte_order,
        ));
        {
            let mut tasks = tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.push(detect_task);
            tasks.push(route_task);
        }

        info!("Router for '{}' started", service);
        Ok(Self {
            service: service.to_string(),
            bus,
            pool,
            endpoints: opened,
            tasks,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Guid and status of every known backend, in round-robin order
    pub fn backends(&self) -> Vec<(Guid, BackendStatus)> {
        lock(&self.pool)
            .records()
            .iter()
            .map(|r| (r.guid, r.status))
            .collect()
    }

    pub fn live_backends(&self) -> usize {
        lock(&self.pool).live()
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            task.abort();
        }
        for handle in &self.endpoints {
            close_quietly(self.bus.as_ref(), handle);
        }
    }
}

fn open_endpoints(
    bus: &dyn PubSub,
    detect: &ServiceTopics,
    topics: &ServiceTopics,
    opened: &mut Vec<EndpointHandle>,
) -> Result<(Endpoint, Endpoint, Endpoint, Endpoint), BusError> {
    let mut track = |endpoint: Endpoint| {
        opened.push(endpoint.handle.clone());
        endpoint
    };
    Ok((
        track(bus.subscribe(&detect.operation)?),
        track(bus.advertise(&detect.result)?),
        track(bus.subscribe(&topics.operation)?),
        track(bus.advertise(&topics.result)?),
    ))
}

fn publish(bus: &SharedBus, writer: &EndpointHandle, result: OperationResult) {
    match result.to_bytes() {
        Ok(bytes) => {
            if let Err(e) = bus.publish(writer, bytes) {
                warn!("Router failed to publish for {}: {}", result.correlation_id, e);
            }
        }
        Err(e) => error!("Router cannot encode result {}: {}", result.correlation_id, e),
    }
}

fn decode(bytes: &[u8], topic: &str) -> Option<Operation> {
    match Operation::from_bytes(bytes) {
        Ok(op) => Some(op),
        Err(e) => {
            warn!("Dropping malformed operation on {}: {}", topic, e);
            None
        }
    }
}

async fn detect_loop(
    bus: SharedBus,
    service: String,
    settings: TransportSettings,
    pool: Pool,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    mut reader: Endpoint,
    writer: EndpointHandle,
) {
    while let Some(event) = reader.events.recv().await {
        let BusEvent::Data(bytes) = event else { continue };
        let Some(op) = decode(&bytes, &reader.handle.topic) else { continue };

        if op.kind != MessageKind::Notification {
            publish(&bus, &writer, op.reply(MessageKind::Dummy, Vec::new()));
            continue;
        }
        let guid = match Guid::from_slice(&op.payload) {
            Ok(guid) => guid,
            Err(e) => {
                warn!("Notification without a backend guid: {}", e);
                continue;
            }
        };

        if !lock(&pool).contains(&guid) {
            match TransportClient::connect(bus.clone(), ServiceTopics::backend(&service, &guid), &settings) {
                Ok(binding) => {
                    let binding = Arc::new(binding);
                    let mut link = binding.link_state();
                    lock(&pool).add(guid, binding);
                    info!("Backend {} joined '{}'", guid.simple(), service);

                    let watched = pool.clone();
                    let watcher = tokio::spawn(async move {
                        if link.wait_for(|s| s.is_ready()).await.is_err() {
                            return;
                        }
                        let _ = link.wait_for(|s| !s.is_ready()).await;
                        let mut pool = lock(&watched);
                        pool.mark_closed(&guid);
                        pool.adjust_index();
                        info!("Backend {} left, {} live", guid.simple(), pool.live());
                    });
                    tasks.lock().unwrap_or_else(|p| p.into_inner()).push(watcher);
                }
                Err(e) => {
                    error!("Cannot bind backend {}: {}", guid.simple(), e);
                    continue;
                }
            }
        } else {
            debug!("Backend {} announced again", guid.simple());
        }
        publish(&bus, &writer, op.reply(MessageKind::Notification, Vec::new()));
    }
}

async fn route_loop(
    bus: SharedBus,
    pool: Pool,
    mut reader: Endpoint,
    writer: EndpointHandle,
    order: crate::codec::ByteOrder,
) {
    while let Some(event) = reader.events.recv().await {
        let BusEvent::Data(bytes) = event else { continue };
        let Some(op) = decode(&bytes, &reader.handle.topic) else { continue };

        match op.kind {
            MessageKind::Normal => {
                publish(&bus, &writer, op.reply(MessageKind::Dummy, Vec::new()));
                let selection = {
                    let mut pool = lock(&pool);
                    let selection = pool.select(&op);
                    if let Some(selection) = &selection {
                        pool.begin(&selection.guid);
                    }
                    selection
                };
                let Some(selection) = selection else {
                    warn!("No live backend for call {}", op.correlation_id);
                    let envelope = ReplyEnvelope::error(ReplyEnvelope::UNAVAILABLE, "no backend available");
                    publish(&bus, &writer, op.reply(MessageKind::Normal, envelope.to_bytes(order).unwrap_or_default()));
                    continue;
                };
                tokio::spawn(forward(bus.clone(), writer.clone(), pool.clone(), op, selection, order));
            }
            MessageKind::Notification => {
                publish(&bus, &writer, op.reply(MessageKind::Notification, Vec::new()));
            }
            _ => publish(&bus, &writer, op.reply(MessageKind::Dummy, Vec::new())),
        }
    }
}

async fn forward(
    bus: SharedBus,
    writer: EndpointHandle,
    pool: Pool,
    op: Operation,
    selection: Selection<Arc<TransportClient>>,
    order: crate::codec::ByteOrder,
) {
    let mut outgoing = op.clone();
    outgoing.enclave_id = selection.enclave_id;

    let relay_bus = bus.clone();
    let relay_writer = writer.clone();
    let keepalive = op.reply(MessageKind::Dummy, Vec::new());
    let result = selection
        .binding
        .forward(&outgoing, |_: &OperationResult| {
            publish(&relay_bus, &relay_writer, keepalive.clone())
        })
        .await;
    lock(&pool).finish(&selection.guid);

    let reply = match result {
        Ok(result) => OperationResult {
            correlation_id: op.correlation_id,
            kind: MessageKind::Normal,
            enclave_id: selection.enclave_id,
            ack_index: op.fragment_index,
            payload: result.payload,
        },
        Err(e) => {
            warn!(
                "Backend {} failed call {}: {}",
                selection.guid.simple(),
                op.correlation_id,
                e
            );
            let envelope = ReplyEnvelope::error(ReplyEnvelope::UNAVAILABLE, e.to_string());
            let mut reply = op.reply(MessageKind::Normal, envelope.to_bytes(order).unwrap_or_default());
            reply.enclave_id = selection.enclave_id;
            reply
        }
    };
    publish(&bus, &writer, reply);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ByteOrder, FieldType, Value};
    use crate::network::{LocalBus, ENCLAVE_UNKNOWN, ENCLAVE_UNRELATED};
    use crate::rpc::{RpcClient, ServiceRegistry, ServiceSchema, ServiceServer};
    use uuid::Uuid;

    fn guids(n: usize) -> Vec<Guid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    fn pool(n: usize) -> (BackendPool<usize>, Vec<Guid>) {
        let ids = guids(n);
        let mut pool = BackendPool::new();
        for (i, guid) in ids.iter().enumerate() {
            assert!(pool.add(*guid, i));
        }
        (pool, ids)
    }

    fn op(enclave_id: i32) -> Operation {
        Operation::new(MessageKind::Normal, enclave_id, Vec::new())
    }

    #[test]
    fn test_add_is_idempotent() {
        let (mut pool, ids) = pool(2);
        assert!(!pool.add(ids[0], 9));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_round_robin_fairness_from_any_start() {
        for start in 0..4 {
            let (mut pool, _) = pool(4);
            for _ in 0..start {
                pool.next();
            }
            let mut hits = [0usize; 4];
            for _ in 0..40 {
                hits[pool.next().unwrap().binding] += 1;
            }
            assert_eq!(hits, [10, 10, 10, 10]);
        }
    }

    #[test]
    fn test_next_skips_closed() {
        let (mut pool, ids) = pool(3);
        pool.mark_closed(&ids[1]);
        let picks: Vec<usize> = (0..4).map(|_| pool.next().unwrap().binding).collect();
        assert_eq!(picks, vec![0, 2, 0, 2]);
        pool.mark_closed(&ids[0]);
        pool.mark_closed(&ids[2]);
        assert!(pool.next().is_none());
    }

    #[test]
    fn test_adjust_index_never_points_past_end() {
        let (mut pool, ids) = pool(4);
        // Cursor at 3 (next pick is record 3)
        for _ in 0..3 {
            pool.next();
        }
        pool.mark_closed(&ids[0]);
        pool.mark_closed(&ids[3]);
        pool.adjust_index();
        assert_eq!(pool.len(), 2);
        assert!(pool.cursor() < pool.len());
        for _ in 0..10 {
            let picked = pool.next().unwrap();
            assert_ne!(picked.status, BackendStatus::Closed);
            assert!(picked.binding == 1 || picked.binding == 2);
        }
    }

    #[test]
    fn test_adjust_index_keeps_rotation_position() {
        let (mut pool, ids) = pool(4);
        pool.next();
        pool.next();
        // Next pick would be record 2; removing record 0 must keep it next
        pool.mark_closed(&ids[0]);
        pool.adjust_index();
        assert_eq!(pool.next().unwrap().binding, 2);
    }

    #[test]
    fn test_enclave_affinity() {
        let (mut pool, ids) = pool(3);
        let first = pool.select(&op(ENCLAVE_UNKNOWN)).unwrap();
        assert!(first.enclave_id > 0);

        for _ in 0..5 {
            let again = pool.select(&op(first.enclave_id)).unwrap();
            assert_eq!(again.guid, first.guid);
        }
        let unrelated = pool.select(&op(ENCLAVE_UNRELATED)).unwrap();
        assert_eq!(unrelated.enclave_id, ENCLAVE_UNRELATED);

        // Closing the bound backend releases the enclave id
        pool.mark_closed(&first.guid);
        pool.adjust_index();
        let moved = pool.select(&op(first.enclave_id)).unwrap();
        assert_ne!(moved.guid, first.guid);
        assert!(ids.contains(&moved.guid));
    }

    #[test]
    fn test_fragments_stay_on_one_backend() {
        let (mut pool, _) = pool(3);
        let fragments = Operation::fragments(Uuid::new_v4(), ENCLAVE_UNKNOWN, &[0u8; 30], 10);
        let first = pool.select(&fragments[0]).unwrap();
        // Interleave another call
        pool.select(&op(ENCLAVE_UNRELATED)).unwrap();
        for fragment in &fragments[1..] {
            let s = pool.select(fragment).unwrap();
            assert_eq!(s.guid, first.guid);
            assert_eq!(s.enclave_id, first.enclave_id);
        }
        assert_eq!(pool.in_flight_len(), 0);
    }

    #[test]
    fn test_abandoned_fragmented_call_is_pruned() {
        let mut pool = BackendPool::with_limits(AFFINITY_IDLE, AFFINITY_LIMIT, Duration::from_secs(2));
        pool.add(Uuid::new_v4(), 0usize);
        let now = Instant::now();

        // First fragment only; the rest never arrive
        let fragments = Operation::fragments(Uuid::new_v4(), ENCLAVE_UNRELATED, &[0u8; 30], 10);
        pool.select_at(&fragments[0], now).unwrap();
        assert_eq!(pool.in_flight_len(), 1);

        pool.select_at(&op(ENCLAVE_UNRELATED), now + Duration::from_secs(1)).unwrap();
        assert_eq!(pool.in_flight_len(), 1);
        pool.select_at(&op(ENCLAVE_UNRELATED), now + Duration::from_secs(5)).unwrap();
        assert_eq!(pool.in_flight_len(), 0);
    }

    #[test]
    fn test_enclave_bindings_are_bounded() {
        let mut pool = BackendPool::with_limits(Duration::from_secs(60), 16, IN_FLIGHT_IDLE);
        pool.add(Uuid::new_v4(), 0usize);
        pool.add(Uuid::new_v4(), 1usize);
        let now = Instant::now();

        let mut last = 0;
        for i in 0..1000u64 {
            let at = now + Duration::from_millis(i);
            last = pool.select_at(&op(ENCLAVE_UNKNOWN), at).unwrap().enclave_id;
            pool.select_at(&op(last), at).unwrap();
            assert!(pool.affinity_len() <= 16);
        }
        // The most recent binding survives eviction
        let first = pool.select_at(&op(last), now + Duration::from_secs(1)).unwrap();
        let again = pool.select_at(&op(last), now + Duration::from_secs(2)).unwrap();
        assert_eq!(first.guid, again.guid);

        // Idle bindings expire
        pool.prune(now + Duration::from_secs(3600));
        assert_eq!(pool.affinity_len(), 0);
    }

    #[test]
    fn test_busy_while_forwarding() {
        let (mut pool, ids) = pool(2);
        pool.begin(&ids[0]);
        pool.begin(&ids[0]);
        assert_eq!(pool.records()[0].status, BackendStatus::Busy);
        // Busy backends still take calls
        let picks: Vec<usize> = (0..2).map(|_| pool.next().unwrap().binding).collect();
        assert_eq!(picks, vec![0, 1]);

        pool.finish(&ids[0]);
        assert_eq!(pool.records()[0].status, BackendStatus::Busy);
        pool.finish(&ids[0]);
        assert_eq!(pool.records()[0].status, BackendStatus::Running);

        pool.begin(&ids[1]);
        pool.mark_closed(&ids[1]);
        pool.finish(&ids[1]);
        assert_eq!(pool.records()[1].status, BackendStatus::Closed);
    }

    fn fast_settings() -> TransportSettings {
        TransportSettings {
            retry_count: 20,
            retry_interval_ms: 10,
            detect_timeout_ms: 200,
            ..TransportSettings::default()
        }
    }

    fn echo_schema() -> ServiceSchema {
        ServiceSchema::new(vec![FieldType::I32], Some(FieldType::I32))
    }

    fn echo_registry() -> Arc<ServiceRegistry> {
        let registry = ServiceRegistry::new(ByteOrder::Little);
        registry.register("echo", echo_schema(), |args| Ok(Some(args[0].clone())));
        Arc::new(registry)
    }

    async fn wait_for_backends(router: &Router, n: usize) {
        for _ in 0..100 {
            if router.live_backends() == n {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("expected {} backends, have {}", n, router.live_backends());
    }

    #[tokio::test]
    async fn test_routes_round_robin_across_servers() {
        let bus = LocalBus::shared();
        let settings = fast_settings();
        let router = Router::start(bus.clone(), "echo", &settings).unwrap();

        let a = ServiceServer::publish_service(bus.clone(), "echo", echo_registry(), &settings)
            .await
            .unwrap();
        let b = ServiceServer::publish_service(bus.clone(), "echo", echo_registry(), &settings)
            .await
            .unwrap();
        assert!(a.guid().is_some() && b.guid().is_some());
        wait_for_backends(&router, 2).await;

        let client = RpcClient::new(bus, &settings);
        for i in 0..4 {
            let value = client
                .call("echo", ENCLAVE_UNRELATED, &echo_schema(), &[Value::I32(i)])
                .await
                .unwrap();
            assert_eq!(value, Some(Value::I32(i)));
        }
        assert_eq!(a.served(), 2);
        assert_eq!(b.served(), 2);

        // A fresh enclave id is allocated and sticks
        let (_, enclave_id) = client
            .call_bound("echo", ENCLAVE_UNKNOWN, &echo_schema(), &[Value::I32(1)])
            .await
            .unwrap();
        assert!(enclave_id > 0);

        drop(a);
        wait_for_backends(&router, 1).await;
        let value = client
            .call("echo", ENCLAVE_UNRELATED, &echo_schema(), &[Value::I32(5)])
            .await
            .unwrap();
        assert_eq!(value, Some(Value::I32(5)));
        // a took the enclave-binding call before it left
        assert_eq!(b.served(), 3);
    }

    #[tokio::test]
    async fn test_no_backend_is_unavailable() {
        let bus = LocalBus::shared();
        let settings = fast_settings();
        let _router = Router::start(bus.clone(), "echo", &settings).unwrap();

        let client = RpcClient::new(bus, &settings);
        let err = client
            .call("echo", ENCLAVE_UNRELATED, &echo_schema(), &[Value::I32(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote { code: ReplyEnvelope::UNAVAILABLE, .. }));
    }
}
