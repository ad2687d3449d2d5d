//! Dispatch Context: decides where a secure function call runs
//!
//! Each call site is evaluated in order:
//! 1. `look_local` with a local TEE → run here
//! 2. server side → run here
//! 3. Normal mode → remote call, enclave id unrelated
//! 4. Migrate mode → run here, on the client host
//! 5. anything else is rejected with [`DispatchError::UnsupportedPolicy`]
//!
//! Compute nodes additionally publish the task handler, which runs enclave
//! calls on behalf of remote clients, and the key exchange service that
//! hands those clients an attested session key.

pub mod mapping;

pub use mapping::EnclaveMapping;

use crate::codec::{Codec, CodecError, FieldType, Value};
use crate::config::{ConfigError, Settings};
use crate::network::{SharedBus, ENCLAVE_UNRELATED};
use crate::rpc::{ReplyEnvelope, RpcClient, RpcError, ServiceError, ServiceRegistry, ServiceSchema, ServiceServer};
use crate::tee::crypto::{PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use crate::tee::key_exchange::{self, HandshakeInit, HandshakeResponse, KeyExchange, Session, SessionKey};
use crate::tee::{
    probe_local_tee, EcallStatus, EnclaveHandle, EnclaveHost, EnclaveRuntime, HostPolicy,
    RemoteEcall, Report, TeeError,
};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Service running enclave calls for remote clients
pub const TASK_HANDLER: &str = "dtee.task_handler";
/// Service handing out attested session keys
pub const KEY_EXCHANGE: &str = "dtee.key_exchange";
/// Image the key exchange runs in
pub const KEY_EXCHANGE_ENCLAVE: &str = "enclave";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Normal,
    /// Server hosting enclaves for remote clients
    ComputeNode,
    /// Enclave code runs on the client host
    Migrate,
    /// Local enclave when present, forwarded otherwise
    Transparent,
}

/// Call-site configuration of one context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DteeConfig {
    pub side: Side,
    pub mode: Mode,
    pub name: String,
    pub version: String,
}

impl DteeConfig {
    pub fn new(side: Side, mode: Mode) -> Self {
        Self {
            side,
            mode,
            name: "dtee".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No dispatch rule for a {side:?} in {mode:?} mode")]
    UnsupportedPolicy { side: Side, mode: Mode },

    #[error("Service '{name}' failed with code {code}: {message}")]
    Service { name: String, code: u16, message: String },

    #[error("Malformed reply from '{0}'")]
    MalformedReply(String),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("TEE error: {0}")]
    Tee(#[from] TeeError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Where a call runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    Remote,
}

/// Apply the dispatch rules to one call site
pub fn decide(side: Side, mode: Mode, look_local: bool, local_tee: bool) -> Result<Route, DispatchError> {
    if look_local && local_tee {
        return Ok(Route::Local);
    }
    if side == Side::Server {
        return Ok(Route::Local);
    }
    match mode {
        Mode::Normal => Ok(Route::Remote),
        Mode::Migrate => Ok(Route::Local),
        mode => Err(DispatchError::UnsupportedPolicy { side, mode }),
    }
}

/// `(enclave_name, function_id, in_buf, out_buf, sealed_session) -> (res, out_buf)`
pub fn task_handler_schema() -> ServiceSchema {
    ServiceSchema::new(
        vec![
            FieldType::Str,
            FieldType::U32,
            FieldType::Bytes,
            FieldType::Bytes,
            FieldType::Bytes,
        ],
        Some(FieldType::Tuple(vec![FieldType::I32, FieldType::Bytes])),
    )
}

/// `(client_pub_key) -> (server_pub_key, pub_key_signature, report, sealed_shared_key)`
pub fn key_exchange_schema() -> ServiceSchema {
    ServiceSchema::new(
        vec![FieldType::Bytes],
        Some(FieldType::Tuple(vec![
            FieldType::Bytes,
            FieldType::Bytes,
            FieldType::Bytes,
            FieldType::Bytes,
        ])),
    )
}

fn fixed<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
    bytes.try_into().ok()
}

fn response_to_value(response: &HandshakeResponse) -> Value {
    Value::Tuple(vec![
        Value::Bytes(response.pub_key.to_vec()),
        Value::Bytes(response.signature.to_vec()),
        Value::Bytes(response.report.to_bytes()),
        Value::Bytes(response.sealed_shared_key.clone()),
    ])
}

fn response_from_value(value: Value) -> Option<HandshakeResponse> {
    let mut parts = value.into_tuple()?.into_iter().map(Value::into_bytes);
    let pub_key = fixed::<PUBLIC_KEY_SIZE>(&parts.next()??)?;
    let signature = fixed::<SIGNATURE_SIZE>(&parts.next()??)?;
    let report = Report::from_bytes(&parts.next()??).ok()?;
    let sealed_shared_key = parts.next()??;
    Some(HandshakeResponse {
        pub_key,
        signature,
        report,
        sealed_shared_key,
    })
}

fn task_result(res: i32, out_buf: Vec<u8>) -> Option<Value> {
    Some(Value::Tuple(vec![Value::I32(res), Value::Bytes(out_buf)]))
}

fn unpack_task_result(value: Value) -> Option<(i32, Vec<u8>)> {
    let mut parts = value.into_tuple()?.into_iter();
    let res = parts.next()?.as_i32()?;
    let out = parts.next()?.into_bytes()?;
    Some((res, out))
}

type SessionSlot = Arc<RwLock<Option<Session>>>;

/// Ships ecalls to a compute node through the task handler
struct TaskForwarder {
    rpc: Arc<RpcClient>,
    session: SessionSlot,
}

impl RemoteEcall for TaskForwarder {
    fn forward<'a>(
        &'a self,
        enclave_name: &'a str,
        function_id: u32,
        input: &'a [u8],
        output: Vec<u8>,
    ) -> BoxFuture<'a, Result<(i32, Vec<u8>), TeeError>> {
        Box::pin(async move {
            let session = self.session.read().unwrap_or_else(|p| p.into_inner()).clone();
            let (in_buf, out_buf, sealed) = match &session {
                Some(s) => (
                    s.key.encrypt(input)?,
                    s.key.encrypt(&output)?,
                    s.sealed_shared_key.clone(),
                ),
                None => (input.to_vec(), output, Vec::new()),
            };

            let args = [
                Value::Str(enclave_name.to_string()),
                Value::U32(function_id),
                Value::Bytes(in_buf),
                Value::Bytes(out_buf),
                Value::Bytes(sealed),
            ];
            let reply = self
                .rpc
                .call(TASK_HANDLER, ENCLAVE_UNRELATED, &task_handler_schema(), &args)
                .await
                .map_err(|e| TeeError::RemoteError(e.to_string()))?;
            let (res, out) = reply
                .and_then(unpack_task_result)
                .ok_or_else(|| TeeError::RemoteError("malformed task handler reply".into()))?;

            match &session {
                Some(s) => Ok((res, s.key.decrypt(&out)?)),
                None => Ok((res, out)),
            }
        })
    }
}

/// Run one forwarded enclave call on this compute node
fn run_task(host: &EnclaveHost, mapping: &EnclaveMapping, args: &[Value]) -> Result<Option<Value>, ServiceError> {
    let bad = |what: &str| ServiceError::Failed(format!("task handler argument {} has the wrong type", what));
    let name = args[0].as_str().ok_or_else(|| bad("enclave_name"))?;
    let function_id = args[1].as_u32().ok_or_else(|| bad("function_id"))?;
    let in_buf = args[2].as_bytes().ok_or_else(|| bad("in_buf"))?;
    let out_buf = args[3].as_bytes().ok_or_else(|| bad("out_buf"))?;
    let sealed = args[4].as_bytes().ok_or_else(|| bad("sealed_session"))?;
    let refused = || task_result(EcallStatus::Failure.code(), out_buf.to_vec());

    if !mapping.contains(name) {
        warn!("Enclave '{}' is not in the mapping, refusing call", name);
        return Ok(refused());
    }

    let key = if sealed.is_empty() {
        None
    } else {
        let unsealed = host
            .runtime()
            .ok_or_else(|| TeeError::BackendUnavailable("no enclave runtime".into()))
            .and_then(|runtime| runtime.unseal_shared_key(sealed));
        match unsealed {
            Ok(shared) => Some(SessionKey::from_shared(&shared)),
            Err(e) => {
                warn!("Cannot recover session key for '{}': {}", name, e);
                return Ok(refused());
            }
        }
    };
    let (input, mut output) = match &key {
        Some(key) => match (key.decrypt(in_buf), key.decrypt(out_buf)) {
            (Ok(input), Ok(output)) => (input, output),
            _ => {
                warn!("Buffers for '{}' do not decrypt under the session key", name);
                return Ok(refused());
            }
        },
        None => (in_buf.to_vec(), out_buf.to_vec()),
    };

    let runtime = tokio::runtime::Handle::try_current().map_err(|e| ServiceError::Failed(e.to_string()))?;
    let status = runtime.block_on(async {
        let enclave = host.create_enclave(name, true)?;
        let status = host.ecall(&enclave, function_id, &input, &mut output, &[]).await;
        host.destroy_enclave(&enclave).await?;
        Ok::<_, TeeError>(status)
    });
    let res = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("Task on '{}' failed: {}", name, e);
            EcallStatus::Failure.code()
        }
    };
    debug!("Task {}#{} finished with {}", name, function_id, res);

    let out = match &key {
        Some(key) => key
            .encrypt(&output)
            .map_err(|e| ServiceError::Failed(e.to_string()))?,
        None => output,
    };
    Ok(task_result(res, out))
}

fn run_key_exchange(host: &EnclaveHost, args: &[Value]) -> Result<Option<Value>, ServiceError> {
    let pub_key = args[0]
        .as_bytes()
        .and_then(fixed::<PUBLIC_KEY_SIZE>)
        .ok_or_else(|| ServiceError::Failed("client key must be 64 bytes".into()))?;
    let runtime = tokio::runtime::Handle::try_current().map_err(|e| ServiceError::Failed(e.to_string()))?;
    let response = runtime
        .block_on(key_exchange::respond(host, KEY_EXCHANGE_ENCLAVE, &HandshakeInit { pub_key }))
        .map_err(|e| ServiceError::Failed(e.to_string()))?;
    Ok(Some(response_to_value(&response)))
}

/// Per-process state for secure function calls
pub struct DteeContext {
    config: DteeConfig,
    settings: Settings,
    bus: SharedBus,
    registry: Arc<ServiceRegistry>,
    rpc: Arc<RpcClient>,
    host: Arc<EnclaveHost>,
    local_tee: bool,
    session: SessionSlot,
    servers: tokio::sync::Mutex<Vec<ServiceServer>>,
}

impl DteeContext {
    pub fn new(
        config: DteeConfig,
        settings: Settings,
        bus: SharedBus,
        runtime: Option<Arc<dyn EnclaveRuntime>>,
    ) -> Self {
        let local_tee = settings
            .tee
            .local_tee
            .unwrap_or_else(|| probe_local_tee(&settings.tee.tee_module));
        let policy = match config.mode {
            Mode::Migrate => HostPolicy::Forward,
            Mode::Transparent if !local_tee => HostPolicy::Forward,
            _ => HostPolicy::Local,
        };

        let rpc = Arc::new(RpcClient::new(bus.clone(), &settings.transport));
        let session: SessionSlot = Arc::new(RwLock::new(None));
        let forwarder: Arc<dyn RemoteEcall> = Arc::new(TaskForwarder {
            rpc: rpc.clone(),
            session: session.clone(),
        });
        let host = Arc::new(EnclaveHost::new(
            policy,
            runtime,
            Some(forwarder),
            settings.tee.enclave_dir.clone(),
        ));

        info!(
            "Context {:?}/{:?}: local TEE {}, enclaves {:?}",
            config.side,
            config.mode,
            if local_tee { "present" } else { "absent" },
            policy
        );
        Self {
            registry: Arc::new(ServiceRegistry::new(settings.transport.byte_order)),
            config,
            settings,
            bus,
            rpc,
            host,
            local_tee,
            session,
            servers: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &DteeConfig {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    pub fn host(&self) -> &Arc<EnclaveHost> {
        &self.host
    }

    pub fn exist_local_tee(&self) -> bool {
        self.local_tee
    }

    /// Register a secure function; publish all of them with [`DteeContext::serve`]
    pub fn publish_secure_function<F>(&self, name: &str, schema: ServiceSchema, handler: F)
    where
        F: Fn(&[Value]) -> Result<Option<Value>, ServiceError> + Send + Sync + 'static,
    {
        self.registry.register(name, schema, handler);
    }

    /// Publish every registered function on the bus; returns how many
    pub async fn serve(&self) -> Result<usize, DispatchError> {
        if self.config.mode == Mode::ComputeNode {
            let mapping = EnclaveMapping::load(&self.settings.tee.mapping_path())?;
            let host = self.host.clone();
            self.registry
                .register(TASK_HANDLER, task_handler_schema(), move |args| run_task(&host, &mapping, args));
            let host = self.host.clone();
            self.registry
                .register(KEY_EXCHANGE, key_exchange_schema(), move |args| run_key_exchange(&host, args));
        }

        let mut servers = self.servers.lock().await;
        let mut published = 0;
        for name in self.registry.names() {
            if servers.iter().any(|s| s.name() == name) {
                continue;
            }
            let server = ServiceServer::publish_service(
                self.bus.clone(),
                &name,
                self.registry.clone(),
                &self.settings.transport,
            )
            .await?;
            servers.push(server);
            published += 1;
        }
        info!("Serving {} secure functions", servers.len());
        Ok(published)
    }

    /// Requests served per published function
    pub async fn served(&self) -> Vec<(String, u64)> {
        self.servers
            .lock()
            .await
            .iter()
            .map(|s| (s.name().to_string(), s.served()))
            .collect()
    }

    /// Call a secure function wherever the dispatch rules send it
    pub async fn call_secure_function(
        &self,
        name: &str,
        schema: &ServiceSchema,
        args: &[Value],
        look_local: bool,
    ) -> Result<Option<Value>, DispatchError> {
        let route = decide(self.config.side, self.config.mode, look_local, self.local_tee)
            .inspect_err(|e| warn!("Cannot dispatch '{}': {}", name, e))?;
        match route {
            Route::Local => self.call_local(name, schema, args).await,
            Route::Remote => Ok(self.rpc.call(name, ENCLAVE_UNRELATED, schema, args).await?),
        }
    }

    async fn call_local(&self, name: &str, schema: &ServiceSchema, args: &[Value]) -> Result<Option<Value>, DispatchError> {
        let order = self.registry.order();
        let mut codec = Codec::with_order(order);
        schema.args.encode(args, &mut codec)?;

        let registry = self.registry.clone();
        let service = name.to_string();
        let raw = codec.into_bytes();
        let envelope = tokio::task::spawn_blocking(move || registry.dispatch(&service, &raw))
            .await
            .map_err(|e| DispatchError::Service {
                name: name.to_string(),
                code: ReplyEnvelope::HANDLER_FAILED,
                message: e.to_string(),
            })?;

        if !envelope.is_ok() {
            return Err(DispatchError::Service {
                name: name.to_string(),
                code: envelope.code,
                message: envelope.message,
            });
        }
        Ok(envelope.decode_value(schema.returns.as_ref(), order)?)
    }

    /// Agree on a session key with a compute node's attested enclave
    pub async fn establish_session(&self) -> Result<(), DispatchError> {
        let exchange = KeyExchange::new();
        let args = [Value::Bytes(exchange.init().pub_key.to_vec())];
        let reply = self
            .rpc
            .call(KEY_EXCHANGE, ENCLAVE_UNRELATED, &key_exchange_schema(), &args)
            .await?;
        let response = reply
            .and_then(response_from_value)
            .ok_or_else(|| DispatchError::MalformedReply(KEY_EXCHANGE.to_string()))?;

        let session = exchange.complete(&response, &self.host.image_path(KEY_EXCHANGE_ENCLAVE))?;
        *self.session.write().unwrap_or_else(|p| p.into_inner()) = Some(session);
        Ok(())
    }

    pub fn has_session(&self) -> bool {
        self.session
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    pub fn create_enclave(&self, name_or_path: &str, is_proxy: bool) -> Result<Arc<EnclaveHandle>, TeeError> {
        self.host.create_enclave(name_or_path, is_proxy)
    }

    pub async fn ecall(&self, enclave: &EnclaveHandle, function_id: u32, input: &[u8], output: &mut [u8]) -> EcallStatus {
        self.host.ecall(enclave, function_id, input, output, &[]).await
    }

    pub async fn destroy_enclave(&self, enclave: &EnclaveHandle) -> Result<(), TeeError> {
        self.host.destroy_enclave(enclave).await
    }

    pub async fn get_report(&self, name_or_path: &str) -> Result<Report, TeeError> {
        self.host.get_report(name_or_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LocalBus;
    use crate::tee::{image, EcallPath, SimulatedRuntime};
    use std::path::Path;

    fn settings(local_tee: bool, enclave_dir: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.transport.retry_count = 20;
        settings.transport.retry_interval_ms = 10;
        settings.transport.detect_timeout_ms = 20;
        settings.tee.local_tee = Some(local_tee);
        settings.tee.enclave_dir = enclave_dir.to_path_buf();
        settings
    }

    fn echo_schema() -> ServiceSchema {
        ServiceSchema::new(vec![FieldType::I32], Some(FieldType::I32))
    }

    fn echo(args: &[Value]) -> Result<Option<Value>, ServiceError> {
        Ok(Some(args[0].clone()))
    }

    #[test]
    fn test_decision_table() {
        use Mode::*;
        use Side::*;
        assert_eq!(decide(Client, Normal, true, true).unwrap(), Route::Local);
        assert_eq!(decide(Client, Normal, true, false).unwrap(), Route::Remote);
        assert_eq!(decide(Client, Normal, false, true).unwrap(), Route::Remote);
        assert_eq!(decide(Server, Transparent, false, false).unwrap(), Route::Local);
        assert_eq!(decide(Client, Migrate, false, false).unwrap(), Route::Local);
        assert!(matches!(
            decide(Client, ComputeNode, false, true),
            Err(DispatchError::UnsupportedPolicy { side: Client, mode: ComputeNode })
        ));
        assert!(decide(Client, Transparent, false, false).is_err());
    }

    #[tokio::test]
    async fn test_echo_goes_through_transport() {
        let dir = tempfile::tempdir().unwrap();
        let bus = LocalBus::shared();
        let server = DteeContext::new(
            DteeConfig::new(Side::Server, Mode::Normal),
            settings(false, dir.path()),
            bus.clone(),
            None,
        );
        server.publish_secure_function("echo", echo_schema(), echo);
        assert_eq!(server.serve().await.unwrap(), 1);

        let client = DteeContext::new(
            DteeConfig::new(Side::Client, Mode::Normal),
            settings(false, dir.path()),
            bus,
            None,
        );
        let value = client
            .call_secure_function("echo", &echo_schema(), &[Value::I32(42)], false)
            .await
            .unwrap();
        assert_eq!(value, Some(Value::I32(42)));
        assert_eq!(client.rpc().call_count("echo").await, 1);
        assert_eq!(server.served().await, vec![("echo".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_look_local_never_touches_transport() {
        let dir = tempfile::tempdir().unwrap();
        let client = DteeContext::new(
            DteeConfig::new(Side::Client, Mode::Normal),
            settings(true, dir.path()),
            LocalBus::shared(),
            None,
        );
        client.publish_secure_function("echo", echo_schema(), echo);

        let value = client
            .call_secure_function("echo", &echo_schema(), &[Value::I32(42)], true)
            .await
            .unwrap();
        assert_eq!(value, Some(Value::I32(42)));
        assert_eq!(client.rpc().call_count("echo").await, 0);
    }

    #[tokio::test]
    async fn test_unsupported_policy_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = DteeContext::new(
            DteeConfig::new(Side::Client, Mode::Transparent),
            settings(false, dir.path()),
            LocalBus::shared(),
            None,
        );
        let err = client
            .call_secure_function("echo", &echo_schema(), &[Value::I32(1)], false)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnsupportedPolicy { .. }));
    }

    #[tokio::test]
    async fn test_local_unknown_function() {
        let dir = tempfile::tempdir().unwrap();
        let server = DteeContext::new(
            DteeConfig::new(Side::Server, Mode::Normal),
            settings(false, dir.path()),
            LocalBus::shared(),
            None,
        );
        let err = server
            .call_secure_function("missing", &echo_schema(), &[Value::I32(1)], false)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Service { code: ReplyEnvelope::NOT_FOUND, .. }));
    }

    fn compute_node(dir: &Path, bus: SharedBus) -> (DteeContext, Arc<SimulatedRuntime>) {
        image::write_image(dir, KEY_EXCHANGE_ENCLAVE, &[1u8; 32]).unwrap();
        image::write_image(dir, "upper", &[2u8; 32]).unwrap();
        std::fs::write(dir.join("mapping"), "upper 1\n").unwrap();

        let runtime = Arc::new(SimulatedRuntime::new());
        runtime.register(1, |input, output, _| {
            if output.len() != input.len() {
                return EcallStatus::BadParameters;
            }
            for (o, i) in output.iter_mut().zip(input) {
                *o = i.to_ascii_uppercase();
            }
            EcallStatus::Success
        });
        let shared: Arc<dyn EnclaveRuntime> = runtime.clone();
        let node = DteeContext::new(
            DteeConfig::new(Side::Server, Mode::ComputeNode),
            settings(true, dir),
            bus,
            Some(shared),
        );
        (node, runtime)
    }

    #[tokio::test]
    async fn test_transparent_call_forwarded_with_session() {
        let dir = tempfile::tempdir().unwrap();
        let bus = LocalBus::shared();
        let (node, runtime) = compute_node(dir.path(), bus.clone());
        assert_eq!(node.serve().await.unwrap(), 2);

        let client = DteeContext::new(
            DteeConfig::new(Side::Client, Mode::Transparent),
            settings(false, dir.path()),
            bus,
            None,
        );
        client.establish_session().await.unwrap();
        assert!(client.has_session());

        let enclave = client.create_enclave("upper", false).unwrap();
        assert_eq!(enclave.path, EcallPath::RemoteForward);
        let mut out = [0u8; 5];
        let status = client.ecall(&enclave, 1, b"hello", &mut out).await;
        assert_eq!(status, EcallStatus::Success);
        assert_eq!(&out, b"HELLO");
        assert_eq!(runtime.call_count(), 1);
        assert_eq!(runtime.intercepted_count(), 0);
        assert_eq!(runtime.live_enclaves(), 0);
        client.destroy_enclave(&enclave).await.unwrap();
    }

    #[tokio::test]
    async fn test_unmapped_enclave_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let bus = LocalBus::shared();
        let (node, runtime) = compute_node(dir.path(), bus.clone());
        node.serve().await.unwrap();

        let client = DteeContext::new(
            DteeConfig::new(Side::Client, Mode::Migrate),
            settings(false, dir.path()),
            bus,
            None,
        );
        let enclave = client.create_enclave("ghost", false).unwrap();
        let mut out = [7u8; 3];
        assert_eq!(client.ecall(&enclave, 1, b"abc", &mut out).await, EcallStatus::Failure);
        assert_eq!(out, [7u8; 3]);
        assert_eq!(runtime.call_count(), 0);
    }

    #[tokio::test]
    async fn test_local_report() {
        let dir = tempfile::tempdir().unwrap();
        let (node, runtime) = compute_node(dir.path(), LocalBus::shared());
        let report = node.get_report("upper").await.unwrap();
        assert_eq!(report.sm.pub_key, runtime.sm_public_key());
        assert!(node.exist_local_tee());
    }
}
