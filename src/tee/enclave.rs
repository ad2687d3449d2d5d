//! TEE Enclave: runtime seam and ecall strategies
//!
//! Provides a unified interface for enclave calls:
//! - [`EnclaveRuntime`]: the platform SDK (create / destroy / ecall / key attestation)
//! - [`SimulatedRuntime`]: software enclave (always available, for dev/test)
//! - [`EnclaveHost`]: picks how calls reach an enclave, once, when configured
//!
//! Every path shares one ecall boundary:
//! `(enclave, path, function_id, input, output, extra_state, ocall_table) -> EcallStatus`.

use super::attestation::Report;
use super::crypto::{self, PlatformSigner, RawPublicKey, RawSignature};
use super::image;
use super::sealing::{self, SealingKey};
use futures::future::BoxFuture;
use log::{error, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Runtime-assigned enclave identifier
pub type EnclaveId = u64;

/// Untrusted function an enclave may call out to
pub type OcallFn = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Trusted function body registered with the simulated runtime
pub type EnclaveFn = Arc<dyn Fn(&[u8], &mut [u8], &[OcallFn]) -> EcallStatus + Send + Sync>;

/// Bytes appended to the input of an intercepted call
pub const INTERCEPT_INPUT_PAD: usize = 4;
/// Flag byte appended to the output of an intercepted call
pub const INTERCEPT_OUTPUT_FLAG: u8 = 1;

/// Result of one ecall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcallStatus {
    Success,
    Failure,
    BadParameters,
    Busy,
    Unsupported,
}

impl EcallStatus {
    pub fn code(self) -> i32 {
        match self {
            EcallStatus::Success => 0,
            EcallStatus::Failure => -1,
            EcallStatus::BadParameters => -2,
            EcallStatus::Busy => -3,
            EcallStatus::Unsupported => -4,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => EcallStatus::Success,
            -2 => EcallStatus::BadParameters,
            -3 => EcallStatus::Busy,
            -4 => EcallStatus::Unsupported,
            _ => EcallStatus::Failure,
        }
    }

    pub fn is_success(self) -> bool {
        self == EcallStatus::Success
    }
}

/// TEE-related errors
#[derive(Debug, thiserror::Error)]
pub enum TeeError {
    #[error("TEE backend not available: {0}")]
    BackendUnavailable(String),

    #[error("Unknown enclave: {0}")]
    UnknownEnclave(EnclaveId),

    #[error("Enclave is busy")]
    Busy,

    #[error("Bad parameters: {0}")]
    BadParameters(String),

    #[error("Sealing error: {0}")]
    SealingError(String),

    #[error("Integrity verification failed: {0}")]
    IntegrityError(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Invalid enclave image: {0}")]
    ImageError(String),

    #[error("Attestation failed: {0}")]
    Attestation(#[from] super::attestation::AttestationFailure),

    #[error("Remote enclave call failed: {0}")]
    RemoteError(String),

    #[error("Enclave error: {0}")]
    EnclaveError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A freshly created enclave
#[derive(Debug, Clone)]
pub struct CreatedEnclave {
    pub eid: EnclaveId,
    pub report: Report,
}

/// Key material an enclave hands out during key exchange
#[derive(Debug, Clone)]
pub struct KeyAttestation {
    /// Enclave-side ECDH public key
    pub pub_key: RawPublicKey,
    /// Secure monitor signature over `pub_key`
    pub signature: RawSignature,
    /// Agreed secret sealed so only this platform can recover it
    pub sealed_shared_key: Vec<u8>,
}

/// The TEE platform SDK
pub trait EnclaveRuntime: Send + Sync {
    fn create(&self, image: &Path) -> Result<CreatedEnclave, TeeError>;

    fn destroy(&self, eid: EnclaveId) -> Result<(), TeeError>;

    /// `path` tells the runtime whether the buffers carry intercept padding
    #[allow(clippy::too_many_arguments)]
    fn ecall(
        &self,
        eid: EnclaveId,
        path: EcallPath,
        function_id: u32,
        input: &[u8],
        output: &mut [u8],
        extra_state: &mut u32,
        ocalls: &[OcallFn],
    ) -> EcallStatus;

    /// Run key agreement inside the enclave against a peer public key
    fn attest_key(&self, eid: EnclaveId, peer_pub_key: &RawPublicKey) -> Result<KeyAttestation, TeeError>;

    /// Recover a secret sealed by [`EnclaveRuntime::attest_key`]
    fn unseal_shared_key(&self, sealed: &[u8]) -> Result<[u8; 32], TeeError>;
}

struct SimEnclave {
    image: PathBuf,
}

/// Software enclave platform
///
/// Functions are registered per function id and shared by every enclave the
/// runtime creates. An [`EcallPath::Intercepted`] call is a plaintext local
/// call: the padding is stripped before the function runs.
pub struct SimulatedRuntime {
    sm: PlatformSigner,
    device: PlatformSigner,
    sealing_key: SealingKey,
    functions: RwLock<HashMap<u32, EnclaveFn>>,
    enclaves: Mutex<HashMap<EnclaveId, SimEnclave>>,
    next_eid: AtomicU64,
    calls: AtomicU64,
    intercepted: AtomicU64,
}

impl Default for SimulatedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self::with_signer(PlatformSigner::generate())
    }

    /// Runtime whose secure monitor signs with a fixed key
    pub fn with_signer(sm: PlatformSigner) -> Self {
        Self {
            sealing_key: SealingKey::from_shared(&sm.to_bytes()),
            sm,
            device: PlatformSigner::generate(),
            functions: RwLock::new(HashMap::new()),
            enclaves: Mutex::new(HashMap::new()),
            next_eid: AtomicU64::new(1),
            calls: AtomicU64::new(0),
            intercepted: AtomicU64::new(0),
        }
    }

    /// Register a trusted function under `function_id`
    pub fn register<F>(&self, function_id: u32, f: F)
    where
        F: Fn(&[u8], &mut [u8], &[OcallFn]) -> EcallStatus + Send + Sync + 'static,
    {
        let mut functions = self.functions.write().unwrap_or_else(|p| p.into_inner());
        if functions.insert(function_id, Arc::new(f)).is_some() {
            warn!("Enclave function {} registered twice, replacing", function_id);
        }
    }

    pub fn sm_public_key(&self) -> RawPublicKey {
        self.sm.public_key()
    }

    /// Total ecalls served
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Ecalls that arrived through the intercepted path
    pub fn intercepted_count(&self) -> u64 {
        self.intercepted.load(Ordering::Relaxed)
    }

    pub fn live_enclaves(&self) -> usize {
        self.enclaves.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn function(&self, function_id: u32) -> Option<EnclaveFn> {
        self.functions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&function_id)
            .cloned()
    }
}

impl EnclaveRuntime for SimulatedRuntime {
    fn create(&self, image_path: &Path) -> Result<CreatedEnclave, TeeError> {
        let measurement = image::read_measurement(image_path)?;
        let nonce: u64 = rand::random();
        let report = Report::issue(&self.sm, &self.device, &measurement, nonce);
        let eid = self.next_eid.fetch_add(1, Ordering::Relaxed);

        self.enclaves
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(eid, SimEnclave { image: image_path.to_path_buf() });
        info!(
            "Simulated enclave {} created from {} (measurement {})",
            eid,
            image_path.display(),
            &hex::encode(measurement)[..16]
        );
        Ok(CreatedEnclave { eid, report })
    }

    fn destroy(&self, eid: EnclaveId) -> Result<(), TeeError> {
        let removed = self
            .enclaves
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&eid);
        match removed {
            Some(enclave) => {
                info!("Simulated enclave {} ({}) destroyed", eid, enclave.image.display());
                Ok(())
            }
            None => Err(TeeError::UnknownEnclave(eid)),
        }
    }

    fn ecall(
        &self,
        eid: EnclaveId,
        path: EcallPath,
        function_id: u32,
        input: &[u8],
        output: &mut [u8],
        _extra_state: &mut u32,
        ocalls: &[OcallFn],
    ) -> EcallStatus {
        if !self
            .enclaves
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&eid)
        {
            return EcallStatus::BadParameters;
        }
        let Some(function) = self.function(function_id) else {
            return EcallStatus::Unsupported;
        };

        match path {
            EcallPath::Local => {
                self.calls.fetch_add(1, Ordering::Relaxed);
                function(input, output, ocalls)
            }
            EcallPath::Intercepted => {
                if input.len() < INTERCEPT_INPUT_PAD || output.last() != Some(&INTERCEPT_OUTPUT_FLAG) {
                    return EcallStatus::BadParameters;
                }
                self.calls.fetch_add(1, Ordering::Relaxed);
                self.intercepted.fetch_add(1, Ordering::Relaxed);
                let input = &input[..input.len() - INTERCEPT_INPUT_PAD];
                let out_len = output.len() - 1;
                function(input, &mut output[..out_len], ocalls)
            }
            EcallPath::RemoteForward => EcallStatus::Unsupported,
        }
    }

    fn attest_key(&self, eid: EnclaveId, peer_pub_key: &RawPublicKey) -> Result<KeyAttestation, TeeError> {
        if !self
            .enclaves
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&eid)
        {
            return Err(TeeError::UnknownEnclave(eid));
        }
        let pair = crypto::make_key_pair();
        let shared = crypto::make_shared_key(pair.private_key(), peer_pub_key)?;
        let sealed = sealing::seal(&self.sealing_key, &shared)?;
        Ok(KeyAttestation {
            pub_key: *pair.public_key(),
            signature: self.sm.sign(pair.public_key()),
            sealed_shared_key: sealed.to_bytes(),
        })
    }

    fn unseal_shared_key(&self, sealed: &[u8]) -> Result<[u8; 32], TeeError> {
        let blob = sealing::SealedBlob::from_bytes(sealed)?;
        let plain = sealing::unseal(&self.sealing_key, &blob)?;
        <[u8; 32]>::try_from(plain.as_slice())
            .map_err(|_| TeeError::SealingError("sealed key has wrong length".into()))
    }
}

/// How calls on one enclave handle are carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcallPath {
    /// Direct runtime call with the caller's buffers (proxy for a remote client)
    Local,
    /// Runtime call with padded buffers marking a plaintext local call
    Intercepted,
    /// No local enclave; the call is shipped to a compute node
    RemoteForward,
}

/// Carries ecalls to an enclave hosted elsewhere
pub trait RemoteEcall: Send + Sync {
    /// Returns the remote status code and the output buffer
    fn forward<'a>(
        &'a self,
        enclave_name: &'a str,
        function_id: u32,
        input: &'a [u8],
        output: Vec<u8>,
    ) -> BoxFuture<'a, Result<(i32, Vec<u8>), TeeError>>;
}

#[derive(Debug)]
enum Backing {
    Runtime { eid: EnclaveId, report: Report },
    Remote,
}

/// A created enclave and the path its calls take
#[derive(Debug)]
pub struct EnclaveHandle {
    pub name: String,
    pub image: PathBuf,
    pub path: EcallPath,
    backing: Backing,
    /// Held shared by calls and exclusively by destroy; false once destroyed
    alive: tokio::sync::RwLock<bool>,
}

impl EnclaveHandle {
    pub fn eid(&self) -> Option<EnclaveId> {
        match self.backing {
            Backing::Runtime { eid, .. } => Some(eid),
            Backing::Remote => None,
        }
    }

    pub fn report(&self) -> Option<&Report> {
        match &self.backing {
            Backing::Runtime { report, .. } => Some(report),
            Backing::Remote => None,
        }
    }
}

/// Whether calls should be forwarded instead of run on a local enclave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPolicy {
    /// Enclaves are created on this host
    Local,
    /// Enclaves live on a compute node
    Forward,
}

/// Creates enclaves and routes ecalls along the configured path
pub struct EnclaveHost {
    runtime: Option<Arc<dyn EnclaveRuntime>>,
    forwarder: Option<Arc<dyn RemoteEcall>>,
    policy: HostPolicy,
    enclave_dir: PathBuf,
}

impl EnclaveHost {
    pub fn new(
        policy: HostPolicy,
        runtime: Option<Arc<dyn EnclaveRuntime>>,
        forwarder: Option<Arc<dyn RemoteEcall>>,
        enclave_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime,
            forwarder,
            policy,
            enclave_dir: enclave_dir.into(),
        }
    }

    pub fn policy(&self) -> HostPolicy {
        self.policy
    }

    pub fn runtime(&self) -> Option<&Arc<dyn EnclaveRuntime>> {
        self.runtime.as_ref()
    }

    pub fn image_path(&self, name_or_path: &str) -> PathBuf {
        image::image_path(&self.enclave_dir, name_or_path)
    }

    fn require_runtime(&self) -> Result<&Arc<dyn EnclaveRuntime>, TeeError> {
        self.runtime
            .as_ref()
            .ok_or_else(|| TeeError::BackendUnavailable("no enclave runtime configured".into()))
    }

    /// Create an enclave, or a forwarding handle when enclaves live remotely
    pub fn create_enclave(&self, name_or_path: &str, is_proxy: bool) -> Result<Arc<EnclaveHandle>, TeeError> {
        let image = self.image_path(name_or_path);
        let (path, backing) = match self.policy {
            HostPolicy::Forward => (EcallPath::RemoteForward, Backing::Remote),
            HostPolicy::Local => {
                let created = self.require_runtime()?.create(&image)?;
                let path = if is_proxy {
                    EcallPath::Local
                } else {
                    EcallPath::Intercepted
                };
                (
                    path,
                    Backing::Runtime {
                        eid: created.eid,
                        report: created.report,
                    },
                )
            }
        };
        info!("Enclave {} ready via {:?}", name_or_path, path);
        Ok(Arc::new(EnclaveHandle {
            name: name_or_path.to_string(),
            image,
            path,
            backing,
            alive: tokio::sync::RwLock::new(true),
        }))
    }

    /// Destroy a handle; waits for calls in flight
    pub async fn destroy_enclave(&self, handle: &EnclaveHandle) -> Result<(), TeeError> {
        let mut alive = handle.alive.write().await;
        if !*alive {
            return Ok(());
        }
        *alive = false;
        match handle.backing {
            Backing::Remote => Ok(()),
            Backing::Runtime { eid, .. } => self.require_runtime()?.destroy(eid),
        }
    }

    /// Create an enclave only to capture its attestation report
    pub async fn get_report(&self, name_or_path: &str) -> Result<Report, TeeError> {
        if self.policy == HostPolicy::Forward {
            return Err(TeeError::BackendUnavailable("no local enclave to report on".into()));
        }
        let handle = self.create_enclave(name_or_path, true)?;
        let report = handle
            .report()
            .copied()
            .ok_or_else(|| TeeError::EnclaveError("enclave produced no report".into()));
        self.destroy_enclave(&handle).await?;
        report
    }

    /// Run key agreement inside an enclave created from `name_or_path`
    pub async fn attest_key(
        &self,
        name_or_path: &str,
        peer_pub_key: &RawPublicKey,
    ) -> Result<(KeyAttestation, Report), TeeError> {
        let handle = self.create_enclave(name_or_path, true)?;
        let result = match &handle.backing {
            Backing::Runtime { eid, report } => self
                .require_runtime()?
                .attest_key(*eid, peer_pub_key)
                .map(|attestation| (attestation, *report)),
            Backing::Remote => Err(TeeError::BackendUnavailable("key exchange needs a local enclave".into())),
        };
        self.destroy_enclave(&handle).await?;
        result
    }

    /// Call `function_id` in the enclave behind `handle`
    pub async fn ecall(
        &self,
        handle: &EnclaveHandle,
        function_id: u32,
        input: &[u8],
        output: &mut [u8],
        ocalls: &[OcallFn],
    ) -> EcallStatus {
        let Ok(alive) = handle.alive.try_read() else {
            return EcallStatus::Busy;
        };
        if !*alive {
            return EcallStatus::BadParameters;
        }

        match (&handle.backing, handle.path) {
            (Backing::Runtime { eid, .. }, EcallPath::Local) => {
                let Some(runtime) = self.runtime.as_ref() else {
                    return EcallStatus::Unsupported;
                };
                let mut ms = 0u32;
                runtime.ecall(*eid, EcallPath::Local, function_id, input, output, &mut ms, ocalls)
            }
            (Backing::Runtime { eid, .. }, EcallPath::Intercepted) => {
                let Some(runtime) = self.runtime.as_ref() else {
                    return EcallStatus::Unsupported;
                };
                local_tee_ecall(runtime.as_ref(), *eid, function_id, input, output, ocalls)
            }
            (Backing::Remote, EcallPath::RemoteForward) => {
                let Some(forwarder) = self.forwarder.as_ref() else {
                    warn!("No forwarder configured for remote enclave {}", handle.name);
                    return EcallStatus::Unsupported;
                };
                match forwarder
                    .forward(&handle.name, function_id, input, output.to_vec())
                    .await
                {
                    Ok((res, out)) => {
                        if out.len() != output.len() {
                            warn!(
                                "Remote output for {} is {} bytes, expected {}",
                                handle.name,
                                out.len(),
                                output.len()
                            );
                            return EcallStatus::BadParameters;
                        }
                        output.copy_from_slice(&out);
                        EcallStatus::from_code(res)
                    }
                    Err(e) => {
                        error!("Forwarded call to {} failed: {}", handle.name, e);
                        EcallStatus::Failure
                    }
                }
            }
            (backing, path) => {
                error!("Enclave {} has {:?} backing but {:?} path", handle.name, backing, path);
                EcallStatus::Unsupported
            }
        }
    }
}

/// Pad the buffers so the enclave treats the call as plaintext and local
pub fn local_tee_ecall(
    runtime: &dyn EnclaveRuntime,
    eid: EnclaveId,
    function_id: u32,
    input: &[u8],
    output: &mut [u8],
    ocalls: &[OcallFn],
) -> EcallStatus {
    let mut fake_input = Vec::with_capacity(input.len() + INTERCEPT_INPUT_PAD);
    fake_input.extend_from_slice(input);
    fake_input.extend_from_slice(&[0u8; INTERCEPT_INPUT_PAD]);

    let mut fake_output = Vec::with_capacity(output.len() + 1);
    fake_output.extend_from_slice(output);
    fake_output.push(INTERCEPT_OUTPUT_FLAG);

    let mut ms = 0u32;
    let status = runtime.ecall(
        eid,
        EcallPath::Intercepted,
        function_id,
        &fake_input,
        &mut fake_output,
        &mut ms,
        ocalls,
    );
    let len = output.len();
    output.copy_from_slice(&fake_output[..len]);
    status
}

/// Whether a kernel module list (as in `/proc/modules`) names `module`
pub fn modules_contain(modules: &str, module: &str) -> bool {
    modules
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|name| name == module)
}

/// Probe the host for the TEE kernel module
pub fn probe_local_tee(module: &str) -> bool {
    match std::fs::read_to_string("/proc/modules") {
        Ok(modules) => modules_contain(&modules, module),
        Err(_) => false,
    }
}
