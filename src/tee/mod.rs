//! TEE (Trusted Execution Environment): trust layer for secure calls
//!
//! - **Enclave**: runtime seam, simulated runtime and ecall paths
//! - **Attestation**: report layout and verification against the signed image
//! - **Key Exchange**: attested ECDH, session keys and the secure channel
//! - **Sealing**: authenticated containers keyed by an agreed secret

pub mod attestation;
pub mod crypto;
pub mod enclave;
pub mod image;
pub mod key_exchange;
pub mod sealing;

pub use attestation::{
    is_report_valid, update_enclave_hash, verify_report, AttestationFailure, EnclaveReport,
    Report, SmReport, REPORT_SIZE,
};
pub use crypto::{make_key_pair, make_shared_key, KeyPair, PlatformSigner};
pub use enclave::{
    probe_local_tee, CreatedEnclave, EcallPath, EcallStatus, EnclaveHandle, EnclaveHost,
    EnclaveId, EnclaveRuntime, HostPolicy, KeyAttestation, OcallFn, RemoteEcall,
    SimulatedRuntime, TeeError,
};
pub use key_exchange::{
    ChannelRole, ChannelState, HandshakeInit, HandshakeResponse, KeyExchange, SecureChannel, SecureMessage,
    Session, SessionKey,
};
pub use sealing::{seal, unseal, SealedBlob, SealingKey};
