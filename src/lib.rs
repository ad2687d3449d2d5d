//! DTEE: Distributed Trusted Execution Environment
//!
//! Secure functions are published by name and called across hosts over a
//! topic-based pub/sub transport. Each call site decides whether a call
//! runs in a local enclave or is shipped to a remote host.

pub mod codec;
pub mod config;
pub mod context;
pub mod network;
pub mod router;
pub mod rpc;
pub mod tee;

pub use codec::{ByteOrder, Codec, CodecError, FieldType, Schema, Value};
pub use config::{ConfigError, Settings};
pub use context::{decide, DispatchError, DteeConfig, DteeContext, EnclaveMapping, Mode, Route, Side};
pub use network::{GossipBus, LocalBus, PubSub, SharedBus};
pub use router::Router;
pub use rpc::{RpcClient, RpcError, ServiceRegistry, ServiceSchema, ServiceServer};
pub use tee::{EcallStatus, EnclaveHost, EnclaveRuntime, Report, SimulatedRuntime, TeeError};
