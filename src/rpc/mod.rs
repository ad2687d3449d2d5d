//! RPC: named secure functions over the pub/sub transport
//!
//! - **Registry**: name → handler table and reply envelopes
//! - **Client**: per-service transport bindings and typed calls
//! - **Server**: serves a registry, registering with a router when present

pub mod client;
pub mod registry;
pub mod server;

pub use client::{LinkState, RpcClient, RpcError, TransportClient};
pub use registry::{encode_request, ReplyEnvelope, ServiceError, ServiceRegistry, ServiceSchema};
pub use server::ServiceServer;
