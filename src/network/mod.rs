//! Network module: publish/subscribe transport for secure function calls
//!
//! The RPC layer talks to a [`PubSub`] collaborator. [`LocalBus`] connects
//! endpoints inside one process; [`GossipBus`] extends it across hosts over
//! libp2p gossipsub with mDNS discovery.

pub mod bus;
pub mod message;
pub mod swarm;

pub use bus::{close_quietly, BusError, BusEvent, Endpoint, EndpointHandle, LocalBus, PubSub, Role, SharedBus};
pub use message::{
    Assembled, Guid, MessageKind, Operation, OperationResult, Reassembly, ServiceTopics,
    ENCLAVE_UNKNOWN, ENCLAVE_UNRELATED, MAX_TRANSFER_SIZE,
};
pub use swarm::GossipBus;
