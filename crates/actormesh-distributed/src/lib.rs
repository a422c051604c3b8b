//! actormesh's cluster transport: node identity, the wire codec, TCP
//! connections with reconnect backoff, membership/failure detection, and
//! the remote call/cast/monitor/link/spawn protocols layered on top of it.
//!
//! Everything here is usable standalone; the top-level `actormesh` crate's
//! `Cluster` wires it together with `actormesh-process` and
//! `actormesh-supervisor`.

pub mod codec;
pub mod connection;
pub mod error;
pub mod membership;
pub mod node;
pub mod remote_call;
pub mod remote_link;
pub mod spawn;
pub mod transport;
pub mod value;

pub use codec::Envelope;
pub use error::{ClusterError, RemoteSpawnErrorKind};
pub use membership::{Membership, MembershipConfig, MembershipEntry, MembershipEvent, MembershipStatus};
pub use node::{InvalidNodeId, NodeId};
pub use remote_call::{CallHandler, RemoteCallStats, RemoteCalls};
pub use remote_link::{RemoteLinks, RemoteProcess};
pub use spawn::{BehaviorRegistry, RemoteSpawn, SpawnFactory};
pub use transport::{Transport, TransportConfig, TransportEvent};
pub use value::Value;
