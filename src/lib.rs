//! # weft
//!
//! The sans-io core of a peer-to-peer Ethernet virtualization node.
//! Endpoints scattered across the public Internet exchange Ethernet
//! frames as if attached to one switched LAN, over two layers:
//!
//! - **VL1**: cryptographically authenticated packet transport between
//!   nodes identified by 40-bit self-certifying addresses
//! - **VL2**: virtual Ethernet networks (64-bit IDs), each governed by
//!   a controller that issues membership credentials and per-member
//!   policy enforced by a rules engine
//!
//! The core owns no sockets, threads, or files. A driver feeds it wire
//! packets and tap frames, calls [`Node::process_background_tasks`] on
//! the returned deadlines, and supplies everything external through
//! the [`Host`] trait. The clock is always a parameter.
//!
//! ```ignore
//! let node = Node::new(host, clock_ms())?;
//! // deliver a UDP datagram:
//! node.process_wire_packet(clock_ms(), socket_id, from, &datagram);
//! // join a network:
//! node.join(clock_ms(), NetworkId(0x8056c2e21c000001), None);
//! ```

pub mod buf;
pub mod cert;
pub mod credential;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod locator;
pub mod network;
pub mod node;
pub mod packet;
pub mod path;
pub mod peer;
pub mod protocol;
pub mod rules;

pub use cert::{
    Certificate, CertificateName, CertificateStore, CertificateSubject,
    LOCAL_TRUST_FLAG_ROOT_CA, LOCAL_TRUST_FLAG_ROOT_SET,
};
pub use credential::{
    CapabilityCredential, Com, CooCredential, CredentialKind, Revocation, TagCredential,
};
pub use endpoint::{Endpoint, Mac};
pub use error::{CertificateError, CredentialError, FrameDropReason, PacketDropReason, ResultCode};
pub use identity::{Address, Fingerprint, Identity, IdentityKind};
pub use locator::Locator;
pub use network::{
    AssignedAddress, MulticastGroup, NetworkConfig, NetworkId, NetworkInfo, NetworkStatus,
    NetworkType, Route, SignedNetworkConfig,
};
pub use node::{
    ConfigOperation, Event, Host, Node, NodeStatus, PeerStatus, StateObject, TraceEvent,
};
pub use rules::{FilterResult, FrameContext, Rule, RuleKind};
