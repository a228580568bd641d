//! sdwan - Overlay Network Control and Data Plane
//!
//! Edge nodes tunnel IP packets from a local TUN interface to a central
//! control server, which tracks every node and the routes it advertises and
//! forwards each packet to the node owning its destination. When a node
//! cannot be reached directly, traffic goes through a UDP relay.
//!
//! # Architecture
//!
//! - [`protocol`]: versioned datagram envelope with optional AEAD sealing
//! - [`directory`]: peer registry and routing table with staleness eviction
//! - [`relay`]: relayed sessions toward unreachable peers, plus the relay server
//! - [`server`]: the control loop
//! - [`client`]: the tunnel loop running on each edge node
//! - [`tun`]: TUN device abstraction

pub mod config;
pub mod error;
pub mod crypto;
pub mod protocol;
pub mod directory;
pub mod relay;
pub mod task;
pub mod tun;
pub mod server;
pub mod client;

pub use config::SdwanConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::SdwanConfig;
    pub use crate::error::{Error, Result};
    pub use crate::crypto::{Algorithm, CryptoContext};
    pub use crate::protocol::{Message, MessageType, Protocol};
    pub use crate::directory::{Peer, PeerDirectory, Route};
    pub use crate::relay::{RelayManager, RelayServer};
    pub use crate::server::ControlServer;
    pub use crate::client::TunnelClient;
    pub use crate::tun::TunDevice;
}
