//! PeerVault networking core
//!
//! Framed TCP transport, the file-server state machine, link-local mDNS
//! discovery, gossip-based peer exchange, and server metrics.
//!
//! ## Modules
//! - `transport`: framed TCP connections with per-peer read loops
//! - `message`: wire protocol and control-message encoding
//! - `server`: the central dispatcher and local client operations
//! - `discovery`: mDNS announce/browse
//! - `pex`: known-peer gossip
//! - `metrics`: per-server activity counters
//! - `netutil`: address helpers shared with the CLI

pub mod discovery;
pub mod message;
pub mod metrics;
pub mod netutil;
pub mod pex;
pub mod server;
mod sync_wait;
pub mod transport;

pub use discovery::{DiscoveryConfig, DiscoveryService, SERVICE_TYPE};
pub use message::{
    ControlMessage, InboundEvent, PeerRecord, PeerSource, ProtocolError, MAX_MESSAGE_BYTES,
    MESSAGE_FRAME, STREAM_FRAME,
};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use pex::{KnownPeer, PeerExchange, PexConfig};
pub use server::{FileServer, PeerRegistry, ServerConfig, ServerError};
pub use transport::{noop_handshake, TcpPeer, TcpTransport, TransportConfig, TransportError};
