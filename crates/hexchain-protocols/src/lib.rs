//! Hexchain Mesh Protocol
//!
//! Peer-to-peer plumbing for the hexagonal ledger: framing, handshake,
//! request/response matching and distance-aware gossip.
//!
//! # Wire Format
//!
//! Every message is a frame: a big-endian `u32` length, a one-byte
//! [`MessageCode`] and a bincode payload. The length counts the code and
//! the payload.
//!
//! # Peers
//!
//! A connection moves `Connecting -> Handshaking -> Active ->
//! Disconnected`. Only peers whose [`Status`] matches our protocol
//! version, network id and genesis become active. Lifecycle transitions
//! are published to [`MeshProtocol::subscribe_events`].
//!
//! # Gossip
//!
//! Blocks flood to peers within `flood_radius` hex steps, headers go to
//! everyone, proofs go to direct neighbors only. Received items land on
//! bounded [`InboundQueues`]; when a queue is full the item is dropped and
//! counted in [`StatsSnapshot`].

mod config;
mod error;
mod message;
mod peer;
mod protocol;
mod request;
mod stats;

pub use config::ProtocolConfig;
pub use error::{NetworkError, RequestError, Result};
pub use message::{
    read_frame, write_frame, BlockResponse, HeaderResponse, MeshMessage, MeshStateSummary,
    MessageCode, NeighborUpdate, ProofAnnouncement, Request, Status,
};
pub use peer::{PeerEvent, PeerId, PeerLifecycle, PeerRecord, PeerState};
pub use protocol::{Inbound, InboundQueues, MeshProtocol};
pub use request::{RequestTable, Response, ResponseReceiver};
pub use stats::{ProtocolStats, StatsSnapshot};
