//! Participant connection and message bus.
//!
//! One [`ConnectionManager`] per participant maintains the registry link and
//! one full-duplex [`peer link`](peer) per remote participant. Inbound
//! frames are decoded on the link's reader task and forwarded, in per-link
//! order, to the participant's dispatch thread as [`NetEvent`]s. Outbound
//! traffic goes through the [`Router`], which resolves receivers from the
//! discovery index.
//!
//! # Startup sequence
//!
//! 1. Bind the peer listener(s) so endpoints can be advertised.
//! 2. Dial the registry with exponential backoff, send a
//!    `ParticipantAnnouncement`, await the reply.
//! 3. On every `KnownParticipants` push, dial the peers whose names sort
//!    above ours (the lower name dials, the higher name accepts).
//! 4. After each peer handshake, replay the local service set, then signal
//!    readiness once every known peer is linked.

mod connection;
mod framing;
mod peer;
mod router;

pub use connection::{ConnectionManager, ConnectionOptions, TcpOptions};
pub use framing::{read_frame, write_frame};
pub use peer::{PeerHandle, HEARTBEAT_INTERVAL};
pub use router::Router;

use cosim_messages::Message;
use cosim_types::EndpointAddress;
use thiserror::Error;

/// Events delivered to the participant's dispatch thread.
#[derive(Debug)]
pub enum NetEvent {
    /// A peer handshake completed; its service announcement follows on the
    /// same link.
    PeerConnected { peer: String },
    /// The link to a peer terminated. Emitted exactly once per link, after
    /// all frames already queued inbound have been delivered.
    PeerDisconnected { peer: String },
    /// Every known peer (per the registry) is linked.
    PeersReady,
    /// A decoded frame from a peer, or a self-delivered local emission
    /// (`peer` is then our own name and the frame never touched the codec).
    Frame {
        peer: String,
        from: EndpointAddress,
        message: Message,
    },
    /// The registry link was lost. Running simulations continue; no new
    /// peers will be discovered.
    RegistryLost,
}

/// Connection-layer failures.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The registry could not be reached within `ConnectAttempts` dials.
    /// Terminal for a fresh participant.
    #[error("registry unreachable at {0}")]
    RegistryUnreachable(String),

    /// The registry or a peer rejected our announcement.
    #[error("announcement rejected: {0}")]
    Rejected(String),

    /// The remote did not complete the handshake in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The remote speaks an incompatible protocol version.
    #[error("protocol version mismatch: remote {0}")]
    VersionMismatch(String),

    /// The link is gone; pending sends on it are dropped.
    #[error("peer disconnected")]
    Disconnected,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
