//! Connection handshake and registry protocol messages.

use cosim_types::ParticipantId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version negotiated during the announcement handshake.
///
/// Peers with a different major version are rejected; the minor version is
/// informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// The protocol version spoken by this build.
pub const CURRENT_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 3, minor: 1 };

/// A TCP endpoint a participant accepts peer connections on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpEndpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for TcpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// First message on every fresh link, in both the registry and the
/// peer-to-peer handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantAnnouncement {
    pub participant_name: String,
    pub participant_id: ParticipantId,
    pub protocol_version: ProtocolVersion,
    /// Endpoints this participant accepts peer connections on.
    pub tcp_endpoints: Vec<TcpEndpoint>,
    /// Local-domain socket paths, used when both sides report the same host
    /// identity.
    pub local_endpoints: Vec<String>,
}

/// Accept/reject answer to a [`ParticipantAnnouncement`].
///
/// A non-accepted reply closes the link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantAnnouncementReply {
    pub accepted: bool,
    pub reason: Option<String>,
}

impl ParticipantAnnouncementReply {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// One peer as known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub participant_name: String,
    pub participant_id: ParticipantId,
    pub tcp_endpoints: Vec<TcpEndpoint>,
    pub local_endpoints: Vec<String>,
}

/// Pushed by the registry on join and on every roster change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnownParticipants {
    pub participants: Vec<PeerInfo>,
}
