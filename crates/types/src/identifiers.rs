//! Identifier newtypes for participants and services.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable 64-bit participant identifier, derived from the participant name.
///
/// The identifier is used on the wire; the human-readable name is used in
/// logs and for targeted sends. Derivation is a portable FNV-1a hash so any
/// process computes the same id for the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub u64);

impl ParticipantId {
    /// Derive the participant id from its name.
    ///
    /// FNV-1a over the UTF-8 bytes of the name. Deterministic across
    /// platforms and process runs.
    pub fn from_name(name: &str) -> Self {
        const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = FNV_OFFSET_BASIS;
        for byte in name.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        Self(hash)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Participant-local service identifier.
///
/// Monotonically assigned by the facade on controller creation, starting
/// at 1. Id 0 is reserved for the connection endpoint itself (announcements,
/// registry traffic).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ServiceId(pub u16);

impl ServiceId {
    /// The reserved id for non-service (connection-level) traffic.
    pub const CONNECTION: ServiceId = ServiceId(0);
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Legacy wire-form address of a service: (participant, service).
///
/// Uniquely identifies a service on the wire. Full identity lives in the
/// [`ServiceDescriptor`](crate::ServiceDescriptor); this pair is only the
/// envelope address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub participant: ParticipantId,
    pub service: ServiceId,
}

impl EndpointAddress {
    pub fn new(participant: ParticipantId, service: ServiceId) -> Self {
        Self {
            participant,
            service,
        }
    }

    /// The connection-level address of a participant (service id 0).
    pub fn connection(participant: ParticipantId) -> Self {
        Self {
            participant,
            service: ServiceId::CONNECTION,
        }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.participant, self.service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_id_is_deterministic() {
        assert_eq!(
            ParticipantId::from_name("CanWriter"),
            ParticipantId::from_name("CanWriter")
        );
        assert_ne!(
            ParticipantId::from_name("CanWriter"),
            ParticipantId::from_name("CanReader")
        );
    }

    #[test]
    fn participant_id_matches_reference_fnv1a() {
        // FNV-1a of the empty string is the offset basis.
        assert_eq!(ParticipantId::from_name("").0, 0xcbf2_9ce4_8422_2325);
        // Known FNV-1a test vector.
        assert_eq!(ParticipantId::from_name("a").0, 0xaf63_dc4c_8601_ec8c);
    }
}
