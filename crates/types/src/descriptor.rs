//! Service descriptors: the addressing unit of the middleware.

use crate::{ParticipantId, ServiceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Supplemental key carrying an RPC function name.
pub const SUPPLEMENTAL_KEY_RPC_FUNCTION: &str = "rpc.function";
/// Supplemental key carrying a media type (pub/sub and RPC).
pub const SUPPLEMENTAL_KEY_MEDIA_TYPE: &str = "mediatype";
/// Supplemental key carrying a serialized label set (`k=v;k=v`).
pub const SUPPLEMENTAL_KEY_LABELS: &str = "labels";
/// Supplemental key carrying a publisher UUID.
pub const SUPPLEMENTAL_KEY_PUBLISHER_UUID: &str = "pub.uuid";
/// Supplemental key carrying the history length of a publishing link.
pub const SUPPLEMENTAL_KEY_HISTORY_LENGTH: &str = "history";

/// What kind of endpoint a service is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ServiceType {
    /// A user-facing bus controller.
    Controller = 1,
    /// A controller internal to the runtime (discovery, lifecycle, time sync).
    InternalController = 2,
    /// A network link endpoint.
    Link = 3,
    /// A controller backed by a detailed network simulator.
    SimulatedController = 4,
}

impl ServiceType {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Controller),
            2 => Some(Self::InternalController),
            3 => Some(Self::Link),
            4 => Some(Self::SimulatedController),
            _ => None,
        }
    }
}

/// The kind of network a service exchanges messages on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NetworkType {
    #[default]
    Undefined = 0,
    Can = 1,
    Lin = 2,
    FlexRay = 3,
    Ethernet = 4,
    Data = 5,
    Rpc = 6,
}

impl NetworkType {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Undefined),
            1 => Some(Self::Can),
            2 => Some(Self::Lin),
            3 => Some(Self::FlexRay),
            4 => Some(Self::Ethernet),
            5 => Some(Self::Data),
            6 => Some(Self::Rpc),
            _ => None,
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkType::Undefined => "Undefined",
            NetworkType::Can => "CAN",
            NetworkType::Lin => "LIN",
            NetworkType::FlexRay => "FlexRay",
            NetworkType::Ethernet => "Ethernet",
            NetworkType::Data => "Data",
            NetworkType::Rpc => "Rpc",
        };
        f.write_str(name)
    }
}

/// Domain-wide identity of a service.
///
/// The triple (participant, network, service name) uniquely identifies a
/// service across the domain and is the deduplication key everywhere —
/// discovery indexes and the system monitor alike.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub participant_name: String,
    pub network_name: String,
    pub service_name: String,
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.participant_name, self.network_name, self.service_name
        )
    }
}

/// Full address of a service.
///
/// The wire envelope carries only `(participant_id, service_id)`; receivers
/// resolve that pair back to the full descriptor via the discovery index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Owning participant (human-readable, unique within a domain).
    pub participant_name: String,
    /// Stable id derived from `participant_name`.
    pub participant_id: ParticipantId,
    /// Logical bus or channel the service exchanges messages on.
    pub network_name: String,
    /// Name of the service, unique within its participant.
    pub service_name: String,
    /// Participant-local id, monotonically assigned on creation.
    pub service_id: ServiceId,
    pub service_type: ServiceType,
    pub network_type: NetworkType,
    /// Discovery-time metadata (RPC function name, media type, labels, …).
    ///
    /// Ordered map so the encoded form is stable.
    pub supplemental: BTreeMap<String, String>,
}

impl ServiceDescriptor {
    /// The domain-wide identity key of this service.
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            participant_name: self.participant_name.clone(),
            network_name: self.network_name.clone(),
            service_name: self.service_name.clone(),
        }
    }

    /// The wire-form address of this service.
    pub fn endpoint(&self) -> crate::EndpointAddress {
        crate::EndpointAddress::new(self.participant_id, self.service_id)
    }

    /// Look up a supplemental value.
    pub fn supplement(&self, key: &str) -> Option<&str> {
        self.supplemental.get(key).map(String::as_str)
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} ({}, id {})",
            self.participant_name,
            self.network_name,
            self.service_name,
            self.network_type,
            self.service_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(participant: &str, network: &str, service: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            participant_name: participant.to_string(),
            participant_id: ParticipantId::from_name(participant),
            network_name: network.to_string(),
            service_name: service.to_string(),
            service_id: ServiceId(1),
            service_type: ServiceType::Controller,
            network_type: NetworkType::Can,
            supplemental: BTreeMap::new(),
        }
    }

    #[test]
    fn key_is_the_full_triple() {
        let a = descriptor("P1", "CAN1", "CanCtrl");
        let b = descriptor("P1", "CAN1", "CanCtrl");
        let c = descriptor("P2", "CAN1", "CanCtrl");
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn enum_wire_values_round_trip() {
        for ty in [
            NetworkType::Undefined,
            NetworkType::Can,
            NetworkType::Lin,
            NetworkType::FlexRay,
            NetworkType::Ethernet,
            NetworkType::Data,
            NetworkType::Rpc,
        ] {
            assert_eq!(NetworkType::from_wire(ty as u8), Some(ty));
        }
        assert_eq!(NetworkType::from_wire(200), None);
        assert_eq!(ServiceType::from_wire(0), None);
    }
}
