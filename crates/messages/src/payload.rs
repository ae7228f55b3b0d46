//! Payload traffic and service discovery messages.

use cosim_types::{ServiceDescriptor, SimTime};
use serde::{Deserialize, Serialize};

/// Discovery state of a service registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DiscoveryEventKind {
    Created = 1,
    Removed = 2,
}

impl DiscoveryEventKind {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Created),
            2 => Some(Self::Removed),
            _ => None,
        }
    }
}

/// Broadcast when a service is created or removed on its owning participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDiscoveryEvent {
    pub kind: DiscoveryEventKind,
    pub descriptor: ServiceDescriptor,
}

/// Full replay of a participant's current service set, sent to a peer
/// immediately after handshake acceptance. The receiver treats each entry
/// as a `Created` and suppresses duplicates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceAnnouncement {
    pub services: Vec<ServiceDescriptor>,
}

/// A virtual-bus frame. The core carries the controller's serialized payload
/// opaquely; frame semantics live in the controller implementations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusFrame {
    /// Virtual time of emission (wall clock for unsynchronized senders).
    pub timestamp: SimTime,
    pub payload: Vec<u8>,
}

/// Delivery outcome reported back to the emitting controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransmitStatus {
    Transmitted = 1,
    Canceled = 2,
    TransmitQueueFull = 3,
}

impl TransmitStatus {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Transmitted),
            2 => Some(Self::Canceled),
            3 => Some(Self::TransmitQueueFull),
            _ => None,
        }
    }
}

/// Acknowledgment for a [`BusFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusFrameAck {
    pub timestamp: SimTime,
    pub status: TransmitStatus,
}

/// Publish/subscribe payload on a data network (topic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    pub timestamp: SimTime,
    pub payload: Vec<u8>,
}

/// An RPC invocation. Correlated with its return by `call_uuid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    pub timestamp: SimTime,
    pub call_uuid: [u8; 16],
    pub payload: Vec<u8>,
}

/// The result of an RPC invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCallReturn {
    pub timestamp: SimTime,
    pub call_uuid: [u8; 16],
    pub payload: Vec<u8>,
}
