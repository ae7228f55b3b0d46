//! Thin controller shims over the router.
//!
//! The core carries controller payloads opaquely; frame semantics (CAN
//! arbitration, LIN schedules, FlexRay cluster timing) belong to detailed
//! simulators outside this crate. What lives here is the send path with
//! timestamping, local transmit acks, pub/sub matching by media type and
//! labels, and RPC call/return correlation.

use crate::core::{ControllerSink, Core, Internal};
use cosim_types::{
    ServiceDescriptor, SimTime, SUPPLEMENTAL_KEY_LABELS, SUPPLEMENTAL_KEY_MEDIA_TYPE,
    SUPPLEMENTAL_KEY_RPC_FUNCTION,
};
use cosim_messages::{
    BusFrame, BusFrameAck, DataMessage, Message, RpcCall, RpcCallReturn, TransmitStatus,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Key/value labels attached to pub/sub and RPC services.
pub type Labels = Vec<(String, String)>;

/// Marks RPC descriptors as caller or callee on their function channel.
pub(crate) const SUPPLEMENTAL_KEY_RPC_ROLE: &str = "rpc.role";
pub(crate) const RPC_ROLE_CLIENT: &str = "client";
pub(crate) const RPC_ROLE_SERVER: &str = "server";

pub(crate) fn encode_labels(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(";")
}

fn decode_labels(raw: &str) -> Labels {
    raw.split(';')
        .filter(|chunk| !chunk.is_empty())
        .filter_map(|chunk| {
            chunk
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

/// A subscriber matches a publisher when its media type is empty or equal,
/// and every one of its labels appears on the publisher.
fn matches_publisher(
    subscriber_media: &str,
    subscriber_labels: &Labels,
    publisher: &ServiceDescriptor,
) -> bool {
    if !subscriber_media.is_empty() {
        match publisher.supplement(SUPPLEMENTAL_KEY_MEDIA_TYPE) {
            Some(media) if media == subscriber_media => {}
            _ => return false,
        }
    }
    if subscriber_labels.is_empty() {
        return true;
    }
    let published = publisher
        .supplement(SUPPLEMENTAL_KEY_LABELS)
        .map(decode_labels)
        .unwrap_or_default();
    subscriber_labels
        .iter()
        .all(|needed| published.iter().any(|have| have == needed))
}

// ─── Bus controllers ───

/// A received bus frame.
#[derive(Debug, Clone)]
pub struct FrameEvent {
    pub timestamp: SimTime,
    pub payload: Vec<u8>,
    /// Name of the emitting participant.
    pub sender: String,
}

/// A transmit acknowledgment for a frame this controller sent.
#[derive(Debug, Clone, Copy)]
pub struct FrameAckEvent {
    pub timestamp: SimTime,
    pub status: TransmitStatus,
}

type FrameHandler = Box<dyn FnMut(&FrameEvent) + Send>;
type AckHandler = Box<dyn FnMut(&FrameAckEvent) + Send>;

/// One virtual-bus endpoint (CAN, Ethernet, LIN, or FlexRay).
///
/// The bus kind lives in the descriptor's network type; payload layout is
/// the embedding application's contract.
pub struct BusController {
    core: Arc<Core>,
    descriptor: ServiceDescriptor,
    frame_handlers: Mutex<Vec<FrameHandler>>,
    ack_handlers: Mutex<Vec<AckHandler>>,
}

impl BusController {
    pub(crate) fn new(core: Arc<Core>, descriptor: ServiceDescriptor) -> Self {
        Self {
            core,
            descriptor,
            frame_handlers: Mutex::new(Vec::new()),
            ack_handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Send a serialized frame on this controller's network.
    ///
    /// The frame carries the participant's current (virtual or wall-clock)
    /// time; the matching transmit ack arrives on the registered ack
    /// handlers with the same timestamp.
    pub fn send_frame(&self, payload: Vec<u8>) {
        let timestamp = self.core.time.now();
        self.core.router.broadcast(
            &self.descriptor,
            Message::BusFrame(BusFrame { timestamp, payload }),
        );
        let _ = self.core.internal_tx.send(Internal::LocalAck {
            service: self.descriptor.service_id,
            ack: BusFrameAck {
                timestamp,
                status: TransmitStatus::Transmitted,
            },
        });
    }

    /// Register a frame-received handler. Handlers run on the dispatch
    /// thread in registration order.
    pub fn add_frame_handler(&self, handler: impl FnMut(&FrameEvent) + Send + 'static) {
        self.frame_handlers
            .lock()
            .expect("frame handlers lock")
            .push(Box::new(handler));
    }

    /// Register a transmit-ack handler.
    pub fn add_frame_transmit_handler(&self, handler: impl FnMut(&FrameAckEvent) + Send + 'static) {
        self.ack_handlers
            .lock()
            .expect("ack handlers lock")
            .push(Box::new(handler));
    }

    fn fire_ack(&self, ack: FrameAckEvent) {
        for handler in self.ack_handlers.lock().expect("ack handlers lock").iter_mut() {
            handler(&ack);
        }
    }
}

impl ControllerSink for BusController {
    fn deliver(&self, from: &ServiceDescriptor, message: &Message) {
        match message {
            Message::BusFrame(frame) => {
                let event = FrameEvent {
                    timestamp: frame.timestamp,
                    payload: frame.payload.clone(),
                    sender: from.participant_name.clone(),
                };
                for handler in self
                    .frame_handlers
                    .lock()
                    .expect("frame handlers lock")
                    .iter_mut()
                {
                    handler(&event);
                }
            }
            // Wire-level acks only appear with a detailed bus simulator.
            Message::BusFrameAck(ack) => self.fire_ack(FrameAckEvent {
                timestamp: ack.timestamp,
                status: ack.status,
            }),
            _ => {}
        }
    }

    fn deliver_ack(&self, ack: &BusFrameAck) {
        self.fire_ack(FrameAckEvent {
            timestamp: ack.timestamp,
            status: ack.status,
        });
    }
}

// ─── Publish/subscribe ───

/// Publishes opaque payloads on a topic network.
pub struct DataPublisher {
    core: Arc<Core>,
    descriptor: ServiceDescriptor,
}

impl DataPublisher {
    pub(crate) fn new(core: Arc<Core>, descriptor: ServiceDescriptor) -> Self {
        Self { core, descriptor }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn publish(&self, payload: Vec<u8>) {
        let timestamp = self.core.time.now();
        self.core.router.broadcast(
            &self.descriptor,
            Message::DataMessage(DataMessage { timestamp, payload }),
        );
    }

    /// Publish to one participant only (targeted send of pub/sub data is
    /// honored as targeted, never widened to broadcast).
    pub fn publish_to(&self, target_participant: &str, payload: Vec<u8>) {
        let timestamp = self.core.time.now();
        self.core.router.send_to(
            target_participant,
            &self.descriptor,
            Message::DataMessage(DataMessage { timestamp, payload }),
        );
    }
}

/// A received pub/sub payload.
#[derive(Debug, Clone)]
pub struct DataMessageEvent {
    pub timestamp: SimTime,
    pub payload: Vec<u8>,
    pub publisher: String,
}

type DataHandler = Box<dyn FnMut(&DataMessageEvent) + Send>;

/// Receives payloads on a topic network, filtered by media type and labels.
pub struct DataSubscriber {
    descriptor: ServiceDescriptor,
    media_type: String,
    labels: Labels,
    handlers: Mutex<Vec<DataHandler>>,
}

impl DataSubscriber {
    pub(crate) fn new(descriptor: ServiceDescriptor, media_type: String, labels: Labels) -> Self {
        Self {
            descriptor,
            media_type,
            labels,
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn add_data_message_handler(
        &self,
        handler: impl FnMut(&DataMessageEvent) + Send + 'static,
    ) {
        self.handlers
            .lock()
            .expect("data handlers lock")
            .push(Box::new(handler));
    }
}

impl ControllerSink for DataSubscriber {
    fn deliver(&self, from: &ServiceDescriptor, message: &Message) {
        let Message::DataMessage(data) = message else {
            return;
        };
        if !matches_publisher(&self.media_type, &self.labels, from) {
            return;
        }
        let event = DataMessageEvent {
            timestamp: data.timestamp,
            payload: data.payload.clone(),
            publisher: from.participant_name.clone(),
        };
        for handler in self.handlers.lock().expect("data handlers lock").iter_mut() {
            handler(&event);
        }
    }
}

// ─── RPC ───

/// The result of an RPC call, delivered to the client's return handler.
#[derive(Debug, Clone)]
pub struct RpcCallResultEvent {
    pub timestamp: SimTime,
    pub call_uuid: [u8; 16],
    pub payload: Vec<u8>,
}

type CallReturnHandler = Box<dyn FnMut(&RpcCallResultEvent) + Send>;

/// Issues calls on a function channel and correlates the returns.
pub struct RpcClient {
    core: Arc<Core>,
    descriptor: ServiceDescriptor,
    media_type: String,
    pending: Mutex<HashSet<[u8; 16]>>,
    return_handlers: Mutex<Vec<CallReturnHandler>>,
}

impl RpcClient {
    pub(crate) fn new(core: Arc<Core>, descriptor: ServiceDescriptor, media_type: String) -> Self {
        Self {
            core,
            descriptor,
            media_type,
            pending: Mutex::new(HashSet::new()),
            return_handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Issue a call. Returns the call uuid used to correlate the return.
    pub fn call(&self, payload: Vec<u8>) -> [u8; 16] {
        let call_uuid = *uuid::Uuid::new_v4().as_bytes();
        let network = &self.descriptor.network_name;
        let servers = self.core.discovery.find(|d| {
            d.network_name == *network
                && d.supplement(SUPPLEMENTAL_KEY_RPC_ROLE) == Some(RPC_ROLE_SERVER)
                && (self.media_type.is_empty()
                    || d.supplement(SUPPLEMENTAL_KEY_MEDIA_TYPE) == Some(self.media_type.as_str()))
        });
        if servers.is_empty() {
            warn!(
                function = self.descriptor.supplement(SUPPLEMENTAL_KEY_RPC_FUNCTION),
                "rpc call issued with no matching server"
            );
        }

        self.pending.lock().expect("pending lock").insert(call_uuid);
        let timestamp = self.core.time.now();
        self.core.router.broadcast(
            &self.descriptor,
            Message::RpcCall(RpcCall {
                timestamp,
                call_uuid,
                payload,
            }),
        );
        call_uuid
    }

    /// Register the return handler. Fires once per completed call, in call
    /// order per server.
    pub fn set_call_return_handler(
        &self,
        handler: impl FnMut(&RpcCallResultEvent) + Send + 'static,
    ) {
        self.return_handlers
            .lock()
            .expect("return handlers lock")
            .push(Box::new(handler));
    }
}

impl ControllerSink for RpcClient {
    fn deliver(&self, _from: &ServiceDescriptor, message: &Message) {
        let Message::RpcCallReturn(ret) = message else {
            return;
        };
        if !self.pending.lock().expect("pending lock").remove(&ret.call_uuid) {
            return;
        }
        let event = RpcCallResultEvent {
            timestamp: ret.timestamp,
            call_uuid: ret.call_uuid,
            payload: ret.payload.clone(),
        };
        for handler in self
            .return_handlers
            .lock()
            .expect("return handlers lock")
            .iter_mut()
        {
            handler(&event);
        }
    }
}

type RpcHandler = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Serves calls on a function channel.
pub struct RpcServer {
    core: Arc<Core>,
    descriptor: ServiceDescriptor,
    handler: Mutex<RpcHandler>,
}

impl RpcServer {
    pub(crate) fn new(
        core: Arc<Core>,
        descriptor: ServiceDescriptor,
        handler: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    ) -> Self {
        Self {
            core,
            descriptor,
            handler: Mutex::new(Box::new(handler)),
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }
}

impl ControllerSink for RpcServer {
    fn deliver(&self, from: &ServiceDescriptor, message: &Message) {
        let Message::RpcCall(call) = message else {
            return;
        };
        let result = (self.handler.lock().expect("rpc handler lock"))(&call.payload);
        // The return goes back to the caller only.
        self.core.router.send_to(
            &from.participant_name,
            &self.descriptor,
            Message::RpcCallReturn(RpcCallReturn {
                timestamp: self.core.time.now(),
                call_uuid: call.call_uuid,
                payload: result,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosim_types::{NetworkType, ParticipantId, ServiceId, ServiceType};
    use std::collections::BTreeMap;

    fn publisher(media: &str, labels: &str) -> ServiceDescriptor {
        let mut supplemental = BTreeMap::new();
        if !media.is_empty() {
            supplemental.insert(SUPPLEMENTAL_KEY_MEDIA_TYPE.to_string(), media.to_string());
        }
        if !labels.is_empty() {
            supplemental.insert(SUPPLEMENTAL_KEY_LABELS.to_string(), labels.to_string());
        }
        ServiceDescriptor {
            participant_name: "Pub".to_string(),
            participant_id: ParticipantId::from_name("Pub"),
            network_name: "topic".to_string(),
            service_name: "publisher".to_string(),
            service_id: ServiceId(1),
            service_type: ServiceType::Controller,
            network_type: NetworkType::Data,
            supplemental,
        }
    }

    #[test]
    fn empty_subscriber_media_matches_anything() {
        assert!(matches_publisher("", &vec![], &publisher("application/json", "")));
        assert!(matches_publisher("", &vec![], &publisher("", "")));
    }

    #[test]
    fn media_type_must_match_when_set() {
        assert!(matches_publisher(
            "application/json",
            &vec![],
            &publisher("application/json", "")
        ));
        assert!(!matches_publisher(
            "application/json",
            &vec![],
            &publisher("application/octet-stream", "")
        ));
    }

    #[test]
    fn subscriber_labels_must_be_subset_of_publisher_labels() {
        let labels = vec![("region".to_string(), "eu".to_string())];
        assert!(matches_publisher("", &labels, &publisher("", "region=eu;tier=1")));
        assert!(!matches_publisher("", &labels, &publisher("", "tier=1")));
        assert!(!matches_publisher("", &labels, &publisher("", "")));
    }

    #[test]
    fn labels_encode_decode() {
        let labels = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ];
        assert_eq!(decode_labels(&encode_labels(&labels)), labels);
        assert!(decode_labels("").is_empty());
    }
}
