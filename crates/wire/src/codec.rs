//! Frame-level encode/decode for every message kind.

use crate::{CodecError, Decoder, Encoder};
use cosim_messages::{
    AddressedMessage, BusFrame, BusFrameAck, DataMessage, DiscoveryEventKind, KnownParticipants,
    LogLevel, LogRecord, Message, MessageKind, NextSimTask, ParticipantAnnouncement,
    ParticipantAnnouncementReply, ParticipantCommand, ParticipantCommandKind, ParticipantStatus,
    PeerInfo, ProtocolVersion, RpcCall, RpcCallReturn, ServiceAnnouncement, ServiceDiscoveryEvent,
    SystemCommand, SystemCommandKind, TcpEndpoint, TransmitStatus, WorkflowConfiguration,
};
use cosim_types::{
    EndpointAddress, NetworkType, ParticipantId, ParticipantState, ServiceDescriptor, ServiceId,
    ServiceType, SimStep, SimTime,
};
use std::collections::BTreeMap;

/// Maximum accepted frame size (length-prefix value). Anything larger is
/// treated as a protocol violation and tears down the link.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bytes between the length prefix and the body: kind + endpoint address.
pub const HEADER_LEN: usize = 1 + 8 + 2;

/// Encode a message into its full framed form:
/// `[total_length: u32][kind: u8][participant_id: u64][service_id: u16][body]`.
pub fn encode_frame(from: EndpointAddress, message: &Message) -> Vec<u8> {
    let mut body = Encoder::with_capacity(64);
    encode_body(message, &mut body);

    let total_len = HEADER_LEN + body.len();
    let mut frame = Encoder::with_capacity(4 + total_len);
    frame.put_u32(total_len as u32);
    frame.put_u8(message.kind() as u8);
    frame.put_u64(from.participant.0);
    frame.put_u16(from.service.0);
    frame.put_raw(&body.into_bytes());
    frame.into_bytes()
}

/// Decode a frame body (everything after the length prefix).
///
/// The peer link reads the u32 length prefix, enforces [`MAX_FRAME_SIZE`],
/// and hands the exact body slice here.
pub fn decode_frame(bytes: &[u8]) -> Result<AddressedMessage, CodecError> {
    let mut dec = Decoder::new(bytes);
    let raw_kind = dec.u8()?;
    let kind = MessageKind::from_wire(raw_kind).ok_or(CodecError::UnknownKind(raw_kind))?;
    let from = EndpointAddress::new(ParticipantId(dec.u64()?), ServiceId(dec.u16()?));
    let message = decode_body(kind, &mut dec)?;
    dec.finish()?;
    Ok(AddressedMessage { from, message })
}

// ─── Body encoding ───

fn encode_body(message: &Message, enc: &mut Encoder) {
    match message {
        Message::ParticipantAnnouncement(m) => encode_announcement(m, enc),
        Message::ParticipantAnnouncementReply(m) => {
            enc.put_bool(m.accepted);
            enc.put_opt_str(m.reason.as_deref());
        }
        Message::KnownParticipants(m) => {
            enc.put_u32(m.participants.len() as u32);
            for peer in &m.participants {
                encode_peer_info(peer, enc);
            }
        }
        Message::Heartbeat => {}
        Message::ServiceDiscoveryEvent(m) => {
            enc.put_u8(m.kind as u8);
            encode_descriptor(&m.descriptor, enc);
        }
        Message::ServiceAnnouncement(m) => {
            enc.put_u32(m.services.len() as u32);
            for descriptor in &m.services {
                encode_descriptor(descriptor, enc);
            }
        }
        Message::ParticipantStatus(m) => {
            enc.put_str(&m.participant_name);
            enc.put_u8(m.state as u8);
            enc.put_str(&m.enter_reason);
            enc.put_i64(m.enter_time);
            enc.put_i64(m.refresh_time);
        }
        Message::ParticipantCommand(m) => {
            enc.put_u64(m.target_participant.0);
            enc.put_u8(m.kind as u8);
        }
        Message::SystemCommand(m) => enc.put_u8(m.kind as u8),
        Message::WorkflowConfiguration(m) => {
            enc.put_u32(m.required_participant_names.len() as u32);
            for name in &m.required_participant_names {
                enc.put_str(name);
            }
        }
        Message::NextSimTask(m) => {
            enc.put_i64(m.time_point.as_nanos());
            enc.put_i64(m.duration.as_nanos());
        }
        Message::LogRecord(m) => {
            enc.put_u8(m.level as u8);
            enc.put_i64(m.timestamp);
            enc.put_str(&m.body);
        }
        Message::BusFrame(m) => {
            enc.put_i64(m.timestamp.as_nanos());
            enc.put_bytes(&m.payload);
        }
        Message::BusFrameAck(m) => {
            enc.put_i64(m.timestamp.as_nanos());
            enc.put_u8(m.status as u8);
        }
        Message::DataMessage(m) => {
            enc.put_i64(m.timestamp.as_nanos());
            enc.put_bytes(&m.payload);
        }
        Message::RpcCall(m) => {
            enc.put_i64(m.timestamp.as_nanos());
            enc.put_raw(&m.call_uuid);
            enc.put_bytes(&m.payload);
        }
        Message::RpcCallReturn(m) => {
            enc.put_i64(m.timestamp.as_nanos());
            enc.put_raw(&m.call_uuid);
            enc.put_bytes(&m.payload);
        }
    }
}

fn encode_announcement(m: &ParticipantAnnouncement, enc: &mut Encoder) {
    enc.put_str(&m.participant_name);
    enc.put_u64(m.participant_id.0);
    enc.put_u16(m.protocol_version.major);
    enc.put_u16(m.protocol_version.minor);
    enc.put_u32(m.tcp_endpoints.len() as u32);
    for endpoint in &m.tcp_endpoints {
        enc.put_str(&endpoint.host);
        enc.put_u16(endpoint.port);
    }
    enc.put_u32(m.local_endpoints.len() as u32);
    for path in &m.local_endpoints {
        enc.put_str(path);
    }
}

fn encode_peer_info(peer: &PeerInfo, enc: &mut Encoder) {
    enc.put_str(&peer.participant_name);
    enc.put_u64(peer.participant_id.0);
    enc.put_u32(peer.tcp_endpoints.len() as u32);
    for endpoint in &peer.tcp_endpoints {
        enc.put_str(&endpoint.host);
        enc.put_u16(endpoint.port);
    }
    enc.put_u32(peer.local_endpoints.len() as u32);
    for path in &peer.local_endpoints {
        enc.put_str(path);
    }
}

fn encode_descriptor(descriptor: &ServiceDescriptor, enc: &mut Encoder) {
    enc.put_str(&descriptor.participant_name);
    enc.put_u64(descriptor.participant_id.0);
    enc.put_str(&descriptor.network_name);
    enc.put_str(&descriptor.service_name);
    enc.put_u16(descriptor.service_id.0);
    enc.put_u8(descriptor.service_type as u8);
    enc.put_u8(descriptor.network_type as u8);
    enc.put_u32(descriptor.supplemental.len() as u32);
    for (key, value) in &descriptor.supplemental {
        enc.put_str(key);
        enc.put_str(value);
    }
}

// ─── Body decoding ───

fn decode_body(kind: MessageKind, dec: &mut Decoder<'_>) -> Result<Message, CodecError> {
    let message = match kind {
        MessageKind::ParticipantAnnouncement => {
            Message::ParticipantAnnouncement(decode_announcement(dec)?)
        }
        MessageKind::ParticipantAnnouncementReply => {
            Message::ParticipantAnnouncementReply(ParticipantAnnouncementReply {
                accepted: dec.bool()?,
                reason: dec.opt_str()?,
            })
        }
        MessageKind::KnownParticipants => {
            let count = dec.u32()?;
            let mut participants = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                participants.push(decode_peer_info(dec)?);
            }
            Message::KnownParticipants(KnownParticipants { participants })
        }
        MessageKind::Heartbeat => Message::Heartbeat,
        MessageKind::ServiceDiscoveryEvent => {
            let event_kind = DiscoveryEventKind::from_wire(dec.u8()?)
                .ok_or(CodecError::MalformedFrame("invalid discovery event kind"))?;
            Message::ServiceDiscoveryEvent(ServiceDiscoveryEvent {
                kind: event_kind,
                descriptor: decode_descriptor(dec)?,
            })
        }
        MessageKind::ServiceAnnouncement => {
            let count = dec.u32()?;
            let mut services = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                services.push(decode_descriptor(dec)?);
            }
            Message::ServiceAnnouncement(ServiceAnnouncement { services })
        }
        MessageKind::ParticipantStatus => Message::ParticipantStatus(ParticipantStatus {
            participant_name: dec.str()?,
            state: ParticipantState::from_wire(dec.u8()?)
                .ok_or(CodecError::MalformedFrame("invalid participant state"))?,
            enter_reason: dec.str()?,
            enter_time: dec.i64()?,
            refresh_time: dec.i64()?,
        }),
        MessageKind::ParticipantCommand => Message::ParticipantCommand(ParticipantCommand {
            target_participant: ParticipantId(dec.u64()?),
            kind: ParticipantCommandKind::from_wire(dec.u8()?)
                .ok_or(CodecError::MalformedFrame("invalid participant command"))?,
        }),
        MessageKind::SystemCommand => Message::SystemCommand(SystemCommand {
            kind: SystemCommandKind::from_wire(dec.u8()?)
                .ok_or(CodecError::MalformedFrame("invalid system command"))?,
        }),
        MessageKind::WorkflowConfiguration => {
            let count = dec.u32()?;
            let mut required_participant_names = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                required_participant_names.push(dec.str()?);
            }
            Message::WorkflowConfiguration(WorkflowConfiguration {
                required_participant_names,
            })
        }
        MessageKind::NextSimTask => Message::NextSimTask(NextSimTask {
            time_point: SimTime::from_nanos(dec.i64()?),
            duration: SimStep::from_nanos(dec.i64()?),
        }),
        MessageKind::LogRecord => Message::LogRecord(LogRecord {
            level: LogLevel::from_wire(dec.u8()?)
                .ok_or(CodecError::MalformedFrame("invalid log level"))?,
            timestamp: dec.i64()?,
            body: dec.str()?,
        }),
        MessageKind::BusFrame => Message::BusFrame(BusFrame {
            timestamp: SimTime::from_nanos(dec.i64()?),
            payload: dec.bytes()?,
        }),
        MessageKind::BusFrameAck => Message::BusFrameAck(BusFrameAck {
            timestamp: SimTime::from_nanos(dec.i64()?),
            status: TransmitStatus::from_wire(dec.u8()?)
                .ok_or(CodecError::MalformedFrame("invalid transmit status"))?,
        }),
        MessageKind::DataMessage => Message::DataMessage(DataMessage {
            timestamp: SimTime::from_nanos(dec.i64()?),
            payload: dec.bytes()?,
        }),
        MessageKind::RpcCall => Message::RpcCall(RpcCall {
            timestamp: SimTime::from_nanos(dec.i64()?),
            call_uuid: dec.raw::<16>()?,
            payload: dec.bytes()?,
        }),
        MessageKind::RpcCallReturn => Message::RpcCallReturn(RpcCallReturn {
            timestamp: SimTime::from_nanos(dec.i64()?),
            call_uuid: dec.raw::<16>()?,
            payload: dec.bytes()?,
        }),
    };
    Ok(message)
}

fn decode_announcement(dec: &mut Decoder<'_>) -> Result<ParticipantAnnouncement, CodecError> {
    let participant_name = dec.str()?;
    let participant_id = ParticipantId(dec.u64()?);
    let protocol_version = ProtocolVersion {
        major: dec.u16()?,
        minor: dec.u16()?,
    };
    let tcp_count = dec.u32()?;
    let mut tcp_endpoints = Vec::with_capacity(tcp_count.min(64) as usize);
    for _ in 0..tcp_count {
        tcp_endpoints.push(TcpEndpoint {
            host: dec.str()?,
            port: dec.u16()?,
        });
    }
    let local_count = dec.u32()?;
    let mut local_endpoints = Vec::with_capacity(local_count.min(64) as usize);
    for _ in 0..local_count {
        local_endpoints.push(dec.str()?);
    }
    Ok(ParticipantAnnouncement {
        participant_name,
        participant_id,
        protocol_version,
        tcp_endpoints,
        local_endpoints,
    })
}

fn decode_peer_info(dec: &mut Decoder<'_>) -> Result<PeerInfo, CodecError> {
    let participant_name = dec.str()?;
    let participant_id = ParticipantId(dec.u64()?);
    let tcp_count = dec.u32()?;
    let mut tcp_endpoints = Vec::with_capacity(tcp_count.min(64) as usize);
    for _ in 0..tcp_count {
        tcp_endpoints.push(TcpEndpoint {
            host: dec.str()?,
            port: dec.u16()?,
        });
    }
    let local_count = dec.u32()?;
    let mut local_endpoints = Vec::with_capacity(local_count.min(64) as usize);
    for _ in 0..local_count {
        local_endpoints.push(dec.str()?);
    }
    Ok(PeerInfo {
        participant_name,
        participant_id,
        tcp_endpoints,
        local_endpoints,
    })
}

fn decode_descriptor(dec: &mut Decoder<'_>) -> Result<ServiceDescriptor, CodecError> {
    let participant_name = dec.str()?;
    let participant_id = ParticipantId(dec.u64()?);
    let network_name = dec.str()?;
    let service_name = dec.str()?;
    let service_id = ServiceId(dec.u16()?);
    let service_type = ServiceType::from_wire(dec.u8()?)
        .ok_or(CodecError::MalformedFrame("invalid service type"))?;
    let network_type = NetworkType::from_wire(dec.u8()?)
        .ok_or(CodecError::MalformedFrame("invalid network type"))?;
    let count = dec.u32()?;
    let mut supplemental = BTreeMap::new();
    for _ in 0..count {
        let key = dec.str()?;
        let value = dec.str()?;
        supplemental.insert(key, value);
    }
    Ok(ServiceDescriptor {
        participant_name,
        participant_id,
        network_name,
        service_name,
        service_id,
        service_type,
        network_type,
        supplemental,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosim_messages::CURRENT_PROTOCOL_VERSION;

    fn sender() -> EndpointAddress {
        EndpointAddress::new(ParticipantId::from_name("EcuA"), ServiceId(3))
    }

    fn round_trip(message: Message) {
        let from = sender();
        let frame = encode_frame(from, &message);

        // The length prefix equals the byte count after it.
        let declared = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len() - 4, "length prefix mismatch");

        let decoded = decode_frame(&frame[4..]).expect("decode");
        assert_eq!(decoded.from, from);
        assert_eq!(decoded.message, message);
    }

    fn sample_descriptor() -> ServiceDescriptor {
        let mut supplemental = BTreeMap::new();
        supplemental.insert("mediatype".to_string(), "application/json".to_string());
        supplemental.insert("labels".to_string(), "kind=demo".to_string());
        ServiceDescriptor {
            participant_name: "EcuA".to_string(),
            participant_id: ParticipantId::from_name("EcuA"),
            network_name: "Eth0".to_string(),
            service_name: "EthController1".to_string(),
            service_id: ServiceId(3),
            service_type: ServiceType::Controller,
            network_type: NetworkType::Ethernet,
            supplemental,
        }
    }

    #[test]
    fn announcement_round_trip() {
        round_trip(Message::ParticipantAnnouncement(ParticipantAnnouncement {
            participant_name: "EcuA".to_string(),
            participant_id: ParticipantId::from_name("EcuA"),
            protocol_version: CURRENT_PROTOCOL_VERSION,
            tcp_endpoints: vec![TcpEndpoint {
                host: "127.0.0.1".to_string(),
                port: 37001,
            }],
            local_endpoints: vec!["/tmp/cosim-EcuA.sock".to_string()],
        }));
    }

    #[test]
    fn announcement_reply_round_trip() {
        round_trip(Message::ParticipantAnnouncementReply(
            ParticipantAnnouncementReply::accepted(),
        ));
        round_trip(Message::ParticipantAnnouncementReply(
            ParticipantAnnouncementReply::rejected("name already taken"),
        ));
    }

    #[test]
    fn known_participants_round_trip() {
        round_trip(Message::KnownParticipants(KnownParticipants {
            participants: vec![PeerInfo {
                participant_name: "EcuB".to_string(),
                participant_id: ParticipantId::from_name("EcuB"),
                tcp_endpoints: vec![TcpEndpoint {
                    host: "10.0.0.2".to_string(),
                    port: 9000,
                }],
                local_endpoints: vec![],
            }],
        }));
    }

    #[test]
    fn heartbeat_round_trip() {
        round_trip(Message::Heartbeat);
    }

    #[test]
    fn discovery_event_round_trip() {
        round_trip(Message::ServiceDiscoveryEvent(ServiceDiscoveryEvent {
            kind: DiscoveryEventKind::Created,
            descriptor: sample_descriptor(),
        }));
        round_trip(Message::ServiceDiscoveryEvent(ServiceDiscoveryEvent {
            kind: DiscoveryEventKind::Removed,
            descriptor: sample_descriptor(),
        }));
    }

    #[test]
    fn service_announcement_round_trip() {
        round_trip(Message::ServiceAnnouncement(ServiceAnnouncement {
            services: vec![sample_descriptor(), sample_descriptor()],
        }));
    }

    #[test]
    fn participant_status_round_trip() {
        round_trip(Message::ParticipantStatus(ParticipantStatus {
            participant_name: "EcuA".to_string(),
            state: ParticipantState::Running,
            enter_reason: "system command Run".to_string(),
            enter_time: 1_700_000_000_000_000_000,
            refresh_time: 1_700_000_000_500_000_000,
        }));
    }

    #[test]
    fn commands_round_trip() {
        round_trip(Message::ParticipantCommand(ParticipantCommand {
            target_participant: ParticipantId::from_name("EcuB"),
            kind: ParticipantCommandKind::Restart,
        }));
        round_trip(Message::SystemCommand(SystemCommand {
            kind: SystemCommandKind::AbortSimulation,
        }));
    }

    #[test]
    fn workflow_configuration_round_trip() {
        round_trip(Message::WorkflowConfiguration(WorkflowConfiguration {
            required_participant_names: vec!["EcuA".to_string(), "EcuB".to_string()],
        }));
    }

    #[test]
    fn next_sim_task_round_trip() {
        round_trip(Message::NextSimTask(NextSimTask {
            time_point: SimTime::from_millis(5),
            duration: SimStep::from_millis(1),
        }));
    }

    #[test]
    fn log_record_round_trip() {
        round_trip(Message::LogRecord(LogRecord {
            level: LogLevel::Warn,
            timestamp: 123,
            body: "queue depth high".to_string(),
        }));
    }

    #[test]
    fn payload_kinds_round_trip() {
        round_trip(Message::BusFrame(BusFrame {
            timestamp: SimTime::from_millis(7),
            payload: vec![0xca, 0xfe],
        }));
        round_trip(Message::BusFrameAck(BusFrameAck {
            timestamp: SimTime::from_millis(7),
            status: TransmitStatus::Transmitted,
        }));
        round_trip(Message::DataMessage(DataMessage {
            timestamp: SimTime::ZERO,
            payload: vec![],
        }));
        round_trip(Message::RpcCall(RpcCall {
            timestamp: SimTime::from_millis(1),
            call_uuid: [7; 16],
            payload: vec![0, 0, 0],
        }));
        round_trip(Message::RpcCallReturn(RpcCallReturn {
            timestamp: SimTime::from_millis(2),
            call_uuid: [7; 16],
            payload: vec![100, 100, 100],
        }));
    }

    #[test]
    fn unknown_kind_rejected() {
        let frame = encode_frame(sender(), &Message::Heartbeat);
        let mut body = frame[4..].to_vec();
        body[0] = 0xee;
        assert!(matches!(
            decode_frame(&body),
            Err(CodecError::UnknownKind(0xee))
        ));
    }

    #[test]
    fn truncated_body_rejected() {
        let frame = encode_frame(
            sender(),
            &Message::ParticipantStatus(ParticipantStatus {
                participant_name: "EcuA".to_string(),
                state: ParticipantState::Running,
                enter_reason: String::new(),
                enter_time: 0,
                refresh_time: 0,
            }),
        );
        let body = &frame[4..frame.len() - 1];
        assert!(matches!(
            decode_frame(body),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn trailing_garbage_rejected() {
        let frame = encode_frame(sender(), &Message::Heartbeat);
        let mut body = frame[4..].to_vec();
        body.push(0);
        assert!(matches!(
            decode_frame(&body),
            Err(CodecError::MalformedFrame(_))
        ));
    }
}
