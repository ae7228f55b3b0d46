//! Message types exchanged between cosim participants.
//!
//! Every wire-level kind is a variant of the [`Message`] discriminated union:
//! handshake and registry messages, service discovery, orchestration
//! (status, commands, next-sim-task), remote log records, and the payload
//! kinds (bus frames and acks, pub/sub data, RPC). The codec decides the
//! kind byte from the variant; dispatch on receive is a flat match over it.

mod handshake;
mod kinds;
mod orchestration;
mod payload;

pub use handshake::{
    KnownParticipants, ParticipantAnnouncement, ParticipantAnnouncementReply, PeerInfo,
    ProtocolVersion, TcpEndpoint, CURRENT_PROTOCOL_VERSION,
};
pub use kinds::MessageKind;
pub use orchestration::{
    LogLevel, LogRecord, NextSimTask, ParticipantCommand, ParticipantCommandKind,
    ParticipantStatus, SystemCommand, SystemCommandKind, WorkflowConfiguration,
};
pub use payload::{
    BusFrame, BusFrameAck, DataMessage, DiscoveryEventKind, RpcCall, RpcCallReturn,
    ServiceAnnouncement, ServiceDiscoveryEvent, TransmitStatus,
};

use cosim_types::EndpointAddress;

/// A message together with the wire-form address of the sending service.
///
/// `from` is filled in on receive from the frame envelope; receivers resolve
/// it back to a full descriptor via the discovery index.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressedMessage {
    pub from: EndpointAddress,
    pub message: Message,
}

/// All wire-level message kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    // ─── Connection handshake & registry protocol ───
    ParticipantAnnouncement(ParticipantAnnouncement),
    ParticipantAnnouncementReply(ParticipantAnnouncementReply),
    KnownParticipants(KnownParticipants),
    /// Keepalive. Empty body; never dispatched past the link.
    Heartbeat,

    // ─── Service discovery ───
    ServiceDiscoveryEvent(ServiceDiscoveryEvent),
    ServiceAnnouncement(ServiceAnnouncement),

    // ─── Orchestration ───
    ParticipantStatus(ParticipantStatus),
    ParticipantCommand(ParticipantCommand),
    SystemCommand(SystemCommand),
    WorkflowConfiguration(WorkflowConfiguration),
    NextSimTask(NextSimTask),
    LogRecord(LogRecord),

    // ─── Payload traffic ───
    BusFrame(BusFrame),
    BusFrameAck(BusFrameAck),
    DataMessage(DataMessage),
    RpcCall(RpcCall),
    RpcCallReturn(RpcCallReturn),
}

impl Message {
    /// The wire kind byte for this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ParticipantAnnouncement(_) => MessageKind::ParticipantAnnouncement,
            Message::ParticipantAnnouncementReply(_) => MessageKind::ParticipantAnnouncementReply,
            Message::KnownParticipants(_) => MessageKind::KnownParticipants,
            Message::Heartbeat => MessageKind::Heartbeat,
            Message::ServiceDiscoveryEvent(_) => MessageKind::ServiceDiscoveryEvent,
            Message::ServiceAnnouncement(_) => MessageKind::ServiceAnnouncement,
            Message::ParticipantStatus(_) => MessageKind::ParticipantStatus,
            Message::ParticipantCommand(_) => MessageKind::ParticipantCommand,
            Message::SystemCommand(_) => MessageKind::SystemCommand,
            Message::WorkflowConfiguration(_) => MessageKind::WorkflowConfiguration,
            Message::NextSimTask(_) => MessageKind::NextSimTask,
            Message::LogRecord(_) => MessageKind::LogRecord,
            Message::BusFrame(_) => MessageKind::BusFrame,
            Message::BusFrameAck(_) => MessageKind::BusFrameAck,
            Message::DataMessage(_) => MessageKind::DataMessage,
            Message::RpcCall(_) => MessageKind::RpcCall,
            Message::RpcCallReturn(_) => MessageKind::RpcCallReturn,
        }
    }

    /// Human-readable name of this message kind, for logs.
    pub fn type_name(&self) -> &'static str {
        self.kind().type_name()
    }

    /// Whether this kind is delivered to local receivers on the emitting
    /// participant. Bus frames and payload traffic self-deliver; commands
    /// and status do not (the local monitor is fed directly by the
    /// lifecycle service, off the wire path).
    pub fn self_delivering(&self) -> bool {
        matches!(
            self,
            Message::BusFrame(_)
                | Message::BusFrameAck(_)
                | Message::DataMessage(_)
                | Message::RpcCall(_)
                | Message::RpcCallReturn(_)
        )
    }
}
