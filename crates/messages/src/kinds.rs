//! Wire kind bytes.

/// Kind byte of every framed message: `[u32 length][u8 kind][body]`.
///
/// Values are part of the wire protocol and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    ParticipantAnnouncement = 1,
    ParticipantAnnouncementReply = 2,
    KnownParticipants = 3,
    Heartbeat = 4,
    ServiceDiscoveryEvent = 5,
    ServiceAnnouncement = 6,
    ParticipantStatus = 7,
    ParticipantCommand = 8,
    SystemCommand = 9,
    WorkflowConfiguration = 10,
    NextSimTask = 11,
    LogRecord = 12,
    BusFrame = 13,
    BusFrameAck = 14,
    DataMessage = 15,
    RpcCall = 16,
    RpcCallReturn = 17,
}

impl MessageKind {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ParticipantAnnouncement),
            2 => Some(Self::ParticipantAnnouncementReply),
            3 => Some(Self::KnownParticipants),
            4 => Some(Self::Heartbeat),
            5 => Some(Self::ServiceDiscoveryEvent),
            6 => Some(Self::ServiceAnnouncement),
            7 => Some(Self::ParticipantStatus),
            8 => Some(Self::ParticipantCommand),
            9 => Some(Self::SystemCommand),
            10 => Some(Self::WorkflowConfiguration),
            11 => Some(Self::NextSimTask),
            12 => Some(Self::LogRecord),
            13 => Some(Self::BusFrame),
            14 => Some(Self::BusFrameAck),
            15 => Some(Self::DataMessage),
            16 => Some(Self::RpcCall),
            17 => Some(Self::RpcCallReturn),
            _ => None,
        }
    }

    pub fn type_name(self) -> &'static str {
        match self {
            Self::ParticipantAnnouncement => "ParticipantAnnouncement",
            Self::ParticipantAnnouncementReply => "ParticipantAnnouncementReply",
            Self::KnownParticipants => "KnownParticipants",
            Self::Heartbeat => "Heartbeat",
            Self::ServiceDiscoveryEvent => "ServiceDiscoveryEvent",
            Self::ServiceAnnouncement => "ServiceAnnouncement",
            Self::ParticipantStatus => "ParticipantStatus",
            Self::ParticipantCommand => "ParticipantCommand",
            Self::SystemCommand => "SystemCommand",
            Self::WorkflowConfiguration => "WorkflowConfiguration",
            Self::NextSimTask => "NextSimTask",
            Self::LogRecord => "LogRecord",
            Self::BusFrame => "BusFrame",
            Self::BusFrameAck => "BusFrameAck",
            Self::DataMessage => "DataMessage",
            Self::RpcCall => "RpcCall",
            Self::RpcCallReturn => "RpcCallReturn",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_bytes_round_trip() {
        for raw in 1..=17u8 {
            let kind = MessageKind::from_wire(raw).expect("assigned kind byte");
            assert_eq!(kind as u8, raw);
        }
        assert_eq!(MessageKind::from_wire(0), None);
        assert_eq!(MessageKind::from_wire(18), None);
    }
}
