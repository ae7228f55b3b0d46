//! Orchestration messages: status, commands, time sync, log records.

use cosim_types::{ParticipantId, ParticipantState, SimStep, SimTime};
use serde::{Deserialize, Serialize};

/// Per-participant lifecycle status, emitted on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantStatus {
    pub participant_name: String,
    pub state: ParticipantState,
    /// Why the state was entered; carries hook faults verbatim.
    pub enter_reason: String,
    /// Wall-clock nanoseconds since the Unix epoch when the state was entered.
    pub enter_time: i64,
    /// Wall-clock nanoseconds of the most recent refresh of this status.
    pub refresh_time: i64,
}

/// Command addressed to one specific participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantCommand {
    /// Applied only if this matches the local participant id.
    pub target_participant: ParticipantId,
    pub kind: ParticipantCommandKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ParticipantCommandKind {
    Initialize = 1,
    Restart = 2,
    Shutdown = 3,
}

impl ParticipantCommandKind {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Initialize),
            2 => Some(Self::Restart),
            3 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// Command addressed to every participant in the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemCommand {
    pub kind: SystemCommandKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SystemCommandKind {
    Run = 1,
    Stop = 2,
    Shutdown = 3,
    AbortSimulation = 4,
}

impl SystemCommandKind {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Run),
            2 => Some(Self::Stop),
            3 => Some(Self::Shutdown),
            4 => Some(Self::AbortSimulation),
            _ => None,
        }
    }
}

/// Names the participants whose states aggregate into the system state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfiguration {
    pub required_participant_names: Vec<String>,
}

/// Barrier message of the virtual-time coordinator.
///
/// `time_point` is the next point the sender wants to execute at;
/// `duration` is the step it will take after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextSimTask {
    pub time_point: SimTime,
    pub duration: SimStep,
}

/// Severity of a forwarded log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
    Off = 6,
}

impl LogLevel {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Trace),
            1 => Some(Self::Debug),
            2 => Some(Self::Info),
            3 => Some(Self::Warn),
            4 => Some(Self::Error),
            5 => Some(Self::Critical),
            6 => Some(Self::Off),
            _ => None,
        }
    }
}

/// A log record forwarded to participants that enabled remote logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    /// Wall-clock nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub body: String,
}
