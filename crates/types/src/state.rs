//! Participant and system state enumerations.
//!
//! The participant lifecycle follows a canonical order; the system state is
//! derived as the minimum over all required participants with `Error` and
//! `Aborting` dominant. Discriminants are spaced by 10 so the enumeration
//! order is explicit on the wire and stable across versions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a single participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ParticipantState {
    /// No status received yet.
    Invalid = 0,
    /// All controllers have been created.
    ServicesCreated = 10,
    /// Peer connections are being established.
    CommunicationInitializing = 20,
    /// All peer connections are up; communication is possible.
    CommunicationInitialized = 30,
    /// The communication-ready hook has completed.
    ReadyToRun = 40,
    Running = 50,
    Paused = 60,
    Stopping = 70,
    Stopped = 80,
    /// Terminal except for shutdown or abort.
    Error = 90,
    ShuttingDown = 100,
    Shutdown = 110,
    /// Emergency shutdown in progress.
    Aborting = 120,
}

impl ParticipantState {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Invalid),
            10 => Some(Self::ServicesCreated),
            20 => Some(Self::CommunicationInitializing),
            30 => Some(Self::CommunicationInitialized),
            40 => Some(Self::ReadyToRun),
            50 => Some(Self::Running),
            60 => Some(Self::Paused),
            70 => Some(Self::Stopping),
            80 => Some(Self::Stopped),
            90 => Some(Self::Error),
            100 => Some(Self::ShuttingDown),
            110 => Some(Self::Shutdown),
            120 => Some(Self::Aborting),
            _ => None,
        }
    }

    /// Position of this state on the canonical (non-error) path, used for
    /// minimum aggregation. `Error` and `Aborting` are handled by dominance
    /// before ordering applies.
    pub fn order(self) -> u8 {
        self as u8
    }

    /// Whether a participant in this state still takes part in time
    /// synchronization and message exchange.
    pub fn is_operational(self) -> bool {
        !matches!(
            self,
            ParticipantState::Error | ParticipantState::Aborting | ParticipantState::Shutdown
        )
    }
}

impl fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParticipantState::Invalid => "Invalid",
            ParticipantState::ServicesCreated => "ServicesCreated",
            ParticipantState::CommunicationInitializing => "CommunicationInitializing",
            ParticipantState::CommunicationInitialized => "CommunicationInitialized",
            ParticipantState::ReadyToRun => "ReadyToRun",
            ParticipantState::Running => "Running",
            ParticipantState::Paused => "Paused",
            ParticipantState::Stopping => "Stopping",
            ParticipantState::Stopped => "Stopped",
            ParticipantState::Error => "Error",
            ParticipantState::ShuttingDown => "ShuttingDown",
            ParticipantState::Shutdown => "Shutdown",
            ParticipantState::Aborting => "Aborting",
        };
        f.write_str(name)
    }
}

/// Aggregated state of the whole simulation.
///
/// Derived from the required participants' states: any `Error` dominates,
/// then `Aborting`, then the minimum by enumeration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SystemState {
    Invalid = 0,
    ServicesCreated = 10,
    CommunicationInitializing = 20,
    CommunicationInitialized = 30,
    ReadyToRun = 40,
    Running = 50,
    Paused = 60,
    Stopping = 70,
    Stopped = 80,
    Error = 90,
    ShuttingDown = 100,
    Shutdown = 110,
    Aborting = 120,
}

impl SystemState {
    /// Map a participant state onto the corresponding system-state bucket.
    pub fn from_participant(state: ParticipantState) -> Self {
        match state {
            ParticipantState::Invalid => SystemState::Invalid,
            ParticipantState::ServicesCreated => SystemState::ServicesCreated,
            ParticipantState::CommunicationInitializing => SystemState::CommunicationInitializing,
            ParticipantState::CommunicationInitialized => SystemState::CommunicationInitialized,
            ParticipantState::ReadyToRun => SystemState::ReadyToRun,
            ParticipantState::Running => SystemState::Running,
            ParticipantState::Paused => SystemState::Paused,
            ParticipantState::Stopping => SystemState::Stopping,
            ParticipantState::Stopped => SystemState::Stopped,
            ParticipantState::Error => SystemState::Error,
            ParticipantState::ShuttingDown => SystemState::ShuttingDown,
            ParticipantState::Shutdown => SystemState::Shutdown,
            ParticipantState::Aborting => SystemState::Aborting,
        }
    }

    /// The previous bucket on the canonical path. Used when a required
    /// participant leaves: the system drops back by one state bucket.
    pub fn degraded(self) -> Self {
        match self {
            SystemState::Invalid | SystemState::ServicesCreated => SystemState::Invalid,
            SystemState::CommunicationInitializing => SystemState::ServicesCreated,
            SystemState::CommunicationInitialized => SystemState::CommunicationInitializing,
            SystemState::ReadyToRun => SystemState::CommunicationInitialized,
            SystemState::Running => SystemState::ReadyToRun,
            SystemState::Paused => SystemState::Running,
            SystemState::Stopping => SystemState::Running,
            SystemState::Stopped => SystemState::Stopping,
            SystemState::ShuttingDown => SystemState::Stopped,
            SystemState::Shutdown => SystemState::ShuttingDown,
            SystemState::Error => SystemState::Error,
            SystemState::Aborting => SystemState::Aborting,
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SystemState::Invalid => "Invalid",
            SystemState::ServicesCreated => "ServicesCreated",
            SystemState::CommunicationInitializing => "CommunicationInitializing",
            SystemState::CommunicationInitialized => "CommunicationInitialized",
            SystemState::ReadyToRun => "ReadyToRun",
            SystemState::Running => "Running",
            SystemState::Paused => "Paused",
            SystemState::Stopping => "Stopping",
            SystemState::Stopped => "Stopped",
            SystemState::Error => "Error",
            SystemState::ShuttingDown => "ShuttingDown",
            SystemState::Shutdown => "Shutdown",
            SystemState::Aborting => "Aborting",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_order_is_monotonic() {
        let path = [
            ParticipantState::Invalid,
            ParticipantState::ServicesCreated,
            ParticipantState::CommunicationInitializing,
            ParticipantState::CommunicationInitialized,
            ParticipantState::ReadyToRun,
            ParticipantState::Running,
            ParticipantState::Paused,
            ParticipantState::Stopping,
            ParticipantState::Stopped,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].order() < pair[1].order());
        }
    }

    #[test]
    fn state_wire_round_trip() {
        for raw in 0..=255u8 {
            if let Some(state) = ParticipantState::from_wire(raw) {
                assert_eq!(state as u8, raw);
            }
        }
        assert_eq!(ParticipantState::from_wire(11), None);
    }

    #[test]
    fn degraded_steps_back_one_bucket() {
        assert_eq!(SystemState::Running.degraded(), SystemState::ReadyToRun);
        assert_eq!(SystemState::Invalid.degraded(), SystemState::Invalid);
        assert_eq!(SystemState::Error.degraded(), SystemState::Error);
    }
}
