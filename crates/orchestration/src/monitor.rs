//! System-state aggregation over per-participant statuses.

use cosim_messages::{ParticipantStatus, WorkflowConfiguration};
use cosim_types::{ParticipantState, SystemState};
use std::collections::HashMap;
use tracing::debug;

/// Folds every received participant status into a single system state.
///
/// Aggregation rule: if any required participant has no status yet the
/// system is `Invalid`; any `Error` dominates; then `Aborting`; otherwise
/// the minimum of the required participants' states by enumeration order.
/// Without a workflow configuration, all known participants are required.
pub struct SystemMonitor {
    statuses: HashMap<String, ParticipantStatus>,
    required: Option<Vec<String>>,
    system_state: SystemState,
}

impl SystemMonitor {
    pub fn new() -> Self {
        Self {
            statuses: HashMap::new(),
            required: None,
            system_state: SystemState::Invalid,
        }
    }

    pub fn system_state(&self) -> SystemState {
        self.system_state
    }

    pub fn participant_status(&self, name: &str) -> Option<&ParticipantStatus> {
        self.statuses.get(name)
    }

    pub fn known_participants(&self) -> impl Iterator<Item = &str> {
        self.statuses.keys().map(String::as_str)
    }

    /// Record a status. Returns the new system state if it changed.
    pub fn on_status(&mut self, status: ParticipantStatus) -> Option<SystemState> {
        self.statuses
            .insert(status.participant_name.clone(), status);
        self.recompute()
    }

    /// Apply a workflow configuration. Participants joining after this is
    /// published are accepted silently.
    pub fn set_workflow(&mut self, workflow: WorkflowConfiguration) -> Option<SystemState> {
        debug!(required = ?workflow.required_participant_names, "workflow configuration set");
        self.required = Some(workflow.required_participant_names);
        self.recompute()
    }

    /// A participant's link went away. A leaving required participant drops
    /// the system back by one state bucket.
    pub fn on_participant_left(&mut self, name: &str) -> Option<SystemState> {
        self.statuses.remove(name);
        let is_required = match &self.required {
            Some(required) => required.iter().any(|r| r == name),
            None => true,
        };
        if !is_required {
            return None;
        }
        let degraded = self.system_state.degraded();
        self.transition_to(degraded)
    }

    fn recompute(&mut self) -> Option<SystemState> {
        let computed = self.aggregate();
        self.transition_to(computed)
    }

    fn transition_to(&mut self, state: SystemState) -> Option<SystemState> {
        if state == self.system_state {
            return None;
        }
        debug!(from = %self.system_state, to = %state, "system state transition");
        self.system_state = state;
        Some(state)
    }

    fn aggregate(&self) -> SystemState {
        let required: Vec<&str> = match &self.required {
            Some(required) => required.iter().map(String::as_str).collect(),
            None => self.statuses.keys().map(String::as_str).collect(),
        };
        if required.is_empty() {
            return SystemState::Invalid;
        }

        let mut minimum: Option<ParticipantState> = None;
        let mut any_aborting = false;
        for name in required {
            let Some(status) = self.statuses.get(name) else {
                return SystemState::Invalid;
            };
            match status.state {
                ParticipantState::Error => return SystemState::Error,
                ParticipantState::Aborting => any_aborting = true,
                state => {
                    minimum = Some(match minimum {
                        Some(current) if current.order() <= state.order() => current,
                        _ => state,
                    });
                }
            }
        }
        if any_aborting {
            return SystemState::Aborting;
        }
        match minimum {
            Some(state) => SystemState::from_participant(state),
            // Every required participant is aborting-or-error; error was
            // handled above.
            None => SystemState::Aborting,
        }
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(name: &str, state: ParticipantState) -> ParticipantStatus {
        ParticipantStatus {
            participant_name: name.to_string(),
            state,
            enter_reason: String::new(),
            enter_time: 0,
            refresh_time: 0,
        }
    }

    fn workflow(names: &[&str]) -> WorkflowConfiguration {
        WorkflowConfiguration {
            required_participant_names: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn unknown_required_participant_keeps_system_invalid() {
        let mut monitor = SystemMonitor::new();
        monitor.set_workflow(workflow(&["A", "B"]));
        monitor.on_status(status("A", ParticipantState::Running));
        assert_eq!(monitor.system_state(), SystemState::Invalid);
    }

    #[test]
    fn system_state_is_minimum_by_order() {
        let mut monitor = SystemMonitor::new();
        monitor.set_workflow(workflow(&["A", "B"]));
        monitor.on_status(status("A", ParticipantState::Running));
        monitor.on_status(status("B", ParticipantState::ReadyToRun));
        assert_eq!(monitor.system_state(), SystemState::ReadyToRun);

        monitor.on_status(status("B", ParticipantState::Running));
        assert_eq!(monitor.system_state(), SystemState::Running);
    }

    #[test]
    fn error_dominates() {
        let mut monitor = SystemMonitor::new();
        monitor.set_workflow(workflow(&["A", "B", "C"]));
        monitor.on_status(status("A", ParticipantState::Running));
        monitor.on_status(status("B", ParticipantState::Running));
        let changed = monitor.on_status(status("C", ParticipantState::Error));
        assert_eq!(changed, Some(SystemState::Error));
    }

    #[test]
    fn aborting_dominates_all_but_error() {
        let mut monitor = SystemMonitor::new();
        monitor.set_workflow(workflow(&["A", "B"]));
        monitor.on_status(status("A", ParticipantState::Aborting));
        monitor.on_status(status("B", ParticipantState::Running));
        assert_eq!(monitor.system_state(), SystemState::Aborting);

        monitor.on_status(status("B", ParticipantState::Error));
        assert_eq!(monitor.system_state(), SystemState::Error);
    }

    #[test]
    fn non_required_participants_are_ignored() {
        let mut monitor = SystemMonitor::new();
        monitor.set_workflow(workflow(&["A"]));
        monitor.on_status(status("A", ParticipantState::Running));
        // A late joiner that is not required does not change the state.
        let changed = monitor.on_status(status("Observer", ParticipantState::Invalid));
        assert_eq!(changed, None);
        assert_eq!(monitor.system_state(), SystemState::Running);
    }

    #[test]
    fn leaving_required_participant_degrades_one_bucket() {
        let mut monitor = SystemMonitor::new();
        monitor.set_workflow(workflow(&["A", "B"]));
        monitor.on_status(status("A", ParticipantState::Running));
        monitor.on_status(status("B", ParticipantState::Running));
        assert_eq!(monitor.system_state(), SystemState::Running);

        let changed = monitor.on_participant_left("B");
        assert_eq!(changed, Some(SystemState::ReadyToRun));
    }

    #[test]
    fn no_workflow_aggregates_all_known() {
        let mut monitor = SystemMonitor::new();
        monitor.on_status(status("A", ParticipantState::ServicesCreated));
        assert_eq!(monitor.system_state(), SystemState::ServicesCreated);
    }
}
