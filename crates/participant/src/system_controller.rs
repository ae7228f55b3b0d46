//! The system controller: domain-wide commands and workflow configuration.

use crate::core::{Core, Internal};
use cosim_messages::{
    Message, ParticipantCommand, ParticipantCommandKind, SystemCommand, SystemCommandKind,
    WorkflowConfiguration,
};
use cosim_orchestration::LifecycleEvent;
use cosim_types::ParticipantId;
use std::sync::Arc;

/// Issues system commands to every participant in the domain.
///
/// Commands do not self-deliver through the router; the local lifecycle is
/// fed directly, off the wire path.
pub struct SystemController {
    core: Arc<Core>,
}

impl SystemController {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    /// Declare which participants the system state aggregates over.
    pub fn set_workflow_configuration(&self, required_participant_names: Vec<String>) {
        let workflow = WorkflowConfiguration {
            required_participant_names,
        };
        self.core.router.broadcast_all(
            self.core.system_descriptor.endpoint(),
            Message::WorkflowConfiguration(workflow.clone()),
        );
        let _ = self.core.internal_tx.send(Internal::SetWorkflow(workflow));
    }

    pub fn run(&self) {
        self.command(SystemCommandKind::Run);
    }

    pub fn stop(&self) {
        self.command(SystemCommandKind::Stop);
    }

    pub fn shutdown(&self) {
        self.command(SystemCommandKind::Shutdown);
    }

    /// Emergency shutdown: every participant runs its abort hook, then goes
    /// straight to `Shutdown`.
    pub fn abort_simulation(&self) {
        self.command(SystemCommandKind::AbortSimulation);
    }

    /// Reinitialize one participant after `Stopped` or `Error`.
    pub fn initialize_participant(&self, participant_name: &str) {
        self.participant_command(participant_name, ParticipantCommandKind::Initialize);
    }

    /// Restart one participant's lifecycle after `Stopped` or `Error`.
    pub fn restart_participant(&self, participant_name: &str) {
        self.participant_command(participant_name, ParticipantCommandKind::Restart);
    }

    /// Shut one participant down.
    pub fn shutdown_participant(&self, participant_name: &str) {
        self.participant_command(participant_name, ParticipantCommandKind::Shutdown);
    }

    fn command(&self, kind: SystemCommandKind) {
        self.core.router.broadcast_all(
            self.core.system_descriptor.endpoint(),
            Message::SystemCommand(SystemCommand { kind }),
        );
        let _ = self
            .core
            .internal_tx
            .send(Internal::LocalSystemCommand(kind));
    }

    fn participant_command(&self, participant_name: &str, kind: ParticipantCommandKind) {
        let target = ParticipantId::from_name(participant_name);
        self.core.router.broadcast_all(
            self.core.system_descriptor.endpoint(),
            Message::ParticipantCommand(ParticipantCommand {
                target_participant: target,
                kind,
            }),
        );
        if target == self.core.id {
            let _ = self
                .core
                .internal_tx
                .send(Internal::Lifecycle(LifecycleEvent::ParticipantCommand(kind)));
        }
    }
}
