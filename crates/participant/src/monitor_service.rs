//! The user-facing system monitor handle.

use crate::core::Core;
use cosim_messages::ParticipantStatus;
use cosim_types::SystemState;
use std::sync::Arc;

/// Observes participant statuses and the aggregated system state.
pub struct SystemMonitorHandle {
    core: Arc<Core>,
}

impl SystemMonitorHandle {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    /// The current aggregated system state.
    pub fn system_state(&self) -> SystemState {
        self.core.system_state()
    }

    /// Register a system-state handler. It observes the current state
    /// immediately, then every transition, in registration order on the
    /// dispatch thread.
    pub fn add_system_state_handler(&self, mut handler: impl FnMut(SystemState) + Send + 'static) {
        handler(self.core.system_state());
        self.core
            .monitor_handlers
            .lock()
            .expect("monitor lock")
            .system_state
            .push(Box::new(handler));
    }

    /// Register a participant-status handler. It observes every status
    /// received, local and remote.
    pub fn add_participant_status_handler(
        &self,
        handler: impl FnMut(&ParticipantStatus) + Send + 'static,
    ) {
        self.core
            .monitor_handlers
            .lock()
            .expect("monitor lock")
            .participant_status
            .push(Box::new(handler));
    }
}
