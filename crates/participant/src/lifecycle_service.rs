//! The user-facing lifecycle handle.

use crate::core::{Core, Internal, SimTask, INTERNAL_NETWORK, TIME_SYNC_SERVICE};
use crate::error::ParticipantError;
use cosim_orchestration::{HookKind, LifecycleEvent};
use cosim_types::{NetworkType, ParticipantState, ServiceType, SimStep, SimTime};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Drives the participant's lifecycle and owns its simulation task.
///
/// Hooks run on the dispatch thread; they must not block it indefinitely.
pub struct LifecycleService {
    core: Arc<Core>,
}

impl LifecycleService {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ParticipantState {
        self.core.state_cell.state()
    }

    // ─── Hooks ───

    pub fn set_communication_ready_handler(&self, handler: impl FnMut() + Send + 'static) {
        let mut hooks = self.core.hooks.lock().expect("hooks lock");
        hooks.communication_ready = Some(Box::new(handler));
        hooks.communication_ready_async = false;
    }

    /// Async variant: the state machine stays in `CommunicationInitialized`
    /// until [`complete_communication_ready_handler`] is called.
    ///
    /// [`complete_communication_ready_handler`]: Self::complete_communication_ready_handler
    pub fn set_communication_ready_handler_async(&self, handler: impl FnMut() + Send + 'static) {
        let mut hooks = self.core.hooks.lock().expect("hooks lock");
        hooks.communication_ready = Some(Box::new(handler));
        hooks.communication_ready_async = true;
    }

    /// Complete a pending asynchronous communication-ready hook.
    pub fn complete_communication_ready_handler(&self) -> Result<(), ParticipantError> {
        if !self
            .core
            .hooks
            .lock()
            .expect("hooks lock")
            .communication_ready_async
        {
            return Err(ParticipantError::InvalidState(
                "no asynchronous communication-ready handler pending".into(),
            ));
        }
        self.send(LifecycleEvent::HookCompleted {
            hook: HookKind::CommunicationReady,
            fault: None,
        });
        Ok(())
    }

    pub fn set_starting_handler(&self, handler: impl FnMut() + Send + 'static) {
        self.core.hooks.lock().expect("hooks lock").starting = Some(Box::new(handler));
    }

    pub fn set_stop_handler(&self, handler: impl FnMut() + Send + 'static) {
        self.core.hooks.lock().expect("hooks lock").stop = Some(Box::new(handler));
    }

    pub fn set_shutdown_handler(&self, handler: impl FnMut() + Send + 'static) {
        self.core.hooks.lock().expect("hooks lock").shutdown = Some(Box::new(handler));
    }

    pub fn set_abort_handler(&self, handler: impl FnMut() + Send + 'static) {
        self.core.hooks.lock().expect("hooks lock").abort = Some(Box::new(handler));
    }

    // ─── Simulation task ───

    /// Install the per-tick simulation task and make this participant
    /// synchronized. Must be called before the lifecycle starts.
    pub fn set_simulation_step(
        &self,
        step: Duration,
        task: impl FnMut(SimTime, SimStep) + Send + 'static,
    ) -> Result<(), ParticipantError> {
        self.install_sim_task(step, Box::new(task), false)
    }

    /// Async variant: each tick stays pending until
    /// [`complete_simulation_step`](Self::complete_simulation_step).
    pub fn set_simulation_step_async(
        &self,
        step: Duration,
        task: impl FnMut(SimTime, SimStep) + Send + 'static,
    ) -> Result<(), ParticipantError> {
        self.install_sim_task(step, Box::new(task), true)
    }

    fn install_sim_task(
        &self,
        step: Duration,
        callback: Box<dyn FnMut(SimTime, SimStep) + Send>,
        is_async: bool,
    ) -> Result<(), ParticipantError> {
        if step.is_zero() {
            return Err(ParticipantError::InvalidArgument(
                "simulation step must be positive".into(),
            ));
        }
        *self.core.sim_task.lock().expect("sim task lock") = Some(SimTask { callback, is_async });
        self.core.time.set_synchronized();
        self.send_internal(Internal::ConfigureTimeSync {
            step: SimStep::from(step),
        });

        // Publish the time-sync controller so peers count us into the
        // synchronized set. Idempotent across repeated calls.
        let mut descriptor_slot = self
            .core
            .timesync_descriptor
            .lock()
            .expect("timesync descriptor lock");
        if descriptor_slot.is_none() {
            let descriptor = self.core.describe(
                INTERNAL_NETWORK,
                TIME_SYNC_SERVICE,
                ServiceType::InternalController,
                NetworkType::Undefined,
                BTreeMap::new(),
            );
            self.core.publish_service(&descriptor)?;
            *descriptor_slot = Some(descriptor);
        }
        Ok(())
    }

    /// Finish the pending tick of an asynchronous simulation task.
    /// Returns immediately.
    pub fn complete_simulation_step(&self) {
        self.send_internal(Internal::CompleteSimStep);
    }

    // ─── Lifecycle control ───

    /// Start the lifecycle and block until it reaches a terminal state.
    pub fn start_lifecycle(&self) -> Result<ParticipantState, ParticipantError> {
        self.start_lifecycle_detached()?;
        Ok(self.wait_for_lifecycle_to_complete())
    }

    /// Start the lifecycle without blocking; pair with
    /// [`wait_for_lifecycle_to_complete`](Self::wait_for_lifecycle_to_complete).
    pub fn start_lifecycle_detached(&self) -> Result<(), ParticipantError> {
        self.send(LifecycleEvent::Start);
        Ok(())
    }

    /// Block until the lifecycle reaches a terminal state.
    pub fn wait_for_lifecycle_to_complete(&self) -> ParticipantState {
        self.core.state_cell.wait_for_completion()
    }

    /// Request a stop (legal while `Running` or `Paused`).
    pub fn stop(&self) {
        self.send(LifecycleEvent::UserStop);
    }

    /// Pause the simulation. The reason must not be empty.
    pub fn pause(&self, reason: impl Into<String>) -> Result<(), ParticipantError> {
        let reason = reason.into();
        if reason.is_empty() {
            return Err(ParticipantError::InvalidArgument(
                "pause requires a non-empty reason".into(),
            ));
        }
        self.send(LifecycleEvent::UserPause { reason });
        Ok(())
    }

    /// Continue after a pause.
    pub fn continue_simulation(&self) {
        self.send(LifecycleEvent::UserContinue);
    }

    /// Report a user-level error; transitions the lifecycle to `Error`.
    pub fn report_error(&self, reason: impl Into<String>) {
        self.send(LifecycleEvent::UserReportError {
            reason: reason.into(),
        });
    }

    fn send(&self, event: LifecycleEvent) {
        self.send_internal(Internal::Lifecycle(event));
    }

    fn send_internal(&self, event: Internal) {
        let _ = self.core.internal_tx.send(event);
    }
}
