//! The per-participant lifecycle state machine.
//!
//! Transitions are driven by user API calls, inbound system/participant
//! commands, and hook completions. Every transition emits a fresh status
//! before any user hook runs. Deviations from the canonical order force the
//! state to `Error` with a reason naming the attempted transition; nothing
//! here panics or throws on misuse.

use cosim_messages::{ParticipantCommandKind, SystemCommandKind};
use cosim_types::ParticipantState;
use tracing::{debug, warn};

/// User-suppliable lifecycle hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    CommunicationReady,
    Starting,
    Stop,
    Shutdown,
    Abort,
}

/// Which hooks the user registered. Unregistered hooks complete immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookSet {
    pub communication_ready: bool,
    pub starting: bool,
    pub stop: bool,
    pub shutdown: bool,
    pub abort: bool,
}

impl HookSet {
    fn has(&self, hook: HookKind) -> bool {
        match hook {
            HookKind::CommunicationReady => self.communication_ready,
            HookKind::Starting => self.starting,
            HookKind::Stop => self.stop,
            HookKind::Shutdown => self.shutdown,
            HookKind::Abort => self.abort,
        }
    }
}

/// Inputs to the lifecycle state machine.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// `StartLifecycle` was called.
    Start,
    /// The connection manager reports all peer links up.
    CommunicationEstablished,
    /// A hook finished, inline or via its async completer. A fault carries
    /// the user error verbatim.
    HookCompleted {
        hook: HookKind,
        fault: Option<String>,
    },
    UserStop,
    UserPause { reason: String },
    UserContinue,
    UserReportError { reason: String },
    SystemCommand(SystemCommandKind),
    /// Already filtered by target id; only commands addressed to this
    /// participant arrive here.
    ParticipantCommand(ParticipantCommandKind),
}

/// Outputs of the lifecycle state machine, executed by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleAction {
    /// Broadcast a fresh participant status and feed the local monitor.
    EmitStatus {
        state: ParticipantState,
        reason: String,
    },
    /// Run a user hook (inline for sync hooks; async hooks complete later).
    InvokeHook(HookKind),
    StartTimeSync,
    StopTimeSync,
    /// The lifecycle reached a terminal state; unblock `StartLifecycle`.
    Finished(ParticipantState),
}

/// The lifecycle state machine proper.
///
/// Synchronous and I/O-free; the runtime owns the only mutable reference,
/// which makes the state word effectively single-writer.
pub struct LifecycleStateMachine {
    participant_name: String,
    state: ParticipantState,
    hooks: HookSet,
    /// Hook whose completion gates the next transition.
    pending_hook: Option<HookKind>,
    started: bool,
}

impl LifecycleStateMachine {
    pub fn new(participant_name: impl Into<String>, hooks: HookSet) -> Self {
        Self {
            participant_name: participant_name.into(),
            state: ParticipantState::Invalid,
            hooks,
            pending_hook: None,
            started: false,
        }
    }

    pub fn state(&self) -> ParticipantState {
        self.state
    }

    pub fn set_hooks(&mut self, hooks: HookSet) {
        self.hooks = hooks;
    }

    /// Process one event, returning the actions to perform in order.
    pub fn handle(&mut self, event: LifecycleEvent) -> Vec<LifecycleAction> {
        match event {
            LifecycleEvent::Start => self.on_start(),
            LifecycleEvent::CommunicationEstablished => self.on_communication_established(),
            LifecycleEvent::HookCompleted { hook, fault } => self.on_hook_completed(hook, fault),
            LifecycleEvent::UserStop => self.on_stop("user requested stop"),
            LifecycleEvent::UserPause { reason } => self.on_pause(reason),
            LifecycleEvent::UserContinue => self.on_continue(),
            LifecycleEvent::UserReportError { reason } => self.to_error(reason),
            LifecycleEvent::SystemCommand(kind) => self.on_system_command(kind),
            LifecycleEvent::ParticipantCommand(kind) => self.on_participant_command(kind),
        }
    }

    // ─── Event handlers ───

    fn on_start(&mut self) -> Vec<LifecycleAction> {
        if self.started {
            return self.invalid_transition("Start while already started");
        }
        self.started = true;
        let mut actions = self.enter(ParticipantState::ServicesCreated, "lifecycle started");
        actions.extend(self.enter(
            ParticipantState::CommunicationInitializing,
            "connecting to peers",
        ));
        actions
    }

    fn on_communication_established(&mut self) -> Vec<LifecycleAction> {
        if self.state != ParticipantState::CommunicationInitializing {
            // Late signal after an error or abort; nothing to do.
            return Vec::new();
        }
        let mut actions = self.enter(
            ParticipantState::CommunicationInitialized,
            "all peer links up",
        );
        actions.extend(self.invoke_or_skip(HookKind::CommunicationReady));
        actions
    }

    fn on_hook_completed(
        &mut self,
        hook: HookKind,
        fault: Option<String>,
    ) -> Vec<LifecycleAction> {
        if self.pending_hook != Some(hook) {
            debug!(
                participant = %self.participant_name,
                ?hook,
                "stale hook completion ignored"
            );
            return Vec::new();
        }
        self.pending_hook = None;

        if let Some(fault) = fault {
            // The abort path still terminates on a faulty hook.
            if self.state == ParticipantState::Aborting {
                warn!(participant = %self.participant_name, %fault, "abort hook faulted");
                return self.finish_shutdown("aborted (abort hook faulted)");
            }
            return self.to_error(fault);
        }

        // A hook that drove the machine to Error (e.g. a Stop hook calling
        // ReportError) leaves the state at Error.
        if self.state == ParticipantState::Error {
            return Vec::new();
        }

        match hook {
            HookKind::CommunicationReady => {
                self.enter(ParticipantState::ReadyToRun, "communication ready")
            }
            HookKind::Starting => Vec::new(),
            HookKind::Stop => {
                let mut actions = self.enter(ParticipantState::Stopped, "stop completed");
                actions.extend(self.enter(
                    ParticipantState::ShuttingDown,
                    "shutting down after stop",
                ));
                actions.extend(self.invoke_or_skip(HookKind::Shutdown));
                actions
            }
            HookKind::Shutdown => self.finish_shutdown("shutdown completed"),
            HookKind::Abort => self.finish_shutdown("aborted"),
        }
    }

    fn on_system_command(&mut self, kind: SystemCommandKind) -> Vec<LifecycleAction> {
        // A participant whose lifecycle never started does not take part in
        // orchestration (e.g. a passive monitor or system controller).
        if !self.started {
            return Vec::new();
        }
        match kind {
            SystemCommandKind::Run => self.on_run(),
            SystemCommandKind::Stop => self.on_stop("system command Stop"),
            SystemCommandKind::Shutdown => self.on_shutdown("system command Shutdown"),
            SystemCommandKind::AbortSimulation => self.on_abort(),
        }
    }

    fn on_participant_command(&mut self, kind: ParticipantCommandKind) -> Vec<LifecycleAction> {
        if !self.started {
            return Vec::new();
        }
        match kind {
            ParticipantCommandKind::Initialize | ParticipantCommandKind::Restart => {
                self.on_reinitialize()
            }
            ParticipantCommandKind::Shutdown => self.on_shutdown("participant command Shutdown"),
        }
    }

    fn on_run(&mut self) -> Vec<LifecycleAction> {
        if self.state != ParticipantState::ReadyToRun {
            return self.invalid_transition("Run");
        }
        let mut actions = self.enter(ParticipantState::Running, "system command Run");
        actions.push(LifecycleAction::StartTimeSync);
        actions.extend(self.invoke_or_skip(HookKind::Starting));
        actions
    }

    fn on_stop(&mut self, reason: &str) -> Vec<LifecycleAction> {
        match self.state {
            ParticipantState::Running | ParticipantState::Paused => {
                let mut actions = vec![LifecycleAction::StopTimeSync];
                actions.extend(self.enter(ParticipantState::Stopping, reason));
                actions.extend(self.invoke_or_skip(HookKind::Stop));
                actions
            }
            // A stop command racing a finished or failed run is not a fault.
            ParticipantState::Stopping
            | ParticipantState::Stopped
            | ParticipantState::ShuttingDown
            | ParticipantState::Shutdown
            | ParticipantState::Error
            | ParticipantState::Aborting => Vec::new(),
            _ => self.invalid_transition("Stop"),
        }
    }

    fn on_pause(&mut self, reason: String) -> Vec<LifecycleAction> {
        if self.state != ParticipantState::Running {
            return self.invalid_transition("Pause");
        }
        let mut actions = vec![LifecycleAction::StopTimeSync];
        actions.extend(self.enter(ParticipantState::Paused, &reason));
        actions
    }

    fn on_continue(&mut self) -> Vec<LifecycleAction> {
        if self.state != ParticipantState::Paused {
            return self.invalid_transition("Continue");
        }
        let mut actions = self.enter(ParticipantState::Running, "continued");
        actions.push(LifecycleAction::StartTimeSync);
        actions
    }

    fn on_shutdown(&mut self, reason: &str) -> Vec<LifecycleAction> {
        match self.state {
            ParticipantState::Stopped | ParticipantState::Error => {
                let mut actions = self.enter(ParticipantState::ShuttingDown, reason);
                actions.extend(self.invoke_or_skip(HookKind::Shutdown));
                actions
            }
            ParticipantState::ShuttingDown | ParticipantState::Shutdown => Vec::new(),
            _ => self.invalid_transition("Shutdown"),
        }
    }

    fn on_abort(&mut self) -> Vec<LifecycleAction> {
        if matches!(
            self.state,
            ParticipantState::Shutdown | ParticipantState::Aborting
        ) {
            return Vec::new();
        }
        let mut actions = vec![LifecycleAction::StopTimeSync];
        actions.extend(self.enter(ParticipantState::Aborting, "system command AbortSimulation"));
        actions.extend(self.invoke_or_skip(HookKind::Abort));
        actions
    }

    fn on_reinitialize(&mut self) -> Vec<LifecycleAction> {
        match self.state {
            ParticipantState::Stopped | ParticipantState::Error => {
                let mut actions = self.enter(
                    ParticipantState::CommunicationInitializing,
                    "reinitializing",
                );
                actions.extend(self.on_communication_established());
                actions
            }
            _ => self.invalid_transition("Initialize"),
        }
    }

    // ─── Transition helpers ───

    /// Enter a state and emit its status. The status action precedes any
    /// hook invocation queued by the caller.
    fn enter(&mut self, state: ParticipantState, reason: &str) -> Vec<LifecycleAction> {
        debug!(
            participant = %self.participant_name,
            from = %self.state,
            to = %state,
            reason,
            "lifecycle transition"
        );
        self.state = state;
        vec![LifecycleAction::EmitStatus {
            state,
            reason: reason.to_string(),
        }]
    }

    fn invoke_or_skip(&mut self, hook: HookKind) -> Vec<LifecycleAction> {
        if self.hooks.has(hook) {
            self.pending_hook = Some(hook);
            vec![LifecycleAction::InvokeHook(hook)]
        } else {
            // No hook registered: complete inline.
            self.pending_hook = Some(hook);
            self.on_hook_completed(hook, None)
        }
    }

    fn to_error(&mut self, reason: String) -> Vec<LifecycleAction> {
        if self.state == ParticipantState::Error {
            return Vec::new();
        }
        warn!(participant = %self.participant_name, %reason, "entering Error state");
        let mut actions = vec![LifecycleAction::StopTimeSync];
        actions.extend(self.enter(ParticipantState::Error, &reason));
        actions
    }

    fn invalid_transition(&mut self, attempted: &str) -> Vec<LifecycleAction> {
        self.to_error(format!(
            "invalid transition: {attempted} requested in state {}",
            self.state
        ))
    }

    fn finish_shutdown(&mut self, reason: &str) -> Vec<LifecycleAction> {
        let mut actions = self.enter(ParticipantState::Shutdown, reason);
        actions.push(LifecycleAction::Finished(ParticipantState::Shutdown));
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states(actions: &[LifecycleAction]) -> Vec<ParticipantState> {
        actions
            .iter()
            .filter_map(|a| match a {
                LifecycleAction::EmitStatus { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn machine(hooks: HookSet) -> LifecycleStateMachine {
        LifecycleStateMachine::new("P", hooks)
    }

    /// Drive a hookless machine through the full canonical path.
    #[test]
    fn canonical_path_with_external_stop() {
        let mut sm = machine(HookSet::default());
        let mut observed = Vec::new();

        observed.extend(states(&sm.handle(LifecycleEvent::Start)));
        observed.extend(states(&sm.handle(LifecycleEvent::CommunicationEstablished)));
        observed.extend(states(
            &sm.handle(LifecycleEvent::SystemCommand(SystemCommandKind::Run)),
        ));
        observed.extend(states(
            &sm.handle(LifecycleEvent::SystemCommand(SystemCommandKind::Stop)),
        ));

        assert_eq!(
            observed,
            vec![
                ParticipantState::ServicesCreated,
                ParticipantState::CommunicationInitializing,
                ParticipantState::CommunicationInitialized,
                ParticipantState::ReadyToRun,
                ParticipantState::Running,
                ParticipantState::Stopping,
                ParticipantState::Stopped,
                ParticipantState::ShuttingDown,
                ParticipantState::Shutdown,
            ]
        );
        assert_eq!(sm.state(), ParticipantState::Shutdown);
    }

    #[test]
    fn registered_hooks_gate_transitions() {
        let mut sm = machine(HookSet {
            communication_ready: true,
            ..Default::default()
        });
        sm.handle(LifecycleEvent::Start);
        let actions = sm.handle(LifecycleEvent::CommunicationEstablished);
        assert!(actions.contains(&LifecycleAction::InvokeHook(HookKind::CommunicationReady)));
        // Blocked until the hook completes.
        assert_eq!(sm.state(), ParticipantState::CommunicationInitialized);

        let actions = sm.handle(LifecycleEvent::HookCompleted {
            hook: HookKind::CommunicationReady,
            fault: None,
        });
        assert_eq!(states(&actions), vec![ParticipantState::ReadyToRun]);
    }

    #[test]
    fn run_before_ready_is_invalid_transition() {
        let mut sm = machine(HookSet::default());
        sm.handle(LifecycleEvent::Start);
        // No CommunicationEstablished yet.
        let actions = sm.handle(LifecycleEvent::SystemCommand(SystemCommandKind::Run));
        assert_eq!(states(&actions), vec![ParticipantState::Error]);
        match &actions[1] {
            LifecycleAction::EmitStatus { reason, .. } => {
                assert!(reason.contains("Run"), "reason names the attempted transition");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn pause_requires_running_and_continue_requires_paused() {
        let mut sm = machine(HookSet::default());
        sm.handle(LifecycleEvent::Start);
        sm.handle(LifecycleEvent::CommunicationEstablished);
        sm.handle(LifecycleEvent::SystemCommand(SystemCommandKind::Run));

        let actions = sm.handle(LifecycleEvent::UserPause {
            reason: "breakpoint".to_string(),
        });
        assert_eq!(states(&actions), vec![ParticipantState::Paused]);
        assert!(actions.contains(&LifecycleAction::StopTimeSync));

        let actions = sm.handle(LifecycleEvent::UserContinue);
        assert_eq!(states(&actions), vec![ParticipantState::Running]);
        assert!(actions.contains(&LifecycleAction::StartTimeSync));

        // Continue while running deviates from the canonical order.
        let actions = sm.handle(LifecycleEvent::UserContinue);
        assert_eq!(states(&actions), vec![ParticipantState::Error]);
    }

    #[test]
    fn stop_hook_reporting_error_leaves_error_state() {
        let mut sm = machine(HookSet {
            stop: true,
            ..Default::default()
        });
        sm.handle(LifecycleEvent::Start);
        sm.handle(LifecycleEvent::CommunicationEstablished);
        sm.handle(LifecycleEvent::SystemCommand(SystemCommandKind::Run));
        sm.handle(LifecycleEvent::SystemCommand(SystemCommandKind::Stop));
        assert_eq!(sm.state(), ParticipantState::Stopping);

        // The hook body calls ReportError, then the hook returns normally.
        sm.handle(LifecycleEvent::UserReportError {
            reason: "stop handler failed".to_string(),
        });
        let actions = sm.handle(LifecycleEvent::HookCompleted {
            hook: HookKind::Stop,
            fault: None,
        });
        assert!(actions.is_empty());
        assert_eq!(sm.state(), ParticipantState::Error);
    }

    #[test]
    fn hook_fault_becomes_error_reason() {
        let mut sm = machine(HookSet {
            communication_ready: true,
            ..Default::default()
        });
        sm.handle(LifecycleEvent::Start);
        sm.handle(LifecycleEvent::CommunicationEstablished);
        let actions = sm.handle(LifecycleEvent::HookCompleted {
            hook: HookKind::CommunicationReady,
            fault: Some("database offline".to_string()),
        });
        assert_eq!(states(&actions), vec![ParticipantState::Error]);
        match &actions[1] {
            LifecycleAction::EmitStatus { reason, .. } => assert_eq!(reason, "database offline"),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn error_accepts_only_shutdown_or_abort() {
        let mut sm = machine(HookSet::default());
        sm.handle(LifecycleEvent::Start);
        sm.handle(LifecycleEvent::UserReportError {
            reason: "boom".to_string(),
        });
        assert_eq!(sm.state(), ParticipantState::Error);

        // Run and Stop are ignored or keep the state at Error.
        sm.handle(LifecycleEvent::SystemCommand(SystemCommandKind::Run));
        assert_eq!(sm.state(), ParticipantState::Error);
        sm.handle(LifecycleEvent::SystemCommand(SystemCommandKind::Stop));
        assert_eq!(sm.state(), ParticipantState::Error);

        let actions = sm.handle(LifecycleEvent::SystemCommand(SystemCommandKind::Shutdown));
        assert_eq!(
            states(&actions),
            vec![ParticipantState::ShuttingDown, ParticipantState::Shutdown]
        );
    }

    #[test]
    fn abort_skips_intermediate_states() {
        let mut sm = machine(HookSet {
            abort: true,
            ..Default::default()
        });
        sm.handle(LifecycleEvent::Start);
        sm.handle(LifecycleEvent::CommunicationEstablished);
        sm.handle(LifecycleEvent::SystemCommand(SystemCommandKind::Run));

        let actions = sm.handle(LifecycleEvent::SystemCommand(
            SystemCommandKind::AbortSimulation,
        ));
        assert_eq!(states(&actions), vec![ParticipantState::Aborting]);
        assert!(actions.contains(&LifecycleAction::InvokeHook(HookKind::Abort)));

        let actions = sm.handle(LifecycleEvent::HookCompleted {
            hook: HookKind::Abort,
            fault: None,
        });
        assert_eq!(states(&actions), vec![ParticipantState::Shutdown]);
        assert!(actions.contains(&LifecycleAction::Finished(ParticipantState::Shutdown)));
    }

    #[test]
    fn status_precedes_hook_invocation() {
        let mut sm = machine(HookSet {
            stop: true,
            ..Default::default()
        });
        sm.handle(LifecycleEvent::Start);
        sm.handle(LifecycleEvent::CommunicationEstablished);
        sm.handle(LifecycleEvent::SystemCommand(SystemCommandKind::Run));
        let actions = sm.handle(LifecycleEvent::SystemCommand(SystemCommandKind::Stop));

        let status_pos = actions
            .iter()
            .position(|a| matches!(a, LifecycleAction::EmitStatus { .. }))
            .unwrap();
        let hook_pos = actions
            .iter()
            .position(|a| matches!(a, LifecycleAction::InvokeHook(_)))
            .unwrap();
        assert!(status_pos < hook_pos);
    }
}
