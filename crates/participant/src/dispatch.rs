//! The per-participant dispatch thread.
//!
//! Consumes link events and facade commands from two channels (facade
//! commands first) and owns every piece of orchestration state: the
//! lifecycle machine, the system monitor, and the time coordinator. All
//! user-visible handlers run here, serially, in registration order — which
//! is what serializes status emission with lifecycle transitions.

use crate::core::{Core, Internal, TIME_SYNC_SERVICE};
use crate::time_provider::wall_clock_ns;
use cosim_discovery::HandlerInvocation;
use cosim_messages::{DiscoveryEventKind, LogLevel, Message, NextSimTask, ParticipantStatus};
use cosim_network::NetEvent;
use cosim_orchestration::{
    HookKind, LifecycleAction, LifecycleEvent, LifecycleStateMachine, SystemMonitor,
    TimeSyncAction, TimeSyncEvent, TimeSyncState,
};
use cosim_types::{EndpointAddress, ParticipantState, SimStep, SystemState};
use crossbeam::channel::Receiver;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub(crate) struct Dispatcher {
    core: Arc<Core>,
    lifecycle: LifecycleStateMachine,
    monitor: SystemMonitor,
    time_sync: TimeSyncState,
    time_sync_started: bool,
    /// Whether every registry-known peer is currently linked. Consulted
    /// when the lifecycle starts after the links already came up.
    peers_ready: bool,
}

impl Dispatcher {
    pub fn new(core: Arc<Core>) -> Self {
        let lifecycle = LifecycleStateMachine::new(core.name.clone(), Default::default());
        Self {
            core,
            lifecycle,
            monitor: SystemMonitor::new(),
            // The step is configured when a simulation task is installed.
            time_sync: TimeSyncState::new(SimStep::from_millis(1)),
            time_sync_started: false,
            peers_ready: false,
        }
    }

    /// Run until `Internal::Terminate`. Facade commands outrank link events.
    pub fn run(mut self, internal_rx: Receiver<Internal>, net_rx: Receiver<NetEvent>) {
        loop {
            // Priority cascade: drain facade commands before link events.
            loop {
                match internal_rx.try_recv() {
                    Ok(Internal::Terminate) => return,
                    Ok(event) => self.on_internal(event),
                    Err(_) => break,
                }
            }

            crossbeam::select! {
                recv(internal_rx) -> event => match event {
                    Ok(Internal::Terminate) | Err(_) => return,
                    Ok(event) => self.on_internal(event),
                },
                recv(net_rx) -> event => match event {
                    Ok(event) => self.on_net(event),
                    Err(_) => return,
                },
            }
        }
    }

    // ─── Facade commands ───

    fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::Lifecycle(event) => {
                let starting = matches!(event, LifecycleEvent::Start);
                if starting {
                    let hooks = self.core.hooks.lock().expect("hooks lock");
                    self.lifecycle.set_hooks(hooks.hook_set());
                }
                let actions = self.lifecycle.handle(event);
                self.run_lifecycle_actions(actions);
                // The links may have come up before the lifecycle started.
                if starting && self.peers_ready {
                    let actions = self
                        .lifecycle
                        .handle(LifecycleEvent::CommunicationEstablished);
                    self.run_lifecycle_actions(actions);
                }
            }
            Internal::LocalSystemCommand(kind) => {
                let actions = self.lifecycle.handle(LifecycleEvent::SystemCommand(kind));
                self.run_lifecycle_actions(actions);
            }
            Internal::SetWorkflow(workflow) => {
                let changed = self.monitor.set_workflow(workflow);
                self.fire_system_state_handlers(changed);
            }
            Internal::LocalAck { service, ack } => {
                let sink = self.core.sinks.get(&service).map(|s| s.clone());
                if let Some(sink) = sink {
                    guard_handler("transmit ack", || sink.deliver_ack(&ack));
                }
            }
            Internal::ConfigureTimeSync { step } => {
                // In place: peers discovered before the task was installed
                // stay in the synchronized set.
                self.time_sync.set_step(step);
            }
            Internal::CompleteSimStep => {
                let actions = self.time_sync.handle(TimeSyncEvent::StepCompleted);
                self.run_time_actions(actions);
            }
            Internal::Terminate => unreachable!("handled by run()"),
        }
    }

    // ─── Link events ───

    fn on_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::PeersReady => {
                self.peers_ready = true;
                let actions = self.lifecycle.handle(LifecycleEvent::CommunicationEstablished);
                self.run_lifecycle_actions(actions);
            }
            NetEvent::PeerConnected { peer } => {
                debug!(peer = %peer, "peer link up");
            }
            NetEvent::PeerDisconnected { peer } => {
                self.core.router.forget_peer(&peer);
                let invocations = self.core.discovery.drop_peer(&peer);
                self.process_discovery(invocations);
                let changed = self.monitor.on_participant_left(&peer);
                self.fire_system_state_handlers(changed);
            }
            NetEvent::RegistryLost => {
                warn!("registry connection lost; no new peers will be discovered");
            }
            NetEvent::Frame {
                peer,
                from,
                message,
            } => self.route_frame(peer, from, message),
        }
    }

    fn route_frame(&mut self, peer: String, from: EndpointAddress, message: Message) {
        match message {
            Message::ServiceDiscoveryEvent(event) => {
                let invocation = self
                    .core
                    .discovery
                    .apply_remote_event(event.kind, event.descriptor);
                self.process_discovery(invocation.into_iter().collect());
            }
            Message::ServiceAnnouncement(announcement) => {
                let invocations = self.core.discovery.apply_announcement(announcement.services);
                self.process_discovery(invocations);
            }
            Message::ParticipantStatus(status) => self.feed_status(status),
            Message::WorkflowConfiguration(workflow) => {
                let changed = self.monitor.set_workflow(workflow);
                self.fire_system_state_handlers(changed);
            }
            Message::SystemCommand(command) => {
                let actions = self
                    .lifecycle
                    .handle(LifecycleEvent::SystemCommand(command.kind));
                self.run_lifecycle_actions(actions);
            }
            Message::ParticipantCommand(command) => {
                // Applied only when addressed to us.
                if command.target_participant == self.core.id {
                    let actions = self
                        .lifecycle
                        .handle(LifecycleEvent::ParticipantCommand(command.kind));
                    self.run_lifecycle_actions(actions);
                }
            }
            Message::NextSimTask(task) => {
                let actions = self.time_sync.handle(TimeSyncEvent::PeerTask {
                    participant_name: peer,
                    task,
                });
                self.run_time_actions(actions);
            }
            Message::LogRecord(record) => {
                if self.core.log_from_remotes {
                    log_remote_record(&peer, &record.body, record.level);
                }
            }
            Message::BusFrame(_)
            | Message::BusFrameAck(_)
            | Message::DataMessage(_)
            | Message::RpcCall(_)
            | Message::RpcCallReturn(_) => self.deliver_payload(&peer, from, &message),
            other => {
                trace!(kind = other.type_name(), "unexpected frame past handshake");
            }
        }
    }

    /// Hand a payload message to every local service on the sender's
    /// network, excluding the sender itself on the self-delivery path.
    fn deliver_payload(&mut self, peer: &str, from: EndpointAddress, message: &Message) {
        let is_local = peer == self.core.name;
        let from_descriptor = if is_local {
            self.core.discovery.resolve_local(from)
        } else {
            self.core.discovery.resolve_remote(from)
        };
        let Some(from_descriptor) = from_descriptor else {
            trace!(%from, kind = message.type_name(), "frame from unknown service dropped");
            return;
        };

        let receivers = self
            .core
            .discovery
            .local_receivers_on_network(&from_descriptor.network_name, from);
        for receiver in receivers {
            let sink = self.core.sinks.get(&receiver.service_id).map(|s| s.clone());
            if let Some(sink) = sink {
                guard_handler(message.type_name(), || {
                    sink.deliver(&from_descriptor, message)
                });
            }
        }
    }

    // ─── Discovery fan-out ───

    fn process_discovery(&mut self, invocations: Vec<HandlerInvocation>) {
        if invocations.is_empty() {
            return;
        }
        self.core.discovery.invoke_handlers(&invocations);

        for invocation in &invocations {
            let descriptor = &invocation.descriptor;
            if descriptor.participant_name == self.core.name {
                continue;
            }

            // A peer announcing a service on a history-carrying network gets
            // that history before live traffic.
            if invocation.kind == DiscoveryEventKind::Created {
                self.core
                    .router
                    .replay_network_history_to(&descriptor.participant_name, &descriptor.network_name);
            }

            // A peer's time-sync controller joining or leaving changes the
            // synchronized set.
            if descriptor.service_name != TIME_SYNC_SERVICE {
                continue;
            }
            let event = match invocation.kind {
                DiscoveryEventKind::Created => {
                    TimeSyncEvent::PeerJoined(descriptor.participant_name.clone())
                }
                DiscoveryEventKind::Removed => {
                    TimeSyncEvent::PeerLeft(descriptor.participant_name.clone())
                }
            };
            let actions = self.time_sync.handle(event);
            self.run_time_actions(actions);
        }
    }

    // ─── Status & monitor ───

    fn feed_status(&mut self, status: ParticipantStatus) {
        {
            let mut handlers = self.core.monitor_handlers.lock().expect("monitor lock");
            for handler in handlers.participant_status.iter_mut() {
                guard_handler("participant status", || handler(&status));
            }
        }
        let changed = self.monitor.on_status(status);
        self.fire_system_state_handlers(changed);
    }

    fn fire_system_state_handlers(&mut self, changed: Option<SystemState>) {
        let Some(state) = changed else { return };
        self.core
            .system_state
            .store(state as u8, std::sync::atomic::Ordering::Release);
        let mut handlers = self.core.monitor_handlers.lock().expect("monitor lock");
        for handler in handlers.system_state.iter_mut() {
            guard_handler("system state", || handler(state));
        }
    }

    // ─── Lifecycle actions ───

    fn run_lifecycle_actions(&mut self, actions: Vec<LifecycleAction>) {
        for action in actions {
            match action {
                LifecycleAction::EmitStatus { state, reason } => self.emit_status(state, reason),
                LifecycleAction::InvokeHook(kind) => self.invoke_hook(kind),
                LifecycleAction::StartTimeSync => {
                    if self.core.sim_task.lock().expect("sim task lock").is_none() {
                        // Unsynchronized participants bypass the barrier.
                        continue;
                    }
                    let event = if self.time_sync_started {
                        TimeSyncEvent::Resume
                    } else {
                        self.time_sync_started = true;
                        TimeSyncEvent::Start
                    };
                    let time_actions = self.time_sync.handle(event);
                    self.run_time_actions(time_actions);
                }
                LifecycleAction::StopTimeSync => {
                    let event = if self.lifecycle.state() == ParticipantState::Paused {
                        TimeSyncEvent::Pause
                    } else {
                        TimeSyncEvent::Stop
                    };
                    let time_actions = self.time_sync.handle(event);
                    self.run_time_actions(time_actions);
                }
                LifecycleAction::Finished(state) => {
                    debug!(final_state = %state, "lifecycle finished");
                    self.core.state_cell.complete(state);
                }
            }
        }
    }

    /// Emit a fresh status: on the bus for peers, and straight into the
    /// local monitor (status does not self-deliver through the router).
    fn emit_status(&mut self, state: ParticipantState, reason: String) {
        self.core.state_cell.set_state(state);
        let now = wall_clock_ns();
        let status = ParticipantStatus {
            participant_name: self.core.name.clone(),
            state,
            enter_reason: reason,
            enter_time: now,
            refresh_time: now,
        };
        self.core.router.broadcast_all(
            self.core.lifecycle_descriptor.endpoint(),
            Message::ParticipantStatus(status.clone()),
        );
        self.feed_status(status);
    }

    fn invoke_hook(&mut self, kind: HookKind) {
        let hook = self.core.hooks.lock().expect("hooks lock").take(kind);
        let Some(mut hook) = hook else {
            // Registered at Start time but removed since; complete inline.
            let actions = self.lifecycle.handle(LifecycleEvent::HookCompleted {
                hook: kind,
                fault: None,
            });
            self.run_lifecycle_actions(actions);
            return;
        };

        if let Some(watchdog) = &self.core.watchdog {
            watchdog.start();
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| hook()));
        if let Some(watchdog) = &self.core.watchdog {
            watchdog.reset();
        }

        let mut hooks = self.core.hooks.lock().expect("hooks lock");
        hooks.put_back(kind, hook);
        let is_async = kind == HookKind::CommunicationReady && hooks.communication_ready_async;
        drop(hooks);

        let fault = outcome.err().map(panic_reason);
        if fault.is_none() && is_async {
            // Completion arrives via the facade.
            return;
        }
        let actions = self
            .lifecycle
            .handle(LifecycleEvent::HookCompleted { hook: kind, fault });
        self.run_lifecycle_actions(actions);
    }

    // ─── Time sync actions ───

    fn run_time_actions(&mut self, actions: Vec<TimeSyncAction>) {
        for action in actions {
            match action {
                TimeSyncAction::SendNextSimTask(task) => self.send_next_sim_task(task),
                TimeSyncAction::InvokeSimTask { now, duration } => {
                    self.core.time.set_virtual_now(now);
                    // Run the task off the lock so the callback may use the
                    // facade freely.
                    let task = self.core.sim_task.lock().expect("sim task lock").take();
                    let Some(mut task) = task else {
                        continue;
                    };
                    let is_async = task.is_async;
                    let outcome = catch_unwind(AssertUnwindSafe(|| (task.callback)(now, duration)));
                    let mut guard = self.core.sim_task.lock().expect("sim task lock");
                    if guard.is_none() {
                        *guard = Some(task);
                    }
                    drop(guard);

                    match outcome {
                        Err(payload) => {
                            let actions =
                                self.lifecycle.handle(LifecycleEvent::UserReportError {
                                    reason: format!(
                                        "simulation task panicked: {}",
                                        panic_reason(payload)
                                    ),
                                });
                            self.run_lifecycle_actions(actions);
                        }
                        Ok(()) if !is_async => {
                            // Inline completion re-enters through the queue so
                            // link events interleave between ticks.
                            let _ = self.core.internal_tx.send(Internal::CompleteSimStep);
                        }
                        Ok(()) => {}
                    }
                }
            }
        }
    }

    fn send_next_sim_task(&self, task: NextSimTask) {
        let from = self
            .core
            .timesync_descriptor
            .lock()
            .expect("timesync descriptor lock")
            .as_ref()
            .map(|d| d.endpoint())
            .unwrap_or_else(|| EndpointAddress::connection(self.core.id));
        self.core
            .router
            .broadcast_all(from, Message::NextSimTask(task));
    }
}

/// Nothing from a user handler may crash the dispatch thread.
fn guard_handler<R>(what: &str, f: impl FnOnce() -> R) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        warn!(handler = what, fault = %panic_reason(payload), "user handler faulted");
    }
}

fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_remote_record(peer: &str, body: &str, level: LogLevel) {
    match level {
        LogLevel::Trace => trace!(remote = peer, "{body}"),
        LogLevel::Debug => debug!(remote = peer, "{body}"),
        LogLevel::Info => tracing::info!(remote = peer, "{body}"),
        LogLevel::Warn => warn!(remote = peer, "{body}"),
        LogLevel::Error | LogLevel::Critical => tracing::error!(remote = peer, "{body}"),
        LogLevel::Off => {}
    }
}
