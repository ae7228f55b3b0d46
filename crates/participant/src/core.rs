//! Shared runtime state behind the facade handles.

use crate::error::ParticipantError;
use crate::time_provider::TimeProvider;
use cosim_discovery::ServiceDiscovery;
use cosim_messages::{
    BusFrameAck, DiscoveryEventKind, Message, ParticipantStatus, ServiceDiscoveryEvent,
    SystemCommandKind, WorkflowConfiguration,
};
use cosim_network::{ConnectionManager, Router};
use cosim_orchestration::{HookKind, HookSet, LifecycleEvent, Watchdog};
use cosim_types::{
    NetworkType, ParticipantId, ParticipantState, ServiceDescriptor, ServiceId, ServiceType,
    SimStep, SimTime, SystemState,
};
use crossbeam::channel::Sender;
use dashmap::DashMap;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Service name of the virtual-time coordinator's internal controller.
/// Discovery of a peer's instance marks that peer as synchronized.
pub(crate) const TIME_SYNC_SERVICE: &str = "TimeSyncService";
/// Network carrying internal controllers.
pub(crate) const INTERNAL_NETWORK: &str = "default";

/// Events the facade threads enqueue for the dispatch thread.
pub(crate) enum Internal {
    Lifecycle(LifecycleEvent),
    /// A system command issued by the local system controller; commands do
    /// not self-deliver over the router.
    LocalSystemCommand(SystemCommandKind),
    SetWorkflow(WorkflowConfiguration),
    /// Transmit ack generated locally on a bus controller's send path.
    LocalAck {
        service: ServiceId,
        ack: BusFrameAck,
    },
    /// Configure the virtual-time step (a simulation task was installed).
    ConfigureTimeSync { step: SimStep },
    /// `CompleteSimulationStep` or an inline step return.
    CompleteSimStep,
    Terminate,
}

/// Anything that consumes inbound messages for one local service.
pub(crate) trait ControllerSink: Send + Sync {
    fn deliver(&self, from: &ServiceDescriptor, message: &Message);

    /// Locally generated transmit acks.
    fn deliver_ack(&self, _ack: &BusFrameAck) {}
}

type Hook = Box<dyn FnMut() + Send>;

/// The user-registered lifecycle hooks.
#[derive(Default)]
pub(crate) struct LifecycleHooks {
    pub communication_ready: Option<Hook>,
    /// When set, `CommunicationReady` completes only via
    /// `complete_communication_ready_handler`.
    pub communication_ready_async: bool,
    pub starting: Option<Hook>,
    pub stop: Option<Hook>,
    pub shutdown: Option<Hook>,
    pub abort: Option<Hook>,
}

impl LifecycleHooks {
    pub fn hook_set(&self) -> HookSet {
        HookSet {
            communication_ready: self.communication_ready.is_some(),
            starting: self.starting.is_some(),
            stop: self.stop.is_some(),
            shutdown: self.shutdown.is_some(),
            abort: self.abort.is_some(),
        }
    }

    pub fn take(&mut self, kind: HookKind) -> Option<Hook> {
        match kind {
            HookKind::CommunicationReady => self.communication_ready.take(),
            HookKind::Starting => self.starting.take(),
            HookKind::Stop => self.stop.take(),
            HookKind::Shutdown => self.shutdown.take(),
            HookKind::Abort => self.abort.take(),
        }
    }

    pub fn put_back(&mut self, kind: HookKind, hook: Hook) {
        match kind {
            HookKind::CommunicationReady => self.communication_ready = Some(hook),
            HookKind::Starting => self.starting = Some(hook),
            HookKind::Stop => self.stop = Some(hook),
            HookKind::Shutdown => self.shutdown = Some(hook),
            HookKind::Abort => self.abort = Some(hook),
        }
    }
}

/// The user's per-tick simulation task.
pub(crate) struct SimTask {
    pub callback: Box<dyn FnMut(SimTime, SimStep) + Send>,
    /// Async tasks complete via `complete_simulation_step`.
    pub is_async: bool,
}

pub(crate) struct MonitorHandlers {
    pub system_state: Vec<Box<dyn FnMut(SystemState) + Send>>,
    pub participant_status: Vec<Box<dyn FnMut(&ParticipantStatus) + Send>>,
}

/// Lifecycle state mirror plus the completion signal `StartLifecycle`
/// blocks on.
pub(crate) struct StateCell {
    state: AtomicU8,
    final_state: Mutex<Option<ParticipantState>>,
    done: Condvar,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ParticipantState::Invalid as u8),
            final_state: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    pub fn set_state(&self, state: ParticipantState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn state(&self) -> ParticipantState {
        ParticipantState::from_wire(self.state.load(Ordering::Acquire))
            .unwrap_or(ParticipantState::Invalid)
    }

    pub fn complete(&self, state: ParticipantState) {
        *self.final_state.lock().expect("state cell lock") = Some(state);
        self.done.notify_all();
    }

    pub fn wait_for_completion(&self) -> ParticipantState {
        let mut guard = self.final_state.lock().expect("state cell lock");
        while guard.is_none() {
            guard = self.done.wait(guard).expect("state cell lock");
        }
        guard.expect("final state present")
    }
}

struct ControllerEntry {
    type_tag: &'static str,
    controller: Arc<dyn Any + Send + Sync>,
}

/// Shared state of one participant instance.
pub(crate) struct Core {
    pub name: String,
    pub id: ParticipantId,
    pub discovery: Arc<ServiceDiscovery>,
    pub connections: ConnectionManager,
    pub router: Arc<Router>,
    pub internal_tx: Sender<Internal>,
    pub time: Arc<TimeProvider>,
    pub sinks: DashMap<ServiceId, Arc<dyn ControllerSink>>,
    controllers: DashMap<(String, String), ControllerEntry>,
    next_service_id: AtomicU16,
    pub state_cell: Arc<StateCell>,
    pub system_state: AtomicU8,
    pub hooks: Mutex<LifecycleHooks>,
    pub sim_task: Mutex<Option<SimTask>>,
    pub monitor_handlers: Mutex<MonitorHandlers>,
    pub watchdog: Option<Watchdog>,
    pub log_from_remotes: bool,
    /// Internal controller descriptors, created before the domain join.
    pub lifecycle_descriptor: ServiceDescriptor,
    pub system_descriptor: ServiceDescriptor,
    pub timesync_descriptor: Mutex<Option<ServiceDescriptor>>,
}

impl Core {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        discovery: Arc<ServiceDiscovery>,
        connections: ConnectionManager,
        router: Arc<Router>,
        internal_tx: Sender<Internal>,
        watchdog: Option<Watchdog>,
        log_from_remotes: bool,
        lifecycle_descriptor: ServiceDescriptor,
        system_descriptor: ServiceDescriptor,
        next_service_id: u16,
    ) -> Self {
        let id = ParticipantId::from_name(&name);
        Self {
            name,
            id,
            discovery,
            connections,
            router,
            internal_tx,
            time: Arc::new(TimeProvider::new()),
            sinks: DashMap::new(),
            controllers: DashMap::new(),
            next_service_id: AtomicU16::new(next_service_id),
            state_cell: Arc::new(StateCell::new()),
            system_state: AtomicU8::new(SystemState::Invalid as u8),
            hooks: Mutex::new(LifecycleHooks::default()),
            sim_task: Mutex::new(None),
            monitor_handlers: Mutex::new(MonitorHandlers {
                system_state: Vec::new(),
                participant_status: Vec::new(),
            }),
            watchdog,
            log_from_remotes,
            lifecycle_descriptor,
            system_descriptor,
            timesync_descriptor: Mutex::new(None),
        }
    }

    pub fn system_state(&self) -> SystemState {
        match self.system_state.load(Ordering::Acquire) {
            0 => SystemState::Invalid,
            raw => cosim_types::ParticipantState::from_wire(raw)
                .map(SystemState::from_participant)
                .unwrap_or(SystemState::Invalid),
        }
    }

    /// Allocate the next service id. Strictly increasing, never reused.
    pub fn allocate_service_id(&self) -> ServiceId {
        ServiceId(self.next_service_id.fetch_add(1, Ordering::AcqRel))
    }

    /// Build a descriptor for a service owned by this participant.
    pub fn describe(
        &self,
        network_name: &str,
        service_name: &str,
        service_type: ServiceType,
        network_type: NetworkType,
        supplemental: BTreeMap<String, String>,
    ) -> ServiceDescriptor {
        ServiceDescriptor {
            participant_name: self.name.clone(),
            participant_id: self.id,
            network_name: network_name.to_string(),
            service_name: service_name.to_string(),
            service_id: self.allocate_service_id(),
            service_type,
            network_type,
            supplemental,
        }
    }

    /// Idempotent controller creation: the first call constructs, repeated
    /// calls with the same (network, name) return the existing controller.
    pub fn create_controller<C: Send + Sync + 'static>(
        &self,
        canonical_name: &str,
        network_name: &str,
        type_tag: &'static str,
        construct: impl FnOnce() -> Result<Arc<C>, ParticipantError>,
    ) -> Result<Arc<C>, ParticipantError> {
        if canonical_name.is_empty() {
            return Err(ParticipantError::InvalidName);
        }
        let key = (network_name.to_string(), canonical_name.to_string());
        if let Some(existing) = self.controllers.get(&key) {
            if existing.type_tag != type_tag {
                return Err(ParticipantError::DuplicateService(format!(
                    "{canonical_name} on {network_name} already exists as {}",
                    existing.type_tag
                )));
            }
            return existing
                .controller
                .clone()
                .downcast::<C>()
                .map_err(|_| ParticipantError::DuplicateService(canonical_name.to_string()));
        }

        let controller = construct()?;
        self.controllers.insert(
            key,
            ControllerEntry {
                type_tag,
                controller: controller.clone(),
            },
        );
        Ok(controller)
    }

    /// Insert a fresh local service and broadcast its `Created` event.
    pub fn publish_service(&self, descriptor: &ServiceDescriptor) -> Result<(), ParticipantError> {
        if !self.discovery.insert_local(descriptor.clone()) {
            return Err(ParticipantError::DuplicateService(format!(
                "{}/{}",
                descriptor.network_name, descriptor.service_name
            )));
        }
        self.router.broadcast_all(
            descriptor.endpoint(),
            Message::ServiceDiscoveryEvent(ServiceDiscoveryEvent {
                kind: DiscoveryEventKind::Created,
                descriptor: descriptor.clone(),
            }),
        );
        Ok(())
    }

    /// Broadcast `Removed` for every local service. Called on shutdown.
    pub fn retire_local_services(&self) {
        for descriptor in self.discovery.local_services() {
            self.router.broadcast_all(
                descriptor.endpoint(),
                Message::ServiceDiscoveryEvent(ServiceDiscoveryEvent {
                    kind: DiscoveryEventKind::Removed,
                    descriptor,
                }),
            );
        }
    }
}
