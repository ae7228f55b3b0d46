//! Participant construction and the controller factory facade.

use crate::controllers::{
    encode_labels, BusController, DataPublisher, DataSubscriber, Labels, RpcClient, RpcServer,
    RPC_ROLE_CLIENT, RPC_ROLE_SERVER, SUPPLEMENTAL_KEY_RPC_ROLE,
};
use crate::core::{Core, ControllerSink, Internal, INTERNAL_NETWORK};
use crate::dispatch::Dispatcher;
use crate::error::ParticipantError;
use crate::lifecycle_service::LifecycleService;
use crate::monitor_service::SystemMonitorHandle;
use crate::system_controller::SystemController;
use cosim_config::ParticipantConfiguration;
use cosim_discovery::ServiceDiscovery;
use cosim_messages::{LogLevel, LogRecord, Message};
use cosim_network::{ConnectionManager, ConnectionOptions, NetEvent, Router, TcpOptions};
use cosim_orchestration::{Watchdog, WatchdogConfig};
use cosim_types::{
    NetworkType, ParticipantId, ServiceDescriptor, ServiceType, SUPPLEMENTAL_KEY_HISTORY_LENGTH,
    SUPPLEMENTAL_KEY_LABELS, SUPPLEMENTAL_KEY_MEDIA_TYPE, SUPPLEMENTAL_KEY_PUBLISHER_UUID,
    SUPPLEMENTAL_KEY_RPC_FUNCTION,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

/// One simulation process's membership in a domain.
///
/// Dropping the participant retires its services, closes every link, and
/// stops the dispatch thread.
pub struct Participant {
    core: Arc<Core>,
    lifecycle: Arc<LifecycleService>,
    monitor: Arc<SystemMonitorHandle>,
    system_controller: Arc<SystemController>,
    dispatch: Option<JoinHandle<()>>,
    /// Owns the link tasks; kept alive for the participant's lifetime.
    _runtime: tokio::runtime::Runtime,
}

impl Participant {
    /// Join the domain described by `config`.
    ///
    /// Blocks until the registry accepted the announcement. Fails with
    /// `RegistryUnreachable` after `ConnectAttempts` dials.
    pub fn connect(config: ParticipantConfiguration) -> Result<Self, ParticipantError> {
        let name = config
            .participant_name
            .clone()
            .ok_or_else(|| ParticipantError::Configuration("ParticipantName is required".into()))?;
        if name.is_empty() {
            return Err(ParticipantError::Configuration(
                "ParticipantName must not be empty".into(),
            ));
        }
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(format!("cosim-io-{name}"))
            .enable_all()
            .build()
            .map_err(|e| ParticipantError::Configuration(format!("runtime: {e}")))?;

        let discovery = Arc::new(ServiceDiscovery::new(name.clone()));
        let (net_tx, net_rx) = crossbeam::channel::unbounded::<NetEvent>();
        let (internal_tx, internal_rx) = crossbeam::channel::unbounded::<Internal>();

        // Internal controllers exist before the join so peer handshakes
        // replay them. Ids 1..: the facade is the sole allocator.
        let id = ParticipantId::from_name(&name);
        let mut next_service_id = 1u16;
        let mut internal_descriptor = |service_name: &str| {
            let descriptor = ServiceDescriptor {
                participant_name: name.clone(),
                participant_id: id,
                network_name: INTERNAL_NETWORK.to_string(),
                service_name: service_name.to_string(),
                service_id: cosim_types::ServiceId(next_service_id),
                service_type: ServiceType::InternalController,
                network_type: NetworkType::Undefined,
                supplemental: BTreeMap::new(),
            };
            next_service_id += 1;
            descriptor
        };
        let discovery_descriptor = internal_descriptor("ServiceDiscovery");
        let lifecycle_descriptor = internal_descriptor("ParticipantController");
        let system_descriptor = internal_descriptor("SystemController");
        let monitor_descriptor = internal_descriptor("SystemMonitor");
        for descriptor in [
            &discovery_descriptor,
            &lifecycle_descriptor,
            &system_descriptor,
            &monitor_descriptor,
        ] {
            discovery.insert_local((*descriptor).clone());
        }

        let registry = &config.middleware.registry;
        let options = ConnectionOptions {
            participant_name: name.clone(),
            registry_host: registry.hostname.clone(),
            registry_port: registry.port,
            connect_attempts: registry.effective_connect_attempts(),
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: cosim_network::HEARTBEAT_INTERVAL,
            outbound_queue_capacity: 2048,
            tcp: TcpOptions {
                no_delay: config.middleware.tcp_no_delay,
                quick_ack: config.middleware.tcp_quick_ack,
                receive_buffer_size: config.middleware.tcp_receive_buffer_size,
                send_buffer_size: config.middleware.tcp_send_buffer_size,
                enable_domain_sockets: config.middleware.enable_domain_sockets,
            },
        };

        let replay_discovery = Arc::clone(&discovery);
        let connections = runtime.block_on(ConnectionManager::connect(
            options,
            net_tx.clone(),
            Arc::new(move || replay_discovery.local_services()),
        ))?;
        let router = Arc::new(Router::new(
            connections.clone(),
            Arc::clone(&discovery),
            net_tx.clone(),
        ));

        let watchdog = match (
            config.health_check.soft_timeout(),
            config.health_check.hard_timeout(),
        ) {
            (Some(soft), Some(hard)) => {
                let warn_name = name.clone();
                let error_name = name.clone();
                Some(Watchdog::spawn(
                    WatchdogConfig {
                        soft_timeout: soft,
                        hard_timeout: hard,
                    },
                    move |elapsed| {
                        warn!(
                            participant = %warn_name,
                            ?elapsed,
                            "handler exceeded soft response timeout"
                        );
                    },
                    move |elapsed| {
                        tracing::error!(
                            participant = %error_name,
                            ?elapsed,
                            "handler exceeded hard response timeout"
                        );
                    },
                ))
            }
            _ => None,
        };

        let core = Arc::new(Core::new(
            name.clone(),
            discovery,
            connections,
            router,
            internal_tx,
            watchdog,
            config.logging.log_from_remotes,
            lifecycle_descriptor,
            system_descriptor,
            next_service_id,
        ));

        let dispatcher = Dispatcher::new(Arc::clone(&core));
        let dispatch = std::thread::Builder::new()
            .name(format!("cosim-dispatch-{name}"))
            .spawn(move || dispatcher.run(internal_rx, net_rx))
            .map_err(|e| ParticipantError::Configuration(format!("dispatch thread: {e}")))?;

        info!(participant = %name, "participant created");
        Ok(Self {
            lifecycle: Arc::new(LifecycleService::new(Arc::clone(&core))),
            monitor: Arc::new(SystemMonitorHandle::new(Arc::clone(&core))),
            system_controller: Arc::new(SystemController::new(Arc::clone(&core))),
            core,
            dispatch: Some(dispatch),
            _runtime: runtime,
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn id(&self) -> ParticipantId {
        self.core.id
    }

    // ─── Orchestration services ───

    pub fn lifecycle_service(&self) -> Arc<LifecycleService> {
        Arc::clone(&self.lifecycle)
    }

    pub fn system_monitor(&self) -> Arc<SystemMonitorHandle> {
        Arc::clone(&self.monitor)
    }

    pub fn system_controller(&self) -> Arc<SystemController> {
        Arc::clone(&self.system_controller)
    }

    // ─── Bus controllers ───

    pub fn create_can_controller(
        &self,
        canonical_name: &str,
        network_name: &str,
    ) -> Result<Arc<BusController>, ParticipantError> {
        self.create_bus_controller(canonical_name, network_name, NetworkType::Can, "can")
    }

    pub fn create_ethernet_controller(
        &self,
        canonical_name: &str,
        network_name: &str,
    ) -> Result<Arc<BusController>, ParticipantError> {
        self.create_bus_controller(canonical_name, network_name, NetworkType::Ethernet, "ethernet")
    }

    pub fn create_lin_controller(
        &self,
        canonical_name: &str,
        network_name: &str,
    ) -> Result<Arc<BusController>, ParticipantError> {
        self.create_bus_controller(canonical_name, network_name, NetworkType::Lin, "lin")
    }

    pub fn create_flexray_controller(
        &self,
        canonical_name: &str,
        network_name: &str,
    ) -> Result<Arc<BusController>, ParticipantError> {
        self.create_bus_controller(canonical_name, network_name, NetworkType::FlexRay, "flexray")
    }

    fn create_bus_controller(
        &self,
        canonical_name: &str,
        network_name: &str,
        network_type: NetworkType,
        type_tag: &'static str,
    ) -> Result<Arc<BusController>, ParticipantError> {
        let core = Arc::clone(&self.core);
        self.core
            .create_controller(canonical_name, network_name, type_tag, move || {
                let descriptor = core.describe(
                    network_name,
                    canonical_name,
                    ServiceType::Controller,
                    network_type,
                    BTreeMap::new(),
                );
                let controller = Arc::new(BusController::new(Arc::clone(&core), descriptor.clone()));
                core.publish_service(&descriptor)?;
                core.sinks.insert(
                    descriptor.service_id,
                    Arc::clone(&controller) as Arc<dyn ControllerSink>,
                );
                Ok(controller)
            })
    }

    // ─── Publish/subscribe ───

    /// Create a publisher on `topic`. `history_length` messages are
    /// retained and replayed to late-joining peers.
    pub fn create_data_publisher(
        &self,
        canonical_name: &str,
        topic: &str,
        media_type: &str,
        labels: Labels,
        history_length: usize,
    ) -> Result<Arc<DataPublisher>, ParticipantError> {
        let core = Arc::clone(&self.core);
        let media_type = media_type.to_string();
        self.core
            .create_controller(canonical_name, topic, "data-publisher", move || {
                let mut supplemental = BTreeMap::new();
                supplemental.insert(
                    SUPPLEMENTAL_KEY_MEDIA_TYPE.to_string(),
                    media_type.clone(),
                );
                supplemental.insert(SUPPLEMENTAL_KEY_LABELS.to_string(), encode_labels(&labels));
                supplemental.insert(
                    SUPPLEMENTAL_KEY_PUBLISHER_UUID.to_string(),
                    uuid::Uuid::new_v4().to_string(),
                );
                supplemental.insert(
                    SUPPLEMENTAL_KEY_HISTORY_LENGTH.to_string(),
                    history_length.to_string(),
                );
                let descriptor = core.describe(
                    topic,
                    canonical_name,
                    ServiceType::Controller,
                    NetworkType::Data,
                    supplemental,
                );
                core.router.enable_history(topic, history_length);
                let publisher = Arc::new(DataPublisher::new(Arc::clone(&core), descriptor.clone()));
                core.publish_service(&descriptor)?;
                Ok(publisher)
            })
    }

    pub fn create_data_subscriber(
        &self,
        canonical_name: &str,
        topic: &str,
        media_type: &str,
        labels: Labels,
    ) -> Result<Arc<DataSubscriber>, ParticipantError> {
        let core = Arc::clone(&self.core);
        let media_type = media_type.to_string();
        self.core
            .create_controller(canonical_name, topic, "data-subscriber", move || {
                let mut supplemental = BTreeMap::new();
                supplemental.insert(
                    SUPPLEMENTAL_KEY_MEDIA_TYPE.to_string(),
                    media_type.clone(),
                );
                supplemental.insert(SUPPLEMENTAL_KEY_LABELS.to_string(), encode_labels(&labels));
                let descriptor = core.describe(
                    topic,
                    canonical_name,
                    ServiceType::Controller,
                    NetworkType::Data,
                    supplemental,
                );
                let subscriber = Arc::new(DataSubscriber::new(
                    descriptor.clone(),
                    media_type.clone(),
                    labels.clone(),
                ));
                core.publish_service(&descriptor)?;
                core.sinks.insert(
                    descriptor.service_id,
                    Arc::clone(&subscriber) as Arc<dyn ControllerSink>,
                );
                Ok(subscriber)
            })
    }

    // ─── RPC ───

    /// Create an RPC client on the channel named by `function_name`.
    pub fn create_rpc_client(
        &self,
        canonical_name: &str,
        function_name: &str,
        media_type: &str,
        labels: Labels,
    ) -> Result<Arc<RpcClient>, ParticipantError> {
        let core = Arc::clone(&self.core);
        let media_type = media_type.to_string();
        self.core
            .create_controller(canonical_name, function_name, "rpc-client", move || {
                let mut supplemental = BTreeMap::new();
                supplemental.insert(
                    SUPPLEMENTAL_KEY_RPC_FUNCTION.to_string(),
                    function_name.to_string(),
                );
                supplemental.insert(
                    SUPPLEMENTAL_KEY_MEDIA_TYPE.to_string(),
                    media_type.clone(),
                );
                supplemental.insert(SUPPLEMENTAL_KEY_LABELS.to_string(), encode_labels(&labels));
                supplemental.insert(
                    SUPPLEMENTAL_KEY_RPC_ROLE.to_string(),
                    RPC_ROLE_CLIENT.to_string(),
                );
                let descriptor = core.describe(
                    function_name,
                    canonical_name,
                    ServiceType::Controller,
                    NetworkType::Rpc,
                    supplemental,
                );
                let client = Arc::new(RpcClient::new(
                    Arc::clone(&core),
                    descriptor.clone(),
                    media_type.clone(),
                ));
                core.publish_service(&descriptor)?;
                core.sinks.insert(
                    descriptor.service_id,
                    Arc::clone(&client) as Arc<dyn ControllerSink>,
                );
                Ok(client)
            })
    }

    /// Create an RPC server on the channel named by `function_name`.
    /// `handler` maps each call payload to its result payload; it runs on
    /// the dispatch thread, in call order.
    pub fn create_rpc_server(
        &self,
        canonical_name: &str,
        function_name: &str,
        media_type: &str,
        labels: Labels,
        handler: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    ) -> Result<Arc<RpcServer>, ParticipantError> {
        let core = Arc::clone(&self.core);
        let media_type = media_type.to_string();
        self.core
            .create_controller(canonical_name, function_name, "rpc-server", move || {
                let mut supplemental = BTreeMap::new();
                supplemental.insert(
                    SUPPLEMENTAL_KEY_RPC_FUNCTION.to_string(),
                    function_name.to_string(),
                );
                supplemental.insert(
                    SUPPLEMENTAL_KEY_MEDIA_TYPE.to_string(),
                    media_type.clone(),
                );
                supplemental.insert(SUPPLEMENTAL_KEY_LABELS.to_string(), encode_labels(&labels));
                supplemental.insert(
                    SUPPLEMENTAL_KEY_RPC_ROLE.to_string(),
                    RPC_ROLE_SERVER.to_string(),
                );
                let descriptor = core.describe(
                    function_name,
                    canonical_name,
                    ServiceType::Controller,
                    NetworkType::Rpc,
                    supplemental,
                );
                let server = Arc::new(RpcServer::new(
                    Arc::clone(&core),
                    descriptor.clone(),
                    handler,
                ));
                core.publish_service(&descriptor)?;
                core.sinks.insert(
                    descriptor.service_id,
                    Arc::clone(&server) as Arc<dyn ControllerSink>,
                );
                Ok(server)
            })
    }

    // ─── Discovery ───

    /// All remote services matching `predicate`. Used by applications for
    /// RPC/pub-sub matching and by tests to await propagation.
    pub fn find_services(
        &self,
        predicate: impl Fn(&ServiceDescriptor) -> bool,
    ) -> Vec<ServiceDescriptor> {
        self.core.discovery.find(predicate)
    }

    /// Register a discovery handler: it observes every already-known remote
    /// service as created, then live create/remove events in registration
    /// order.
    pub fn add_service_discovery_handler(
        &self,
        handler: impl FnMut(cosim_messages::DiscoveryEventKind, &ServiceDescriptor) + Send + 'static,
    ) {
        self.core.discovery.register_handler(handler);
    }

    // ─── Remote logging ───

    /// Forward a log record to participants that enabled `LogFromRemotes`.
    pub fn emit_log(&self, level: LogLevel, body: impl Into<String>) {
        self.core.router.broadcast_all(
            self.core.lifecycle_descriptor.endpoint(),
            Message::LogRecord(LogRecord {
                level,
                timestamp: crate::time_provider::wall_clock_ns(),
                body: body.into(),
            }),
        );
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        self.core.retire_local_services();
        let _ = self.core.internal_tx.send(Internal::Terminate);
        if let Some(dispatch) = self.dispatch.take() {
            let _ = dispatch.join();
        }
        self.core.connections.shutdown();
    }
}
