//! The discovery indexes and handler bookkeeping.

use cosim_messages::DiscoveryEventKind;
use cosim_types::{EndpointAddress, ServiceDescriptor, ServiceKey};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tracing::{debug, trace};

/// Identifies a registered discovery handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiscoveryHandlerId(u64);

/// A deferred handler invocation, produced by an index mutation and run by
/// the dispatch thread via [`ServiceDiscovery::invoke_handlers`].
#[derive(Debug, Clone)]
pub struct HandlerInvocation {
    pub kind: DiscoveryEventKind,
    pub descriptor: ServiceDescriptor,
}

type Handler = Box<dyn FnMut(DiscoveryEventKind, &ServiceDescriptor) + Send>;

#[derive(Default)]
struct Indexes {
    /// Services this participant created, keyed by (network, service name).
    local: HashMap<(String, String), ServiceDescriptor>,
    /// Services announced by peers, keyed by the full descriptor triple.
    remote: HashMap<ServiceKey, ServiceDescriptor>,
    /// Wire address → remote key, for inbound envelope resolution.
    remote_by_addr: HashMap<EndpointAddress, ServiceKey>,
}

/// Per-participant service discovery component.
pub struct ServiceDiscovery {
    participant_name: String,
    indexes: RwLock<Indexes>,
    /// Handlers run on the dispatch thread only, never under `indexes`.
    handlers: Mutex<Vec<(DiscoveryHandlerId, Handler)>>,
    next_handler_id: AtomicU64,
    /// Bumped on every local index mutation.
    local_epoch: AtomicU64,
}

impl ServiceDiscovery {
    pub fn new(participant_name: impl Into<String>) -> Self {
        Self {
            participant_name: participant_name.into(),
            indexes: RwLock::new(Indexes::default()),
            handlers: Mutex::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
            local_epoch: AtomicU64::new(0),
        }
    }

    pub fn local_epoch(&self) -> u64 {
        self.local_epoch.load(Ordering::Acquire)
    }

    // ─── Local services ───

    /// Record a locally created service. Returns false if a service with the
    /// same (network, name) already exists.
    pub fn insert_local(&self, descriptor: ServiceDescriptor) -> bool {
        let key = (
            descriptor.network_name.clone(),
            descriptor.service_name.clone(),
        );
        let mut indexes = self.indexes.write().expect("discovery lock poisoned");
        if indexes.local.contains_key(&key) {
            return false;
        }
        trace!(service = %descriptor, "local service created");
        indexes.local.insert(key, descriptor);
        self.local_epoch.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Drop a locally created service, returning its descriptor.
    pub fn remove_local(&self, network_name: &str, service_name: &str) -> Option<ServiceDescriptor> {
        let mut indexes = self.indexes.write().expect("discovery lock poisoned");
        let removed = indexes
            .local
            .remove(&(network_name.to_string(), service_name.to_string()));
        if removed.is_some() {
            self.local_epoch.fetch_add(1, Ordering::AcqRel);
        }
        removed
    }

    /// Snapshot of all locally created services, for new-peer replay.
    pub fn local_services(&self) -> Vec<ServiceDescriptor> {
        let indexes = self.indexes.read().expect("discovery lock poisoned");
        indexes.local.values().cloned().collect()
    }

    /// Resolve a wire address that refers to one of our own services.
    pub fn resolve_local(&self, addr: EndpointAddress) -> Option<ServiceDescriptor> {
        let indexes = self.indexes.read().expect("discovery lock poisoned");
        indexes
            .local
            .values()
            .find(|d| d.endpoint() == addr)
            .cloned()
    }

    // ─── Remote services ───

    /// Apply a discovery event from a peer.
    ///
    /// Returns the handler invocation to run, or `None` when the event was
    /// suppressed: a duplicate `Created` for an already-indexed descriptor,
    /// or a `Removed` for an unknown one.
    pub fn apply_remote_event(
        &self,
        kind: DiscoveryEventKind,
        descriptor: ServiceDescriptor,
    ) -> Option<HandlerInvocation> {
        let key = descriptor.key();
        let mut indexes = self.indexes.write().expect("discovery lock poisoned");
        match kind {
            DiscoveryEventKind::Created => {
                if indexes.remote.contains_key(&key) {
                    trace!(service = %descriptor, "duplicate Created suppressed");
                    return None;
                }
                indexes
                    .remote_by_addr
                    .insert(descriptor.endpoint(), key.clone());
                indexes.remote.insert(key, descriptor.clone());
                debug!(service = %descriptor, "remote service discovered");
                Some(HandlerInvocation { kind, descriptor })
            }
            DiscoveryEventKind::Removed => {
                if indexes.remote.remove(&key).is_none() {
                    trace!(service = %descriptor, "Removed for unknown service ignored");
                    return None;
                }
                indexes.remote_by_addr.remove(&descriptor.endpoint());
                debug!(service = %descriptor, "remote service removed");
                Some(HandlerInvocation { kind, descriptor })
            }
        }
    }

    /// Apply a full service announcement from a freshly connected peer.
    ///
    /// Each entry is treated as `Created`; duplicates are suppressed, so a
    /// reconnecting peer never produces a second event for a known service.
    pub fn apply_announcement(
        &self,
        services: Vec<ServiceDescriptor>,
    ) -> Vec<HandlerInvocation> {
        services
            .into_iter()
            .filter_map(|d| self.apply_remote_event(DiscoveryEventKind::Created, d))
            .collect()
    }

    /// Drop every remote entry owned by a disconnected peer, yielding the
    /// `Removed` invocations for them.
    pub fn drop_peer(&self, peer_name: &str) -> Vec<HandlerInvocation> {
        let mut indexes = self.indexes.write().expect("discovery lock poisoned");
        let removed_keys: Vec<ServiceKey> = indexes
            .remote
            .keys()
            .filter(|k| k.participant_name == peer_name)
            .cloned()
            .collect();
        let mut invocations = Vec::with_capacity(removed_keys.len());
        for key in removed_keys {
            if let Some(descriptor) = indexes.remote.remove(&key) {
                indexes.remote_by_addr.remove(&descriptor.endpoint());
                invocations.push(HandlerInvocation {
                    kind: DiscoveryEventKind::Removed,
                    descriptor,
                });
            }
        }
        if !invocations.is_empty() {
            debug!(
                peer = peer_name,
                count = invocations.len(),
                "dropped remote services of disconnected peer"
            );
        }
        invocations
    }

    /// Resolve the wire envelope address of an inbound message.
    pub fn resolve_remote(&self, addr: EndpointAddress) -> Option<ServiceDescriptor> {
        let indexes = self.indexes.read().expect("discovery lock poisoned");
        let key = indexes.remote_by_addr.get(&addr)?;
        indexes.remote.get(key).cloned()
    }

    /// All remote descriptors matching a predicate.
    pub fn find(&self, predicate: impl Fn(&ServiceDescriptor) -> bool) -> Vec<ServiceDescriptor> {
        let indexes = self.indexes.read().expect("discovery lock poisoned");
        indexes
            .remote
            .values()
            .filter(|d| predicate(d))
            .cloned()
            .collect()
    }

    /// Names of all peers owning at least one service on `network`.
    pub fn peers_on_network(&self, network: &str) -> BTreeSet<String> {
        let indexes = self.indexes.read().expect("discovery lock poisoned");
        indexes
            .remote
            .values()
            .filter(|d| d.network_name == network)
            .map(|d| d.participant_name.clone())
            .collect()
    }

    /// Local descriptors on a network, excluding the sender itself.
    pub fn local_receivers_on_network(
        &self,
        network: &str,
        sender: EndpointAddress,
    ) -> Vec<ServiceDescriptor> {
        let indexes = self.indexes.read().expect("discovery lock poisoned");
        indexes
            .local
            .values()
            .filter(|d| d.network_name == network && d.endpoint() != sender)
            .cloned()
            .collect()
    }

    // ─── Handlers ───

    /// Register a discovery handler. The handler immediately observes every
    /// already-indexed remote service as `Created`, then live events in
    /// registration order.
    pub fn register_handler(
        &self,
        mut handler: impl FnMut(DiscoveryEventKind, &ServiceDescriptor) + Send + 'static,
    ) -> DiscoveryHandlerId {
        let id = DiscoveryHandlerId(self.next_handler_id.fetch_add(1, Ordering::AcqRel));
        let existing: Vec<ServiceDescriptor> = {
            let indexes = self.indexes.read().expect("discovery lock poisoned");
            indexes.remote.values().cloned().collect()
        };
        for descriptor in &existing {
            handler(DiscoveryEventKind::Created, descriptor);
        }
        self.handlers
            .lock()
            .expect("handler list poisoned")
            .push((id, Box::new(handler)));
        id
    }

    pub fn unregister_handler(&self, id: DiscoveryHandlerId) {
        self.handlers
            .lock()
            .expect("handler list poisoned")
            .retain(|(handler_id, _)| *handler_id != id);
    }

    /// Run the registered handlers for a batch of invocations, in
    /// registration order. Called from the dispatch thread.
    pub fn invoke_handlers(&self, invocations: &[HandlerInvocation]) {
        if invocations.is_empty() {
            return;
        }
        let mut handlers = self.handlers.lock().expect("handler list poisoned");
        for invocation in invocations {
            for (_, handler) in handlers.iter_mut() {
                handler(invocation.kind, &invocation.descriptor);
            }
        }
    }

    pub fn participant_name(&self) -> &str {
        &self.participant_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosim_types::{NetworkType, ParticipantId, ServiceId, ServiceType};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn descriptor(participant: &str, network: &str, service: &str, id: u16) -> ServiceDescriptor {
        ServiceDescriptor {
            participant_name: participant.to_string(),
            participant_id: ParticipantId::from_name(participant),
            network_name: network.to_string(),
            service_name: service.to_string(),
            service_id: ServiceId(id),
            service_type: ServiceType::Controller,
            network_type: NetworkType::Can,
            supplemental: BTreeMap::new(),
        }
    }

    #[test]
    fn duplicate_created_is_suppressed() {
        let discovery = ServiceDiscovery::new("Local");
        let d = descriptor("Remote", "CAN1", "Ctrl", 1);
        assert!(discovery
            .apply_remote_event(DiscoveryEventKind::Created, d.clone())
            .is_some());
        assert!(discovery
            .apply_remote_event(DiscoveryEventKind::Created, d)
            .is_none());
    }

    #[test]
    fn removed_for_unknown_is_ignored() {
        let discovery = ServiceDiscovery::new("Local");
        let d = descriptor("Remote", "CAN1", "Ctrl", 1);
        assert!(discovery
            .apply_remote_event(DiscoveryEventKind::Removed, d)
            .is_none());
    }

    #[test]
    fn announcement_replay_fires_once_per_descriptor() {
        let discovery = ServiceDiscovery::new("Local");
        let d = descriptor("Remote", "CAN1", "Ctrl", 1);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        discovery.register_handler(move |kind, _| {
            if kind == DiscoveryEventKind::Created {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let first = discovery.apply_announcement(vec![d.clone()]);
        discovery.invoke_handlers(&first);
        // Reconnect: the peer re-announces the same service.
        let second = discovery.apply_announcement(vec![d]);
        discovery.invoke_handlers(&second);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_observes_preexisting_services_on_registration() {
        let discovery = ServiceDiscovery::new("Local");
        let d = descriptor("Remote", "CAN1", "Ctrl", 1);
        discovery.apply_remote_event(DiscoveryEventKind::Created, d);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        discovery.register_handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_peer_removes_only_that_peers_services() {
        let discovery = ServiceDiscovery::new("Local");
        discovery.apply_remote_event(
            DiscoveryEventKind::Created,
            descriptor("A", "CAN1", "Ctrl", 1),
        );
        discovery.apply_remote_event(
            DiscoveryEventKind::Created,
            descriptor("B", "CAN1", "Ctrl", 1),
        );

        let removed = discovery.drop_peer("A");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].descriptor.participant_name, "A");
        assert_eq!(discovery.peers_on_network("CAN1").len(), 1);
    }

    #[test]
    fn local_duplicate_rejected() {
        let discovery = ServiceDiscovery::new("Local");
        assert!(discovery.insert_local(descriptor("Local", "CAN1", "Ctrl", 1)));
        assert!(!discovery.insert_local(descriptor("Local", "CAN1", "Ctrl", 2)));
    }

    #[test]
    fn peers_on_network_deduplicates_by_participant() {
        let discovery = ServiceDiscovery::new("Local");
        discovery.apply_remote_event(
            DiscoveryEventKind::Created,
            descriptor("A", "Eth0", "Ctrl1", 1),
        );
        discovery.apply_remote_event(
            DiscoveryEventKind::Created,
            descriptor("A", "Eth0", "Ctrl2", 2),
        );
        let peers = discovery.peers_on_network("Eth0");
        assert_eq!(peers.len(), 1);
        assert!(peers.contains("A"));
    }

    #[test]
    fn resolve_remote_by_wire_address() {
        let discovery = ServiceDiscovery::new("Local");
        let d = descriptor("A", "Eth0", "Ctrl1", 4);
        discovery.apply_remote_event(DiscoveryEventKind::Created, d.clone());
        assert_eq!(discovery.resolve_remote(d.endpoint()), Some(d));
    }
}
