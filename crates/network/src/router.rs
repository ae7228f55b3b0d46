//! Outbound routing: broadcast by network, targeted send, self-delivery.

use crate::{ConnectionManager, NetEvent};
use cosim_discovery::ServiceDiscovery;
use cosim_messages::Message;
use cosim_types::{EndpointAddress, ServiceDescriptor};
use cosim_wire::encode_frame;
use crossbeam::channel::Sender as EventSender;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{trace, warn};

/// Messages a network retains for replay to late-joining peers.
struct NetworkHistory {
    capacity: usize,
    frames: VecDeque<(EndpointAddress, Message)>,
}

impl NetworkHistory {
    fn push(&mut self, from: EndpointAddress, message: Message) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back((from, message));
    }
}

/// Resolves receivers for outbound messages and writes the frames.
///
/// Self-destined traffic never touches the wire: it re-enters the dispatch
/// channel as a [`NetEvent::Frame`] tagged with our own name, codec-free.
pub struct Router {
    connections: ConnectionManager,
    discovery: Arc<ServiceDiscovery>,
    events: EventSender<NetEvent>,
    history: Mutex<HashMap<String, NetworkHistory>>,
    /// (peer, network) pairs already served history this link session.
    history_replayed: Mutex<HashSet<(String, String)>>,
}

impl Router {
    pub fn new(
        connections: ConnectionManager,
        discovery: Arc<ServiceDiscovery>,
        events: EventSender<NetEvent>,
    ) -> Self {
        Self {
            connections,
            discovery,
            events,
            history: Mutex::new(HashMap::new()),
            history_replayed: Mutex::new(HashSet::new()),
        }
    }

    /// Broadcast on the sender's network: every peer owning at least one
    /// service on that network gets the frame once; local receivers get it
    /// in-process when the kind self-delivers.
    pub fn broadcast(&self, from: &ServiceDescriptor, message: Message) {
        let network = &from.network_name;
        let peers = self.discovery.peers_on_network(network);
        let from_addr = from.endpoint();

        if !peers.is_empty() {
            let frame = encode_frame(from_addr, &message);
            for peer_name in peers {
                self.write_to_peer(&peer_name, frame.clone());
            }
        }

        self.record_history(network, from_addr, &message);
        self.self_deliver(from_addr, message);
    }

    /// Send to one participant only. An unknown target is dropped with a
    /// warning and never blocks.
    pub fn send_to(&self, target_participant: &str, from: &ServiceDescriptor, message: Message) {
        let from_addr = from.endpoint();
        if target_participant == self.connections.participant_name() {
            self.self_deliver(from_addr, message);
            return;
        }
        match self.connections.peer(target_participant) {
            Some(peer) => {
                let frame = encode_frame(from_addr, &message);
                if peer.send_blocking(frame).is_err() {
                    warn!(
                        target = target_participant,
                        kind = message.type_name(),
                        "targeted send dropped: peer link closed"
                    );
                }
            }
            None => {
                warn!(
                    target = target_participant,
                    kind = message.type_name(),
                    "targeted send dropped: unknown participant"
                );
            }
        }
    }

    /// Deliver to every connected peer regardless of network. Used for
    /// orchestration traffic (status, commands, next-sim-task).
    pub fn broadcast_all(&self, from: EndpointAddress, message: Message) {
        let frame = encode_frame(from, &message);
        for peer in self.connections.all_peers() {
            if peer.send_blocking(frame.clone()).is_err() {
                trace!(peer = peer.name(), "broadcast to closing link dropped");
            }
        }
        self.self_deliver(from, message);
    }

    /// Retain the last `capacity` messages emitted on `network` for replay
    /// to late-joining peers.
    pub fn enable_history(&self, network: &str, capacity: usize) {
        if capacity == 0 {
            return;
        }
        let mut history = self.history.lock().expect("history lock");
        history
            .entry(network.to_string())
            .or_insert_with(|| NetworkHistory {
                capacity,
                frames: VecDeque::with_capacity(capacity),
            })
            .capacity = capacity;
    }

    /// Replay a network's retained history to a peer that just announced a
    /// service on it, once per link session, ahead of subsequent live
    /// traffic.
    pub fn replay_network_history_to(&self, peer_name: &str, network: &str) {
        let frames: Vec<Vec<u8>> = {
            let history = self.history.lock().expect("history lock");
            let Some(entry) = history.get(network) else {
                return;
            };
            entry
                .frames
                .iter()
                .map(|(from, message)| encode_frame(*from, message))
                .collect()
        };
        if frames.is_empty() {
            return;
        }
        {
            let mut replayed = self.history_replayed.lock().expect("replayed lock");
            if !replayed.insert((peer_name.to_string(), network.to_string())) {
                return;
            }
        }
        let Some(peer) = self.connections.peer(peer_name) else {
            return;
        };
        trace!(peer = peer_name, network, count = frames.len(), "replaying history");
        for frame in frames {
            if peer.send_blocking(frame).is_err() {
                return;
            }
        }
    }

    /// A peer's link went down; a reconnect gets history again.
    pub fn forget_peer(&self, peer_name: &str) {
        self.history_replayed
            .lock()
            .expect("replayed lock")
            .retain(|(peer, _)| peer != peer_name);
    }

    fn record_history(&self, network: &str, from: EndpointAddress, message: &Message) {
        let mut history = self.history.lock().expect("history lock");
        if let Some(entry) = history.get_mut(network) {
            entry.push(from, message.clone());
        }
    }

    fn self_deliver(&self, from: EndpointAddress, message: Message) {
        if !message.self_delivering() {
            return;
        }
        let _ = self.events.send(NetEvent::Frame {
            peer: self.connections.participant_name().to_string(),
            from,
            message,
        });
    }

    fn write_to_peer(&self, peer_name: &str, frame: Vec<u8>) {
        match self.connections.peer(peer_name) {
            Some(peer) => {
                if peer.send_blocking(frame).is_err() {
                    trace!(peer = peer_name, "send to closing link dropped");
                }
            }
            None => {
                // The service index can briefly outlive a dropped link.
                trace!(peer = peer_name, "no link for indexed peer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosim_messages::DataMessage;
    use cosim_types::{ParticipantId, ServiceId, SimTime};

    #[test]
    fn history_is_bounded_and_fifo() {
        let mut history = NetworkHistory {
            capacity: 3,
            frames: VecDeque::new(),
        };
        let from = EndpointAddress::new(ParticipantId::from_name("A"), ServiceId(1));
        for i in 0..5i64 {
            history.push(
                from,
                Message::DataMessage(DataMessage {
                    timestamp: SimTime::from_nanos(i),
                    payload: vec![i as u8],
                }),
            );
        }
        assert_eq!(history.frames.len(), 3);
        let first = match &history.frames[0].1 {
            Message::DataMessage(d) => d.payload[0],
            _ => unreachable!(),
        };
        assert_eq!(first, 2, "oldest entries evicted first");
    }
}
