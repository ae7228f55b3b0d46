//! The registry accept loop and roster.

use cosim_messages::{
    KnownParticipants, Message, ParticipantAnnouncementReply, PeerInfo, CURRENT_PROTOCOL_VERSION,
};
use cosim_network::{read_frame, write_frame};
use cosim_types::{EndpointAddress, ParticipantId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RegistryServerError {
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
}

struct Roster {
    entries: HashMap<String, RosterEntry>,
}

struct RosterEntry {
    info: PeerInfo,
    outbound: mpsc::UnboundedSender<Message>,
}

impl Roster {
    fn known_participants(&self) -> KnownParticipants {
        KnownParticipants {
            participants: self.entries.values().map(|e| e.info.clone()).collect(),
        }
    }

    /// Push the current roster to every connected participant.
    fn broadcast_roster(&self) {
        let known = self.known_participants();
        for entry in self.entries.values() {
            let _ = entry
                .outbound
                .send(Message::KnownParticipants(known.clone()));
        }
    }
}

/// A running registry instance.
pub struct RegistryServer {
    local_addr: SocketAddr,
    roster: Arc<Mutex<Roster>>,
}

impl RegistryServer {
    /// Bind and start serving. The accept loop runs on the current runtime.
    pub async fn bind(host: &str, port: u16) -> Result<Self, RegistryServerError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| RegistryServerError::Bind(format!("{host}:{port}"), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RegistryServerError::Bind(format!("{host}:{port}"), e))?;
        info!(%local_addr, "registry listening");

        let roster = Arc::new(Mutex::new(Roster {
            entries: HashMap::new(),
        }));
        let accept_roster = Arc::clone(&roster);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!(%peer_addr, "registry connection");
                        let roster = Arc::clone(&accept_roster);
                        tokio::spawn(handle_connection(stream, roster));
                    }
                    Err(e) => {
                        warn!(error = %e, "registry accept failed");
                        break;
                    }
                }
            }
        });

        Ok(Self { local_addr, roster })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Names currently joined to the domain.
    pub fn participant_names(&self) -> Vec<String> {
        self.roster
            .lock()
            .expect("roster lock")
            .entries
            .keys()
            .cloned()
            .collect()
    }
}

fn registry_address() -> EndpointAddress {
    EndpointAddress::connection(ParticipantId::from_name("Registry"))
}

async fn handle_connection(stream: TcpStream, roster: Arc<Mutex<Roster>>) {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();

    // First frame must announce the participant.
    let first = match timeout(HANDSHAKE_TIMEOUT, read_frame(&mut read_half)).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            debug!(error = %e, "registry handshake read failed");
            return;
        }
        Err(_) => {
            debug!("registry handshake timed out");
            return;
        }
    };
    let announcement = match first.message {
        Message::ParticipantAnnouncement(a) => a,
        other => {
            debug!(kind = other.type_name(), "connection sent no announcement");
            return;
        }
    };

    let rejection = if announcement.protocol_version.major != CURRENT_PROTOCOL_VERSION.major {
        Some(format!(
            "protocol version {} incompatible with {}",
            announcement.protocol_version, CURRENT_PROTOCOL_VERSION
        ))
    } else {
        let roster = roster.lock().expect("roster lock");
        if roster.entries.contains_key(&announcement.participant_name) {
            Some(format!(
                "participant name '{}' already taken",
                announcement.participant_name
            ))
        } else {
            None
        }
    };
    if let Some(reason) = rejection {
        warn!(
            participant = %announcement.participant_name,
            %reason,
            "rejecting announcement"
        );
        let reply = Message::ParticipantAnnouncementReply(ParticipantAnnouncementReply::rejected(
            reason,
        ));
        let _ = write_frame(&mut write_half, registry_address(), &reply).await;
        return;
    }

    let name = announcement.participant_name.clone();
    let reply = Message::ParticipantAnnouncementReply(ParticipantAnnouncementReply::accepted());
    if write_frame(&mut write_half, registry_address(), &reply)
        .await
        .is_err()
    {
        return;
    }
    info!(participant = %name, "participant joined domain");

    // Register, then push the updated roster to everyone (the join push the
    // new participant receives doubles as its initial peer list).
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    {
        let mut roster = roster.lock().expect("roster lock");
        roster.entries.insert(
            name.clone(),
            RosterEntry {
                info: PeerInfo {
                    participant_name: name.clone(),
                    participant_id: announcement.participant_id,
                    tcp_endpoints: announcement.tcp_endpoints,
                    local_endpoints: announcement.local_endpoints,
                },
                outbound: outbound_tx,
            },
        );
        roster.broadcast_roster();
    }

    // Writer: queued roster pushes plus keepalives.
    let writer_name = name.clone();
    let writer = tokio::spawn(async move {
        // First keepalive only after a full interval, so the initial roster
        // push is the first frame the participant reads.
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                msg = outbound_rx.recv() => match msg {
                    Some(msg) => {
                        if write_frame(&mut write_half, registry_address(), &msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = keepalive.tick() => {
                    if write_frame(&mut write_half, registry_address(), &Message::Heartbeat)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
        debug!(participant = %writer_name, "registry writer finished");
    });

    // Reader: drain keepalives until the participant goes away.
    loop {
        match timeout(HEARTBEAT_INTERVAL * 3, read_frame(&mut read_half)).await {
            Ok(Ok(frame)) => {
                if !matches!(frame.message, Message::Heartbeat) {
                    debug!(
                        participant = %name,
                        kind = frame.message.type_name(),
                        "unexpected registry frame ignored"
                    );
                }
            }
            Ok(Err(_)) | Err(_) => break,
        }
    }

    info!(participant = %name, "participant left domain");
    {
        let mut roster = roster.lock().expect("roster lock");
        roster.entries.remove(&name);
        roster.broadcast_roster();
    }
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosim_messages::{ParticipantAnnouncement, TcpEndpoint};

    async fn announce(stream: &mut TcpStream, name: &str) -> Message {
        let announcement = ParticipantAnnouncement {
            participant_name: name.to_string(),
            participant_id: ParticipantId::from_name(name),
            protocol_version: CURRENT_PROTOCOL_VERSION,
            tcp_endpoints: vec![TcpEndpoint {
                host: "127.0.0.1".to_string(),
                port: 1,
            }],
            local_endpoints: vec![],
        };
        let from = EndpointAddress::connection(ParticipantId::from_name(name));
        write_frame(stream, from, &Message::ParticipantAnnouncement(announcement))
            .await
            .unwrap();
        read_frame(stream).await.unwrap().message
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn accepts_and_pushes_roster() {
        let registry = RegistryServer::bind("127.0.0.1", 0).await.unwrap();
        let mut a = TcpStream::connect(registry.local_addr()).await.unwrap();

        let reply = announce(&mut a, "A").await;
        assert!(matches!(
            reply,
            Message::ParticipantAnnouncementReply(ParticipantAnnouncementReply {
                accepted: true,
                ..
            })
        ));

        // The join push lists ourselves.
        let push = read_frame(&mut a).await.unwrap().message;
        match push {
            Message::KnownParticipants(known) => {
                assert_eq!(known.participants.len(), 1);
                assert_eq!(known.participants[0].participant_name, "A");
            }
            other => panic!("expected KnownParticipants, got {other:?}"),
        }

        // A second join is pushed to the first participant.
        let mut b = TcpStream::connect(registry.local_addr()).await.unwrap();
        announce(&mut b, "B").await;
        let push = loop {
            let frame = read_frame(&mut a).await.unwrap().message;
            if let Message::KnownParticipants(known) = frame {
                break known;
            }
        };
        assert_eq!(push.participants.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_name_is_rejected() {
        let registry = RegistryServer::bind("127.0.0.1", 0).await.unwrap();
        let mut a = TcpStream::connect(registry.local_addr()).await.unwrap();
        announce(&mut a, "A").await;

        let mut dup = TcpStream::connect(registry.local_addr()).await.unwrap();
        let reply = announce(&mut dup, "A").await;
        match reply {
            Message::ParticipantAnnouncementReply(reply) => {
                assert!(!reply.accepted);
                assert!(reply.reason.unwrap().contains("already taken"));
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn leaving_updates_the_roster()
    {
        let registry = RegistryServer::bind("127.0.0.1", 0).await.unwrap();
        let mut a = TcpStream::connect(registry.local_addr()).await.unwrap();
        announce(&mut a, "A").await;
        let mut b = TcpStream::connect(registry.local_addr()).await.unwrap();
        announce(&mut b, "B").await;
        drop(b);

        // Eventually a roster without B arrives.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            assert!(tokio::time::Instant::now() < deadline, "no roster update");
            let frame = read_frame(&mut a).await.unwrap().message;
            if let Message::KnownParticipants(known) = frame {
                if known.participants.len() == 1 {
                    assert_eq!(known.participants[0].participant_name, "A");
                    break;
                }
            }
        }
    }
}
