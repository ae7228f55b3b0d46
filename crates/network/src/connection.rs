//! The connection manager: registry client, peer handshakes, peer set.

use crate::framing::{read_frame, write_frame, FrameReadError};
use crate::peer::{spawn_link, LinkParams, PeerHandle, HEARTBEAT_INTERVAL};
use crate::{ConnectionError, NetEvent};
use cosim_messages::{
    AddressedMessage, KnownParticipants, Message, ParticipantAnnouncement,
    ParticipantAnnouncementReply, PeerInfo, ServiceAnnouncement, TcpEndpoint,
    CURRENT_PROTOCOL_VERSION,
};
use cosim_types::{EndpointAddress, ParticipantId, ServiceDescriptor};
use cosim_wire::encode_frame;
use crossbeam::channel::Sender as EventSender;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

/// Socket options applied to peer and registry links.
#[derive(Debug, Clone)]
pub struct TcpOptions {
    pub no_delay: bool,
    /// Recognized for configuration compatibility; applied only on
    /// platforms that support it (currently a no-op).
    pub quick_ack: bool,
    pub receive_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    pub enable_domain_sockets: bool,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            no_delay: false,
            quick_ack: false,
            receive_buffer_size: None,
            send_buffer_size: None,
            enable_domain_sockets: true,
        }
    }
}

/// Everything the connection manager needs to join a domain.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub participant_name: String,
    pub registry_host: String,
    pub registry_port: u16,
    /// Registry dial attempts before `RegistryUnreachable`; values below 1
    /// are clamped to 1.
    pub connect_attempts: u32,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Outbound queue bound per link (backpressure high-water mark).
    pub outbound_queue_capacity: usize,
    pub tcp: TcpOptions,
}

impl ConnectionOptions {
    pub fn new(participant_name: impl Into<String>) -> Self {
        Self {
            participant_name: participant_name.into(),
            registry_host: "localhost".to_string(),
            registry_port: 8500,
            connect_attempts: 9,
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            outbound_queue_capacity: 2048,
            tcp: TcpOptions::default(),
        }
    }
}

enum ControlMsg {
    RegistryFrame(AddressedMessage),
    RegistryLost,
}

struct Inner {
    options: ConnectionOptions,
    self_id: ParticipantId,
    self_addr: EndpointAddress,
    /// Established peer links, keyed by remote participant name.
    peers: DashMap<String, PeerHandle>,
    registry: Mutex<Option<PeerHandle>>,
    /// Names the registry currently knows (excluding us). Readiness means
    /// every one of them is linked.
    expected_peers: Mutex<HashSet<String>>,
    /// Peers with a dial in flight, to suppress duplicate dials when the
    /// registry pushes the roster again mid-handshake.
    dialing: Mutex<HashSet<String>>,
    events: EventSender<NetEvent>,
    rt: tokio::runtime::Handle,
    /// Supplies the current local service set for new-peer replay.
    local_services: Arc<dyn Fn() -> Vec<ServiceDescriptor> + Send + Sync>,
    announcement: ParticipantAnnouncement,
    link_params: LinkParams,
    #[cfg(unix)]
    local_socket_path: Option<std::path::PathBuf>,
}

/// Maintains the registry link and the set of peer links.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Join a domain: bind listeners, dial the registry, announce, and start
    /// accepting and dialing peers.
    ///
    /// Returns once the registry accepted us. Peer links come up in the
    /// background; [`NetEvent::PeersReady`] fires when every known peer is
    /// linked.
    pub async fn connect(
        options: ConnectionOptions,
        events: EventSender<NetEvent>,
        local_services: Arc<dyn Fn() -> Vec<ServiceDescriptor> + Send + Sync>,
    ) -> Result<Self, ConnectionError> {
        let self_id = ParticipantId::from_name(&options.participant_name);
        let self_addr = EndpointAddress::connection(self_id);

        // Bind before announcing so the endpoints are real.
        let tcp_listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let tcp_port = tcp_listener.local_addr()?.port();

        #[cfg(unix)]
        let (unix_listener, local_socket_path) = if options.tcp.enable_domain_sockets {
            let path = std::env::temp_dir().join(format!("cosim-{self_id}.sock"));
            let _ = std::fs::remove_file(&path);
            match tokio::net::UnixListener::bind(&path) {
                Ok(listener) => (Some(listener), Some(path)),
                Err(e) => {
                    debug!(error = %e, "domain socket unavailable, TCP only");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let announcement = ParticipantAnnouncement {
            participant_name: options.participant_name.clone(),
            participant_id: self_id,
            protocol_version: CURRENT_PROTOCOL_VERSION,
            tcp_endpoints: vec![TcpEndpoint {
                host: "127.0.0.1".to_string(),
                port: tcp_port,
            }],
            #[cfg(unix)]
            local_endpoints: local_socket_path
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            #[cfg(not(unix))]
            local_endpoints: Vec::new(),
        };

        let inner = Arc::new(Inner {
            self_id,
            self_addr,
            peers: DashMap::new(),
            registry: Mutex::new(None),
            expected_peers: Mutex::new(HashSet::new()),
            dialing: Mutex::new(HashSet::new()),
            events,
            rt: tokio::runtime::Handle::current(),
            local_services,
            announcement,
            link_params: LinkParams {
                heartbeat_frame: encode_frame(self_addr, &Message::Heartbeat),
                heartbeat_interval: options.heartbeat_interval,
                queue_capacity: options.outbound_queue_capacity,
            },
            #[cfg(unix)]
            local_socket_path,
            options,
        });
        let manager = Self { inner };

        manager.dial_registry().await?;

        // Accept loops for inbound peers.
        let accept_mgr = manager.clone();
        let rt = manager.inner.rt.clone();
        manager.inner.rt.spawn(async move {
            loop {
                match tcp_listener.accept().await {
                    Ok((stream, addr)) => {
                        trace!(%addr, "inbound peer connection");
                        accept_mgr.configure_stream(&stream);
                        let mgr = accept_mgr.clone();
                        rt.spawn(async move {
                            let (r, w) = stream.into_split();
                            mgr.accept_peer(r, w).await;
                        });
                    }
                    Err(e) => {
                        debug!(error = %e, "accept failed, listener closing");
                        break;
                    }
                }
            }
        });
        #[cfg(unix)]
        if let Some(listener) = unix_listener {
            let accept_mgr = manager.clone();
            let rt = manager.inner.rt.clone();
            manager.inner.rt.spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _)) => {
                            let mgr = accept_mgr.clone();
                            rt.spawn(async move {
                                let (r, w) = stream.into_split();
                                mgr.accept_peer(r, w).await;
                            });
                        }
                        Err(_) => break,
                    }
                }
            });
        }

        Ok(manager)
    }

    pub fn participant_name(&self) -> &str {
        &self.inner.options.participant_name
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.inner.self_id
    }

    /// The link to `peer`, if connected.
    pub fn peer(&self, peer: &str) -> Option<PeerHandle> {
        self.inner.peers.get(peer).map(|entry| entry.value().clone())
    }

    /// Snapshot of all connected peer links.
    pub fn all_peers(&self) -> Vec<PeerHandle> {
        self.inner
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Close every link. Writers drain their queues, then the streams shut
    /// down; readers run until EOF.
    pub fn shutdown(&self) {
        for entry in self.inner.peers.iter() {
            entry.value().close();
        }
        if let Some(registry) = self.inner.registry.lock().expect("registry lock").take() {
            registry.close();
        }
        #[cfg(unix)]
        if let Some(path) = &self.inner.local_socket_path {
            let _ = std::fs::remove_file(path);
        }
    }

    // ─── Registry ───

    async fn dial_registry(&self) -> Result<(), ConnectionError> {
        let options = &self.inner.options;
        let registry_addr = format!("{}:{}", options.registry_host, options.registry_port);
        let attempts = options.connect_attempts.max(1);
        let mut backoff = Duration::from_millis(100);

        for attempt in 1..=attempts {
            match self.try_registry_handshake(&registry_addr).await {
                Ok(()) => {
                    info!(registry = %registry_addr, "joined domain");
                    return Ok(());
                }
                Err(ConnectionError::Rejected(reason)) => {
                    return Err(ConnectionError::Rejected(reason));
                }
                Err(e) => {
                    debug!(
                        registry = %registry_addr,
                        attempt,
                        attempts,
                        error = %e,
                        "registry dial failed"
                    );
                }
            }
            if attempt < attempts {
                sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(2));
            }
        }
        Err(ConnectionError::RegistryUnreachable(registry_addr))
    }

    async fn try_registry_handshake(&self, registry_addr: &str) -> Result<(), ConnectionError> {
        let stream = TcpStream::connect(registry_addr).await?;
        self.configure_stream(&stream);
        let (mut read_half, mut write_half) = stream.into_split();

        write_frame(
            &mut write_half,
            self.inner.self_addr,
            &Message::ParticipantAnnouncement(self.inner.announcement.clone()),
        )
        .await?;

        let reply = timeout(self.inner.options.handshake_timeout, read_frame(&mut read_half))
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout)?
            .map_err(|_| ConnectionError::HandshakeTimeout)?;
        match reply.message {
            Message::ParticipantAnnouncementReply(reply) if reply.accepted => {}
            Message::ParticipantAnnouncementReply(reply) => {
                return Err(ConnectionError::Rejected(
                    reply.reason.unwrap_or_else(|| "unspecified".to_string()),
                ));
            }
            other => {
                return Err(ConnectionError::Rejected(format!(
                    "unexpected registry reply: {}",
                    other.type_name()
                )));
            }
        }

        // Registry frames flow through a control task that owns peer
        // discovery; data-plane events go straight to the dispatch thread.
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let frame_tx = control_tx.clone();
        let handle = spawn_link(
            "<registry>",
            read_half,
            write_half,
            &self.inner.link_params,
            &self.inner.rt,
            move |frame| {
                let _ = frame_tx.send(ControlMsg::RegistryFrame(frame));
            },
            move || {
                let _ = control_tx.send(ControlMsg::RegistryLost);
            },
        );
        *self.inner.registry.lock().expect("registry lock") = Some(handle);

        let mgr = self.clone();
        self.inner.rt.spawn(mgr.control_loop(control_rx));
        Ok(())
    }

    async fn control_loop(self, mut control_rx: mpsc::UnboundedReceiver<ControlMsg>) {
        while let Some(msg) = control_rx.recv().await {
            match msg {
                ControlMsg::RegistryFrame(frame) => match frame.message {
                    Message::KnownParticipants(known) => self.on_known_participants(known).await,
                    other => {
                        trace!(kind = other.type_name(), "registry frame ignored");
                    }
                },
                ControlMsg::RegistryLost => {
                    warn!("registry link lost");
                    let _ = self.inner.events.send(NetEvent::RegistryLost);
                    return;
                }
            }
        }
    }

    async fn on_known_participants(&self, known: KnownParticipants) {
        let self_name = self.participant_name();
        {
            let mut expected = self.inner.expected_peers.lock().expect("expected lock");
            expected.clear();
            expected.extend(
                known
                    .participants
                    .iter()
                    .filter(|p| p.participant_name != self_name)
                    .map(|p| p.participant_name.clone()),
            );
        }

        for peer in known.participants {
            if peer.participant_name == self_name {
                continue;
            }
            // Deterministic tie-break: the lower name dials.
            if self_name >= peer.participant_name.as_str() {
                continue;
            }
            if self.inner.peers.contains_key(&peer.participant_name) {
                continue;
            }
            {
                let mut dialing = self.inner.dialing.lock().expect("dialing lock");
                if !dialing.insert(peer.participant_name.clone()) {
                    continue;
                }
            }
            let mgr = self.clone();
            self.inner.rt.spawn(async move {
                let name = peer.participant_name.clone();
                mgr.dial_peer(peer).await;
                mgr.inner.dialing.lock().expect("dialing lock").remove(&name);
            });
        }
        self.check_ready();
    }

    // ─── Peer handshake: dialer side ───

    async fn dial_peer(&self, peer: PeerInfo) {
        let name = peer.participant_name.clone();
        match self.try_dial_peer(peer).await {
            Ok(()) => {}
            Err(e) => {
                warn!(peer = %name, error = %e, "peer dial failed");
            }
        }
    }

    async fn try_dial_peer(&self, peer: PeerInfo) -> Result<(), ConnectionError> {
        // Prefer the local-domain stream when both sides can reach it.
        #[cfg(unix)]
        if self.inner.options.tcp.enable_domain_sockets {
            for path in &peer.local_endpoints {
                if let Ok(stream) = tokio::net::UnixStream::connect(path).await {
                    trace!(peer = %peer.participant_name, %path, "connected via domain socket");
                    let (r, w) = stream.into_split();
                    return self.finish_dial(&peer.participant_name, r, w).await;
                }
            }
        }

        let mut last_error: Option<ConnectionError> = None;
        for endpoint in &peer.tcp_endpoints {
            match self.dial_tcp(&endpoint.host, endpoint.port).await {
                Ok(stream) => {
                    let (r, w) = stream.into_split();
                    return self.finish_dial(&peer.participant_name, r, w).await;
                }
                Err(e) => last_error = Some(e.into()),
            }
        }
        Err(last_error.unwrap_or(ConnectionError::Disconnected))
    }

    async fn dial_tcp(&self, host: &str, port: u16) -> std::io::Result<TcpStream> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        let mut last_error = None;
        for addr in addrs {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            if let Some(size) = self.inner.options.tcp.receive_buffer_size {
                let _ = socket.set_recv_buffer_size(size as u32);
            }
            if let Some(size) = self.inner.options.tcp.send_buffer_size {
                let _ = socket.set_send_buffer_size(size as u32);
            }
            match socket.connect(addr).await {
                Ok(stream) => {
                    self.configure_stream(&stream);
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address")))
    }

    async fn finish_dial<R, W>(
        &self,
        peer_name: &str,
        mut read_half: R,
        mut write_half: W,
    ) -> Result<(), ConnectionError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        write_frame(
            &mut write_half,
            self.inner.self_addr,
            &Message::ParticipantAnnouncement(self.inner.announcement.clone()),
        )
        .await?;

        let deadline = self.inner.options.handshake_timeout;
        let reply = timeout(deadline, read_frame(&mut read_half))
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout)?
            .map_err(handshake_read_error)?;
        match reply.message {
            Message::ParticipantAnnouncementReply(reply) if reply.accepted => {}
            Message::ParticipantAnnouncementReply(reply) => {
                return Err(ConnectionError::Rejected(
                    reply.reason.unwrap_or_else(|| "unspecified".to_string()),
                ));
            }
            other => {
                return Err(ConnectionError::Rejected(format!(
                    "unexpected handshake frame: {}",
                    other.type_name()
                )));
            }
        }
        // The acceptor's own announcement follows its reply.
        let announcement = timeout(deadline, read_frame(&mut read_half))
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout)?
            .map_err(handshake_read_error)?;
        let announced = match announcement.message {
            Message::ParticipantAnnouncement(a) => a,
            other => {
                return Err(ConnectionError::Rejected(format!(
                    "unexpected handshake frame: {}",
                    other.type_name()
                )));
            }
        };
        if announced.participant_name != peer_name {
            return Err(ConnectionError::Rejected(format!(
                "peer announced as {}, expected {peer_name}",
                announced.participant_name
            )));
        }

        self.install_peer(peer_name, read_half, write_half).await;
        Ok(())
    }

    // ─── Peer handshake: acceptor side ───

    async fn accept_peer<R, W>(&self, mut read_half: R, mut write_half: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let deadline = self.inner.options.handshake_timeout;
        let first = match timeout(deadline, read_frame(&mut read_half)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                debug!(error = %e, "inbound handshake read failed");
                return;
            }
            Err(_) => {
                debug!("inbound handshake timed out");
                return;
            }
        };
        let announced = match first.message {
            Message::ParticipantAnnouncement(a) => a,
            other => {
                debug!(kind = other.type_name(), "inbound link sent no announcement");
                return;
            }
        };

        let self_name = self.participant_name();
        let reject = |reason: String| Message::ParticipantAnnouncementReply(
            ParticipantAnnouncementReply::rejected(reason),
        );
        let rejection = if announced.protocol_version.major != CURRENT_PROTOCOL_VERSION.major {
            Some(reject(format!(
                "protocol version {} incompatible with {}",
                announced.protocol_version, CURRENT_PROTOCOL_VERSION
            )))
        } else if announced.participant_name == self_name {
            Some(reject("participant name collision".to_string()))
        } else if announced.participant_name.as_str() > self_name {
            // The lower name dials; an inbound link from a higher name is a
            // tie-break violation.
            Some(reject("handshake tie-break: higher name must accept".to_string()))
        } else if self.inner.peers.contains_key(&announced.participant_name) {
            Some(reject("already connected".to_string()))
        } else {
            None
        };
        if let Some(reply) = rejection {
            warn!(peer = %announced.participant_name, "rejecting inbound peer");
            let _ = write_frame(&mut write_half, self.inner.self_addr, &reply).await;
            return;
        }

        let accept = Message::ParticipantAnnouncementReply(ParticipantAnnouncementReply::accepted());
        if write_frame(&mut write_half, self.inner.self_addr, &accept)
            .await
            .is_err()
        {
            return;
        }
        if write_frame(
            &mut write_half,
            self.inner.self_addr,
            &Message::ParticipantAnnouncement(self.inner.announcement.clone()),
        )
        .await
        .is_err()
        {
            return;
        }

        self.install_peer(&announced.participant_name, read_half, write_half)
            .await;
    }

    // ─── Post-handshake ───

    /// Register the link, replay our service set, and signal the dispatch
    /// thread.
    async fn install_peer<R, W>(&self, peer_name: &str, read_half: R, write_half: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let events = self.inner.events.clone();
        let peer_for_frames = peer_name.to_string();
        let frame_events = events.clone();
        let mgr = self.clone();
        let peer_for_close = peer_name.to_string();

        let handle = spawn_link(
            peer_name,
            read_half,
            write_half,
            &self.inner.link_params,
            &self.inner.rt,
            move |frame| {
                let _ = frame_events.send(NetEvent::Frame {
                    peer: peer_for_frames.clone(),
                    from: frame.from,
                    message: frame.message,
                });
            },
            move || {
                // Only drop the map entry if it is still this (now closed)
                // link; a replacement link must survive the old teardown.
                let removed = mgr
                    .inner
                    .peers
                    .remove_if(&peer_for_close, |_, handle| handle.is_closed());
                if removed.is_some() {
                    let _ = mgr.inner.events.send(NetEvent::PeerDisconnected {
                        peer: peer_for_close.clone(),
                    });
                }
            },
        );

        // Replay the full local service set before any live traffic.
        let announcement = Message::ServiceAnnouncement(ServiceAnnouncement {
            services: (self.inner.local_services)(),
        });
        let frame = encode_frame(self.inner.self_addr, &announcement);
        if handle.send(frame).await.is_err() {
            warn!(peer = %peer_name, "peer vanished during service replay");
            return;
        }

        self.inner.peers.insert(peer_name.to_string(), handle);
        info!(peer = %peer_name, "peer connected");
        let _ = events.send(NetEvent::PeerConnected {
            peer: peer_name.to_string(),
        });
        self.check_ready();
    }

    fn check_ready(&self) {
        let expected = self.inner.expected_peers.lock().expect("expected lock");
        let all_linked = expected
            .iter()
            .all(|name| self.inner.peers.contains_key(name));
        if all_linked {
            let _ = self.inner.events.send(NetEvent::PeersReady);
        }
    }

    fn configure_stream(&self, stream: &TcpStream) {
        if self.inner.options.tcp.no_delay {
            let _ = stream.set_nodelay(true);
        }
    }
}

fn handshake_read_error(e: FrameReadError) -> ConnectionError {
    match e {
        FrameReadError::Io(io) => ConnectionError::Io(io),
        _ => ConnectionError::Disconnected,
    }
}
