//! One full-duplex link to one remote participant (or the registry).
//!
//! A link owns two tokio tasks: a writer draining the bounded outbound
//! queue, and a reader parsing frames and handing them to the link's sink.
//! The queue bound is the backpressure high-water mark — senders block once
//! it fills. Frames cross the link in send order, and teardown surfaces
//! exactly once, after all frames already read have been delivered.
//!
//! Heartbeat: if nothing was written for one interval, a keepalive frame is
//! emitted; if nothing was read for three intervals, the link is declared
//! dead.

use crate::framing::{read_frame, FrameReadError};
use crate::ConnectionError;
use cosim_messages::AddressedMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Default keepalive interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Read intervals without a frame before the link is declared dead.
const DEAD_AFTER_INTERVALS: u32 = 3;

enum WriteCmd {
    Frame(Vec<u8>),
    /// Resolve once every previously queued frame hit the stream.
    Flush(oneshot::Sender<()>),
}

/// Cheap handle to a spawned link. Cloned into the router and the
/// connection manager; dropping the last clone half-closes the link after
/// draining the outbound queue.
#[derive(Clone)]
pub struct PeerHandle {
    name: Arc<str>,
    outbound: mpsc::Sender<WriteCmd>,
    closed: Arc<AtomicBool>,
}

impl PeerHandle {
    /// Remote participant name (or the registry marker).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue an encoded frame from a non-runtime thread, blocking at the
    /// high-water mark.
    pub fn send_blocking(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Disconnected);
        }
        self.outbound
            .blocking_send(WriteCmd::Frame(frame))
            .map_err(|_| ConnectionError::Disconnected)
    }

    /// Enqueue an encoded frame from a runtime task.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Disconnected);
        }
        self.outbound
            .send(WriteCmd::Frame(frame))
            .await
            .map_err(|_| ConnectionError::Disconnected)
    }

    /// Block until the local send buffer is drained.
    pub fn flush_blocking(&self) -> Result<(), ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.outbound
            .blocking_send(WriteCmd::Flush(tx))
            .map_err(|_| ConnectionError::Disconnected)?;
        rx.blocking_recv().map_err(|_| ConnectionError::Disconnected)
    }

    /// Graceful half-close: the writer drains what is queued, then shuts the
    /// stream down. Subsequent sends fail with `Disconnected`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("name", &self.name)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Parameters shared by every link of one participant.
pub(crate) struct LinkParams {
    /// Pre-encoded keepalive frame (carries our connection address).
    pub heartbeat_frame: Vec<u8>,
    pub heartbeat_interval: Duration,
    /// Outbound queue bound; the backpressure high-water mark.
    pub queue_capacity: usize,
}

/// Spawn the writer/reader task pair for an established stream.
///
/// `on_frame` runs on the reader task for every decoded non-heartbeat frame;
/// `on_closed` runs exactly once when the reader terminates, after all
/// frames already read were delivered. Neither runs user code.
pub(crate) fn spawn_link<R, W>(
    peer_name: &str,
    read_half: R,
    write_half: W,
    params: &LinkParams,
    rt: &tokio::runtime::Handle,
    on_frame: impl Fn(AddressedMessage) + Send + 'static,
    on_closed: impl FnOnce() + Send + 'static,
) -> PeerHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel(params.queue_capacity);
    let closed = Arc::new(AtomicBool::new(false));

    rt.spawn(writer_task(
        peer_name.to_string(),
        write_half,
        outbound_rx,
        params.heartbeat_frame.clone(),
        params.heartbeat_interval,
        Arc::clone(&closed),
    ));
    rt.spawn(reader_task(
        peer_name.to_string(),
        read_half,
        params.heartbeat_interval * DEAD_AFTER_INTERVALS,
        Arc::clone(&closed),
        on_frame,
        on_closed,
    ));

    PeerHandle {
        name: Arc::from(peer_name),
        outbound: outbound_tx,
        closed,
    }
}

async fn writer_task<W: AsyncWrite + Unpin>(
    peer: String,
    mut stream: W,
    mut outbound: mpsc::Receiver<WriteCmd>,
    heartbeat_frame: Vec<u8>,
    heartbeat_interval: Duration,
    closed: Arc<AtomicBool>,
) {
    let mut keepalive = tokio::time::interval(heartbeat_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_write = Instant::now();

    loop {
        tokio::select! {
            cmd = outbound.recv() => match cmd {
                Some(WriteCmd::Frame(frame)) => {
                    if let Err(e) = stream.write_all(&frame).await {
                        debug!(peer = %peer, error = %e, "write failed, closing link");
                        break;
                    }
                    last_write = Instant::now();
                    if closed.load(Ordering::Acquire) && outbound.is_empty() {
                        break;
                    }
                }
                Some(WriteCmd::Flush(done)) => {
                    let _ = stream.flush().await;
                    let _ = done.send(());
                }
                None => break,
            },
            _ = keepalive.tick() => {
                if closed.load(Ordering::Acquire) {
                    break;
                }
                if last_write.elapsed() >= heartbeat_interval {
                    if let Err(e) = stream.write_all(&heartbeat_frame).await {
                        debug!(peer = %peer, error = %e, "keepalive write failed");
                        break;
                    }
                    last_write = Instant::now();
                }
            }
        }
    }

    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
    closed.store(true, Ordering::Release);
    outbound.close();
    trace!(peer = %peer, "writer task finished");
}

async fn reader_task<R: AsyncRead + Unpin>(
    peer: String,
    mut stream: R,
    dead_after: Duration,
    closed: Arc<AtomicBool>,
    on_frame: impl Fn(AddressedMessage),
    on_closed: impl FnOnce(),
) {
    loop {
        match timeout(dead_after, read_frame(&mut stream)).await {
            Err(_) => {
                warn!(peer = %peer, "no frame read for {:?}, declaring link dead", dead_after);
                break;
            }
            Ok(Err(FrameReadError::Eof)) => {
                debug!(peer = %peer, "remote closed the link");
                break;
            }
            Ok(Err(FrameReadError::Io(e))) => {
                debug!(peer = %peer, error = %e, "read failed, closing link");
                break;
            }
            Ok(Err(FrameReadError::Codec(e))) => {
                warn!(peer = %peer, error = %e, "undecodable frame, tearing down link");
                break;
            }
            Ok(Ok(message)) => {
                if matches!(message.message, cosim_messages::Message::Heartbeat) {
                    trace!(peer = %peer, "heartbeat");
                    continue;
                }
                on_frame(message);
            }
        }
    }

    closed.store(true, Ordering::Release);
    on_closed();
    trace!(peer = %peer, "reader task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosim_messages::Message;
    use cosim_types::{EndpointAddress, ParticipantId};
    use cosim_wire::encode_frame;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn params() -> LinkParams {
        let addr = EndpointAddress::connection(ParticipantId::from_name("A"));
        LinkParams {
            heartbeat_frame: encode_frame(addr, &Message::Heartbeat),
            heartbeat_interval: Duration::from_millis(50),
            queue_capacity: 16,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frames_arrive_in_send_order() {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (local_r, local_w) = tokio::io::split(local);
        let (remote_r, remote_w) = tokio::io::split(remote);

        let received = Arc::new(Mutex::new(Vec::new()));
        let disconnects = Arc::new(AtomicUsize::new(0));

        let sink = Arc::clone(&received);
        let disc = Arc::clone(&disconnects);
        let rt = tokio::runtime::Handle::current();
        let _remote_handle = spawn_link(
            "A",
            remote_r,
            remote_w,
            &params(),
            &rt,
            move |m| sink.lock().unwrap().push(m),
            move || {
                disc.fetch_add(1, Ordering::SeqCst);
            },
        );
        let local_handle = spawn_link("B", local_r, local_w, &params(), &rt, |_| {}, || {});

        let from = EndpointAddress::connection(ParticipantId::from_name("A"));
        for i in 0..10u8 {
            let frame = encode_frame(
                from,
                &Message::DataMessage(cosim_messages::DataMessage {
                    timestamp: cosim_types::SimTime::from_nanos(i as i64),
                    payload: vec![i],
                }),
            );
            local_handle.send(frame).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let frames = received.lock().unwrap();
        assert_eq!(frames.len(), 10);
        for (i, frame) in frames.iter().enumerate() {
            match &frame.message {
                Message::DataMessage(d) => assert_eq!(d.payload, vec![i as u8]),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_surfaces_one_disconnect_after_queued_frames() {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (local_r, local_w) = tokio::io::split(local);
        let (remote_r, remote_w) = tokio::io::split(remote);

        let received = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&received);
        let disc = Arc::clone(&disconnects);
        let rt = tokio::runtime::Handle::current();
        let _remote_handle = spawn_link(
            "A",
            remote_r,
            remote_w,
            &params(),
            &rt,
            move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                disc.fetch_add(1, Ordering::SeqCst);
            },
        );
        let local_handle = spawn_link("B", local_r, local_w, &params(), &rt, |_| {}, || {});

        let from = EndpointAddress::connection(ParticipantId::from_name("A"));
        for _ in 0..5 {
            local_handle
                .send(encode_frame(
                    from,
                    &Message::DataMessage(cosim_messages::DataMessage {
                        timestamp: cosim_types::SimTime::ZERO,
                        payload: vec![1],
                    }),
                ))
                .await
                .unwrap();
        }
        local_handle.close();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(received.load(Ordering::SeqCst), 5, "queued frames delivered");
        assert_eq!(disconnects.load(Ordering::SeqCst), 1, "exactly one disconnect");
        assert!(matches!(
            local_handle.send(vec![0]).await,
            Err(ConnectionError::Disconnected)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_link_stays_alive_via_heartbeat() {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (local_r, local_w) = tokio::io::split(local);
        let (remote_r, remote_w) = tokio::io::split(remote);

        let disconnects = Arc::new(AtomicUsize::new(0));
        let disc = Arc::clone(&disconnects);
        let rt = tokio::runtime::Handle::current();
        let _remote_handle = spawn_link(
            "A",
            remote_r,
            remote_w,
            &params(),
            &rt,
            |_| {},
            move || {
                disc.fetch_add(1, Ordering::SeqCst);
            },
        );
        let _local_handle = spawn_link("B", local_r, local_w, &params(), &rt, |_| {}, || {});

        // Five dead-intervals of silence; keepalives must keep both ends up.
        tokio::time::sleep(Duration::from_millis(750)).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn undecodable_frame_tears_down_the_link() {
        let (mut local, remote) = tokio::io::duplex(4096);
        let (remote_r, remote_w) = tokio::io::split(remote);

        let disconnects = Arc::new(AtomicUsize::new(0));
        let disc = Arc::clone(&disconnects);
        let rt = tokio::runtime::Handle::current();
        let _remote_handle = spawn_link(
            "A",
            remote_r,
            remote_w,
            &params(),
            &rt,
            |_| {},
            move || {
                disc.fetch_add(1, Ordering::SeqCst);
            },
        );

        // A frame with an unassigned kind byte.
        let mut bogus = 11u32.to_le_bytes().to_vec();
        bogus.push(0xff);
        bogus.extend_from_slice(&[0u8; 10]);
        tokio::io::AsyncWriteExt::write_all(&mut local, &bogus)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }
}
