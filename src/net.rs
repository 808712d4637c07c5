//! Transport plumbing shared by the engine and the sessions.
//!
//! A [`Channel`] is the session's half of one TCP connection: an ordered,
//! non-blocking enqueue of outbound frames plus a close signal. The socket
//! itself stays with [`drive_connection`], which pumps reads into the
//! owning [`NetworkHandler`] and drains the channel queue onto the wire.
//! Sessions never touch the socket, which keeps the outbound path free of
//! await points and makes the dispatch logic testable without a network.

use crate::fix::mem::MsgBuf;
use crate::fix::SessionError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

enum WriteCmd {
    Frame(MsgBuf),
    Shutdown,
}

/// The write handle bound to a session while a connection is up.
#[derive(Clone)]
pub struct Channel {
    id: u64,
    peer: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<WriteCmd>,
    closed: Arc<AtomicBool>,
}

impl Channel {
    fn new(peer: Option<SocketAddr>) -> (Self, mpsc::UnboundedReceiver<WriteCmd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Channel {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (channel, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Enqueues one frame for the writer task. Frames reach the wire in
    /// enqueue order.
    pub fn send(&self, frame: MsgBuf) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::ChannelClosed);
        }
        self.tx
            .send(WriteCmd::Frame(frame))
            .map_err(|_| SessionError::ChannelClosed)
    }

    /// Asks the connection task to flush and drop the socket.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(WriteCmd::Shutdown);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The session-side contract the network layer drives.
///
/// `on_data_received` returns the number of bytes consumed; unconsumed
/// bytes are offered again on the next read. Callbacks for one channel are
/// invoked sequentially from a single task.
pub trait NetworkHandler: Send + Sync {
    fn on_connected(&self, channel: Channel);
    fn on_data_received(&self, channel: &Channel, data: &[u8]) -> usize;
    fn on_disconnected(&self, channel: &Channel, cause: Option<&SessionError>);
    fn on_connect_failed(&self, remote: &str, cause: &std::io::Error);
    fn on_accept_failed(&self, cause: &std::io::Error);
    /// Advises how many bytes the next read should request.
    fn num_bytes_to_read(&self, channel: &Channel) -> usize;
}

/// Runs one TCP connection to completion.
///
/// `preread` holds bytes that were consumed before the handler was known
/// (an acceptor parks connections until the first Logon identifies the
/// session); they are replayed before the first socket read.
pub async fn drive_connection(
    stream: TcpStream,
    handler: Arc<dyn NetworkHandler>,
    preread: Vec<u8>,
) {
    let peer = stream.peer_addr().ok();
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();
    let (channel, mut rx) = Channel::new(peer);
    let closed = Arc::clone(&channel.closed);

    handler.on_connected(channel.clone());

    if !preread.is_empty() {
        offer(&*handler, &channel, &preread, &mut Vec::new());
    }

    let mut pending: Vec<u8> = Vec::new();
    let mut disconnect_cause: Option<SessionError> = None;
    loop {
        let want = handler.num_bytes_to_read(&channel).max(1);
        let mut buf = vec![0u8; want];
        tokio::select! {
            biased;

            cmd = rx.recv() => {
                match cmd {
                    Some(WriteCmd::Frame(frame)) => {
                        if let Err(e) = write_half.write_all(&frame[..]).await {
                            warn!(channel = channel.id(), error = %e, "write failed");
                            disconnect_cause = Some(e.into());
                            break;
                        }
                    }
                    Some(WriteCmd::Shutdown) | None => {
                        debug!(channel = channel.id(), "channel closed locally");
                        break;
                    }
                }
            }
            read = read_half.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!(channel = channel.id(), "peer closed the connection");
                        break;
                    }
                    Ok(n) => {
                        offer(&*handler, &channel, &buf[..n], &mut pending);
                    }
                    Err(e) => {
                        disconnect_cause = Some(e.into());
                        break;
                    }
                }
            }
        }
    }

    closed.store(true, Ordering::Release);
    // drain whatever the session managed to enqueue before the close
    while let Ok(WriteCmd::Frame(frame)) = rx.try_recv() {
        if write_half.write_all(&frame[..]).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
    handler.on_disconnected(&channel, disconnect_cause.as_ref());
}

/// Feeds bytes to the handler, buffering whatever it does not consume.
fn offer(
    handler: &dyn NetworkHandler,
    channel: &Channel,
    fresh: &[u8],
    pending: &mut Vec<u8>,
) {
    pending.extend_from_slice(fresh);
    let consumed = handler.on_data_received(channel, pending);
    pending.drain(..consumed.min(pending.len()));
}
