//! Network transports.
//!
//! Two variants carry the same framed protocol:
//!
//! - [`UdpTransport`] — datagram transport used by game clients, one frame
//!   per datagram. It stands in for the platform peer-to-peer socket, whose
//!   reliable channel the production client rides; the codec and session
//!   layers are oblivious to the difference.
//! - [`TcpTransport`] — stream transport used by game servers and tooling.
//!   Each message is prefixed with a 4-byte little-endian length; one accept
//!   loop, one receive task per accepted peer.
//!
//! Both push [`TransportEvent`]s into one shared bounded queue consumed by
//! the dispatcher, and both sit behind the [`Outbound`] send contract so
//! upper layers never care which wire a peer arrived on.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Serialize;
use shared::messages::{encode_message, MsgType};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::{GcError, TransportError};

/// Opaque peer handle, unique across both transports for a process run.
pub type PeerId = u64;

/// Upper bound on a single wire message; anything larger drops the peer.
const MAX_MESSAGE_SIZE: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Datagram,
    Tcp,
}

/// A peer plus the transport it lives on; everything upper layers need to
/// address a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    pub id: PeerId,
    pub kind: TransportKind,
}

/// Events pushed to the dispatcher queue.
#[derive(Debug)]
pub enum TransportEvent {
    Connected { peer: PeerHandle, addr: SocketAddr },
    Message { peer: PeerHandle, data: Vec<u8> },
    Disconnected { peer: PeerHandle },
}

/// The send half of the transport contract.
///
/// `disconnect` is silent: callers that evict a peer themselves are
/// expected to clean up its session; a [`TransportEvent::Disconnected`] is
/// only emitted when the transport observes the peer going away.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_framed(
        &self,
        peer: PeerHandle,
        data: &[u8],
        reliable: bool,
    ) -> Result<(), TransportError>;

    async fn disconnect(&self, peer: PeerHandle);
}

/// Serializes a payload, frames it (auto-chunked) and sends every frame.
pub async fn send_message<T: Serialize>(
    out: &dyn Outbound,
    peer: PeerHandle,
    msg_type: MsgType,
    payload: &T,
) -> Result<(), GcError> {
    for frame in encode_message(msg_type, payload, 0)? {
        out.send_framed(peer, &frame, true).await?;
    }
    Ok(())
}

// === Datagram transport ===

#[derive(Default)]
struct UdpPeers {
    by_addr: HashMap<SocketAddr, PeerId>,
    by_id: HashMap<PeerId, SocketAddr>,
}

/// Datagram transport: peers appear on their first datagram and are reaped
/// by the session sweep, not by the socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    peers: Mutex<UdpPeers>,
    next_peer: Arc<AtomicU64>,
    events: mpsc::Sender<TransportEvent>,
}

impl UdpTransport {
    pub async fn bind(
        addr: &str,
        events: mpsc::Sender<TransportEvent>,
        next_peer: Arc<AtomicU64>,
        shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!("datagram endpoint listening on {}", local_addr);

        let transport = Arc::new(UdpTransport {
            socket,
            local_addr,
            peers: Mutex::new(UdpPeers::default()),
            next_peer,
            events,
        });

        tokio::spawn(Self::receive_loop(Arc::clone(&transport), shutdown));
        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn receive_loop(transport: Arc<UdpTransport>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; 65536];

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("datagram receive loop stopping");
                        return;
                    }
                }
                received = transport.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, addr)) => {
                            transport.accept_datagram(addr, buf[..len].to_vec()).await;
                        }
                        Err(e) => {
                            error!("datagram receive error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn accept_datagram(&self, addr: SocketAddr, data: Vec<u8>) {
        let (peer, is_new) = {
            let mut peers = self.peers.lock().await;
            match peers.by_addr.get(&addr) {
                Some(&id) => (id, false),
                None => {
                    let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
                    peers.by_addr.insert(addr, id);
                    peers.by_id.insert(id, addr);
                    (id, true)
                }
            }
        };

        let handle = PeerHandle {
            id: peer,
            kind: TransportKind::Datagram,
        };
        if is_new {
            info!("peer {} connected from {} (datagram)", peer, addr);
            let _ = self
                .events
                .send(TransportEvent::Connected { peer: handle, addr })
                .await;
        }
        let _ = self
            .events
            .send(TransportEvent::Message { peer: handle, data })
            .await;
    }

    async fn send_to_peer(&self, peer: PeerId, data: &[u8]) -> Result<(), TransportError> {
        let addr = {
            let peers = self.peers.lock().await;
            peers
                .by_id
                .get(&peer)
                .copied()
                .ok_or(TransportError::UnknownPeer(peer))?
        };

        self.socket
            .send_to(data, addr)
            .await
            .map_err(|e| TransportError::SendFailed {
                peer,
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn drop_peer(&self, peer: PeerId) {
        let mut peers = self.peers.lock().await;
        if let Some(addr) = peers.by_id.remove(&peer) {
            peers.by_addr.remove(&addr);
            debug!("peer {} removed from datagram transport", peer);
        }
    }
}

// === TCP transport ===

struct TcpPeer {
    addr: SocketAddr,
    writer: BufWriter<OwnedWriteHalf>,
    /// Receive task; absent only during the accept handshake.
    reader: Option<JoinHandle<()>>,
}

impl TcpPeer {
    fn abort_reader(&self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}

/// Stream transport with 4-byte little-endian length prefixes.
pub struct TcpTransport {
    local_addr: SocketAddr,
    peers: Mutex<HashMap<PeerId, TcpPeer>>,
    next_peer: Arc<AtomicU64>,
    events: mpsc::Sender<TransportEvent>,
}

impl TcpTransport {
    pub async fn bind(
        addr: &str,
        events: mpsc::Sender<TransportEvent>,
        next_peer: Arc<AtomicU64>,
        shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("TCP endpoint listening on {}", local_addr);

        let transport = Arc::new(TcpTransport {
            local_addr,
            peers: Mutex::new(HashMap::new()),
            next_peer,
            events,
        });

        tokio::spawn(Self::accept_loop(Arc::clone(&transport), listener, shutdown));
        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_loop(
        transport: Arc<TcpTransport>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("TCP accept loop stopping");
                        transport.close_all().await;
                        return;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            transport.accept_peer(stream, addr, shutdown.clone()).await;
                        }
                        Err(e) => {
                            error!("TCP accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn accept_peer(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) {
        let peer = self.next_peer.fetch_add(1, Ordering::Relaxed);
        info!("peer {} connected from {} (tcp)", peer, addr);

        let (read_half, write_half) = stream.into_split();
        self.peers.lock().await.insert(
            peer,
            TcpPeer {
                addr,
                writer: BufWriter::new(write_half),
                reader: None,
            },
        );

        // Announce the peer before the receive loop starts so its first
        // message can never outrun the Connected event.
        let handle = PeerHandle {
            id: peer,
            kind: TransportKind::Tcp,
        };
        let _ = self
            .events
            .send(TransportEvent::Connected { peer: handle, addr })
            .await;

        let reader = tokio::spawn(Self::receive_loop(
            Arc::clone(self),
            peer,
            read_half,
            shutdown,
        ));
        match self.peers.lock().await.get_mut(&peer) {
            Some(entry) => entry.reader = Some(reader),
            // The peer vanished during the handshake.
            None => reader.abort(),
        }
    }

    async fn receive_loop(
        transport: Arc<TcpTransport>,
        peer: PeerId,
        read_half: tokio::net::tcp::OwnedReadHalf,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut reader = BufReader::new(read_half);
        let mut len_buf = [0u8; 4];
        let handle = PeerHandle {
            id: peer,
            kind: TransportKind::Tcp,
        };

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                read = reader.read_exact(&mut len_buf) => {
                    if let Err(e) = read {
                        debug!("peer {} closed: {}", peer, e);
                        break;
                    }

                    let len = u32::from_le_bytes(len_buf) as usize;
                    if len > MAX_MESSAGE_SIZE {
                        warn!("peer {} sent oversized message of {} bytes", peer, len);
                        break;
                    }

                    let mut data = vec![0u8; len];
                    if let Err(e) = reader.read_exact(&mut data).await {
                        debug!("peer {} read failed: {}", peer, e);
                        break;
                    }

                    let _ = transport
                        .events
                        .send(TransportEvent::Message { peer: handle, data })
                        .await;
                }
            }
        }

        // Only announce a disconnect the transport observed itself; an
        // explicit disconnect() has already removed the map entry.
        let was_tracked = transport.peers.lock().await.remove(&peer).is_some();
        if was_tracked {
            info!("peer {} disconnected (tcp)", peer);
            let _ = transport
                .events
                .send(TransportEvent::Disconnected { peer: handle })
                .await;
        }
    }

    async fn send_to_peer(&self, peer: PeerId, data: &[u8]) -> Result<(), TransportError> {
        let mut peers = self.peers.lock().await;
        let entry = peers
            .get_mut(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;

        let write = async {
            entry
                .writer
                .write_all(&(data.len() as u32).to_le_bytes())
                .await?;
            entry.writer.write_all(data).await?;
            entry.writer.flush().await
        };

        if let Err(e) = write.await {
            // Non-retryable send error drops the peer.
            warn!("send to peer {} failed: {}", peer, e);
            let dead = peers.remove(&peer);
            drop(peers);
            if let Some(dead) = dead {
                dead.abort_reader();
                let _ = self
                    .events
                    .send(TransportEvent::Disconnected {
                        peer: PeerHandle {
                            id: peer,
                            kind: TransportKind::Tcp,
                        },
                    })
                    .await;
            }
            return Err(TransportError::SendFailed {
                peer,
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    async fn drop_peer(&self, peer: PeerId) {
        let removed = self.peers.lock().await.remove(&peer);
        if let Some(mut removed) = removed {
            let _ = removed.writer.shutdown().await;
            removed.abort_reader();
            info!("peer {} disconnected by coordinator ({})", peer, removed.addr);
        }
    }

    async fn close_all(&self) {
        let mut peers = self.peers.lock().await;
        for (peer, mut entry) in peers.drain() {
            let _ = entry.writer.shutdown().await;
            entry.abort_reader();
            debug!("peer {} closed on shutdown", peer);
        }
    }
}

// === Router ===

/// Routes sends to the transport a peer lives on. This is the only type
/// upper layers hold; it is what implements the common send contract over
/// the two wire variants.
#[derive(Clone)]
pub struct Router {
    pub udp: Arc<UdpTransport>,
    pub tcp: Arc<TcpTransport>,
}

#[async_trait]
impl Outbound for Router {
    async fn send_framed(
        &self,
        peer: PeerHandle,
        data: &[u8],
        _reliable: bool,
    ) -> Result<(), TransportError> {
        // The datagram side maps "reliable" onto the platform channel; both
        // stand-ins here deliver in order already.
        match peer.kind {
            TransportKind::Datagram => self.udp.send_to_peer(peer.id, data).await,
            TransportKind::Tcp => self.tcp.send_to_peer(peer.id, data).await,
        }
    }

    async fn disconnect(&self, peer: PeerHandle) {
        match peer.kind {
            TransportKind::Datagram => self.udp.drop_peer(peer.id).await,
            TransportKind::Tcp => self.tcp.drop_peer(peer.id).await,
        }
    }
}
