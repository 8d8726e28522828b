//! Client session management.
//!
//! This module tracks every connected peer, including:
//! - Session lifecycle (connect, authenticate, disconnect, idle timeout)
//! - Activity tracking driven by inbound frames
//! - Per-peer reassembly of chunked messages
//! - Malformed-frame accounting (repeat offenders are cut off)
//! - The per-session inventory cursor used by the item-change scan
//!
//! Sessions exist for every peer from the moment the transport reports the
//! connection; authentication attaches the platform id once the ticket has
//! been validated. Only authenticated sessions may speak the rest of the
//! protocol.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::info;
use shared::codec::{Frame, FrameAssembler};
use tokio::sync::Mutex;

use crate::transport::{PeerHandle, PeerId};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle time after which a session is reaped.
    pub idle_timeout: Duration,
    /// Malformed frames tolerated within `malformed_window` before the
    /// session is dropped.
    pub malformed_threshold: u32,
    pub malformed_window: Duration,
    /// Incomplete chunk groups older than this are discarded.
    pub assembly_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            malformed_threshold: 10,
            malformed_window: Duration::from_secs(60),
            assembly_timeout: Duration::from_secs(30),
        }
    }
}

/// State kept per connected peer.
#[derive(Debug)]
pub struct Session {
    pub peer: PeerHandle,
    pub addr: SocketAddr,
    /// Platform id, zero until authenticated.
    pub steam_id: u64,
    pub authenticated: bool,
    pub last_activity: Instant,
    /// Highest inventory item id already announced to this session.
    pub last_checked_item_id: u64,
    /// Whether the cursor has been positioned; set eagerly at auth time,
    /// or on the first scan if the repository was unavailable then.
    pub item_cursor_ready: bool,
    assembler: FrameAssembler,
    malformed: VecDeque<Instant>,
}

impl Session {
    fn new(peer: PeerHandle, addr: SocketAddr) -> Self {
        Self {
            peer,
            addr,
            steam_id: 0,
            authenticated: false,
            last_activity: Instant::now(),
            last_checked_item_id: 0,
            item_cursor_ready: false,
            assembler: FrameAssembler::new(),
            malformed: VecDeque::new(),
        }
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }
}

/// Snapshot of an authenticated session used by the item-change scan.
#[derive(Debug, Clone, Copy)]
pub struct ItemScanEntry {
    pub peer: PeerHandle,
    pub steam_id: u64,
    pub cursor: u64,
    pub cursor_ready: bool,
}

#[derive(Default)]
struct Inner {
    by_peer: HashMap<PeerId, Session>,
    by_steam: HashMap<u64, PeerId>,
}

/// Registry of live sessions, keyed by peer with a platform-id index.
pub struct SessionRegistry {
    config: SessionConfig,
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub async fn connect(&self, peer: PeerHandle, addr: SocketAddr) {
        let mut inner = self.inner.lock().await;
        inner.by_peer.insert(peer.id, Session::new(peer, addr));
    }

    /// Removes the session; returns it so the caller can unwind queue and
    /// match membership.
    pub async fn disconnect(&self, peer: PeerId) -> Option<Session> {
        let mut inner = self.inner.lock().await;
        let session = inner.by_peer.remove(&peer)?;
        if session.authenticated {
            inner.by_steam.remove(&session.steam_id);
        }
        Some(session)
    }

    pub async fn touch(&self, peer: PeerId) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.by_peer.get_mut(&peer) {
            session.last_activity = Instant::now();
        }
    }

    /// Marks the session authenticated and indexes it by platform id.
    ///
    /// Returns the peer handle of a previous session holding the same id,
    /// if any; the caller should disconnect it (latest login wins).
    pub async fn authenticate(&self, peer: PeerId, steam_id: u64) -> Option<PeerHandle> {
        let mut inner = self.inner.lock().await;

        let evicted = match inner.by_steam.get(&steam_id) {
            Some(&old_peer) if old_peer != peer => {
                inner.by_peer.remove(&old_peer).map(|old| old.peer)
            }
            _ => None,
        };

        if let Some(session) = inner.by_peer.get_mut(&peer) {
            session.steam_id = steam_id;
            session.authenticated = true;
            session.last_activity = Instant::now();
            inner.by_steam.insert(steam_id, peer);
            info!("session {} authenticated as {}", peer, steam_id);
        }
        evicted
    }

    pub async fn is_authenticated(&self, peer: PeerId) -> bool {
        let inner = self.inner.lock().await;
        inner
            .by_peer
            .get(&peer)
            .map(|s| s.authenticated)
            .unwrap_or(false)
    }

    /// Platform id of an authenticated session.
    pub async fn steam_id_of(&self, peer: PeerId) -> Option<u64> {
        let inner = self.inner.lock().await;
        inner
            .by_peer
            .get(&peer)
            .filter(|s| s.authenticated)
            .map(|s| s.steam_id)
    }

    pub async fn peer_of(&self, steam_id: u64) -> Option<PeerHandle> {
        let inner = self.inner.lock().await;
        let peer = inner.by_steam.get(&steam_id)?;
        inner.by_peer.get(peer).map(|s| s.peer)
    }

    /// Feeds a decoded frame into the session's reassembler; returns the
    /// completed `(msg_type, payload)` when the message is whole.
    pub async fn push_frame(&self, peer: PeerId, frame: Frame) -> Option<(u32, Vec<u8>)> {
        let mut inner = self.inner.lock().await;
        let session = inner.by_peer.get_mut(&peer)?;
        session.last_activity = Instant::now();
        session.assembler.push(frame)
    }

    /// Records a malformed frame; true means the session crossed the
    /// threshold and should be disconnected.
    pub async fn record_malformed(&self, peer: PeerId) -> bool {
        let mut inner = self.inner.lock().await;
        let (threshold, window) = (self.config.malformed_threshold, self.config.malformed_window);
        let Some(session) = inner.by_peer.get_mut(&peer) else {
            return false;
        };

        let now = Instant::now();
        session.malformed.push_back(now);
        while let Some(&front) = session.malformed.front() {
            if now.duration_since(front) > window {
                session.malformed.pop_front();
            } else {
                break;
            }
        }
        session.malformed.len() as u32 >= threshold
    }

    /// Removes and returns every idle session.
    pub async fn reap_idle(&self) -> Vec<Session> {
        let mut inner = self.inner.lock().await;
        let timeout = self.config.idle_timeout;

        let idle: Vec<PeerId> = inner
            .by_peer
            .iter()
            .filter(|(_, s)| s.is_idle(timeout))
            .map(|(&id, _)| id)
            .collect();

        let mut reaped = Vec::with_capacity(idle.len());
        for peer in idle {
            if let Some(session) = inner.by_peer.remove(&peer) {
                if session.authenticated {
                    inner.by_steam.remove(&session.steam_id);
                }
                info!("session {} timed out (idle)", peer);
                reaped.push(session);
            }
        }
        reaped
    }

    /// Drops chunk groups that have been incomplete for too long.
    pub async fn expire_assemblers(&self) {
        let mut inner = self.inner.lock().await;
        let timeout = self.config.assembly_timeout;
        for session in inner.by_peer.values_mut() {
            session.assembler.expire(timeout);
        }
    }

    /// Positions the inventory cursor for a freshly authenticated session.
    pub async fn init_item_cursor(&self, peer: PeerId, latest_item_id: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.by_peer.get_mut(&peer) {
            session.last_checked_item_id = latest_item_id;
            session.item_cursor_ready = true;
        }
    }

    /// Authenticated sessions, snapshotted for the item-change scan.
    pub async fn item_scan_entries(&self) -> Vec<ItemScanEntry> {
        let inner = self.inner.lock().await;
        inner
            .by_peer
            .values()
            .filter(|s| s.authenticated)
            .map(|s| ItemScanEntry {
                peer: s.peer,
                steam_id: s.steam_id,
                cursor: s.last_checked_item_id,
                cursor_ready: s.item_cursor_ready,
            })
            .collect()
    }

    /// Advances the cursor after new items were announced.
    pub async fn advance_item_cursor(&self, peer: PeerId, new_cursor: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.by_peer.get_mut(&peer) {
            if new_cursor > session.last_checked_item_id || !session.item_cursor_ready {
                session.last_checked_item_id = new_cursor;
                session.item_cursor_ready = true;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.by_peer.len()
    }
}
