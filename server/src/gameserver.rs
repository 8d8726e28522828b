//! Dedicated game-server registry.
//!
//! Game servers connect over TCP, register with their platform id and
//! address, and heartbeat to stay listed. Reserving a server for a match is
//! a single find-and-assign under the registry's exclusive lock so two
//! matches can never grab the same server.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{info, warn};
use shared::messages::{ServerRegister, ServerReserve};
use tokio::sync::Mutex;

use crate::transport::{PeerHandle, PeerId};

/// Heartbeat silence after which a server is dropped.
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_MAX_PLAYERS: u32 = 10;

#[derive(Debug, Clone)]
pub struct GameServerInfo {
    pub server_steam_id: u64,
    pub address: String,
    pub port: u16,
    pub peer: PeerHandle,
    pub is_available: bool,
    /// Zero when no match is assigned; non-zero exactly when unavailable.
    pub current_match_id: u64,
    pub max_players: u32,
    pub current_players: u32,
    pub current_map: String,
    pub last_heartbeat: Instant,
    pub is_authenticated: bool,
}

/// A server handed out by [`GameServerRegistry::find_and_assign`].
#[derive(Debug, Clone)]
pub struct ReservedServer {
    pub server_steam_id: u64,
    pub address: String,
    pub port: u16,
    pub peer: PeerHandle,
}

#[derive(Default)]
struct Inner {
    servers: HashMap<u64, GameServerInfo>,
    by_peer: HashMap<PeerId, u64>,
}

pub struct GameServerRegistry {
    inner: Mutex<Inner>,
    timeout: Duration,
}

impl GameServerRegistry {
    pub fn new() -> Self {
        Self::with_timeout(SERVER_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            timeout,
        }
    }

    /// Registers (or re-registers) a server on its connection. Registration
    /// authenticates the connection for the server protocol.
    pub async fn register(&self, peer: PeerHandle, msg: &ServerRegister) -> bool {
        if msg.server_steam_id == 0 {
            warn!("rejecting server registration with zero id from peer {}", peer.id);
            return false;
        }

        let mut inner = self.inner.lock().await;
        let max_players = if msg.max_players == 0 {
            DEFAULT_MAX_PLAYERS
        } else {
            msg.max_players
        };

        inner.by_peer.insert(peer.id, msg.server_steam_id);
        inner.servers.insert(
            msg.server_steam_id,
            GameServerInfo {
                server_steam_id: msg.server_steam_id,
                address: msg.address.clone(),
                port: msg.port,
                peer,
                is_available: true,
                current_match_id: 0,
                max_players,
                current_players: 0,
                current_map: msg.current_map.clone(),
                last_heartbeat: Instant::now(),
                is_authenticated: true,
            },
        );

        info!(
            "game server {} registered at {}:{}",
            msg.server_steam_id, msg.address, msg.port
        );
        true
    }

    /// Refreshes the heartbeat; false when the peer never registered.
    pub async fn heartbeat(&self, peer: PeerId, current_players: u32, current_map: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(&server_id) = inner.by_peer.get(&peer) else {
            return false;
        };
        if let Some(server) = inner.servers.get_mut(&server_id) {
            server.last_heartbeat = Instant::now();
            server.current_players = current_players;
            server.current_map = current_map.to_string();
            true
        } else {
            false
        }
    }

    /// Server id registered by a peer, if any.
    pub async fn server_of_peer(&self, peer: PeerId) -> Option<u64> {
        self.inner.lock().await.by_peer.get(&peer).copied()
    }

    /// Removes the server a disconnected peer registered; returns the match
    /// it held so the matchmaker can unwind it.
    pub async fn unregister_peer(&self, peer: PeerId) -> Option<u64> {
        let mut inner = self.inner.lock().await;
        let server_id = inner.by_peer.remove(&peer)?;
        let server = inner.servers.remove(&server_id)?;
        info!("game server {} unregistered", server_id);
        (server.current_match_id != 0).then_some(server.current_match_id)
    }

    /// Drops servers whose heartbeat lapsed; returns the match ids they
    /// were holding.
    pub async fn check_timeouts(&self) -> Vec<u64> {
        let mut inner = self.inner.lock().await;
        let timeout = self.timeout;

        let dead: Vec<u64> = inner
            .servers
            .values()
            .filter(|s| s.last_heartbeat.elapsed() > timeout)
            .map(|s| s.server_steam_id)
            .collect();

        let mut orphaned = Vec::new();
        for server_id in dead {
            if let Some(server) = inner.servers.remove(&server_id) {
                inner.by_peer.remove(&server.peer.id);
                warn!("game server {} timed out", server_id);
                if server.current_match_id != 0 {
                    orphaned.push(server.current_match_id);
                }
            }
        }
        orphaned
    }

    /// Atomically picks an available authenticated server and assigns the
    /// match to it. First-seen wins.
    pub async fn find_and_assign(&self, match_id: u64) -> Option<ReservedServer> {
        let mut inner = self.inner.lock().await;
        let server = inner
            .servers
            .values_mut()
            .find(|s| s.is_available && s.is_authenticated)?;

        server.is_available = false;
        server.current_match_id = match_id;
        Some(ReservedServer {
            server_steam_id: server.server_steam_id,
            address: server.address.clone(),
            port: server.port,
            peer: server.peer,
        })
    }

    /// Returns a server to the available pool.
    pub async fn release(&self, server_steam_id: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(server) = inner.servers.get_mut(&server_steam_id) {
            server.is_available = true;
            server.current_match_id = 0;
        }
    }

    pub async fn available_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .servers
            .values()
            .filter(|s| s.is_available && s.is_authenticated)
            .count()
    }

    pub async fn total_count(&self) -> usize {
        self.inner.lock().await.servers.len()
    }

    /// Wire message the reserved server consumes to spin up the match.
    pub fn build_reservation(
        match_id: u64,
        match_token: &str,
        map_name: &str,
        team_a: Vec<u64>,
        team_b: Vec<u64>,
    ) -> ServerReserve {
        ServerReserve {
            match_id,
            match_token: match_token.to_string(),
            map_name: map_name.to_string(),
            team_a,
            team_b,
        }
    }
}

impl Default for GameServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;

    fn peer(id: PeerId) -> PeerHandle {
        PeerHandle {
            id,
            kind: TransportKind::Tcp,
        }
    }

    fn registration(server_steam_id: u64) -> ServerRegister {
        ServerRegister {
            server_steam_id,
            address: "10.0.0.5".to_string(),
            port: 27015,
            max_players: 10,
            current_map: "de_dust2".to_string(),
        }
    }

    #[tokio::test]
    async fn register_assign_release_cycle() {
        let registry = GameServerRegistry::new();
        assert!(registry.register(peer(1), &registration(900)).await);
        assert_eq!(registry.available_count().await, 1);

        let reserved = registry.find_and_assign(77).await.unwrap();
        assert_eq!(reserved.server_steam_id, 900);
        assert_eq!(reserved.address, "10.0.0.5");
        assert_eq!(registry.available_count().await, 0);

        // Nothing left to assign.
        assert!(registry.find_and_assign(78).await.is_none());

        registry.release(900).await;
        assert_eq!(registry.available_count().await, 1);
    }

    #[tokio::test]
    async fn availability_and_match_id_stay_consistent() {
        let registry = GameServerRegistry::new();
        registry.register(peer(1), &registration(900)).await;
        registry.find_and_assign(5).await.unwrap();

        let inner = registry.inner.lock().await;
        let server = inner.servers.get(&900).unwrap();
        // current_match_id != 0 exactly when unavailable
        assert!(!server.is_available);
        assert_eq!(server.current_match_id, 5);
        drop(inner);

        registry.release(900).await;
        let inner = registry.inner.lock().await;
        let server = inner.servers.get(&900).unwrap();
        assert!(server.is_available);
        assert_eq!(server.current_match_id, 0);
    }

    #[tokio::test]
    async fn zero_id_registration_is_rejected() {
        let registry = GameServerRegistry::new();
        assert!(!registry.register(peer(1), &registration(0)).await);
        assert_eq!(registry.total_count().await, 0);
    }

    #[tokio::test]
    async fn heartbeat_requires_registration() {
        let registry = GameServerRegistry::new();
        assert!(!registry.heartbeat(1, 0, "de_nuke").await);

        registry.register(peer(1), &registration(900)).await;
        assert!(registry.heartbeat(1, 4, "de_nuke").await);
    }

    #[tokio::test]
    async fn timed_out_server_surfaces_its_match() {
        let registry = GameServerRegistry::with_timeout(Duration::from_secs(0));
        registry.register(peer(1), &registration(900)).await;
        registry.find_and_assign(42).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let orphaned = registry.check_timeouts().await;
        assert_eq!(orphaned, vec![42]);
        assert_eq!(registry.total_count().await, 0);
    }

    #[tokio::test]
    async fn unregister_peer_surfaces_held_match() {
        let registry = GameServerRegistry::new();
        registry.register(peer(1), &registration(900)).await;

        // Idle server: no orphaned match.
        assert_eq!(registry.unregister_peer(1).await, None);

        registry.register(peer(2), &registration(901)).await;
        registry.find_and_assign(9).await.unwrap();
        assert_eq!(registry.unregister_peer(2).await, Some(9));
    }
}
