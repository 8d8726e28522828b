//! The coordinator's dependency graph and long-lived workers.
//!
//! [`Gc`] owns every component and is built once at startup; handlers and
//! workers receive it as an `Arc`, so tests can stand up fresh graphs with
//! whatever repository, transport or auth implementation they need.
//!
//! Workers:
//! - the dispatcher loop, consuming the shared transport event queue
//! - the matchmaking tick (queue processing, ready-up timeouts, grace
//!   expiry, terminal-match cleanup, game-server heartbeat sweep)
//! - the session sweep (idle reaping, stale chunk groups, item-change scan)

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use shared::messages::{ItemsUpdated, MsgType};
use shared::steamid::steamid2;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;

use crate::auth::AuthService;
use crate::dispatch::Dispatcher;
use crate::gameserver::GameServerRegistry;
use crate::matchmaking::{Matchmaker, MatchmakingConfig};
use crate::moderation::ReportNotifier;
use crate::repository::Repository;
use crate::session::{SessionConfig, SessionRegistry};
use crate::social::{GlobalCounters, SocialConfig, SocialService};
use crate::transport::{send_message, Outbound, PeerHandle, TransportEvent};

use shared::codec::Frame;

/// Cadence of the session sweep and item-change scan.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub struct Gc {
    pub sessions: SessionRegistry,
    pub matchmaker: Matchmaker,
    pub servers: Arc<GameServerRegistry>,
    pub social: SocialService,
    pub repo: Arc<dyn Repository>,
    pub auth: Arc<dyn AuthService>,
    pub out: Arc<dyn Outbound>,
    pub notifier: ReportNotifier,
}

impl Gc {
    pub fn new(
        repo: Arc<dyn Repository>,
        auth: Arc<dyn AuthService>,
        out: Arc<dyn Outbound>,
        notifier: ReportNotifier,
        session_config: SessionConfig,
        matchmaking_config: MatchmakingConfig,
        social_config: SocialConfig,
    ) -> Arc<Self> {
        let servers = Arc::new(GameServerRegistry::new());
        let matchmaker = Matchmaker::new(
            matchmaking_config,
            Arc::clone(&repo),
            Arc::clone(&servers),
            Arc::clone(&out),
        );
        let social = SocialService::new(Arc::clone(&repo), social_config);

        Arc::new(Gc {
            sessions: SessionRegistry::new(session_config),
            matchmaker,
            servers,
            social,
            repo,
            auth,
            out,
            notifier,
        })
    }

    /// Runs the dispatcher loop until shutdown, spawning the periodic
    /// workers alongside it.
    pub async fn run(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let dispatcher = Dispatcher::new();

        tokio::spawn(run_ticks(Arc::clone(self), shutdown.clone()));
        tokio::spawn(run_sweep(Arc::clone(self), shutdown.clone()));

        info!("coordinator started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Connected { peer, addr }) => {
                        self.sessions.connect(peer, addr).await;
                    }
                    Some(TransportEvent::Message { peer, data }) => {
                        self.handle_raw(&dispatcher, peer, data).await;
                    }
                    Some(TransportEvent::Disconnected { peer }) => {
                        self.handle_peer_gone(peer).await;
                    }
                    None => break,
                },
            }
        }
        info!("coordinator stopping");
    }

    /// Parses one wire message, runs reassembly and dispatches the result.
    async fn handle_raw(self: &Arc<Self>, dispatcher: &Dispatcher, peer: PeerHandle, data: Vec<u8>) {
        match Frame::decode(&data) {
            Ok(frame) => {
                if let Some((msg_type, payload)) = self.sessions.push_frame(peer.id, frame).await {
                    dispatcher
                        .dispatch(Arc::clone(self), peer, msg_type, payload)
                        .await;
                }
            }
            Err(e) => {
                warn!("malformed frame from peer {}: {}", peer.id, e);
                if self.sessions.record_malformed(peer.id).await {
                    warn!("peer {} exceeded the malformed-frame budget", peer.id);
                    self.drop_peer(peer).await;
                }
            }
        }
    }

    /// Forcibly disconnects a peer and unwinds its state.
    pub async fn drop_peer(self: &Arc<Self>, peer: PeerHandle) {
        self.out.disconnect(peer).await;
        self.handle_peer_gone(peer).await;
    }

    /// Unwinds queue, match and registry membership of a gone peer.
    async fn handle_peer_gone(&self, peer: PeerHandle) {
        if let Some(session) = self.sessions.disconnect(peer.id).await {
            if session.authenticated {
                self.matchmaker.handle_disconnect(session.steam_id).await;
            }
        }
        if let Some(orphaned_match) = self.servers.unregister_peer(peer.id).await {
            self.matchmaker.handle_server_lost(orphaned_match).await;
        }
    }

    /// Live counters for the hello payload.
    pub async fn global_counters(&self) -> GlobalCounters {
        GlobalCounters {
            players_online: self.sessions.len().await as u32,
            servers_online: self.servers.total_count().await as u32,
            players_searching: self.matchmaker.queue_len().await as u32,
            servers_available: self.servers.available_count().await as u32,
            ongoing_matches: self.matchmaker.active_match_count().await as u32,
        }
    }
}

/// Matchmaking tick worker.
async fn run_ticks(gc: Arc<Gc>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(gc.matchmaker.config().queue_check_interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                gc.matchmaker.process_queue().await;
                gc.matchmaker.check_ready_up_timeouts().await;
                gc.matchmaker.check_match_grace().await;
                gc.matchmaker.cleanup_matches().await;

                for orphaned_match in gc.servers.check_timeouts().await {
                    gc.matchmaker.handle_server_lost(orphaned_match).await;
                }
            }
        }
    }
}

/// Session sweep and item-change scan worker.
async fn run_sweep(gc: Arc<Gc>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                sweep_once(&gc).await;
            }
        }
    }
}

async fn sweep_once(gc: &Arc<Gc>) {
    for session in gc.sessions.reap_idle().await {
        gc.out.disconnect(session.peer).await;
        if session.authenticated {
            gc.matchmaker.handle_disconnect(session.steam_id).await;
        }
        if let Some(orphaned_match) = gc.servers.unregister_peer(session.peer.id).await {
            gc.matchmaker.handle_server_lost(orphaned_match).await;
        }
    }

    gc.sessions.expire_assemblers().await;
    scan_items(gc).await;
}

/// Announces inventory items newer than each session's cursor.
async fn scan_items(gc: &Arc<Gc>) {
    for entry in gc.sessions.item_scan_entries().await {
        let id2 = steamid2(entry.steam_id);

        if !entry.cursor_ready {
            // Auth-time init failed; position the cursor now without
            // announcing the backlog.
            match gc.repo.latest_item_id(&id2).await {
                Ok(latest) => gc.sessions.advance_item_cursor(entry.peer.id, latest).await,
                Err(e) => warn!("item cursor init retry failed for {}: {}", entry.steam_id, e),
            }
            continue;
        }

        match gc.repo.items_after(&id2, entry.cursor).await {
            Ok(items) if !items.is_empty() => {
                let new_cursor = *items.last().unwrap_or(&entry.cursor);
                let count = items.len();
                let update = ItemsUpdated { item_ids: items };
                if let Err(e) =
                    send_message(gc.out.as_ref(), entry.peer, MsgType::ItemsUpdated, &update).await
                {
                    warn!("item update push to {} failed: {}", entry.steam_id, e);
                }
                gc.sessions.advance_item_cursor(entry.peer.id, new_cursor).await;
                info!("announced {} new item(s) to {}", count, entry.steam_id);
            }
            Ok(_) => {}
            Err(e) => warn!("item scan failed for {}: {}", entry.steam_id, e),
        }
    }
}
