//! Skill-based matchmaking engine.
//!
//! Players sit in per-bracket queues (bracket = mmr / 100). Every queue
//! tick — and synchronously after each insert — all brackets are pooled,
//! sorted by MMR and scanned with a sliding window of one match's worth of
//! players; the first window within the allowed spread whose members are
//! pairwise compatible becomes a match, provided a game server can be
//! reserved for it. Matches then walk the ready-up state machine:
//!
//! ```text
//! QUEUED -> WAITING_FOR_CONFIRMATION -> IN_PROGRESS -> COMPLETED
//!                    \-> ABANDONED (decline / ready-up timeout)
//! ```
//!
//! Queue mutation and candidate selection run under one exclusive queue
//! lock so a player can never be committed to two matches. Notifications
//! are sent after every lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::seq::SliceRandom;
use serde::Serialize;
use shared::messages::{
    MatchCancelled, MatchFound, MatchReady, MsgType,
};
use tokio::sync::RwLock;

use crate::error::GcError;
use crate::gameserver::GameServerRegistry;
use crate::repository::{MatchRecord, PlayerSkillRating, Repository};
use crate::transport::{send_message, Outbound, PeerHandle};

/// Region every entry carries until region selection ships client-side.
pub const DEFAULT_REGION: &str = "na";

#[derive(Debug, Clone)]
pub struct MatchmakingConfig {
    pub players_per_team: usize,
    pub ready_up_time: Duration,
    pub queue_check_interval: Duration,
    pub match_cleanup_age: Duration,
    /// In-progress matches older than this are force-completed; the server
    /// report normally arrives long before.
    pub match_grace_time: Duration,
    pub base_mmr_spread: u32,
    /// Extra pairwise spread allowed per 30 seconds of queue time.
    pub mmr_spread_per_wait: u32,
    pub map_pool: Vec<String>,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            players_per_team: 5,
            ready_up_time: Duration::from_secs(30),
            queue_check_interval: Duration::from_secs(5),
            match_cleanup_age: Duration::from_secs(300),
            match_grace_time: Duration::from_secs(7200),
            base_mmr_spread: 300,
            mmr_spread_per_wait: 100,
            map_pool: default_map_pool(),
        }
    }
}

pub fn default_map_pool() -> Vec<String> {
    [
        "de_dust2",
        "de_mirage",
        "de_inferno",
        "de_nuke",
        "de_overpass",
        "de_cache",
        "de_train",
        "de_vertigo",
        "de_ancient",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Skill bracket a rating falls into.
pub fn bracket(mmr: u32) -> u32 {
    mmr / 100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Queued,
    WaitingForConfirmation,
    InProgress,
    Completed,
    Abandoned,
}

impl MatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MatchState::Completed | MatchState::Abandoned)
    }
}

/// A player waiting in a skill bucket. Immutable after insert except for
/// the two flags.
#[derive(Debug)]
pub struct QueueEntry {
    pub steam_id: u64,
    pub account_id: u32,
    pub peer: PeerHandle,
    pub queue_time: Instant,
    pub rating: PlayerSkillRating,
    pub preferred_maps: Vec<String>,
    pub region: String,
    accepted: AtomicBool,
    priority: AtomicBool,
}

impl QueueEntry {
    fn new(
        steam_id: u64,
        peer: PeerHandle,
        rating: PlayerSkillRating,
        preferred_maps: Vec<String>,
    ) -> Self {
        Self {
            steam_id,
            account_id: (steam_id & 0xFFFF_FFFF) as u32,
            peer,
            queue_time: Instant::now(),
            rating,
            preferred_maps,
            region: DEFAULT_REGION.to_string(),
            accepted: AtomicBool::new(false),
            priority: AtomicBool::new(false),
        }
    }

    pub fn has_accepted(&self) -> bool {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn has_priority(&self) -> bool {
        self.priority.load(Ordering::SeqCst)
    }
}

/// A formed match. State is the only mutable attribute; transitions are
/// serialized by the internal lock.
#[derive(Debug)]
pub struct Match {
    pub match_id: u64,
    pub match_token: String,
    pub team_a: Vec<Arc<QueueEntry>>,
    pub team_b: Vec<Arc<QueueEntry>>,
    state: StdMutex<MatchState>,
    pub map_name: String,
    pub server_steam_id: u64,
    pub server_address: String,
    pub server_port: u16,
    pub server_peer: PeerHandle,
    pub created: Instant,
    pub ready_up_deadline: Instant,
    pub avg_mmr: u32,
}

impl Match {
    pub fn state(&self) -> MatchState {
        *self.state.lock().unwrap()
    }

    /// Applies a state transition; anything outside the state machine's
    /// edges is a conflict.
    fn transition(&self, to: MatchState) -> Result<(), GcError> {
        let mut state = self.state.lock().unwrap();
        let allowed = matches!(
            (*state, to),
            (MatchState::Queued, MatchState::WaitingForConfirmation)
                | (MatchState::WaitingForConfirmation, MatchState::InProgress)
                | (MatchState::WaitingForConfirmation, MatchState::Abandoned)
                | (MatchState::InProgress, MatchState::Completed)
        );
        if !allowed {
            return Err(GcError::Conflict(format!(
                "match {}: {:?} -> {:?}",
                self.match_id, *state, to
            )));
        }
        *state = to;
        Ok(())
    }

    pub fn players(&self) -> impl Iterator<Item = &Arc<QueueEntry>> {
        self.team_a.iter().chain(self.team_b.iter())
    }

    pub fn player(&self, steam_id: u64) -> Option<&Arc<QueueEntry>> {
        self.players().find(|p| p.steam_id == steam_id)
    }

    pub fn player_ids(&self) -> Vec<u64> {
        self.players().map(|p| p.steam_id).collect()
    }

    pub fn all_accepted(&self) -> bool {
        self.players().all(|p| p.has_accepted())
    }

    pub fn accepted_count(&self) -> usize {
        self.players().filter(|p| p.has_accepted()).count()
    }

    fn to_record(&self) -> MatchRecord {
        MatchRecord {
            match_id: self.match_id,
            match_token: self.match_token.clone(),
            map_name: self.map_name.clone(),
            avg_mmr: self.avg_mmr,
            team_a: self.team_a.iter().map(|p| p.steam_id).collect(),
            team_b: self.team_b.iter().map(|p| p.steam_id).collect(),
            server_address: self.server_address.clone(),
            server_port: self.server_port,
        }
    }
}

#[derive(Default)]
struct MatchTable {
    by_id: HashMap<u64, Arc<Match>>,
    by_player: HashMap<u64, u64>,
}

pub struct Matchmaker {
    config: MatchmakingConfig,
    repo: Arc<dyn Repository>,
    servers: Arc<GameServerRegistry>,
    out: Arc<dyn Outbound>,
    queues: RwLock<HashMap<u32, Vec<Arc<QueueEntry>>>>,
    matches: RwLock<MatchTable>,
    next_match_id: AtomicU64,
}

impl Matchmaker {
    pub fn new(
        config: MatchmakingConfig,
        repo: Arc<dyn Repository>,
        servers: Arc<GameServerRegistry>,
        out: Arc<dyn Outbound>,
    ) -> Self {
        info!(
            "matchmaker initialized: {} players per team, {} maps in pool",
            config.players_per_team,
            config.map_pool.len()
        );
        Self {
            config,
            repo,
            servers,
            out,
            queues: RwLock::new(HashMap::new()),
            matches: RwLock::new(MatchTable::default()),
            next_match_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &MatchmakingConfig {
        &self.config
    }

    // === Queue management ===

    /// Queues a player, looking up their rating first. A repository failure
    /// falls back to the default rating so the player is never dropped.
    pub async fn queue_player(
        &self,
        steam_id: u64,
        peer: PeerHandle,
        preferred_maps: Vec<String>,
    ) -> bool {
        if steam_id == 0 {
            warn!("refusing to queue steam id 0");
            return false;
        }
        if self.match_for_player(steam_id).await.is_some() {
            debug!("player {} is already in a match, not queueing", steam_id);
            return false;
        }

        let rating = match self.repo.get_player_rating(steam_id).await {
            Ok(rating) => rating,
            Err(e) => {
                warn!(
                    "rating lookup failed for {}: {}; queueing with defaults",
                    steam_id, e
                );
                PlayerSkillRating::default()
            }
        };

        // Re-queueing replaces any previous entry.
        self.remove_from_queue(steam_id).await;

        let mut maps: Vec<String> = preferred_maps
            .into_iter()
            .filter(|m| self.config.map_pool.contains(m))
            .collect();
        if maps.is_empty() {
            maps = self.config.map_pool.clone();
        }

        let entry = Arc::new(QueueEntry::new(steam_id, peer, rating, maps));
        let bucket = bracket(rating.mmr);
        {
            let mut queues = self.queues.write().await;
            queues.entry(bucket).or_default().push(entry);
        }
        info!(
            "player {} queued (mmr {}, bracket {})",
            steam_id, rating.mmr, bucket
        );

        self.process_queue().await;
        true
    }

    pub async fn remove_from_queue(&self, steam_id: u64) -> bool {
        let mut queues = self.queues.write().await;
        let mut removed = false;
        queues.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|e| e.steam_id != steam_id);
            removed |= bucket.len() != before;
            !bucket.is_empty()
        });
        if removed {
            info!("player {} removed from matchmaking queue", steam_id);
        }
        removed
    }

    pub async fn is_queued(&self, steam_id: u64) -> bool {
        let queues = self.queues.read().await;
        queues
            .values()
            .any(|bucket| bucket.iter().any(|e| e.steam_id == steam_id))
    }

    pub async fn queue_len(&self) -> usize {
        let queues = self.queues.read().await;
        queues.values().map(|b| b.len()).sum()
    }

    pub async fn active_match_count(&self) -> usize {
        let matches = self.matches.read().await;
        matches
            .by_id
            .values()
            .filter(|m| !m.state().is_terminal())
            .count()
    }

    // === Candidate selection and match creation ===

    /// Repeatedly forms matches until no acceptable window remains. Called
    /// on the queue tick and after every insert.
    pub async fn process_queue(&self) {
        while self.try_create_match().await {}
    }

    async fn try_create_match(&self) -> bool {
        let match_size = self.config.players_per_team * 2;

        // Selection and commit run under one exclusive lock so a player
        // cannot land in two matches.
        let mut queues = self.queues.write().await;

        let total: usize = queues.values().map(|b| b.len()).sum();
        if total < match_size {
            return false;
        }

        let mut pool: Vec<Arc<QueueEntry>> =
            queues.values().flat_map(|b| b.iter().cloned()).collect();
        pool.sort_by_key(|e| e.rating.mmr);

        let Some(players) = self.find_window(&pool, match_size) else {
            return false;
        };

        let match_id = self.next_match_id.fetch_add(1, Ordering::SeqCst);
        let Some(server) = self.servers.find_and_assign(match_id).await else {
            warn!("match ready but no game servers available");
            for p in &players {
                p.priority.store(true, Ordering::SeqCst);
            }
            return false;
        };

        let avg_mmr =
            (players.iter().map(|p| p.rating.mmr as u64).sum::<u64>() / players.len() as u64) as u32;
        let map_name = self.select_map(&players);
        let (team_a, team_b) = snake_draft(&players);

        let game = Arc::new(Match {
            match_id,
            match_token: generate_match_token(),
            team_a,
            team_b,
            state: StdMutex::new(MatchState::Queued),
            map_name,
            server_steam_id: server.server_steam_id,
            server_address: server.address,
            server_port: server.port,
            server_peer: server.peer,
            created: Instant::now(),
            ready_up_deadline: Instant::now() + self.config.ready_up_time,
            avg_mmr,
        });

        // Committed: pull the chosen players out of their buckets.
        for p in &players {
            queues.retain(|_, bucket| {
                bucket.retain(|e| e.steam_id != p.steam_id);
                !bucket.is_empty()
            });
        }
        drop(queues);

        game.transition(MatchState::WaitingForConfirmation)
            .expect("fresh match enters ready-up");

        {
            let mut matches = self.matches.write().await;
            matches.by_id.insert(match_id, Arc::clone(&game));
            for p in &players {
                matches.by_player.insert(p.steam_id, match_id);
            }
        }

        let found = MatchFound {
            match_id,
            map_name: game.map_name.clone(),
            avg_mmr,
            ready_up_seconds: self.config.ready_up_time.as_secs() as u32,
        };
        for p in &players {
            self.notify(p.peer, MsgType::MatchFound, &found).await;
        }

        info!(
            "match {} created on {} ({}:{}, avg mmr {})",
            match_id, game.map_name, game.server_address, game.server_port, avg_mmr
        );
        true
    }

    /// Slides a window over the MMR-sorted pool and returns the first one
    /// whose spread and pairwise compatibility pass.
    fn find_window(
        &self,
        pool: &[Arc<QueueEntry>],
        match_size: usize,
    ) -> Option<Vec<Arc<QueueEntry>>> {
        for window in pool.windows(match_size) {
            let min = window.first()?.rating.mmr;
            let max = window.last()?.rating.mmr;
            if max - min > self.config.base_mmr_spread * 2 {
                continue;
            }

            let compatible = window.iter().enumerate().all(|(i, a)| {
                window[i + 1..].iter().all(|b| self.pair_compatible(a, b))
            });
            if compatible {
                return Some(window.to_vec());
            }
        }
        None
    }

    /// Pairwise compatibility: same region and MMR-close, where the close
    /// bound widens with queue time.
    fn pair_compatible(&self, a: &QueueEntry, b: &QueueEntry) -> bool {
        if a.region != b.region {
            return false;
        }
        let waited = a.queue_time.elapsed().min(b.queue_time.elapsed());
        let allowed = self.config.base_mmr_spread
            + self.config.mmr_spread_per_wait * (waited.as_secs() / 30) as u32;
        a.rating.mmr.abs_diff(b.rating.mmr) <= allowed
    }

    /// Intersects everyone's preferred maps; an empty intersection falls
    /// back to a random pool map.
    fn select_map(&self, players: &[Arc<QueueEntry>]) -> String {
        let common: Vec<&String> = self
            .config
            .map_pool
            .iter()
            .filter(|m| players.iter().all(|p| p.preferred_maps.contains(*m)))
            .collect();

        let mut rng = rand::thread_rng();
        match common.choose(&mut rng) {
            Some(map) => (*map).clone(),
            None => self
                .config
                .map_pool
                .choose(&mut rng)
                .cloned()
                .unwrap_or_else(|| "de_dust2".to_string()),
        }
    }

    // === Ready-up state machine ===

    /// Records a player's accept; when the last accept lands the match goes
    /// in progress and both sides are notified. Re-sent accepts are no-ops.
    pub async fn accept_match(&self, steam_id: u64) -> Result<(), GcError> {
        let game = self
            .match_for_player(steam_id)
            .await
            .ok_or(GcError::NotFound)?;
        let entry = game.player(steam_id).ok_or(GcError::NotFound)?;

        if game.state() != MatchState::WaitingForConfirmation {
            // Late or repeated accept after the match moved on.
            return Ok(());
        }

        if !entry.accepted.swap(true, Ordering::SeqCst) {
            info!(
                "player {} accepted match {} ({}/{})",
                steam_id,
                game.match_id,
                game.accepted_count(),
                game.player_ids().len()
            );
        }

        if game.all_accepted()
            && game.transition(MatchState::InProgress).is_ok()
        {
            let ready = MatchReady {
                match_id: game.match_id,
                server_address: game.server_address.clone(),
                server_port: game.server_port,
                match_token: game.match_token.clone(),
            };
            for p in game.players() {
                self.notify(p.peer, MsgType::MatchReady, &ready).await;
            }

            let reserve = GameServerRegistry::build_reservation(
                game.match_id,
                &game.match_token,
                &game.map_name,
                game.team_a.iter().map(|p| p.steam_id).collect(),
                game.team_b.iter().map(|p| p.steam_id).collect(),
            );
            self.notify(game.server_peer, MsgType::ServerReserve, &reserve)
                .await;

            info!("match {} is in progress", game.match_id);
        }
        Ok(())
    }

    /// A decline abandons the match outright.
    pub async fn decline_match(&self, steam_id: u64) -> Result<(), GcError> {
        let game = self
            .match_for_player(steam_id)
            .await
            .ok_or(GcError::NotFound)?;
        info!("player {} declined match {}", steam_id, game.match_id);
        self.abandon(&game, "a player declined the match").await;
        Ok(())
    }

    /// Abandons a ready-up match: the server is released, accepters go back
    /// to their buckets, everyone else falls out of the queue entirely.
    async fn abandon(&self, game: &Arc<Match>, reason: &str) {
        if game.transition(MatchState::Abandoned).is_err() {
            return;
        }

        self.servers.release(game.server_steam_id).await;

        {
            let mut matches = self.matches.write().await;
            for id in game.player_ids() {
                matches.by_player.remove(&id);
            }
        }

        let requeue: Vec<Arc<QueueEntry>> = game
            .players()
            .filter(|p| p.accepted.swap(false, Ordering::SeqCst))
            .cloned()
            .collect();
        {
            let mut queues = self.queues.write().await;
            for p in &requeue {
                queues
                    .entry(bracket(p.rating.mmr))
                    .or_default()
                    .push(Arc::clone(p));
            }
        }

        let cancelled = MatchCancelled {
            match_id: game.match_id,
            reason: reason.to_string(),
        };
        for p in game.players() {
            self.notify(p.peer, MsgType::MatchCancelled, &cancelled).await;
        }

        info!(
            "match {} abandoned ({}); {} players re-queued",
            game.match_id,
            reason,
            requeue.len()
        );
    }

    /// Completes an in-progress match and persists the match log.
    pub async fn complete_match(&self, match_id: u64) -> Result<(), GcError> {
        let game = self.match_by_id(match_id).await.ok_or(GcError::NotFound)?;
        game.transition(MatchState::Completed)?;

        self.servers.release(game.server_steam_id).await;
        {
            let mut matches = self.matches.write().await;
            for id in game.player_ids() {
                matches.by_player.remove(&id);
            }
        }

        if let Err(e) = self.repo.log_match(&game.to_record()).await {
            warn!("failed to log match {}: {}", match_id, e);
        }
        info!("match {} completed", match_id);
        Ok(())
    }

    /// Unwinds a match whose game server vanished.
    pub async fn handle_server_lost(&self, match_id: u64) {
        let Some(game) = self.match_by_id(match_id).await else {
            return;
        };
        match game.state() {
            MatchState::WaitingForConfirmation => {
                self.abandon(&game, "game server lost").await;
            }
            MatchState::InProgress => {
                warn!("game server lost mid-match {}; closing it out", match_id);
                let _ = self.complete_match(match_id).await;
            }
            _ => {}
        }
    }

    /// Drops queue and ready-up membership of a vanished player. A running
    /// match plays on without its index entry; the player can rejoin the
    /// server directly.
    pub async fn handle_disconnect(&self, steam_id: u64) {
        self.remove_from_queue(steam_id).await;
        let Some(game) = self.match_for_player(steam_id).await else {
            return;
        };
        match game.state() {
            MatchState::WaitingForConfirmation => {
                info!(
                    "player {} disconnected during ready-up of match {}",
                    steam_id, game.match_id
                );
                self.abandon(&game, "a player disconnected").await;
            }
            _ => {
                let mut matches = self.matches.write().await;
                matches.by_player.remove(&steam_id);
            }
        }
    }

    // === Periodic tasks ===

    /// Abandons ready-up matches whose deadline passed.
    pub async fn check_ready_up_timeouts(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<Match>> = {
            let matches = self.matches.read().await;
            matches
                .by_id
                .values()
                .filter(|m| {
                    m.state() == MatchState::WaitingForConfirmation && now > m.ready_up_deadline
                })
                .cloned()
                .collect()
        };

        for game in expired {
            info!(
                "match {} ready-up expired with {}/{} accepts",
                game.match_id,
                game.accepted_count(),
                game.player_ids().len()
            );
            self.abandon(&game, "ready-up window expired").await;
        }
    }

    /// Force-completes in-progress matches that outlived the grace window.
    pub async fn check_match_grace(&self) {
        let grace = self.config.match_grace_time;
        let stale: Vec<u64> = {
            let matches = self.matches.read().await;
            matches
                .by_id
                .values()
                .filter(|m| m.state() == MatchState::InProgress && m.created.elapsed() > grace)
                .map(|m| m.match_id)
                .collect()
        };
        for match_id in stale {
            warn!("match {} exceeded the grace window", match_id);
            let _ = self.complete_match(match_id).await;
        }
    }

    /// Removes terminal matches past the cleanup age, along with any index
    /// entries still pointing at them.
    pub async fn cleanup_matches(&self) {
        let age = self.config.match_cleanup_age;
        let mut matches = self.matches.write().await;

        let dead: Vec<u64> = matches
            .by_id
            .values()
            .filter(|m| m.state().is_terminal() && m.created.elapsed() > age)
            .map(|m| m.match_id)
            .collect();

        for match_id in dead {
            if let Some(game) = matches.by_id.remove(&match_id) {
                for id in game.player_ids() {
                    if matches.by_player.get(&id) == Some(&match_id) {
                        matches.by_player.remove(&id);
                    }
                }
                info!("cleaned up match {}", match_id);
            }
        }
    }

    // === Lookups ===

    pub async fn match_by_id(&self, match_id: u64) -> Option<Arc<Match>> {
        let matches = self.matches.read().await;
        matches.by_id.get(&match_id).cloned()
    }

    /// The live, non-terminal match a player belongs to.
    pub async fn match_for_player(&self, steam_id: u64) -> Option<Arc<Match>> {
        let matches = self.matches.read().await;
        let match_id = matches.by_player.get(&steam_id)?;
        matches
            .by_id
            .get(match_id)
            .filter(|m| !m.state().is_terminal())
            .cloned()
    }

    async fn notify<T: Serialize>(&self, peer: PeerHandle, msg_type: MsgType, payload: &T) {
        // Send failures never fail the match; the session sweep will pick
        // the dead peer up.
        if let Err(e) = send_message(self.out.as_ref(), peer, msg_type, payload).await {
            warn!("failed to send {:?} to peer {}: {}", msg_type, peer.id, e);
        }
    }
}

/// Splits MMR-sorted players into two teams ABBA-style so the team
/// averages land as close as possible.
fn snake_draft(players: &[Arc<QueueEntry>]) -> (Vec<Arc<QueueEntry>>, Vec<Arc<QueueEntry>>) {
    let mut sorted: Vec<Arc<QueueEntry>> = players.to_vec();
    sorted.sort_by(|a, b| b.rating.mmr.cmp(&a.rating.mmr));

    let mut team_a = Vec::with_capacity(players.len() / 2);
    let mut team_b = Vec::with_capacity(players.len() / 2);
    for (i, player) in sorted.into_iter().enumerate() {
        if matches!(i % 4, 0 | 3) {
            team_a.push(player);
        } else {
            team_b.push(player);
        }
    }
    (team_a, team_b)
}

fn generate_match_token() -> String {
    format!("{:032x}", rand::random::<u128>())
}
