//! Persistence contract and its two implementations.
//!
//! The coordinator only talks to storage through the [`Repository`] trait;
//! every operation takes scalar parameters and no SQL crosses the boundary.
//! [`MySqlRepository`] is the production implementation (parameterised
//! statements only). [`MemoryRepository`] backs development runs without a
//! database and the test suites; it implements the same window semantics
//! in process.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as TimeDelta, Utc};
use log::info;
use shared::messages::{CommendCounts, CommendFlags, CommendType, ReportType};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::RepositoryError;

/// Commends a sender may hand out to distinct receivers per day.
pub const COMMEND_TOKENS_PER_DAY: u32 = 3;

/// Reports a sender may file against distinct receivers per week.
pub const REPORT_TOKENS_PER_WEEK: u32 = 6;

/// Window within which commends from a sender to a target are "current".
const COMMEND_WINDOW_DAYS: i64 = 90;

/// Skill rating as persisted per player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerSkillRating {
    pub rank: u32,
    pub wins: u32,
    pub mmr: u32,
    pub level: u32,
}

impl Default for PlayerSkillRating {
    /// The fallback used whenever a rating cannot be loaded, so a player is
    /// never dropped from matchmaking over a storage hiccup.
    fn default() -> Self {
        Self {
            rank: 6,
            wins: 0,
            mmr: 1000,
            level: 1,
        }
    }
}

/// Latest cooldown row for a player, acknowledged or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownRecord {
    pub reason: u32,
    /// Unix timestamp the cooldown expires at.
    pub expires_at: i64,
    pub acknowledged: bool,
}

/// One collectible owned by a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MedalItem {
    pub def_index: u32,
    pub equipped_t: bool,
    pub equipped_ct: bool,
}

/// Everything the match log persists about a finished match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRecord {
    pub match_id: u64,
    pub match_token: String,
    pub map_name: String,
    pub avg_mmr: u32,
    pub team_a: Vec<u64>,
    pub team_b: Vec<u64>,
    pub server_address: String,
    pub server_port: u16,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_player_rating(&self, steam_id: u64)
        -> Result<PlayerSkillRating, RepositoryError>;
    async fn update_player_rating(
        &self,
        steam_id: u64,
        rating: PlayerSkillRating,
    ) -> Result<(), RepositoryError>;
    async fn log_match(&self, record: &MatchRecord) -> Result<(), RepositoryError>;

    /// Lifetime commend counts received by `target`.
    async fn get_commends(&self, target: u64) -> Result<CommendCounts, RepositoryError>;
    /// Remaining commend tokens for `sender` over the last 24 hours.
    async fn get_commend_tokens(&self, sender: u64) -> Result<u32, RepositoryError>;
    /// Per-type flags for commends from `sender` to `target` within the
    /// three-month window.
    async fn list_commends(&self, sender: u64, target: u64)
        -> Result<CommendFlags, RepositoryError>;
    async fn insert_commend(
        &self,
        sender: u64,
        target: u64,
        kind: CommendType,
    ) -> Result<(), RepositoryError>;
    async fn delete_commend(
        &self,
        sender: u64,
        target: u64,
        kind: CommendType,
    ) -> Result<(), RepositoryError>;

    /// Remaining report tokens for `sender` over the last 7 days.
    async fn get_report_tokens(&self, sender: u64) -> Result<u32, RepositoryError>;
    /// Reports from `sender` to `target` within the last 7 days.
    async fn count_reports(&self, sender: u64, target: u64) -> Result<u32, RepositoryError>;
    async fn insert_report(
        &self,
        sender: u64,
        target: u64,
        kind: ReportType,
        match_id: u64,
    ) -> Result<(), RepositoryError>;

    /// True when an unremoved permanent ban exists for the id.
    async fn is_banned(&self, steam_id2: &str) -> Result<bool, RepositoryError>;
    async fn latest_cooldown(
        &self,
        steam_id2: &str,
    ) -> Result<Option<CooldownRecord>, RepositoryError>;
    async fn list_medals(&self, steam_id2: &str) -> Result<Vec<MedalItem>, RepositoryError>;

    /// Highest inventory item id currently owned by the player.
    async fn latest_item_id(&self, steam_id2: &str) -> Result<u64, RepositoryError>;
    /// Item ids newer than `item_id`, ascending.
    async fn items_after(
        &self,
        steam_id2: &str,
        item_id: u64,
    ) -> Result<Vec<u64>, RepositoryError>;
}

// === MySQL ===

pub struct MySqlRepository {
    pool: MySqlPool,
}

impl MySqlRepository {
    pub async fn connect(url: &str) -> Result<Self, RepositoryError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;
        info!("connected to MySQL repository");
        Ok(Self { pool })
    }
}

#[async_trait]
impl Repository for MySqlRepository {
    async fn get_player_rating(
        &self,
        steam_id: u64,
    ) -> Result<PlayerSkillRating, RepositoryError> {
        let row = sqlx::query(
            "SELECT mmr, rank_id, wins, level FROM player_rankings WHERE steamid64 = ?",
        )
        .bind(steam_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => PlayerSkillRating {
                mmr: row.try_get::<u32, _>(0)?,
                rank: row.try_get::<u32, _>(1)?,
                wins: row.try_get::<u32, _>(2)?,
                level: row.try_get::<u32, _>(3)?,
            },
            None => PlayerSkillRating::default(),
        })
    }

    async fn update_player_rating(
        &self,
        steam_id: u64,
        rating: PlayerSkillRating,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO player_rankings (steamid64, mmr, rank_id, wins, level) \
             VALUES (?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
             mmr = VALUES(mmr), rank_id = VALUES(rank_id), \
             wins = VALUES(wins), level = VALUES(level)",
        )
        .bind(steam_id)
        .bind(rating.mmr)
        .bind(rating.rank)
        .bind(rating.wins)
        .bind(rating.level)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_match(&self, record: &MatchRecord) -> Result<(), RepositoryError> {
        let team_a = serde_json::to_string(&record.team_a).unwrap_or_default();
        let team_b = serde_json::to_string(&record.team_b).unwrap_or_default();
        let server = format!("{}:{}", record.server_address, record.server_port);

        sqlx::query(
            "INSERT INTO match_history (match_id, match_token, map_name, avg_mmr, \
             team_a_players, team_b_players, server_address, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, NOW())",
        )
        .bind(record.match_id)
        .bind(&record.match_token)
        .bind(&record.map_name)
        .bind(record.avg_mmr)
        .bind(team_a)
        .bind(team_b)
        .bind(server)
        .execute(&self.pool)
        .await?;

        info!("logged match {} to database", record.match_id);
        Ok(())
    }

    async fn get_commends(&self, target: u64) -> Result<CommendCounts, RepositoryError> {
        let rows = sqlx::query(
            "SELECT type, COUNT(*) FROM player_commends \
             WHERE receiver_steamid64 = ? GROUP BY type",
        )
        .bind(target)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = CommendCounts::default();
        for row in rows {
            let kind: u8 = row.try_get(0)?;
            let count: i64 = row.try_get(1)?;
            match kind {
                1 => counts.friendly = count as u32,
                2 => counts.teaching = count as u32,
                3 => counts.leader = count as u32,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn get_commend_tokens(&self, sender: u64) -> Result<u32, RepositoryError> {
        let used: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT receiver_steamid64) FROM player_commends \
             WHERE sender_steamid64 = ? AND created_at > DATE_SUB(NOW(), INTERVAL 1 DAY)",
        )
        .bind(sender)
        .fetch_one(&self.pool)
        .await?;
        Ok(COMMEND_TOKENS_PER_DAY.saturating_sub(used as u32))
    }

    async fn list_commends(
        &self,
        sender: u64,
        target: u64,
    ) -> Result<CommendFlags, RepositoryError> {
        let rows = sqlx::query(
            "SELECT type FROM player_commends \
             WHERE sender_steamid64 = ? AND receiver_steamid64 = ? \
             AND created_at > DATE_SUB(NOW(), INTERVAL 3 MONTH)",
        )
        .bind(sender)
        .bind(target)
        .fetch_all(&self.pool)
        .await?;

        let mut flags = CommendFlags::default();
        for row in rows {
            match row.try_get::<u8, _>(0)? {
                1 => flags.friendly = true,
                2 => flags.teaching = true,
                3 => flags.leader = true,
                _ => {}
            }
        }
        Ok(flags)
    }

    async fn insert_commend(
        &self,
        sender: u64,
        target: u64,
        kind: CommendType,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO player_commends (sender_steamid64, receiver_steamid64, type) \
             VALUES (?, ?, ?)",
        )
        .bind(sender)
        .bind(target)
        .bind(kind.as_u8())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_commend(
        &self,
        sender: u64,
        target: u64,
        kind: CommendType,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "DELETE FROM player_commends \
             WHERE sender_steamid64 = ? AND receiver_steamid64 = ? AND type = ?",
        )
        .bind(sender)
        .bind(target)
        .bind(kind.as_u8())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_report_tokens(&self, sender: u64) -> Result<u32, RepositoryError> {
        let used: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT receiver_steamid64) FROM player_reports \
             WHERE sender_steamid64 = ? AND created_at > DATE_SUB(NOW(), INTERVAL 1 WEEK)",
        )
        .bind(sender)
        .fetch_one(&self.pool)
        .await?;
        Ok(REPORT_TOKENS_PER_WEEK.saturating_sub(used as u32))
    }

    async fn count_reports(&self, sender: u64, target: u64) -> Result<u32, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM player_reports \
             WHERE sender_steamid64 = ? AND receiver_steamid64 = ? \
             AND created_at > DATE_SUB(NOW(), INTERVAL 1 WEEK)",
        )
        .bind(sender)
        .bind(target)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    async fn insert_report(
        &self,
        sender: u64,
        target: u64,
        kind: ReportType,
        match_id: u64,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO player_reports (sender_steamid64, receiver_steamid64, type, match_id) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(sender)
        .bind(target)
        .bind(kind.as_u8())
        .bind(match_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_banned(&self, steam_id2: &str) -> Result<bool, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sb_bans \
             WHERE authid = ? AND length = 0 AND RemoveType IS NULL",
        )
        .bind(steam_id2)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn latest_cooldown(
        &self,
        steam_id2: &str,
    ) -> Result<Option<CooldownRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT cooldown_reason, cooldown_expire, acknowledged FROM cooldowns \
             WHERE sid = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(steam_id2)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(CooldownRecord {
                reason: row.try_get::<u32, _>(0)?,
                expires_at: row.try_get::<i64, _>(1)?,
                acknowledged: row.try_get::<i8, _>(2)? != 0,
            }),
            None => None,
        })
    }

    async fn list_medals(&self, steam_id2: &str) -> Result<Vec<MedalItem>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT item_id, equipped_t, equipped_ct FROM csgo_items \
             WHERE owner_steamid2 = ? AND item_id LIKE 'collectible-%'",
        )
        .bind(steam_id2)
        .fetch_all(&self.pool)
        .await?;

        let mut medals = Vec::with_capacity(rows.len());
        for row in rows {
            let item_id: String = row.try_get(0)?;
            // item ids look like "collectible-<defindex>"
            let Some(def_index) = item_id
                .split_once('-')
                .and_then(|(_, idx)| idx.parse::<u32>().ok())
                .filter(|&idx| idx != 0)
            else {
                continue;
            };
            medals.push(MedalItem {
                def_index,
                equipped_t: row.try_get::<i8, _>(1)? != 0,
                equipped_ct: row.try_get::<i8, _>(2)? != 0,
            });
        }
        Ok(medals)
    }

    async fn latest_item_id(&self, steam_id2: &str) -> Result<u64, RepositoryError> {
        let max: Option<u64> =
            sqlx::query_scalar("SELECT MAX(id) FROM csgo_items WHERE owner_steamid2 = ?")
                .bind(steam_id2)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.unwrap_or(0))
    }

    async fn items_after(
        &self,
        steam_id2: &str,
        item_id: u64,
    ) -> Result<Vec<u64>, RepositoryError> {
        let ids: Vec<u64> = sqlx::query_scalar(
            "SELECT id FROM csgo_items WHERE owner_steamid2 = ? AND id > ? ORDER BY id",
        )
        .bind(steam_id2)
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

// === In-memory ===

#[derive(Debug, Clone)]
struct CommendRow {
    sender: u64,
    receiver: u64,
    kind: CommendType,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct ReportRow {
    sender: u64,
    receiver: u64,
    #[allow(dead_code)]
    kind: ReportType,
    #[allow(dead_code)]
    match_id: u64,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    ratings: HashMap<u64, PlayerSkillRating>,
    commends: Vec<CommendRow>,
    reports: Vec<ReportRow>,
    bans: Vec<String>,
    cooldowns: HashMap<String, CooldownRecord>,
    medals: HashMap<String, Vec<MedalItem>>,
    items: HashMap<String, Vec<u64>>,
    matches: Vec<MatchRecord>,
}

/// Process-local repository with the same window semantics as the MySQL
/// implementation. Used when no database is configured and by the tests.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding helpers for development and tests.

    pub fn set_rating(&self, steam_id: u64, rating: PlayerSkillRating) {
        self.state.lock().unwrap().ratings.insert(steam_id, rating);
    }

    pub fn add_ban(&self, steam_id2: &str) {
        self.state.lock().unwrap().bans.push(steam_id2.to_string());
    }

    pub fn set_cooldown(&self, steam_id2: &str, cooldown: CooldownRecord) {
        self.state
            .lock()
            .unwrap()
            .cooldowns
            .insert(steam_id2.to_string(), cooldown);
    }

    pub fn add_medal(&self, steam_id2: &str, medal: MedalItem) {
        self.state
            .lock()
            .unwrap()
            .medals
            .entry(steam_id2.to_string())
            .or_default()
            .push(medal);
    }

    pub fn add_items(&self, steam_id2: &str, ids: &[u64]) {
        let mut state = self.state.lock().unwrap();
        let items = state.items.entry(steam_id2.to_string()).or_default();
        items.extend_from_slice(ids);
        items.sort_unstable();
    }

    /// Inserts a commend with an explicit timestamp, for window tests.
    pub fn insert_commend_at(
        &self,
        sender: u64,
        target: u64,
        kind: CommendType,
        created_at: DateTime<Utc>,
    ) {
        self.state.lock().unwrap().commends.push(CommendRow {
            sender,
            receiver: target,
            kind,
            created_at,
        });
    }

    /// Inserts a report with an explicit timestamp, for window tests.
    pub fn insert_report_at(
        &self,
        sender: u64,
        target: u64,
        kind: ReportType,
        match_id: u64,
        created_at: DateTime<Utc>,
    ) {
        self.state.lock().unwrap().reports.push(ReportRow {
            sender,
            receiver: target,
            kind,
            match_id,
            created_at,
        });
    }

    pub fn logged_matches(&self) -> Vec<MatchRecord> {
        self.state.lock().unwrap().matches.clone()
    }

    pub fn commend_rows(&self, sender: u64, target: u64) -> Vec<CommendType> {
        self.state
            .lock()
            .unwrap()
            .commends
            .iter()
            .filter(|c| c.sender == sender && c.receiver == target)
            .map(|c| c.kind)
            .collect()
    }

    pub fn report_count(&self) -> usize {
        self.state.lock().unwrap().reports.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_player_rating(
        &self,
        steam_id: u64,
    ) -> Result<PlayerSkillRating, RepositoryError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .ratings
            .get(&steam_id)
            .copied()
            .unwrap_or_default())
    }

    async fn update_player_rating(
        &self,
        steam_id: u64,
        rating: PlayerSkillRating,
    ) -> Result<(), RepositoryError> {
        self.state.lock().unwrap().ratings.insert(steam_id, rating);
        Ok(())
    }

    async fn log_match(&self, record: &MatchRecord) -> Result<(), RepositoryError> {
        self.state.lock().unwrap().matches.push(record.clone());
        Ok(())
    }

    async fn get_commends(&self, target: u64) -> Result<CommendCounts, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut counts = CommendCounts::default();
        for row in state.commends.iter().filter(|c| c.receiver == target) {
            match row.kind {
                CommendType::Friendly => counts.friendly += 1,
                CommendType::Teaching => counts.teaching += 1,
                CommendType::Leader => counts.leader += 1,
            }
        }
        Ok(counts)
    }

    async fn get_commend_tokens(&self, sender: u64) -> Result<u32, RepositoryError> {
        let state = self.state.lock().unwrap();
        let cutoff = Utc::now() - TimeDelta::days(1);
        let mut receivers: Vec<u64> = state
            .commends
            .iter()
            .filter(|c| c.sender == sender && c.created_at > cutoff)
            .map(|c| c.receiver)
            .collect();
        receivers.sort_unstable();
        receivers.dedup();
        Ok(COMMEND_TOKENS_PER_DAY.saturating_sub(receivers.len() as u32))
    }

    async fn list_commends(
        &self,
        sender: u64,
        target: u64,
    ) -> Result<CommendFlags, RepositoryError> {
        let state = self.state.lock().unwrap();
        let cutoff = Utc::now() - TimeDelta::days(COMMEND_WINDOW_DAYS);
        let mut flags = CommendFlags::default();
        for row in state
            .commends
            .iter()
            .filter(|c| c.sender == sender && c.receiver == target && c.created_at > cutoff)
        {
            match row.kind {
                CommendType::Friendly => flags.friendly = true,
                CommendType::Teaching => flags.teaching = true,
                CommendType::Leader => flags.leader = true,
            }
        }
        Ok(flags)
    }

    async fn insert_commend(
        &self,
        sender: u64,
        target: u64,
        kind: CommendType,
    ) -> Result<(), RepositoryError> {
        self.insert_commend_at(sender, target, kind, Utc::now());
        Ok(())
    }

    async fn delete_commend(
        &self,
        sender: u64,
        target: u64,
        kind: CommendType,
    ) -> Result<(), RepositoryError> {
        self.state
            .lock()
            .unwrap()
            .commends
            .retain(|c| !(c.sender == sender && c.receiver == target && c.kind == kind));
        Ok(())
    }

    async fn get_report_tokens(&self, sender: u64) -> Result<u32, RepositoryError> {
        let state = self.state.lock().unwrap();
        let cutoff = Utc::now() - TimeDelta::weeks(1);
        let mut receivers: Vec<u64> = state
            .reports
            .iter()
            .filter(|r| r.sender == sender && r.created_at > cutoff)
            .map(|r| r.receiver)
            .collect();
        receivers.sort_unstable();
        receivers.dedup();
        Ok(REPORT_TOKENS_PER_WEEK.saturating_sub(receivers.len() as u32))
    }

    async fn count_reports(&self, sender: u64, target: u64) -> Result<u32, RepositoryError> {
        let state = self.state.lock().unwrap();
        let cutoff = Utc::now() - TimeDelta::weeks(1);
        Ok(state
            .reports
            .iter()
            .filter(|r| r.sender == sender && r.receiver == target && r.created_at > cutoff)
            .count() as u32)
    }

    async fn insert_report(
        &self,
        sender: u64,
        target: u64,
        kind: ReportType,
        match_id: u64,
    ) -> Result<(), RepositoryError> {
        self.insert_report_at(sender, target, kind, match_id, Utc::now());
        Ok(())
    }

    async fn is_banned(&self, steam_id2: &str) -> Result<bool, RepositoryError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .bans
            .iter()
            .any(|b| b == steam_id2))
    }

    async fn latest_cooldown(
        &self,
        steam_id2: &str,
    ) -> Result<Option<CooldownRecord>, RepositoryError> {
        Ok(self.state.lock().unwrap().cooldowns.get(steam_id2).copied())
    }

    async fn list_medals(&self, steam_id2: &str) -> Result<Vec<MedalItem>, RepositoryError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .medals
            .get(steam_id2)
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_item_id(&self, steam_id2: &str) -> Result<u64, RepositoryError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .items
            .get(steam_id2)
            .and_then(|items| items.last().copied())
            .unwrap_or(0))
    }

    async fn items_after(
        &self,
        steam_id2: &str,
        item_id: u64,
    ) -> Result<Vec<u64>, RepositoryError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .items
            .get(steam_id2)
            .map(|items| items.iter().copied().filter(|&id| id > item_id).collect())
            .unwrap_or_default())
    }
}
