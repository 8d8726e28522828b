//! Player social state: hello payloads, profile views, commendations and
//! reports.
//!
//! The commend and report paths enforce per-sender token budgets derived
//! from stored rows rather than separate counters: a commend token is one
//! of three distinct receivers per day, a report token one of six distinct
//! receivers per week. The commend swap rule means moving a commend from
//! one type to another never costs a token; only commending a player you
//! had no current commend with does.

use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use shared::messages::{
    CommendCounts, CommendFlags, CommendPlayerQueryResponse, CommendPlayerRequest, CommendType,
    GlobalStats, MatchmakingHello, MedalsInfo, PlayerProfile, RankingInfo, ReportPlayer,
    ReportResponse, ReportResult, ViewProfileResponse,
};
use shared::rank::score_to_rank;
use shared::steamid::{account_id, steamid2, steamid_from_account};

use crate::moderation::ReportData;
use crate::repository::{Repository, COMMEND_TOKENS_PER_DAY, REPORT_TOKENS_PER_WEEK};

#[derive(Debug, Clone)]
pub struct SocialConfig {
    pub main_post_url: String,
    pub pricesheet_version: u32,
    pub required_app_version: u32,
}

impl Default for SocialConfig {
    fn default() -> Self {
        Self {
            main_post_url: "http://blog.counter-strike.net/".to_string(),
            pricesheet_version: 1680057676,
            required_app_version: 13971,
        }
    }
}

/// Live counters the hello payload carries; zero values are acceptable.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalCounters {
    pub players_online: u32,
    pub servers_online: u32,
    pub players_searching: u32,
    pub servers_available: u32,
    pub ongoing_matches: u32,
}

pub struct SocialService {
    repo: Arc<dyn Repository>,
    config: SocialConfig,
}

impl SocialService {
    pub fn new(repo: Arc<dyn Repository>, config: SocialConfig) -> Self {
        Self { repo, config }
    }

    /// Builds the hello payload for an authenticated session. Storage
    /// failures degrade individual sections rather than failing the hello.
    pub async fn build_hello(&self, steam_id: u64, counters: GlobalCounters) -> MatchmakingHello {
        let account = account_id(steam_id);
        let id2 = steamid2(steam_id);

        let vac_banned = match self.repo.is_banned(&id2).await {
            Ok(banned) => banned,
            Err(e) => {
                warn!("ban lookup failed for {}: {}", id2, e);
                false
            }
        };

        let rating = self.repo.get_player_rating(steam_id).await.unwrap_or_else(|e| {
            warn!("rating lookup failed for {}: {}", steam_id, e);
            Default::default()
        });

        let commendation = self.repo.get_commends(steam_id).await.unwrap_or_else(|e| {
            warn!("commend lookup failed for {}: {}", steam_id, e);
            CommendCounts::default()
        });

        let (penalty_reason, penalty_seconds) = match self.repo.latest_cooldown(&id2).await {
            Ok(Some(cooldown)) if !cooldown.acknowledged => {
                let remaining = (cooldown.expires_at - Utc::now().timestamp()).max(0) as u32;
                info!(
                    "cooldown for {}: reason={}, {}s remaining",
                    id2, cooldown.reason, remaining
                );
                (cooldown.reason, remaining)
            }
            Ok(_) => (0, 0),
            Err(e) => {
                warn!("cooldown lookup failed for {}: {}", id2, e);
                (0, 0)
            }
        };

        MatchmakingHello {
            account_id: account,
            global_stats: GlobalStats {
                players_online: counters.players_online,
                servers_online: counters.servers_online,
                players_searching: counters.players_searching,
                servers_available: counters.servers_available,
                ongoing_matches: counters.ongoing_matches,
                search_time_avg: 0,
                main_post_url: self.config.main_post_url.clone(),
                pricesheet_version: self.config.pricesheet_version,
                required_app_version: self.config.required_app_version,
            },
            vac_banned,
            ranking: RankingInfo {
                account_id: account,
                rank_id: score_to_rank(rating.mmr),
                wins: rating.wins,
            },
            commendation,
            penalty_reason,
            penalty_seconds,
            player_level: rating.level,
            player_cur_xp: 0,
        }
    }

    /// Builds the profile view for any account id.
    pub async fn view_profile(&self, target_account_id: u32) -> ViewProfileResponse {
        let target = steamid_from_account(target_account_id);
        let id2 = steamid2(target);

        let rating = self.repo.get_player_rating(target).await.unwrap_or_else(|e| {
            warn!("rating lookup failed for profile {}: {}", target, e);
            Default::default()
        });
        let commendation = self.repo.get_commends(target).await.unwrap_or_else(|e| {
            warn!("commend lookup failed for profile {}: {}", target, e);
            CommendCounts::default()
        });

        let medals = match self.repo.list_medals(&id2).await {
            Ok(items) => {
                // The featured medal is the one equipped on both sides;
                // first such item wins.
                let featured = items
                    .iter()
                    .find(|m| m.equipped_t && m.equipped_ct)
                    .map(|m| m.def_index)
                    .unwrap_or(0);
                MedalsInfo {
                    display_items: items.iter().map(|m| m.def_index).collect(),
                    featured_item: featured,
                }
            }
            Err(e) => {
                warn!("medal lookup failed for {}: {}", id2, e);
                MedalsInfo::default()
            }
        };

        info!(
            "profile for account {} (medals: {}, commends: {}/{}/{})",
            target_account_id,
            medals.display_items.len(),
            commendation.friendly,
            commendation.teaching,
            commendation.leader
        );

        ViewProfileResponse {
            profiles: vec![PlayerProfile {
                account_id: target_account_id,
                ranking: RankingInfo {
                    account_id: target_account_id,
                    rank_id: score_to_rank(rating.mmr),
                    wins: rating.wins,
                },
                commendation,
                medals,
                player_level: rating.level,
                player_cur_xp: 0,
            }],
        }
    }

    /// Current per-type commend flags for (sender, target) plus the
    /// sender's remaining tokens.
    pub async fn commend_query(
        &self,
        sender: u64,
        target_account_id: u32,
    ) -> CommendPlayerQueryResponse {
        let target = steamid_from_account(target_account_id);

        let commendation = self.repo.list_commends(sender, target).await.unwrap_or_else(|e| {
            warn!("commend history lookup failed: {}", e);
            CommendFlags::default()
        });
        let tokens = self.repo.get_commend_tokens(sender).await.unwrap_or_else(|e| {
            warn!("commend token lookup failed for {}: {}", sender, e);
            COMMEND_TOKENS_PER_DAY
        });

        CommendPlayerQueryResponse {
            account_id: target_account_id,
            commendation,
            tokens,
        }
    }

    /// Applies a commend request. No response frame is sent; rejections are
    /// silent towards the client.
    pub async fn commend_player(&self, sender: u64, request: &CommendPlayerRequest) {
        let target = steamid_from_account(request.account_id);
        let wanted = request.commendation;

        let existing = match self.repo.list_commends(sender, target).await {
            Ok(flags) => flags,
            Err(e) => {
                error!("failed to check existing commends: {}", e);
                return;
            }
        };
        let existing_any = existing.friendly || existing.teaching || existing.leader;

        let adding_new = (wanted.friendly && !existing.friendly)
            || (wanted.teaching && !existing.teaching)
            || (wanted.leader && !existing.leader);

        // A token is only spent when commending a player the sender has no
        // current commend with; swaps and removals are free.
        let need_token = adding_new && !existing_any;
        if need_token {
            let tokens = self.repo.get_commend_tokens(sender).await.unwrap_or_else(|e| {
                warn!("commend token lookup failed for {}: {}", sender, e);
                COMMEND_TOKENS_PER_DAY
            });
            if tokens == 0 {
                info!("commendation rejected: sender {} has no tokens", sender);
                return;
            }
        }

        let mut added = false;
        let mut removed = false;
        let deltas = [
            (CommendType::Friendly, wanted.friendly, existing.friendly),
            (CommendType::Teaching, wanted.teaching, existing.teaching),
            (CommendType::Leader, wanted.leader, existing.leader),
        ];
        for (kind, want, have) in deltas {
            if want == have {
                continue;
            }
            if want {
                match self.repo.insert_commend(sender, target, kind).await {
                    Ok(()) => {
                        added = true;
                        info!("{:?} commendation added: {} -> {}", kind, sender, target);
                    }
                    Err(e) => error!("failed to insert {:?} commendation: {}", kind, e),
                }
            } else {
                match self.repo.delete_commend(sender, target, kind).await {
                    Ok(()) => {
                        removed = true;
                        info!("{:?} commendation removed: {} -> {}", kind, sender, target);
                    }
                    Err(e) => error!("failed to remove {:?} commendation: {}", kind, e),
                }
            }
        }

        match (added, removed, need_token) {
            (false, false, _) => info!("no commendation changes: {} -> {}", sender, target),
            (_, _, true) => info!("commend token spent: {} -> {}", sender, target),
            (true, true, false) => {
                info!("commendation types swapped: {} -> {} (no token)", sender, target)
            }
            (true, false, false) => {
                info!("commendation added to existing: {} -> {} (no token)", sender, target)
            }
            (false, true, false) => {
                info!("commendation removed: {} -> {} (no token)", sender, target)
            }
        }
    }

    /// Applies a report request; returns the client response and, on
    /// success, the event for the moderation fan-out.
    pub async fn report_player(
        &self,
        sender: u64,
        request: &ReportPlayer,
    ) -> (ReportResponse, Option<ReportData>) {
        let target = steamid_from_account(request.account_id);
        let mut response = ReportResponse {
            account_id: request.account_id,
            confirmation_id: rand::random::<u32>(),
            result: ReportResult::GeneralError,
            tokens: 0,
        };

        let tokens = self.repo.get_report_tokens(sender).await.unwrap_or_else(|e| {
            warn!("report token lookup failed for {}: {}", sender, e);
            REPORT_TOKENS_PER_WEEK
        });

        if tokens == 0 {
            response.result = ReportResult::NoTokens;
            info!("report rejected: sender {} has no tokens", sender);
            return (response, None);
        }

        let prior = self.repo.count_reports(sender, target).await.unwrap_or_else(|e| {
            error!("failed to check existing reports: {}", e);
            0
        });
        if prior > 0 {
            response.result = ReportResult::AlreadyReported;
            response.tokens = tokens;
            info!(
                "report rejected: sender {} already reported {} this week",
                sender, target
            );
            return (response, None);
        }

        let flagged = request.flagged_types();
        if flagged.is_empty() {
            response.tokens = tokens;
            error!("report rejected: no report types flagged by {}", sender);
            return (response, None);
        }

        let mut submitted = Vec::with_capacity(flagged.len());
        for kind in flagged {
            match self
                .repo
                .insert_report(sender, target, kind, request.match_id)
                .await
            {
                Ok(()) => {
                    submitted.push(kind);
                    info!("report '{}' filed: {} -> {}", kind.label(), sender, target);
                }
                Err(e) => error!("failed to insert '{}' report: {}", kind.label(), e),
            }
        }

        if submitted.is_empty() {
            response.tokens = tokens;
            error!("all report inserts failed for {} -> {}", sender, target);
            return (response, None);
        }

        response.result = ReportResult::Ok;
        response.tokens = tokens - 1;
        info!(
            "reports filed: {} -> {} ({} types, {} tokens left)",
            sender,
            target,
            submitted.len(),
            response.tokens
        );

        let event = ReportData {
            sender_steamid: sender,
            sender_name: String::new(),
            receiver_steamid: target,
            receiver_name: String::new(),
            types: submitted,
        };
        (response, Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{CooldownRecord, MedalItem, MemoryRepository, PlayerSkillRating};
    use chrono::Duration as TimeDelta;
    use shared::messages::ReportType;

    fn service() -> (SocialService, Arc<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        let service = SocialService::new(
            Arc::clone(&repo) as Arc<dyn Repository>,
            SocialConfig::default(),
        );
        (service, repo)
    }

    const SENDER: u64 = 76561197960287930;

    #[tokio::test]
    async fn hello_reflects_rating_ban_and_cooldown() {
        let (service, repo) = service();
        let id2 = steamid2(SENDER);
        repo.set_rating(
            SENDER,
            PlayerSkillRating {
                mmr: 1250,
                wins: 40,
                rank: 0,
                level: 3,
            },
        );
        repo.add_ban(&id2);
        repo.set_cooldown(
            &id2,
            CooldownRecord {
                reason: 2,
                expires_at: Utc::now().timestamp() + 600,
                acknowledged: false,
            },
        );

        let hello = service.build_hello(SENDER, GlobalCounters::default()).await;
        assert_eq!(hello.account_id, account_id(SENDER));
        assert!(hello.vac_banned);
        // 1250 sits past the 1200 threshold: rank 11.
        assert_eq!(hello.ranking.rank_id, 11);
        assert_eq!(hello.ranking.wins, 40);
        assert_eq!(hello.penalty_reason, 2);
        assert!(hello.penalty_seconds > 590 && hello.penalty_seconds <= 600);
        assert_eq!(hello.player_level, 3);
    }

    #[tokio::test]
    async fn acknowledged_or_expired_cooldowns_stay_silent() {
        let (service, repo) = service();
        let id2 = steamid2(SENDER);
        repo.set_cooldown(
            &id2,
            CooldownRecord {
                reason: 3,
                expires_at: Utc::now().timestamp() + 600,
                acknowledged: true,
            },
        );
        let hello = service.build_hello(SENDER, GlobalCounters::default()).await;
        assert_eq!(hello.penalty_reason, 0);
        assert_eq!(hello.penalty_seconds, 0);

        // Unacknowledged but already expired: seconds clamp to zero.
        repo.set_cooldown(
            &id2,
            CooldownRecord {
                reason: 3,
                expires_at: Utc::now().timestamp() - 100,
                acknowledged: false,
            },
        );
        let hello = service.build_hello(SENDER, GlobalCounters::default()).await;
        assert_eq!(hello.penalty_reason, 3);
        assert_eq!(hello.penalty_seconds, 0);
    }

    #[tokio::test]
    async fn profile_features_the_medal_equipped_on_both_sides() {
        let (service, repo) = service();
        let target_account = 22202u32;
        let id2 = steamid2(steamid_from_account(target_account));
        repo.add_medal(
            &id2,
            MedalItem {
                def_index: 875,
                equipped_t: true,
                equipped_ct: false,
            },
        );
        repo.add_medal(
            &id2,
            MedalItem {
                def_index: 903,
                equipped_t: true,
                equipped_ct: true,
            },
        );

        let response = service.view_profile(target_account).await;
        assert_eq!(response.profiles.len(), 1);
        let profile = &response.profiles[0];
        assert_eq!(profile.medals.display_items, vec![875, 903]);
        assert_eq!(profile.medals.featured_item, 903);
    }

    #[tokio::test]
    async fn commend_query_reports_flags_and_tokens() {
        let (service, repo) = service();
        let target = 5000u32;
        repo.insert_commend_at(
            SENDER,
            steamid_from_account(target),
            CommendType::Teaching,
            Utc::now() - TimeDelta::hours(1),
        );

        let response = service.commend_query(SENDER, target).await;
        assert!(!response.commendation.friendly);
        assert!(response.commendation.teaching);
        assert_eq!(response.tokens, 2);
    }

    #[tokio::test]
    async fn first_commend_spends_a_token() {
        let (service, repo) = service();
        let target = 5000u32;
        service
            .commend_player(
                SENDER,
                &CommendPlayerRequest {
                    account_id: target,
                    commendation: CommendFlags {
                        friendly: true,
                        teaching: false,
                        leader: false,
                    },
                },
            )
            .await;

        assert_eq!(
            repo.commend_rows(SENDER, steamid_from_account(target)),
            vec![CommendType::Friendly]
        );
        assert_eq!(repo.get_commend_tokens(SENDER).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn commend_without_tokens_is_silently_rejected() {
        let (service, repo) = service();
        for receiver in 0..3u32 {
            repo.insert_commend_at(
                SENDER,
                steamid_from_account(7000 + receiver),
                CommendType::Friendly,
                Utc::now() - TimeDelta::hours(2),
            );
        }
        assert_eq!(repo.get_commend_tokens(SENDER).await.unwrap(), 0);

        service
            .commend_player(
                SENDER,
                &CommendPlayerRequest {
                    account_id: 5000,
                    commendation: CommendFlags {
                        friendly: true,
                        teaching: false,
                        leader: false,
                    },
                },
            )
            .await;
        assert!(repo
            .commend_rows(SENDER, steamid_from_account(5000))
            .is_empty());
    }

    #[tokio::test]
    async fn swapping_types_needs_no_token_and_keeps_the_count() {
        let (service, repo) = service();
        let target = 5000u32;
        let target_id = steamid_from_account(target);
        // Prior friendly commend inside the token window: the receiver is
        // already in today's distinct set.
        repo.insert_commend_at(SENDER, target_id, CommendType::Friendly, Utc::now() - TimeDelta::hours(1));
        let tokens_before = repo.get_commend_tokens(SENDER).await.unwrap();

        service
            .commend_player(
                SENDER,
                &CommendPlayerRequest {
                    account_id: target,
                    commendation: CommendFlags {
                        friendly: false,
                        teaching: true,
                        leader: false,
                    },
                },
            )
            .await;

        assert_eq!(
            repo.commend_rows(SENDER, target_id),
            vec![CommendType::Teaching]
        );
        assert_eq!(
            repo.get_commend_tokens(SENDER).await.unwrap(),
            tokens_before
        );
    }

    #[tokio::test]
    async fn adding_a_type_to_an_existing_commend_skips_the_token_check() {
        let (service, repo) = service();
        let target = 5000u32;
        let target_id = steamid_from_account(target);
        // Exhaust the budget on other receivers.
        for receiver in 0..3u32 {
            repo.insert_commend_at(
                SENDER,
                steamid_from_account(7000 + receiver),
                CommendType::Friendly,
                Utc::now() - TimeDelta::hours(2),
            );
        }
        // Existing friendly commend to the target, older than a day.
        repo.insert_commend_at(SENDER, target_id, CommendType::Friendly, Utc::now() - TimeDelta::days(30));

        service
            .commend_player(
                SENDER,
                &CommendPlayerRequest {
                    account_id: target,
                    commendation: CommendFlags {
                        friendly: true,
                        teaching: true,
                        leader: false,
                    },
                },
            )
            .await;

        let mut rows = repo.commend_rows(SENDER, target_id);
        rows.sort_by_key(|k| k.as_u8());
        assert_eq!(rows, vec![CommendType::Friendly, CommendType::Teaching]);
    }

    #[tokio::test]
    async fn identical_commend_requests_are_idempotent() {
        let (service, repo) = service();
        let target = 5000u32;
        let request = CommendPlayerRequest {
            account_id: target,
            commendation: CommendFlags {
                friendly: true,
                teaching: false,
                leader: false,
            },
        };
        service.commend_player(SENDER, &request).await;
        service.commend_player(SENDER, &request).await;

        assert_eq!(
            repo.commend_rows(SENDER, steamid_from_account(target)),
            vec![CommendType::Friendly]
        );
    }

    #[tokio::test]
    async fn report_with_no_tokens_is_rejected_without_rows() {
        let (service, repo) = service();
        for receiver in 0..6u32 {
            repo.insert_report_at(
                SENDER,
                steamid_from_account(8000 + receiver),
                ReportType::Aimbot,
                0,
                Utc::now() - TimeDelta::days(2),
            );
        }

        let (response, event) = service
            .report_player(
                SENDER,
                &ReportPlayer {
                    account_id: 5000,
                    aimbot: true,
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(response.result, ReportResult::NoTokens);
        assert_eq!(response.tokens, 0);
        assert!(event.is_none());
        assert_eq!(repo.report_count(), 6);
    }

    #[tokio::test]
    async fn duplicate_report_within_a_week_is_rejected() {
        let (service, repo) = service();
        let target = 5000u32;
        repo.insert_report_at(
            SENDER,
            steamid_from_account(target),
            ReportType::Wallhack,
            0,
            Utc::now() - TimeDelta::days(3),
        );

        let (response, event) = service
            .report_player(
                SENDER,
                &ReportPlayer {
                    account_id: target,
                    aimbot: true,
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(response.result, ReportResult::AlreadyReported);
        assert_eq!(response.tokens, 5);
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn successful_report_inserts_rows_and_fans_out() {
        let (service, repo) = service();
        let target = 5000u32;

        let (response, event) = service
            .report_player(
                SENDER,
                &ReportPlayer {
                    account_id: target,
                    match_id: 31,
                    wallhack: true,
                    voiceabuse: true,
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(response.result, ReportResult::Ok);
        assert_eq!(response.tokens, 5);
        assert_eq!(repo.report_count(), 2);

        let event = event.expect("fan-out event");
        assert_eq!(event.receiver_steamid, steamid_from_account(target));
        assert_eq!(event.types, vec![ReportType::Wallhack, ReportType::VoiceAbuse]);
    }

    #[tokio::test]
    async fn report_with_no_flags_is_an_error() {
        let (service, repo) = service();
        let (response, event) = service
            .report_player(SENDER, &ReportPlayer::default())
            .await;
        assert_eq!(response.result, ReportResult::GeneralError);
        assert!(event.is_none());
        assert_eq!(repo.report_count(), 0);
    }
}
