//! Message catalogue for the coordinator protocol.
//!
//! Every message is a 32-bit type constant plus a `bincode`-serialized
//! payload struct. The custom coordinator messages live in the 6000 block;
//! matchmaking lifecycle messages in the 9100 block; game-server messages
//! in the 9200 block.

use serde::{Deserialize, Serialize};

use crate::codec::encode_frames;

/// 32-bit message-type constants carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    // Coordinator block
    GcWelcome = 6001,
    GcConfirmAuth = 6002,
    GcHeartbeat = 6003,
    ClientAuth = 6004,
    ClientRequestHello = 6005,
    MatchmakingHello = 6006,
    ViewProfileRequest = 6007,
    ViewProfileResponse = 6008,
    CommendPlayerQuery = 6009,
    CommendPlayerQueryResponse = 6010,
    CommendPlayerRequest = 6011,
    ReportPlayer = 6012,
    ReportResponse = 6013,
    ItemsUpdated = 6014,

    // Matchmaking lifecycle block
    MatchmakingStart = 9109,
    MatchmakingStop = 9110,
    MatchAccept = 9111,
    MatchDecline = 9112,
    MatchFound = 9113,
    MatchReady = 9114,
    MatchCancelled = 9115,
    ServerReserve = 9116,

    // Game-server block
    ServerRegister = 9201,
    ServerHeartbeat = 9202,
    ServerMatchEnd = 9203,
}

impl MsgType {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Maps a wire value back to a known message type.
    pub fn from_u32(value: u32) -> Option<MsgType> {
        use MsgType::*;
        Some(match value {
            6001 => GcWelcome,
            6002 => GcConfirmAuth,
            6003 => GcHeartbeat,
            6004 => ClientAuth,
            6005 => ClientRequestHello,
            6006 => MatchmakingHello,
            6007 => ViewProfileRequest,
            6008 => ViewProfileResponse,
            6009 => CommendPlayerQuery,
            6010 => CommendPlayerQueryResponse,
            6011 => CommendPlayerRequest,
            6012 => ReportPlayer,
            6013 => ReportResponse,
            6014 => ItemsUpdated,
            9109 => MatchmakingStart,
            9110 => MatchmakingStop,
            9111 => MatchAccept,
            9112 => MatchDecline,
            9113 => MatchFound,
            9114 => MatchReady,
            9115 => MatchCancelled,
            9116 => ServerReserve,
            9201 => ServerRegister,
            9202 => ServerHeartbeat,
            9203 => ServerMatchEnd,
            _ => return None,
        })
    }
}

/// Serializes a payload and wraps it in framed byte buffers, ready to send.
///
/// `chunks == 0` auto-sizes the chunk count from the payload length.
pub fn encode_message<T: Serialize>(
    msg_type: MsgType,
    payload: &T,
    chunks: u32,
) -> bincode::Result<Vec<Vec<u8>>> {
    let bytes = bincode::serialize(payload)?;
    Ok(encode_frames(msg_type.as_u32(), &bytes, chunks))
}

/// Deserializes a reassembled message payload.
pub fn decode_payload<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> bincode::Result<T> {
    bincode::deserialize(payload)
}

// === Authentication ===

/// First message on a client connection: the platform-issued ticket.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ClientAuth {
    pub steam_id: u64,
    pub ticket: Vec<u8>,
}

/// Post-auth greeting.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GcWelcome {
    pub steam_id: u64,
}

/// Outcome of ticket validation. `result == 0` means accepted.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GcConfirmAuth {
    pub result: u32,
}

/// Liveness probe, echoed by the coordinator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub timestamp: u64,
}

/// Client request for its hello payload.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct ClientRequestHello {}

// === Social state ===

/// Global counters shown on the client main menu. The coordinator may leave
/// the live counters zero-valued.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct GlobalStats {
    pub players_online: u32,
    pub servers_online: u32,
    pub players_searching: u32,
    pub servers_available: u32,
    pub ongoing_matches: u32,
    pub search_time_avg: u32,
    pub main_post_url: String,
    pub pricesheet_version: u32,
    pub required_app_version: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct RankingInfo {
    pub account_id: u32,
    pub rank_id: u32,
    pub wins: u32,
}

/// Lifetime commendation counts for a player.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommendCounts {
    pub friendly: u32,
    pub teaching: u32,
    pub leader: u32,
}

/// Hello payload: everything the client needs to render the player's own
/// state after connecting.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct MatchmakingHello {
    pub account_id: u32,
    pub global_stats: GlobalStats,
    pub vac_banned: bool,
    pub ranking: RankingInfo,
    pub commendation: CommendCounts,
    /// Cooldown reason code, zero when no unacknowledged cooldown exists.
    pub penalty_reason: u32,
    /// Seconds until the cooldown expires, clamped at zero.
    pub penalty_seconds: u32,
    pub player_level: u32,
    pub player_cur_xp: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ViewProfileRequest {
    pub account_id: u32,
}

/// Display medals: item definition indexes plus the optional featured one
/// (equipped on both teams). Zero means no featured medal.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct MedalsInfo {
    pub display_items: Vec<u32>,
    pub featured_item: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct PlayerProfile {
    pub account_id: u32,
    pub ranking: RankingInfo,
    pub commendation: CommendCounts,
    pub medals: MedalsInfo,
    pub player_level: u32,
    pub player_cur_xp: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct ViewProfileResponse {
    pub profiles: Vec<PlayerProfile>,
}

/// Tri-state commend selection: each flag is the desired end state for that
/// commend type from this sender to the target.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommendFlags {
    pub friendly: bool,
    pub teaching: bool,
    pub leader: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CommendPlayerQuery {
    pub account_id: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CommendPlayerQueryResponse {
    pub account_id: u32,
    pub commendation: CommendFlags,
    pub tokens: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CommendPlayerRequest {
    pub account_id: u32,
    pub commendation: CommendFlags,
}

// === Reports ===

/// The six report categories, with the wire values used in persistence.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReportType {
    Aimbot = 1,
    Wallhack = 2,
    Speedhack = 3,
    Griefing = 4,
    TextAbuse = 5,
    VoiceAbuse = 6,
}

impl ReportType {
    pub const ALL: [ReportType; 6] = [
        ReportType::Aimbot,
        ReportType::Wallhack,
        ReportType::Speedhack,
        ReportType::Griefing,
        ReportType::TextAbuse,
        ReportType::VoiceAbuse,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<ReportType> {
        Self::ALL.get(value.wrapping_sub(1) as usize).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            ReportType::Aimbot => "Aimbot",
            ReportType::Wallhack => "Wallhack",
            ReportType::Speedhack => "Speedhack/Other Hack",
            ReportType::Griefing => "Griefing/Team Harm",
            ReportType::TextAbuse => "Abusive Text Chat",
            ReportType::VoiceAbuse => "Abusive Voice Chat",
        }
    }

    pub fn emoji(self) -> &'static str {
        match self {
            ReportType::Aimbot => "\u{1F3AF}",
            ReportType::Wallhack => "\u{1F47B}",
            ReportType::Speedhack => "\u{26A1}",
            ReportType::Griefing => "\u{1F525}",
            ReportType::TextAbuse => "\u{1F4AC}",
            ReportType::VoiceAbuse => "\u{1F50A}",
        }
    }
}

/// The three commend categories, with the wire values used in persistence.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommendType {
    Friendly = 1,
    Teaching = 2,
    Leader = 3,
}

impl CommendType {
    pub const ALL: [CommendType; 3] =
        [CommendType::Friendly, CommendType::Teaching, CommendType::Leader];

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct ReportPlayer {
    pub account_id: u32,
    /// Match the behavior was observed in; zero when not tied to a match.
    pub match_id: u64,
    pub aimbot: bool,
    pub wallhack: bool,
    pub speedhack: bool,
    pub teamharm: bool,
    pub textabuse: bool,
    pub voiceabuse: bool,
}

impl ReportPlayer {
    /// The categories this report flags, in wire order.
    pub fn flagged_types(&self) -> Vec<ReportType> {
        let flags = [
            (self.aimbot, ReportType::Aimbot),
            (self.wallhack, ReportType::Wallhack),
            (self.speedhack, ReportType::Speedhack),
            (self.teamharm, ReportType::Griefing),
            (self.textabuse, ReportType::TextAbuse),
            (self.voiceabuse, ReportType::VoiceAbuse),
        ];
        flags
            .into_iter()
            .filter_map(|(set, ty)| set.then_some(ty))
            .collect()
    }
}

/// Result codes of the report path.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ReportResult {
    Ok,
    GeneralError,
    NoTokens,
    AlreadyReported,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReportResponse {
    pub account_id: u32,
    pub confirmation_id: u32,
    pub result: ReportResult,
    pub tokens: u32,
}

// === Matchmaking lifecycle ===

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct MatchmakingStart {
    /// Maps the player is willing to play; empty means the whole pool.
    pub preferred_maps: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct MatchmakingStop {}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MatchAccept {
    pub match_id: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MatchDecline {
    pub match_id: u64,
}

/// A match has been formed; every player must accept within the window.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MatchFound {
    pub match_id: u64,
    pub map_name: String,
    pub avg_mmr: u32,
    pub ready_up_seconds: u32,
}

/// Everyone accepted: here is the reserved server and the join token.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MatchReady {
    pub match_id: u64,
    pub server_address: String,
    pub server_port: u16,
    pub match_token: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MatchCancelled {
    pub match_id: u64,
    pub reason: String,
}

/// Reservation pushed to the game server hosting the match.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerReserve {
    pub match_id: u64,
    pub match_token: String,
    pub map_name: String,
    pub team_a: Vec<u64>,
    pub team_b: Vec<u64>,
}

// === Game-server control ===

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerRegister {
    pub server_steam_id: u64,
    pub address: String,
    pub port: u16,
    pub max_players: u32,
    pub current_map: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerHeartbeat {
    pub current_players: u32,
    pub current_map: String,
}

/// End-of-match report from the hosting server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerMatchEnd {
    pub match_id: u64,
}

// === Inventory ===

/// Pushed when the periodic scan finds items newer than the session cursor.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ItemsUpdated {
    pub item_ids: Vec<u64>,
}
