//! End-to-end tests for the coordinator over real sockets.
//!
//! Each test stands up the full dependency graph (in-memory repository,
//! both transports on ephemeral ports, the dispatcher and workers) and
//! drives it the way clients and game servers do on the wire.

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};

use server::auth::TicketAuthenticator;
use server::gc::Gc;
use server::matchmaking::MatchmakingConfig;
use server::moderation::{ModerationConfig, ReportNotifier};
use server::repository::{MemoryRepository, PlayerSkillRating, Repository};
use server::session::SessionConfig;
use server::social::SocialConfig;
use server::transport::{Router, TcpTransport, UdpTransport};
use shared::codec::Frame;
use shared::messages::{
    decode_payload, encode_message, ClientAuth, CommendFlags, CommendPlayerQuery,
    CommendPlayerQueryResponse, CommendPlayerRequest, GcConfirmAuth, GcWelcome, MatchAccept,
    MatchFound, MatchReady, MatchmakingHello, MatchmakingStart, MsgType, ReportPlayer,
    ReportResponse, ReportResult, ServerMatchEnd, ServerRegister, ServerReserve,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

struct TestServer {
    gc: Arc<Gc>,
    repo: Arc<MemoryRepository>,
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    _shutdown: watch::Sender<bool>,
}

async fn spawn_server() -> TestServer {
    let repo = Arc::new(MemoryRepository::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(1024);
    let next_peer = Arc::new(AtomicU64::new(1));

    let udp = UdpTransport::bind(
        "127.0.0.1:0",
        event_tx.clone(),
        Arc::clone(&next_peer),
        shutdown_rx.clone(),
    )
    .await
    .expect("bind udp");
    let tcp = TcpTransport::bind("127.0.0.1:0", event_tx, next_peer, shutdown_rx.clone())
        .await
        .expect("bind tcp");
    let udp_addr = udp.local_addr();
    let tcp_addr = tcp.local_addr();
    let router = Arc::new(Router { udp, tcp });

    let notifier = ReportNotifier::spawn(ModerationConfig::new(None, None), shutdown_rx.clone());
    let gc = Gc::new(
        Arc::clone(&repo) as Arc<dyn Repository>,
        Arc::new(TicketAuthenticator),
        router,
        notifier,
        SessionConfig::default(),
        MatchmakingConfig::default(),
        SocialConfig::default(),
    );

    let runner = Arc::clone(&gc);
    tokio::spawn(async move { runner.run(event_rx, shutdown_rx).await });

    TestServer {
        gc,
        repo,
        udp_addr,
        tcp_addr,
        _shutdown: shutdown_tx,
    }
}

/// A game client on the datagram transport.
struct UdpClient {
    socket: UdpSocket,
    server: SocketAddr,
}

impl UdpClient {
    async fn connect(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
        Self { socket, server }
    }

    async fn send<T: Serialize>(&self, msg_type: MsgType, payload: &T) {
        for frame in encode_message(msg_type, payload, 0).expect("encode") {
            self.socket
                .send_to(&frame, self.server)
                .await
                .expect("send datagram");
        }
    }

    async fn recv_frame(&self) -> (u32, Vec<u8>) {
        let mut buf = vec![0u8; 65536];
        let (len, _) = timeout(RECV_TIMEOUT, self.socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for a datagram")
            .expect("recv");
        let frame = Frame::decode(&buf[..len]).expect("frame");
        (frame.msg_type, frame.payload)
    }

    /// Receives until a message of the wanted type arrives, skipping
    /// unrelated pushes.
    async fn expect<T: DeserializeOwned>(&self, msg_type: MsgType) -> T {
        loop {
            let (received, payload) = self.recv_frame().await;
            if received == msg_type.as_u32() {
                return decode_payload(&payload).expect("payload");
            }
        }
    }

    async fn authenticate(&self, steam_id: u64) {
        self.send(
            MsgType::ClientAuth,
            &ClientAuth {
                steam_id,
                ticket: vec![7u8; 64],
            },
        )
        .await;
        let welcome: GcWelcome = self.expect(MsgType::GcWelcome).await;
        assert_eq!(welcome.steam_id, steam_id);
        let confirm: GcConfirmAuth = self.expect(MsgType::GcConfirmAuth).await;
        assert_eq!(confirm.result, 0);
    }
}

/// A game server on the TCP transport.
struct GameServerClient {
    stream: TcpStream,
}

impl GameServerClient {
    async fn connect(server: SocketAddr) -> Self {
        let stream = TcpStream::connect(server).await.expect("connect tcp");
        Self { stream }
    }

    async fn send<T: Serialize>(&mut self, msg_type: MsgType, payload: &T) {
        for frame in encode_message(msg_type, payload, 0).expect("encode") {
            self.stream
                .write_all(&(frame.len() as u32).to_le_bytes())
                .await
                .expect("write len");
            self.stream.write_all(&frame).await.expect("write frame");
        }
        self.stream.flush().await.expect("flush");
    }

    async fn expect<T: DeserializeOwned>(&mut self, msg_type: MsgType) -> T {
        loop {
            let mut len_buf = [0u8; 4];
            timeout(RECV_TIMEOUT, self.stream.read_exact(&mut len_buf))
                .await
                .expect("timed out waiting for a message")
                .expect("read len");
            let mut data = vec![0u8; u32::from_le_bytes(len_buf) as usize];
            self.stream.read_exact(&mut data).await.expect("read frame");
            let frame = Frame::decode(&data).expect("frame");
            if frame.msg_type == msg_type.as_u32() {
                return decode_payload(&frame.payload).expect("payload");
            }
        }
    }

    async fn register(&mut self, server_steam_id: u64) {
        self.send(
            MsgType::ServerRegister,
            &ServerRegister {
                server_steam_id,
                address: "10.0.0.5".to_string(),
                port: 27015,
                max_players: 10,
                current_map: "de_dust2".to_string(),
            },
        )
        .await;
    }
}

async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..40 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within the deadline");
}

mod auth_tests {
    use super::*;

    #[tokio::test]
    async fn handshake_over_the_datagram_transport() {
        let server = spawn_server().await;
        let client = UdpClient::connect(server.udp_addr).await;
        client.authenticate(76561197960287930).await;
    }

    #[tokio::test]
    async fn short_tickets_are_denied() {
        let server = spawn_server().await;
        let client = UdpClient::connect(server.udp_addr).await;
        client
            .send(
                MsgType::ClientAuth,
                &ClientAuth {
                    steam_id: 42,
                    ticket: vec![1, 2, 3],
                },
            )
            .await;
        let confirm: GcConfirmAuth = client.expect(MsgType::GcConfirmAuth).await;
        assert_eq!(confirm.result, 1);
    }

    #[tokio::test]
    async fn pre_auth_requests_get_no_answer() {
        let server = spawn_server().await;
        let client = UdpClient::connect(server.udp_addr).await;
        client
            .send(
                MsgType::ClientRequestHello,
                &shared::messages::ClientRequestHello {},
            )
            .await;

        let mut buf = [0u8; 1024];
        let silent = timeout(Duration::from_millis(300), client.socket.recv_from(&mut buf)).await;
        assert!(silent.is_err(), "unauthenticated request must be dropped");
    }

    #[tokio::test]
    async fn chunked_auth_message_reassembles() {
        // An oversized ticket forces the client auth payload across
        // multiple frames; authentication proves reassembly.
        let server = spawn_server().await;
        let client = UdpClient::connect(server.udp_addr).await;
        client
            .send(
                MsgType::ClientAuth,
                &ClientAuth {
                    steam_id: 4242,
                    ticket: vec![9u8; 3000],
                },
            )
            .await;
        let welcome: GcWelcome = client.expect(MsgType::GcWelcome).await;
        assert_eq!(welcome.steam_id, 4242);
    }
}

mod social_tests {
    use super::*;
    use shared::steamid::steamid2;

    #[tokio::test]
    async fn hello_carries_the_seeded_social_state() {
        let server = spawn_server().await;
        let steam_id = 76561197960287930;
        server.repo.set_rating(
            steam_id,
            PlayerSkillRating {
                mmr: 1250,
                wins: 73,
                rank: 0,
                level: 5,
            },
        );
        server.repo.add_ban(&steamid2(steam_id));

        let client = UdpClient::connect(server.udp_addr).await;
        client.authenticate(steam_id).await;
        client
            .send(
                MsgType::ClientRequestHello,
                &shared::messages::ClientRequestHello {},
            )
            .await;

        let hello: MatchmakingHello = client.expect(MsgType::MatchmakingHello).await;
        assert_eq!(hello.account_id, (steam_id & 0xFFFF_FFFF) as u32);
        assert_eq!(hello.ranking.rank_id, 11);
        assert_eq!(hello.ranking.wins, 73);
        assert!(hello.vac_banned);
        assert_eq!(hello.player_level, 5);
        assert!(!hello.global_stats.main_post_url.is_empty());
    }

    #[tokio::test]
    async fn commend_roundtrip_updates_flags_and_tokens() {
        let server = spawn_server().await;
        let client = UdpClient::connect(server.udp_addr).await;
        client.authenticate(76561197960287930).await;

        client
            .send(
                MsgType::CommendPlayerQuery,
                &CommendPlayerQuery { account_id: 22202 },
            )
            .await;
        let before: CommendPlayerQueryResponse =
            client.expect(MsgType::CommendPlayerQueryResponse).await;
        assert_eq!(before.tokens, 3);
        assert!(!before.commendation.friendly);

        client
            .send(
                MsgType::CommendPlayerRequest,
                &CommendPlayerRequest {
                    account_id: 22202,
                    commendation: CommendFlags {
                        friendly: true,
                        teaching: false,
                        leader: false,
                    },
                },
            )
            .await;

        // The commend path sends no response; query again to observe it.
        client
            .send(
                MsgType::CommendPlayerQuery,
                &CommendPlayerQuery { account_id: 22202 },
            )
            .await;
        let after: CommendPlayerQueryResponse =
            client.expect(MsgType::CommendPlayerQueryResponse).await;
        assert!(after.commendation.friendly);
        assert_eq!(after.tokens, 2);
    }

    #[tokio::test]
    async fn report_tokens_run_out_after_six_targets() {
        let server = spawn_server().await;
        let client = UdpClient::connect(server.udp_addr).await;
        client.authenticate(76561197960287930).await;

        for target in 0..6u32 {
            client
                .send(
                    MsgType::ReportPlayer,
                    &ReportPlayer {
                        account_id: 30000 + target,
                        aimbot: true,
                        ..Default::default()
                    },
                )
                .await;
            let response: ReportResponse = client.expect(MsgType::ReportResponse).await;
            assert_eq!(response.result, ReportResult::Ok);
            assert_eq!(response.tokens, 5 - target);
        }

        client
            .send(
                MsgType::ReportPlayer,
                &ReportPlayer {
                    account_id: 39999,
                    aimbot: true,
                    ..Default::default()
                },
            )
            .await;
        let response: ReportResponse = client.expect(MsgType::ReportResponse).await;
        assert_eq!(response.result, ReportResult::NoTokens);
        assert_eq!(response.tokens, 0);
        assert_eq!(server.repo.report_count(), 6);
    }
}

mod matchmaking_tests {
    use super::*;

    const MMRS: [u32; 10] = [980, 990, 1000, 1010, 1020, 1030, 1040, 1050, 1060, 1070];

    #[tokio::test]
    async fn full_match_flow_across_both_transports() {
        let server = spawn_server().await;

        let mut game_server = GameServerClient::connect(server.tcp_addr).await;
        game_server.register(900).await;

        // The registration must land before players queue, or the first
        // window would find no server.
        for _ in 0..40 {
            if server.gc.servers.total_count().await == 1 {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(server.gc.servers.total_count().await, 1);

        let mut clients = Vec::new();
        for (i, &mmr) in MMRS.iter().enumerate() {
            let steam_id = 76561197960000000 + i as u64;
            server.repo.set_rating(
                steam_id,
                PlayerSkillRating {
                    mmr,
                    ..PlayerSkillRating::default()
                },
            );
            let client = UdpClient::connect(server.udp_addr).await;
            client.authenticate(steam_id).await;
            clients.push(client);
        }

        for client in &clients {
            client
                .send(
                    MsgType::MatchmakingStart,
                    &MatchmakingStart {
                        preferred_maps: vec![],
                    },
                )
                .await;
        }

        // Everyone hears about the formed match.
        let mut match_id = 0;
        for client in &clients {
            let found: MatchFound = client.expect(MsgType::MatchFound).await;
            assert_eq!(found.avg_mmr, 1025);
            assert_eq!(found.ready_up_seconds, 30);
            match_id = found.match_id;
        }

        for client in &clients {
            client.send(MsgType::MatchAccept, &MatchAccept { match_id }).await;
        }

        for client in &clients {
            let ready: MatchReady = client.expect(MsgType::MatchReady).await;
            assert_eq!(ready.match_id, match_id);
            assert_eq!(ready.server_address, "10.0.0.5");
            assert_eq!(ready.server_port, 27015);
            assert_eq!(ready.match_token.len(), 32);
        }

        let reserve: ServerReserve = game_server.expect(MsgType::ServerReserve).await;
        assert_eq!(reserve.match_id, match_id);
        assert_eq!(reserve.team_a.len(), 5);
        assert_eq!(reserve.team_b.len(), 5);

        // The hosting server closes the match out; the log is persisted.
        game_server
            .send(MsgType::ServerMatchEnd, &ServerMatchEnd { match_id })
            .await;
        let repo = Arc::clone(&server.repo);
        wait_until(move || repo.logged_matches().len() == 1).await;
        let logged = server.repo.logged_matches();
        assert_eq!(logged[0].match_id, match_id);
        assert_eq!(logged[0].avg_mmr, 1025);
    }

    #[tokio::test]
    async fn wide_spread_pool_forms_no_match() {
        let server = spawn_server().await;
        let mut game_server = GameServerClient::connect(server.tcp_addr).await;
        game_server.register(900).await;

        let mmrs = [800, 810, 820, 830, 840, 1600, 1610, 1620, 1630, 1640];
        let mut clients = Vec::new();
        for (i, &mmr) in mmrs.iter().enumerate() {
            let steam_id = 76561197970000000 + i as u64;
            server.repo.set_rating(
                steam_id,
                PlayerSkillRating {
                    mmr,
                    ..PlayerSkillRating::default()
                },
            );
            let client = UdpClient::connect(server.udp_addr).await;
            client.authenticate(steam_id).await;
            client
                .send(
                    MsgType::MatchmakingStart,
                    &MatchmakingStart {
                        preferred_maps: vec![],
                    },
                )
                .await;
            clients.push(client);
        }

        // Give the coordinator time to (not) act, then check state.
        sleep(Duration::from_millis(300)).await;
        assert_eq!(server.gc.matchmaker.active_match_count().await, 0);
        assert_eq!(server.gc.matchmaker.queue_len().await, 10);

        // No client heard anything beyond the auth exchange.
        let mut buf = [0u8; 1024];
        let silent = timeout(
            Duration::from_millis(200),
            clients[0].socket.recv_from(&mut buf),
        )
        .await;
        assert!(silent.is_err());
    }
}
