//! Message dispatch.
//!
//! Inbound messages are routed through a type→handler table instead of a
//! switch; unknown types hit a default that logs and drops. The pre-auth
//! gate lives here: an unauthenticated session may only present a ticket
//! (clients) or register (game servers); everything else is dropped
//! without a response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use log::{debug, info, warn};
use shared::messages::{
    decode_payload, ClientAuth, GcConfirmAuth, GcWelcome, Heartbeat, MatchAccept, MatchDecline,
    MatchmakingStart, MsgType, ReportPlayer, ServerHeartbeat, ServerMatchEnd, ServerRegister,
    ViewProfileRequest,
};
use shared::messages::{CommendPlayerQuery, CommendPlayerRequest};
use shared::steamid::steamid2;

use crate::error::GcError;
use crate::gc::Gc;
use crate::transport::{send_message, PeerHandle};

const AUTH_OK: u32 = 0;
const AUTH_DENIED: u32 = 1;

type HandlerFuture = BoxFuture<'static, Result<(), GcError>>;
type Handler = Box<dyn Fn(Arc<Gc>, PeerHandle, Vec<u8>) -> HandlerFuture + Send + Sync>;

pub struct Dispatcher {
    handlers: HashMap<u32, Handler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let mut dispatcher = Dispatcher {
            handlers: HashMap::new(),
        };

        dispatcher.register(MsgType::ClientAuth, |gc, peer, payload| {
            client_auth(gc, peer, payload).boxed()
        });
        dispatcher.register(MsgType::GcHeartbeat, |gc, peer, payload| {
            heartbeat(gc, peer, payload).boxed()
        });
        dispatcher.register(MsgType::ClientRequestHello, |gc, peer, payload| {
            request_hello(gc, peer, payload).boxed()
        });
        dispatcher.register(MsgType::ViewProfileRequest, |gc, peer, payload| {
            view_profile(gc, peer, payload).boxed()
        });
        dispatcher.register(MsgType::CommendPlayerQuery, |gc, peer, payload| {
            commend_query(gc, peer, payload).boxed()
        });
        dispatcher.register(MsgType::CommendPlayerRequest, |gc, peer, payload| {
            commend_request(gc, peer, payload).boxed()
        });
        dispatcher.register(MsgType::ReportPlayer, |gc, peer, payload| {
            report_player(gc, peer, payload).boxed()
        });
        dispatcher.register(MsgType::MatchmakingStart, |gc, peer, payload| {
            matchmaking_start(gc, peer, payload).boxed()
        });
        dispatcher.register(MsgType::MatchmakingStop, |gc, peer, payload| {
            matchmaking_stop(gc, peer, payload).boxed()
        });
        dispatcher.register(MsgType::MatchAccept, |gc, peer, payload| {
            match_accept(gc, peer, payload).boxed()
        });
        dispatcher.register(MsgType::MatchDecline, |gc, peer, payload| {
            match_decline(gc, peer, payload).boxed()
        });
        dispatcher.register(MsgType::ServerRegister, |gc, peer, payload| {
            server_register(gc, peer, payload).boxed()
        });
        dispatcher.register(MsgType::ServerHeartbeat, |gc, peer, payload| {
            server_heartbeat(gc, peer, payload).boxed()
        });
        dispatcher.register(MsgType::ServerMatchEnd, |gc, peer, payload| {
            server_match_end(gc, peer, payload).boxed()
        });

        dispatcher
    }

    fn register<F>(&mut self, msg_type: MsgType, handler: F)
    where
        F: Fn(Arc<Gc>, PeerHandle, Vec<u8>) -> HandlerFuture + Send + Sync + 'static,
    {
        self.handlers.insert(msg_type.as_u32(), Box::new(handler));
    }

    /// Routes one reassembled message. Unknown types, pre-auth traffic and
    /// handler errors all drop the message while keeping the session.
    pub async fn dispatch(&self, gc: Arc<Gc>, peer: PeerHandle, raw_type: u32, payload: Vec<u8>) {
        let Some(msg_type) = MsgType::from_u32(raw_type) else {
            debug!("unknown message type {} from peer {}; dropped", raw_type, peer.id);
            return;
        };

        if requires_auth(msg_type) && !gc.sessions.is_authenticated(peer.id).await {
            warn!(
                "peer {} sent {:?} before authenticating; dropped",
                peer.id, msg_type
            );
            return;
        }

        let Some(handler) = self.handlers.get(&raw_type) else {
            debug!("no handler for {:?} from peer {}; dropped", msg_type, peer.id);
            return;
        };

        if let Err(e) = handler(gc, peer, payload).await {
            warn!("{:?} from peer {} failed: {}", msg_type, peer.id, e);
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a message type needs an authenticated session. Game-server
/// messages are validated against the server registry in their handlers
/// instead.
fn requires_auth(msg_type: MsgType) -> bool {
    !matches!(
        msg_type,
        MsgType::ClientAuth
            | MsgType::ServerRegister
            | MsgType::ServerHeartbeat
            | MsgType::ServerMatchEnd
    )
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// === Handlers ===

async fn client_auth(gc: Arc<Gc>, peer: PeerHandle, payload: Vec<u8>) -> Result<(), GcError> {
    let request: ClientAuth = decode_payload(&payload)?;

    match gc.auth.validate_ticket(request.steam_id, &request.ticket).await {
        Ok(steam_id) => {
            if let Some(stale) = gc.sessions.authenticate(peer.id, steam_id).await {
                info!("evicting stale session {} of {}", stale.id, steam_id);
                gc.out.disconnect(stale).await;
            }

            // Position the item cursor now so items granted while the
            // session is up are announced from the very first scan.
            match gc.repo.latest_item_id(&steamid2(steam_id)).await {
                Ok(latest) => gc.sessions.init_item_cursor(peer.id, latest).await,
                Err(e) => warn!("item cursor init failed for {}: {}", steam_id, e),
            }

            send_message(gc.out.as_ref(), peer, MsgType::GcWelcome, &GcWelcome { steam_id })
                .await?;
            send_message(
                gc.out.as_ref(),
                peer,
                MsgType::GcConfirmAuth,
                &GcConfirmAuth { result: AUTH_OK },
            )
            .await?;
            Ok(())
        }
        Err(e) => {
            warn!("authentication failed for peer {}: {}", peer.id, e);
            let _ = send_message(
                gc.out.as_ref(),
                peer,
                MsgType::GcConfirmAuth,
                &GcConfirmAuth {
                    result: AUTH_DENIED,
                },
            )
            .await;
            gc.drop_peer(peer).await;
            Ok(())
        }
    }
}

async fn heartbeat(gc: Arc<Gc>, peer: PeerHandle, payload: Vec<u8>) -> Result<(), GcError> {
    let _probe: Heartbeat = decode_payload(&payload)?;
    send_message(
        gc.out.as_ref(),
        peer,
        MsgType::GcHeartbeat,
        &Heartbeat {
            timestamp: unix_millis(),
        },
    )
    .await
}

async fn request_hello(gc: Arc<Gc>, peer: PeerHandle, _payload: Vec<u8>) -> Result<(), GcError> {
    let Some(steam_id) = gc.sessions.steam_id_of(peer.id).await else {
        return Ok(());
    };
    let counters = gc.global_counters().await;
    let hello = gc.social.build_hello(steam_id, counters).await;
    send_message(gc.out.as_ref(), peer, MsgType::MatchmakingHello, &hello).await
}

async fn view_profile(gc: Arc<Gc>, peer: PeerHandle, payload: Vec<u8>) -> Result<(), GcError> {
    let request: ViewProfileRequest = decode_payload(&payload)?;
    let response = gc.social.view_profile(request.account_id).await;
    send_message(gc.out.as_ref(), peer, MsgType::ViewProfileResponse, &response).await
}

async fn commend_query(gc: Arc<Gc>, peer: PeerHandle, payload: Vec<u8>) -> Result<(), GcError> {
    let Some(sender) = gc.sessions.steam_id_of(peer.id).await else {
        return Ok(());
    };
    let request: CommendPlayerQuery = decode_payload(&payload)?;
    let response = gc.social.commend_query(sender, request.account_id).await;
    send_message(
        gc.out.as_ref(),
        peer,
        MsgType::CommendPlayerQueryResponse,
        &response,
    )
    .await
}

async fn commend_request(gc: Arc<Gc>, peer: PeerHandle, payload: Vec<u8>) -> Result<(), GcError> {
    let Some(sender) = gc.sessions.steam_id_of(peer.id).await else {
        return Ok(());
    };
    let request: CommendPlayerRequest = decode_payload(&payload)?;
    // The commend path never answers, success or not.
    gc.social.commend_player(sender, &request).await;
    Ok(())
}

async fn report_player(gc: Arc<Gc>, peer: PeerHandle, payload: Vec<u8>) -> Result<(), GcError> {
    let Some(sender) = gc.sessions.steam_id_of(peer.id).await else {
        return Ok(());
    };
    let request: ReportPlayer = decode_payload(&payload)?;
    let (response, event) = gc.social.report_player(sender, &request).await;
    if let Some(event) = event {
        gc.notifier.enqueue(event);
    }
    send_message(gc.out.as_ref(), peer, MsgType::ReportResponse, &response).await
}

async fn matchmaking_start(gc: Arc<Gc>, peer: PeerHandle, payload: Vec<u8>) -> Result<(), GcError> {
    let Some(steam_id) = gc.sessions.steam_id_of(peer.id).await else {
        return Ok(());
    };
    let request: MatchmakingStart = decode_payload(&payload)?;
    gc.matchmaker
        .queue_player(steam_id, peer, request.preferred_maps)
        .await;
    Ok(())
}

async fn matchmaking_stop(gc: Arc<Gc>, peer: PeerHandle, _payload: Vec<u8>) -> Result<(), GcError> {
    let Some(steam_id) = gc.sessions.steam_id_of(peer.id).await else {
        return Ok(());
    };
    gc.matchmaker.remove_from_queue(steam_id).await;
    Ok(())
}

async fn match_accept(gc: Arc<Gc>, peer: PeerHandle, payload: Vec<u8>) -> Result<(), GcError> {
    let Some(steam_id) = gc.sessions.steam_id_of(peer.id).await else {
        return Ok(());
    };
    let request: MatchAccept = decode_payload(&payload)?;
    match gc.matchmaker.accept_match(steam_id).await {
        Err(GcError::NotFound) => {
            debug!(
                "accept for match {} from {} without a pending match",
                request.match_id, steam_id
            );
            Ok(())
        }
        other => other,
    }
}

async fn match_decline(gc: Arc<Gc>, peer: PeerHandle, payload: Vec<u8>) -> Result<(), GcError> {
    let Some(steam_id) = gc.sessions.steam_id_of(peer.id).await else {
        return Ok(());
    };
    let request: MatchDecline = decode_payload(&payload)?;
    match gc.matchmaker.decline_match(steam_id).await {
        Err(GcError::NotFound) => {
            debug!(
                "decline for match {} from {} without a pending match",
                request.match_id, steam_id
            );
            Ok(())
        }
        other => other,
    }
}

async fn server_register(gc: Arc<Gc>, peer: PeerHandle, payload: Vec<u8>) -> Result<(), GcError> {
    let request: ServerRegister = decode_payload(&payload)?;
    if !gc.servers.register(peer, &request).await {
        warn!("game server registration from peer {} rejected", peer.id);
    }
    Ok(())
}

async fn server_heartbeat(gc: Arc<Gc>, peer: PeerHandle, payload: Vec<u8>) -> Result<(), GcError> {
    let request: ServerHeartbeat = decode_payload(&payload)?;
    if !gc
        .servers
        .heartbeat(peer.id, request.current_players, &request.current_map)
        .await
    {
        warn!("heartbeat from unregistered game server peer {}", peer.id);
    }
    Ok(())
}

async fn server_match_end(gc: Arc<Gc>, peer: PeerHandle, payload: Vec<u8>) -> Result<(), GcError> {
    let request: ServerMatchEnd = decode_payload(&payload)?;
    let Some(server_id) = gc.servers.server_of_peer(peer.id).await else {
        warn!("match end from unregistered game server peer {}", peer.id);
        return Ok(());
    };

    // Only the server hosting the match may close it out.
    match gc.matchmaker.match_by_id(request.match_id).await {
        Some(game) if game.server_steam_id == server_id => {
            gc.matchmaker.complete_match(request.match_id).await
        }
        Some(_) => Err(GcError::Conflict(format!(
            "server {} does not host match {}",
            server_id, request.match_id
        ))),
        None => Err(GcError::NotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_auth_gate_admits_only_entry_messages() {
        assert!(!requires_auth(MsgType::ClientAuth));
        assert!(!requires_auth(MsgType::ServerRegister));
        assert!(!requires_auth(MsgType::ServerHeartbeat));
        assert!(!requires_auth(MsgType::ServerMatchEnd));

        assert!(requires_auth(MsgType::GcHeartbeat));
        assert!(requires_auth(MsgType::ClientRequestHello));
        assert!(requires_auth(MsgType::MatchmakingStart));
        assert!(requires_auth(MsgType::ReportPlayer));
        assert!(requires_auth(MsgType::CommendPlayerRequest));
    }

    #[test]
    fn every_inbound_type_has_a_handler() {
        let dispatcher = Dispatcher::new();
        for msg_type in [
            MsgType::ClientAuth,
            MsgType::GcHeartbeat,
            MsgType::ClientRequestHello,
            MsgType::ViewProfileRequest,
            MsgType::CommendPlayerQuery,
            MsgType::CommendPlayerRequest,
            MsgType::ReportPlayer,
            MsgType::MatchmakingStart,
            MsgType::MatchmakingStop,
            MsgType::MatchAccept,
            MsgType::MatchDecline,
            MsgType::ServerRegister,
            MsgType::ServerHeartbeat,
            MsgType::ServerMatchEnd,
        ] {
            assert!(
                dispatcher.handlers.contains_key(&msg_type.as_u32()),
                "missing handler for {:?}",
                msg_type
            );
        }
        // Outbound-only types intentionally have none.
        assert!(!dispatcher.handlers.contains_key(&MsgType::GcWelcome.as_u32()));
        assert!(!dispatcher.handlers.contains_key(&MsgType::MatchFound.as_u32()));
    }
}
