//! Error taxonomy for the coordinator.
//!
//! Most of these are recovered from locally: a malformed frame or unknown
//! message type drops the message and keeps the session, a missing game
//! server aborts match creation for the tick, repository failures fall back
//! to defaults where a default exists. Only a bind failure at startup is
//! fatal to the process; send failures and repeated malformed frames are
//! fatal to the offending session alone.

use shared::codec::CodecError;
use thiserror::Error;

use crate::transport::PeerId;

#[derive(Debug, Error)]
pub enum GcError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error(transparent)]
    MalformedFrame(#[from] CodecError),

    #[error("unknown message type {0}")]
    UnknownMessageType(u32),

    #[error("message type {0} requires an authenticated session")]
    Unauthorized(u32),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("rate limited")]
    RateLimited,

    #[error("already exists")]
    AlreadyExists,

    #[error("not found")]
    NotFound,

    #[error("no game server available")]
    NoServerAvailable,

    #[error("timed out")]
    Timeout,

    #[error("conflicting state transition: {0}")]
    Conflict(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("payload encoding: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Failures surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    #[error("row not found")]
    NotFound,
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound,
            other => RepositoryError::Unavailable(other.to_string()),
        }
    }
}

/// Failures surfaced by the transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("send to peer {peer} failed: {reason}")]
    SendFailed { peer: PeerId, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
