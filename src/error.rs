//! Error taxonomy (spec §7).
//!
//! *Transport* and *validation* errors are recovered locally and reported
//! back to the originating session as an `error` event — they are
//! constructed here but logged at `warn`/`debug`, never `error` level (spec
//! §7: "never logged at error level"). *Bus* errors are surfaced to the
//! caller. *Fatal* errors (broker bootstrap failure, invariant violation)
//! are the only ones expected to terminate the process, and are left to
//! `anyhow` at the binary boundary the way the teacher's `main` does.

use crate::types::{ChunkId, GameId, SessionId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // --- Bus errors -------------------------------------------------------
    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("bus publish failed on channel {channel}: {source}")]
    PublishFailed {
        channel: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("bus subscribe failed on channel {channel}: {source}")]
    SubscribeFailed {
        channel: String,
        #[source]
        source: anyhow::Error,
    },

    // --- Transport errors ---------------------------------------------------
    #[error("send to session {0} failed: session is closed")]
    SessionClosed(SessionId),

    // --- Validation errors --------------------------------------------------
    #[error("session {session} is not a member of game {game}")]
    NotInGame { session: SessionId, game: GameId },

    #[error("malformed inbound payload: {0}")]
    MalformedPayload(String),

    #[error("session {session} attempted to subscribe to chunk {chunk} of game {game} without joining it")]
    ChunkMembershipViolation {
        session: SessionId,
        game: GameId,
        chunk: ChunkId,
    },

    // --- Sync coordinator errors --------------------------------------------
    #[error("no pending optimistic update {0} for game {1}")]
    UnknownUpdate(String, GameId),

    #[error("conflict resolver for policy Custom is not registered")]
    MissingCustomResolver,

    // --- Fatal ---------------------------------------------------------------
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}

/// A `{type, message}` pair, the exact shape spec §7 says is returned to the
/// client for any error surfaced over the transport.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClientError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl From<&CoreError> for ClientError {
    fn from(err: &CoreError) -> Self {
        let kind = match err {
            CoreError::BusUnavailable(_) => "bus_unavailable",
            CoreError::PublishFailed { .. } => "bus_publish_failed",
            CoreError::SubscribeFailed { .. } => "bus_subscribe_failed",
            CoreError::SessionClosed(_) => "session_closed",
            CoreError::NotInGame { .. } => "not_in_game",
            CoreError::MalformedPayload(_) => "malformed_payload",
            CoreError::ChunkMembershipViolation { .. } => "chunk_membership_violation",
            CoreError::UnknownUpdate(..) => "unknown_update",
            CoreError::MissingCustomResolver => "missing_custom_resolver",
            CoreError::InvariantViolation(_) => "invariant_violation",
        };
        ClientError {
            kind: kind.to_string(),
            message: err.to_string(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
