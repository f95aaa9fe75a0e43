//! Bus wire protocol: the envelope every message crossing the Bus is wrapped
//! in, channel-name helpers, and the typed variant parsed from it at ingress.
//!
//! ## Design rules
//!
//! 1. Every struct is `Serialize + Deserialize`; the wire format is UTF-8
//!    JSON, camelCase, per spec §6.
//! 2. Unknown fields are ignored on decode (`serde`'s default behavior for
//!    structs without `deny_unknown_fields`).
//! 3. Untyped bus payloads are parsed into [`Envelope`] exactly once, at
//!    ingress — everything downstream matches on the tagged variant instead
//!    of re-inspecting JSON (spec §9, "Sum types over duck-typed payloads").

use crate::types::{ChunkId, ChunkUpdate, GameId, PlayerId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Wire envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeType {
    Move,
    StateChange,
    PlayerEvent,
    ChunkUpdate,
}

/// The uniform envelope every Bus message is wrapped in (spec §4.1, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEnvelope {
    pub game_id: GameId,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub data: serde_json::Value,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub player_id: Option<PlayerId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub chunk_id: Option<String>,
}

impl BusEnvelope {
    pub fn new(
        game_id: impl Into<GameId>,
        kind: EnvelopeType,
        data: serde_json::Value,
        player_id: Option<PlayerId>,
        chunk_id: Option<String>,
    ) -> Self {
        Self {
            game_id: game_id.into(),
            kind,
            data,
            timestamp: now_iso8601(),
            player_id,
            chunk_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a raw bus payload. Malformed JSON is the caller's problem to
    /// log-and-drop (spec §4.1's Failure contract); this just surfaces the
    /// error.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Millisecond-precision ISO-8601 wall-clock timestamp, used only for
/// logging/ordering hints — never for correctness (spec §4.1).
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Parsed ingress variant
// ---------------------------------------------------------------------------

/// `state-change` payload shape: either an optimistic echo of a client
/// update (carries `updateId` + `optimistic: true`) or a plain authoritative
/// delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangePayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub update_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub kind: Option<String>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub optimistic: bool,
}

/// The typed variant an inbound [`BusEnvelope`] parses into. Built once at
/// ingress; every consumer (Chunk Router, Sync Coordinator) matches on this
/// instead of re-parsing `data`.
#[derive(Debug, Clone)]
pub enum Envelope {
    Move {
        game_id: GameId,
        player_id: Option<PlayerId>,
        data: serde_json::Value,
        timestamp: String,
    },
    StateChange {
        game_id: GameId,
        player_id: Option<PlayerId>,
        payload: StateChangePayload,
        timestamp: String,
    },
    PlayerEvent {
        game_id: GameId,
        player_id: Option<PlayerId>,
        data: serde_json::Value,
        timestamp: String,
    },
    ChunkUpdate {
        game_id: GameId,
        chunk_id: ChunkId,
        update: ChunkUpdate,
        timestamp: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeParseError {
    #[error("malformed envelope JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Envelope {
    pub fn game_id(&self) -> &GameId {
        match self {
            Envelope::Move { game_id, .. } => game_id,
            Envelope::StateChange { game_id, .. } => game_id,
            Envelope::PlayerEvent { game_id, .. } => game_id,
            Envelope::ChunkUpdate { game_id, .. } => game_id,
        }
    }
}

impl TryFrom<BusEnvelope> for Envelope {
    type Error = EnvelopeParseError;

    fn try_from(env: BusEnvelope) -> Result<Self, Self::Error> {
        Ok(match env.kind {
            EnvelopeType::Move => Envelope::Move {
                game_id: env.game_id,
                player_id: env.player_id,
                data: env.data,
                timestamp: env.timestamp,
            },
            EnvelopeType::StateChange => Envelope::StateChange {
                game_id: env.game_id,
                player_id: env.player_id,
                payload: serde_json::from_value(env.data)?,
                timestamp: env.timestamp,
            },
            EnvelopeType::PlayerEvent => Envelope::PlayerEvent {
                game_id: env.game_id,
                player_id: env.player_id,
                data: env.data,
                timestamp: env.timestamp,
            },
            EnvelopeType::ChunkUpdate => {
                let update: ChunkUpdate = serde_json::from_value(env.data)?;
                let chunk_id = update.chunk_id;
                Envelope::ChunkUpdate {
                    game_id: env.game_id,
                    chunk_id,
                    update,
                    timestamp: env.timestamp,
                }
            }
        })
    }
}

/// Parse a raw bus payload directly into the typed [`Envelope`] in one step.
pub fn parse_envelope(raw: &str) -> Result<Envelope, EnvelopeParseError> {
    let env = BusEnvelope::from_json(raw)?;
    Envelope::try_from(env)
}

// ---------------------------------------------------------------------------
// Channel layout (spec §4.1)
// ---------------------------------------------------------------------------

pub fn game_channel(prefix: &str, game_id: &str) -> String {
    format!("{prefix}{game_id}")
}

pub fn chunk_channel(prefix: &str, game_id: &str, chunk_id: &ChunkId) -> String {
    format!("{prefix}{game_id}:chunk:{chunk_id}")
}

pub fn chunk_pattern(prefix: &str, game_id: &str) -> String {
    format!("{prefix}{game_id}:chunk:*")
}

pub fn all_games_pattern(prefix: &str) -> String {
    format!("{prefix}*")
}
