//! The Session Hub (spec §4.2): accepts transport connections, tracks
//! per-session membership, and exposes room-based fan-out. The Hub knows
//! nothing about chunks or the Bus — the Chunk Router composes on top of it
//! (spec §9, "Implement as composition, not inheritance").

use crate::error::{ClientError, CoreError, CoreResult};
use crate::types::{ChunkId, GameId, SessionId};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Reserved outbound event names (spec §4.2).
pub mod events {
    pub const PLAYER_CONNECTED: &str = "player-connected";
    pub const PLAYER_DISCONNECTED: &str = "player-disconnected";
    pub const PLAYER_JOINED: &str = "player-joined";
    pub const PLAYER_LEFT: &str = "player-left";
    pub const MOVE_MADE: &str = "move-made";
    pub const STATE_UPDATED: &str = "state-updated";
    pub const CHUNK_UPDATED: &str = "chunk-updated";
    pub const ERROR: &str = "error";
}

/// One transport connection's outbound half. Implemented by the transport
/// layer; the Hub only ever calls `send`.
#[async_trait]
pub trait SendHandle: Send + Sync {
    async fn send(&self, event: &str, payload: Value) -> CoreResult<()>;
}

/// Optional game-specific callbacks, plugged into the standard transport
/// events (spec §4.2). All methods have a no-op default so a handler only
/// needs to implement what it cares about.
#[async_trait]
pub trait GameHandler: Send + Sync {
    async fn on_player_joined(&self, _game_id: &GameId, _session_id: &SessionId) {}
    async fn on_player_left(&self, _game_id: &GameId, _session_id: &SessionId) {}
    async fn on_custom_event(&self, _game_id: &GameId, _session_id: &SessionId, _event: &str, _payload: Value) {}
}

struct SessionEntry {
    send: Arc<dyn SendHandle>,
    // Value is the `gameType` passed to `join_game`, retained so `leave_game`
    // and `disconnect` can dispatch `on_player_left` to the same handler
    // `join_game` dispatched `on_player_joined` to.
    games: Mutex<HashMap<GameId, Option<String>>>,
    chunks: Mutex<HashSet<(GameId, ChunkId)>>,
}

/// Process-local connection registry and room multiplexer. One instance per
/// server process (spec §9, "Global mutable maps" — owned explicitly here
/// rather than held in a module-level global).
pub struct SessionHub {
    sessions: DashMap<SessionId, SessionEntry>,
    game_rooms: DashMap<GameId, DashSet<SessionId>>,
    chunk_rooms: DashMap<(GameId, ChunkId), DashSet<SessionId>>,
    handlers: DashMap<String, Arc<dyn GameHandler>>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            game_rooms: DashMap::new(),
            chunk_rooms: DashMap::new(),
            handlers: DashMap::new(),
        }
    }

    pub fn register_game_handler(&self, game_type: impl Into<String>, handler: Arc<dyn GameHandler>) {
        self.handlers.insert(game_type.into(), handler);
    }

    pub fn on_connect(&self, session_id: SessionId, send: Arc<dyn SendHandle>) {
        self.sessions.insert(
            session_id,
            SessionEntry {
                send,
                games: Mutex::new(HashMap::new()),
                chunks: Mutex::new(HashSet::new()),
            },
        );
    }

    pub fn is_connected(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Chunk sub-rooms a session currently belongs to, for a given game.
    /// Exposed for the membership-containment property (P3) and for the
    /// Chunk Router's disconnect cleanup.
    pub fn session_chunks(&self, session_id: &SessionId, game_id: &GameId) -> HashSet<ChunkId> {
        match self.sessions.get(session_id) {
            Some(entry) => entry
                .chunks
                .lock()
                .iter()
                .filter(|(g, _)| g == game_id)
                .map(|(_, c)| *c)
                .collect(),
            None => HashSet::new(),
        }
    }

    pub fn session_games(&self, session_id: &SessionId) -> HashSet<GameId> {
        match self.sessions.get(session_id) {
            Some(entry) => entry.games.lock().keys().cloned().collect(),
            None => HashSet::new(),
        }
    }

    pub async fn join_game(
        &self,
        session_id: &SessionId,
        game_id: &GameId,
        game_type: Option<&str>,
    ) -> CoreResult<()> {
        let entry = self
            .sessions
            .get(session_id)
            .ok_or_else(|| CoreError::SessionClosed(session_id.clone()))?;
        entry.games.lock().insert(game_id.clone(), game_type.map(String::from));
        drop(entry);

        self.game_rooms
            .entry(game_id.clone())
            .or_insert_with(DashSet::new)
            .insert(session_id.clone());

        if let Some(handler) = game_type.and_then(|t| self.handlers.get(t)) {
            handler.on_player_joined(game_id, session_id).await;
        }

        self.broadcast_to_game_except(
            game_id,
            session_id,
            events::PLAYER_CONNECTED,
            serde_json::json!({ "sessionId": session_id }),
        )
        .await;
        Ok(())
    }

    pub async fn leave_game(&self, session_id: &SessionId, game_id: &GameId) -> CoreResult<()> {
        let chunk_keys: Vec<(GameId, ChunkId)> = match self.sessions.get(session_id) {
            Some(entry) => entry
                .chunks
                .lock()
                .iter()
                .filter(|(g, _)| g == game_id)
                .cloned()
                .collect(),
            None => return Err(CoreError::SessionClosed(session_id.clone())),
        };

        for (g, c) in chunk_keys {
            self.unsubscribe_chunk(session_id, &g, c).await?;
        }

        let game_type = match self.sessions.get(session_id) {
            Some(entry) => entry.games.lock().remove(game_id).flatten(),
            None => None,
        };
        if let Some(room) = self.game_rooms.get(game_id) {
            room.remove(session_id);
        }

        if let Some(handler) = game_type.as_deref().and_then(|t| self.handlers.get(t)) {
            handler.on_player_left(game_id, session_id).await;
        }

        self.broadcast_to_game(
            game_id,
            events::PLAYER_DISCONNECTED,
            serde_json::json!({ "sessionId": session_id }),
        )
        .await;
        Ok(())
    }

    /// Dispatches a game-specific custom event to the handler registered for
    /// whichever `gameType` this session joined `game_id` with (spec §4.2,
    /// `onCustomEvent`). A no-op if the session never joined the game or no
    /// handler is registered for its type.
    pub async fn dispatch_custom_event(
        &self,
        session_id: &SessionId,
        game_id: &GameId,
        event: &str,
        payload: Value,
    ) {
        let game_type = match self.sessions.get(session_id) {
            Some(entry) => entry.games.lock().get(game_id).cloned().flatten(),
            None => return,
        };
        if let Some(handler) = game_type.as_deref().and_then(|t| self.handlers.get(t)) {
            handler.on_custom_event(game_id, session_id, event, payload).await;
        }
    }

    pub async fn subscribe_chunk(
        &self,
        session_id: &SessionId,
        game_id: &GameId,
        chunk_id: ChunkId,
    ) -> CoreResult<()> {
        let entry = self
            .sessions
            .get(session_id)
            .ok_or_else(|| CoreError::SessionClosed(session_id.clone()))?;

        if !entry.games.lock().contains_key(game_id) {
            let err = CoreError::ChunkMembershipViolation {
                session: session_id.clone(),
                game: game_id.clone(),
                chunk: chunk_id,
            };
            drop(entry);
            self.send_error(session_id, &err).await;
            return Ok(());
        }

        entry.chunks.lock().insert((game_id.clone(), chunk_id));
        drop(entry);

        self.chunk_rooms
            .entry((game_id.clone(), chunk_id))
            .or_insert_with(DashSet::new)
            .insert(session_id.clone());
        Ok(())
    }

    pub async fn unsubscribe_chunk(
        &self,
        session_id: &SessionId,
        game_id: &GameId,
        chunk_id: ChunkId,
    ) -> CoreResult<()> {
        if let Some(entry) = self.sessions.get(session_id) {
            entry.chunks.lock().remove(&(game_id.clone(), chunk_id));
        }
        if let Some(room) = self.chunk_rooms.get(&(game_id.clone(), chunk_id)) {
            room.remove(session_id);
        }
        Ok(())
    }

    /// True once the chunk sub-room for `(game_id, chunk_id)` has no
    /// subscribers left on this process.
    pub fn chunk_room_is_empty(&self, game_id: &GameId, chunk_id: ChunkId) -> bool {
        self.chunk_rooms
            .get(&(game_id.clone(), chunk_id))
            .map(|room| room.is_empty())
            .unwrap_or(true)
    }

    pub async fn broadcast_to_game(&self, game_id: &GameId, event: &str, payload: Value) {
        self.broadcast_to_game_except_opt(game_id, None, event, payload).await;
    }

    pub async fn broadcast_to_game_except(
        &self,
        game_id: &GameId,
        except: &SessionId,
        event: &str,
        payload: Value,
    ) {
        self.broadcast_to_game_except_opt(game_id, Some(except), event, payload)
            .await;
    }

    async fn broadcast_to_game_except_opt(
        &self,
        game_id: &GameId,
        except: Option<&SessionId>,
        event: &str,
        payload: Value,
    ) {
        let Some(room) = self.game_rooms.get(game_id) else {
            return;
        };
        let members: Vec<SessionId> = room
            .iter()
            .filter(|s| except.map(|e| s.as_str() != e.as_str()).unwrap_or(true))
            .map(|s| s.clone())
            .collect();
        drop(room);
        for session_id in members {
            self.send_to_session(&session_id, event, payload.clone()).await;
        }
    }

    pub async fn broadcast_to_chunk(&self, game_id: &GameId, chunk_id: ChunkId, event: &str, payload: Value) {
        let Some(room) = self.chunk_rooms.get(&(game_id.clone(), chunk_id)) else {
            return;
        };
        let members: Vec<SessionId> = room.iter().map(|s| s.clone()).collect();
        drop(room);
        for session_id in members {
            self.send_to_session(&session_id, event, payload.clone()).await;
        }
    }

    /// A failed send to one session never blocks fan-out to others (spec
    /// §4.2).
    pub async fn send_to_session(&self, session_id: &SessionId, event: &str, payload: Value) {
        let send = match self.sessions.get(session_id) {
            Some(entry) => entry.send.clone(),
            None => return,
        };
        if let Err(e) = send.send(event, payload).await {
            debug!("send to session {session_id} failed: {e}");
        }
    }

    async fn send_error(&self, session_id: &SessionId, err: &CoreError) {
        let client_err: ClientError = err.into();
        warn!("validation error for session {session_id}: {err}");
        self.send_to_session(
            session_id,
            events::ERROR,
            serde_json::to_value(client_err).unwrap_or(Value::Null),
        )
        .await;
    }

    /// Disconnect cleanup (spec §4.2, P6): idempotent, completes even if the
    /// session is unknown or its transport handle has already failed.
    pub async fn disconnect(&self, session_id: &SessionId) {
        let games: Vec<(GameId, Option<String>)> = match self.sessions.get(session_id) {
            Some(entry) => entry.games.lock().iter().map(|(g, t)| (g.clone(), t.clone())).collect(),
            None => return,
        };

        for (game_id, game_type) in games {
            let chunk_keys: Vec<(GameId, ChunkId)> = match self.sessions.get(session_id) {
                Some(entry) => entry
                    .chunks
                    .lock()
                    .iter()
                    .filter(|(g, _)| *g == game_id)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            for (g, c) in chunk_keys {
                let _ = self.unsubscribe_chunk(session_id, &g, c).await;
            }
            if let Some(room) = self.game_rooms.get(&game_id) {
                room.remove(session_id);
            }
            if let Some(handler) = game_type.as_deref().and_then(|t| self.handlers.get(t)) {
                handler.on_player_left(&game_id, session_id).await;
            }
            self.broadcast_to_game(
                &game_id,
                events::PLAYER_DISCONNECTED,
                serde_json::json!({ "sessionId": session_id }),
            )
            .await;
        }

        self.sessions.remove(session_id);
    }
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new()
    }
}
