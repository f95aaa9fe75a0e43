//! The Sync Coordinator (spec §4.4): holds each game's authoritative state
//! snapshot, buffers optimistic updates from this process's clients, and
//! reconciles them against authoritative messages arriving via the Bus.

use crate::bus::Bus;
use crate::error::{CoreError, CoreResult};
use crate::protocol::{BusEnvelope, Envelope, StateChangePayload};
use crate::session_hub::{events, SessionHub};
use crate::types::{ConflictPolicy, GameId, OptimisticUpdate, PlayerId, UpdateLifecycle};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Injectable conflict classifier (spec §9, Open Question (a)): the default
/// heuristic ("any update from a different player conflicts") is
/// deliberately coarse, so real deployments can replace it.
pub trait ConflictDetector: Send + Sync {
    fn conflicts(&self, pending: &OptimisticUpdate, incoming_player: Option<&PlayerId>) -> bool;
}

pub struct DefaultConflictDetector;

impl ConflictDetector for DefaultConflictDetector {
    fn conflicts(&self, pending: &OptimisticUpdate, incoming_player: Option<&PlayerId>) -> bool {
        match incoming_player {
            Some(p) => p != &pending.player_id,
            None => false,
        }
    }
}

/// Registered resolver for `ConflictPolicy::Custom`.
#[async_trait]
pub trait CustomResolver: Send + Sync {
    async fn resolve(&self, server_payload: &Value, client_payload: &Value) -> Value;
}

/// Shallow field-wise merge with server precedence (the default used by
/// both `applyOptimistic`'s local pre-application and `ConflictPolicy::Merge`).
fn shallow_merge(base: &Value, overlay: &Value, overlay_wins: bool) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in overlay_map {
                if overlay_wins || !merged.contains_key(k) {
                    merged.insert(k.clone(), v.clone());
                }
            }
            Value::Object(merged)
        }
        _ => {
            if overlay_wins {
                overlay.clone()
            } else {
                base.clone()
            }
        }
    }
}

struct GameState {
    snapshot: Value,
    pending: VecDeque<OptimisticUpdate>,
    timers: DashMap<String, JoinHandle<()>>,
}

impl GameState {
    fn new() -> Self {
        Self {
            snapshot: Value::Object(serde_json::Map::new()),
            pending: VecDeque::new(),
            timers: DashMap::new(),
        }
    }
}

pub struct SyncCoordinatorConfig {
    pub max_pending_updates: usize,
    pub ack_timeout: Duration,
    pub conflict_policy: ConflictPolicy,
    pub optimistic_enabled: bool,
}

impl Default for SyncCoordinatorConfig {
    fn default() -> Self {
        Self {
            max_pending_updates: 100,
            ack_timeout: Duration::from_millis(5000),
            conflict_policy: ConflictPolicy::ServerWins,
            optimistic_enabled: true,
        }
    }
}

/// Per-game snapshot + pending-update reconciliation engine.
pub struct SyncCoordinator<B: Bus> {
    bus: Arc<B>,
    hub: Arc<SessionHub>,
    games: DashMap<GameId, Mutex<GameState>>,
    config: SyncCoordinatorConfig,
    detector: Box<dyn ConflictDetector>,
    custom_resolver: Option<Arc<dyn CustomResolver>>,
    timed_out: DashMap<String, ()>,
}

impl<B: Bus + 'static> SyncCoordinator<B> {
    pub fn new(bus: Arc<B>, hub: Arc<SessionHub>, config: SyncCoordinatorConfig) -> Self {
        Self {
            bus,
            hub,
            games: DashMap::new(),
            config,
            detector: Box::new(DefaultConflictDetector),
            custom_resolver: None,
            timed_out: DashMap::new(),
        }
    }

    pub fn with_conflict_detector(mut self, detector: Box<dyn ConflictDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_custom_resolver(mut self, resolver: Arc<dyn CustomResolver>) -> Self {
        self.custom_resolver = Some(resolver);
        self
    }

    fn game_entry(&self, game_id: &GameId) -> dashmap::mapref::one::RefMut<'_, GameId, Mutex<GameState>> {
        self.games
            .entry(game_id.clone())
            .or_insert_with(|| Mutex::new(GameState::new()))
    }

    /// `applyOptimistic` (spec §4.4). Always publishes a `state-change`
    /// envelope; when `optimisticEnabled` is false this behaves like
    /// send-and-wait, skipping local pre-application.
    pub async fn apply_optimistic(
        self: &Arc<Self>,
        game_id: &GameId,
        player_id: &PlayerId,
        kind: &str,
        payload: Value,
        rollback_payload: Option<Value>,
    ) -> CoreResult<String> {
        let update_id = new_update_id();

        if self.config.optimistic_enabled {
            let entry = self.game_entry(game_id);
            let mut state = entry.lock();
            state.snapshot = shallow_merge(&state.snapshot, &payload, true);

            let update = OptimisticUpdate {
                update_id: update_id.clone(),
                game_id: game_id.clone(),
                player_id: player_id.clone(),
                kind: kind.to_string(),
                payload: payload.clone(),
                rollback_payload,
                created_at_millis: chrono::Utc::now().timestamp_millis(),
                lifecycle: UpdateLifecycle::Pending,
            };
            state.pending.push_back(update);

            while state.pending.len() > self.config.max_pending_updates {
                let evicted = state.pending.pop_front();
                if let Some(evicted) = evicted {
                    state.timers.remove(&evicted.update_id);
                    warn!(
                        "evicted unacknowledged update {} for game {game_id}: pending queue exceeded {}",
                        evicted.update_id, self.config.max_pending_updates
                    );
                }
            }

            drop(state);
            self.start_ack_timer(game_id.clone(), update_id.clone());
        }

        let envelope = BusEnvelope::new(
            game_id.clone(),
            crate::protocol::EnvelopeType::StateChange,
            serde_json::json!({
                "updateId": update_id,
                "kind": kind,
                "payload": payload,
                "optimistic": true,
            }),
            Some(player_id.clone()),
            None,
        );

        if let Err(e) = self.bus.publish_game(game_id, envelope).await {
            warn!("applyOptimistic could not broadcast update {update_id} for game {game_id}: {e}");
        }

        Ok(update_id)
    }

    fn start_ack_timer(self: &Arc<Self>, game_id: GameId, update_id: String) {
        let coordinator = self.clone();
        let timeout = self.config.ack_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            coordinator.on_ack_timeout(&game_id, &update_id);
        });
        if let Some(entry) = self.games.get(&game_id) {
            entry.lock().timers.insert(update_id, handle);
        }
    }

    fn on_ack_timeout(&self, game_id: &GameId, update_id: &str) {
        let Some(entry) = self.games.get(game_id) else {
            return;
        };
        let mut state = entry.lock();
        if let Some(update) = state.pending.iter_mut().find(|u| u.update_id == update_id) {
            warn!("optimistic update {update_id} for game {game_id} timed out awaiting acknowledgement");
            update.lifecycle = UpdateLifecycle::TimedOut;
            self.timed_out.insert(update_id.to_string(), ());
        }
    }

    /// True once an update has timed out without being acknowledged; used
    /// by tests to observe scenario E3 without sleeping past the timeout.
    pub fn has_timed_out(&self, update_id: &str) -> bool {
        self.timed_out.contains_key(update_id)
    }

    /// `applyServerUpdate` (spec §4.4).
    pub async fn apply_server_update(
        &self,
        game_id: &GameId,
        player_id: Option<&PlayerId>,
        payload: &Value,
    ) -> CoreResult<()> {
        let conflicting: Vec<OptimisticUpdate> = {
            let entry = self.game_entry(game_id);
            let state = entry.lock();
            state
                .pending
                .iter()
                .filter(|u| self.detector.conflicts(u, player_id))
                .cloned()
                .collect()
        };

        let mut resolved = payload.clone();
        for pending in &conflicting {
            resolved = self.resolve_conflict(&resolved, &pending.payload).await?;
        }

        {
            let entry = self.game_entry(game_id);
            let mut state = entry.lock();
            state.snapshot = shallow_merge(&state.snapshot, &resolved, true);
        }

        self.hub
            .broadcast_to_game(game_id, events::STATE_UPDATED, resolved)
            .await;
        Ok(())
    }

    /// Synchronous part of conflict resolution (server-wins/client-wins/merge).
    /// `Custom` is handled by [`Self::resolve_conflict`], which is async.
    fn resolve_conflict_sync(&self, server_payload: &Value, client_payload: &Value) -> CoreResult<Value> {
        match self.config.conflict_policy {
            ConflictPolicy::ServerWins => Ok(server_payload.clone()),
            ConflictPolicy::ClientWins => Ok(shallow_merge(server_payload, client_payload, true)),
            // Merge keeps fields from both sides but gives the server the
            // final say on any field both payloads set.
            ConflictPolicy::Merge => Ok(shallow_merge(client_payload, server_payload, true)),
            ConflictPolicy::Custom => Err(CoreError::MissingCustomResolver),
        }
    }

    /// Async conflict resolution entry point, used when `ConflictPolicy::Custom`
    /// is configured with a registered [`CustomResolver`].
    pub async fn resolve_conflict(&self, server_payload: &Value, client_payload: &Value) -> CoreResult<Value> {
        match self.config.conflict_policy {
            ConflictPolicy::Custom => match &self.custom_resolver {
                Some(resolver) => Ok(resolver.resolve(server_payload, client_payload).await),
                None => Err(CoreError::MissingCustomResolver),
            },
            _ => self.resolve_conflict_sync(server_payload, client_payload),
        }
    }

    /// `acknowledge` (spec §4.4). If `server_state` differs from the local
    /// snapshot, runs a conflict-resolution pass through the configured
    /// `conflict_policy` rather than assuming the server is always right.
    pub async fn acknowledge(&self, game_id: &GameId, update_id: &str, server_state: Option<&Value>) {
        let snapshot_before = {
            let entry = self.game_entry(game_id);
            let mut state = entry.lock();
            let position = state.pending.iter().position(|u| u.update_id == update_id);
            let Some(position) = position else {
                debug!("acknowledge: no pending update {update_id} for game {game_id}");
                return;
            };
            state.pending.remove(position);
            if let Some(handle) = state.timers.remove(update_id) {
                handle.1.abort();
            }
            self.timed_out.remove(update_id);
            state.snapshot.clone()
        };

        let Some(server_state) = server_state else {
            return;
        };
        if *server_state == snapshot_before {
            return;
        }

        let resolved = match self.resolve_conflict(server_state, &snapshot_before).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("acknowledge: conflict resolution failed for update {update_id} in game {game_id}: {e}");
                return;
            }
        };

        let entry = self.game_entry(game_id);
        let mut state = entry.lock();
        state.snapshot = shallow_merge(&state.snapshot, &resolved, true);
    }

    /// `rollbackAll` (spec §4.4): iterates pending updates in reverse order,
    /// merging each `rollbackPayload` (when present) into the snapshot.
    pub fn rollback_all(&self, game_id: &GameId) {
        let Some(entry) = self.games.get(game_id) else {
            return;
        };
        let mut state = entry.lock();
        let pending: Vec<OptimisticUpdate> = state.pending.drain(..).rev().collect();
        for update in &pending {
            if let Some(rollback) = &update.rollback_payload {
                state.snapshot = shallow_merge(&state.snapshot, rollback, true);
            }
            if let Some(handle) = state.timers.remove(&update.update_id) {
                handle.1.abort();
            }
            self.timed_out.remove(&update.update_id);
        }
    }

    pub fn get_pending_updates(&self, game_id: &GameId) -> Vec<OptimisticUpdate> {
        match self.games.get(game_id) {
            Some(entry) => entry.lock().pending.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn get_game_state(&self, game_id: &GameId) -> Option<Value> {
        self.games.get(game_id).map(|entry| entry.lock().snapshot.clone())
    }

    /// Dispatch loop: subscribes to all games' traffic and routes
    /// `state-change` envelopes to `acknowledge`/`apply_server_update`
    /// (spec §4.4, "Subscription").
    pub async fn run_inbound_loop(self: Arc<Self>) -> CoreResult<()> {
        let mut sub = self.bus.subscribe_all_games().await?;
        while let Some(msg) = sub.recv().await {
            let parsed = match Envelope::try_from(msg.envelope) {
                Ok(p) => p,
                Err(e) => {
                    debug!("dropping malformed inbound envelope on {}: {e}", msg.channel);
                    continue;
                }
            };
            self.dispatch(parsed).await;
        }
        Ok(())
    }

    async fn dispatch(&self, envelope: Envelope) {
        match envelope {
            Envelope::StateChange {
                game_id,
                player_id,
                payload,
                ..
            } => self.dispatch_state_change(&game_id, player_id.as_ref(), &payload).await,
            Envelope::Move { game_id, .. } => {
                debug!("move envelope for game {game_id} forwarded to handlers");
            }
            _ => {}
        }
    }

    async fn dispatch_state_change(
        &self,
        game_id: &GameId,
        player_id: Option<&PlayerId>,
        payload: &StateChangePayload,
    ) {
        if payload.optimistic {
            if let Some(update_id) = &payload.update_id {
                let is_pending = self
                    .games
                    .get(game_id)
                    .map(|e| e.lock().pending.iter().any(|u| &u.update_id == update_id))
                    .unwrap_or(false);
                if is_pending {
                    self.acknowledge(game_id, update_id, Some(&payload.payload)).await;
                    return;
                }
            }
        }

        if let Err(e) = self.apply_server_update(game_id, player_id, &payload.payload).await {
            warn!("apply_server_update failed for game {game_id}: {e}");
        }
    }
}

fn new_update_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect();
    format!("{}-{}", crate::protocol::now_iso8601(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    fn coordinator(policy: ConflictPolicy) -> Arc<SyncCoordinator<MemoryBus>> {
        let bus = Arc::new(MemoryBus::new("game:"));
        let hub = Arc::new(SessionHub::new());
        let config = SyncCoordinatorConfig {
            max_pending_updates: 100,
            ack_timeout: Duration::from_millis(50),
            conflict_policy: policy,
            optimistic_enabled: true,
        };
        Arc::new(SyncCoordinator::new(bus, hub, config))
    }

    // P7 from spec §8
    #[tokio::test]
    async fn optimistic_ack_round_trip_removes_pending_and_cancels_timer() {
        let coord = coordinator(ConflictPolicy::ServerWins);
        let update_id = coord
            .apply_optimistic(&"g".to_string(), &"p1".to_string(), "move", serde_json::json!({"a": 1}), None)
            .await
            .unwrap();

        assert_eq!(coord.get_pending_updates(&"g".to_string()).len(), 1);
        coord.acknowledge(&"g".to_string(), &update_id, None).await;
        assert!(coord.get_pending_updates(&"g".to_string()).is_empty());
    }

    // acknowledge must run the conflict pass through the configured policy
    // against the local snapshot, not force server precedence.
    #[tokio::test]
    async fn acknowledge_runs_configured_policy_against_local_snapshot() {
        let coord = coordinator(ConflictPolicy::ClientWins);
        let update_id = coord
            .apply_optimistic(&"g".to_string(), &"p1".to_string(), "move", serde_json::json!({"a": 1}), None)
            .await
            .unwrap();

        coord
            .acknowledge(&"g".to_string(), &update_id, Some(&serde_json::json!({"a": 2})))
            .await;

        assert_eq!(coord.get_game_state(&"g".to_string()).unwrap()["a"], 1);
    }

    // P8 from spec §8
    #[tokio::test]
    async fn conflict_resolution_server_wins() {
        let coord = coordinator(ConflictPolicy::ServerWins);
        coord
            .apply_optimistic(&"g".to_string(), &"p1".to_string(), "move", serde_json::json!({"a": 1}), None)
            .await
            .unwrap();
        coord
            .apply_server_update(&"g".to_string(), Some(&"p2".to_string()), &serde_json::json!({"a": 2}))
            .await
            .unwrap();
        assert_eq!(coord.get_game_state(&"g".to_string()).unwrap()["a"], 2);
    }

    #[tokio::test]
    async fn conflict_resolution_client_wins() {
        let coord = coordinator(ConflictPolicy::ClientWins);
        coord
            .apply_optimistic(&"g".to_string(), &"p1".to_string(), "move", serde_json::json!({"a": 1}), None)
            .await
            .unwrap();
        coord
            .apply_server_update(&"g".to_string(), Some(&"p2".to_string()), &serde_json::json!({"a": 2}))
            .await
            .unwrap();
        // client-wins overlays the server payload with the pending client
        // payload last, so the client's value for the shared field sticks.
        assert_eq!(coord.get_game_state(&"g".to_string()).unwrap()["a"], 1);
    }

    #[tokio::test]
    async fn conflict_resolution_merge_uses_server_precedence() {
        let coord = coordinator(ConflictPolicy::Merge);
        coord
            .apply_optimistic(&"g".to_string(), &"p1".to_string(), "move", serde_json::json!({"a": 1}), None)
            .await
            .unwrap();
        coord
            .apply_server_update(&"g".to_string(), Some(&"p2".to_string()), &serde_json::json!({"a": 2}))
            .await
            .unwrap();
        assert_eq!(coord.get_game_state(&"g".to_string()).unwrap()["a"], 2);
    }

    // Scenario E3
    #[tokio::test]
    async fn timeout_does_not_auto_rollback_but_explicit_rollback_restores_snapshot() {
        let coord = coordinator(ConflictPolicy::ServerWins);
        let update_id = coord
            .apply_optimistic(
                &"g".to_string(),
                &"p1".to_string(),
                "score",
                serde_json::json!({"score": 11}),
                Some(serde_json::json!({"score": 10})),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(coord.has_timed_out(&update_id));
        // No auto-rollback: the update is still pending and the snapshot
        // still reflects the optimistic value.
        assert_eq!(coord.get_pending_updates(&"g".to_string()).len(), 1);
        assert_eq!(coord.get_game_state(&"g".to_string()).unwrap()["score"], 11);

        coord.rollback_all(&"g".to_string());
        assert!(coord.get_pending_updates(&"g".to_string()).is_empty());
        assert_eq!(coord.get_game_state(&"g".to_string()).unwrap()["score"], 10);
    }

    #[tokio::test]
    async fn max_pending_updates_evicts_oldest() {
        let bus = Arc::new(MemoryBus::new("game:"));
        let hub = Arc::new(SessionHub::new());
        let config = SyncCoordinatorConfig {
            max_pending_updates: 2,
            ack_timeout: Duration::from_secs(5),
            conflict_policy: ConflictPolicy::ServerWins,
            optimistic_enabled: true,
        };
        let coord = Arc::new(SyncCoordinator::new(bus, hub, config));

        let first = coord
            .apply_optimistic(&"g".to_string(), &"p1".to_string(), "k", serde_json::json!({}), None)
            .await
            .unwrap();
        coord
            .apply_optimistic(&"g".to_string(), &"p1".to_string(), "k", serde_json::json!({}), None)
            .await
            .unwrap();
        coord
            .apply_optimistic(&"g".to_string(), &"p1".to_string(), "k", serde_json::json!({}), None)
            .await
            .unwrap();

        let pending = coord.get_pending_updates(&"g".to_string());
        assert_eq!(pending.len(), 2);
        assert!(!pending.iter().any(|u| u.update_id == first));
    }
}
