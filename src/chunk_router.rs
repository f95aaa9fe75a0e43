//! The Chunk Router (spec §4.3): turns viewport changes into subscription
//! diffs, groups cell changes into per-chunk update batches, stamps
//! sequence numbers, and forwards both locally (Session Hub) and across
//! processes (Bus).
//!
//! The Router holds references to the Bus and the Hub; the Hub has no
//! knowledge of the Router, and the Router owns its own Bus subscription
//! handle rather than registering a callback the Bus would have to track by
//! identity (spec §9).

use crate::bus::Bus;
use crate::protocol::{BusEnvelope, Envelope, EnvelopeType};
use crate::session_hub::{events, SessionHub};
use crate::types::{ChunkId, ChunkUpdate, GameId, SessionId, Viewport};
use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Result of a viewport change: which chunks were added/removed, and the
/// full new chunk set (spec §4.3, `subscribeToViewport`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDiff {
    pub added: Vec<ChunkId>,
    pub removed: Vec<ChunkId>,
    pub current: Vec<ChunkId>,
}

struct GameCounters {
    sequence: AtomicU64,
}

/// LRU-bounded record of `(gameId, chunkId, sequence)` triples this process
/// has itself originated, so the inbound Bus loop can recognize and skip its
/// own echo instead of re-broadcasting a chunk update a second time (spec
/// §4.3/E4).
struct OriginDedup {
    capacity: usize,
    seen: DashMap<(GameId, ChunkId, u64), ()>,
    order: Mutex<VecDeque<(GameId, ChunkId, u64)>>,
}

impl OriginDedup {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
        }
    }

    fn mark_originated(&self, game_id: &GameId, chunk_id: ChunkId, sequence: u64) {
        let key = (game_id.clone(), chunk_id, sequence);
        if self.seen.insert(key.clone(), ()).is_none() {
            let mut order = self.order.lock();
            order.push_back(key);
            while order.len() > self.capacity {
                if let Some(evicted) = order.pop_front() {
                    self.seen.remove(&evicted);
                }
            }
        }
    }

    /// Consumes the record if present. Returns `true` when this envelope is
    /// this process's own echo and should not be rebroadcast locally again.
    fn was_originated_locally(&self, game_id: &GameId, chunk_id: ChunkId, sequence: u64) -> bool {
        self.seen.remove(&(game_id.clone(), chunk_id, sequence)).is_some()
    }
}

/// How many in-flight locally-originated updates to remember before the
/// oldest entries age out. Generous relative to any plausible ack-less
/// in-flight window between publish and the inbound loop observing the echo.
const ORIGIN_DEDUP_CAPACITY: usize = 4096;

/// Translates viewport/cell-change traffic between the spatial domain and
/// the Session Hub + Bus.
pub struct ChunkRouter<B: Bus> {
    bus: Arc<B>,
    hub: Arc<SessionHub>,
    prefix: String,
    chunk_size: i64,
    active_chunks_ttl_secs: u64,
    session_viewport_chunks: DashMap<(SessionId, GameId), HashSet<ChunkId>>,
    sequences: DashMap<GameId, GameCounters>,
    dedup: OriginDedup,
}

impl<B: Bus + 'static> ChunkRouter<B> {
    pub fn new(bus: Arc<B>, hub: Arc<SessionHub>, prefix: impl Into<String>, chunk_size: i64, active_chunks_ttl_secs: u64) -> Self {
        Self {
            bus,
            hub,
            prefix: prefix.into(),
            chunk_size,
            active_chunks_ttl_secs,
            session_viewport_chunks: DashMap::new(),
            sequences: DashMap::new(),
            dedup: OriginDedup::new(ORIGIN_DEDUP_CAPACITY),
        }
    }

    fn next_sequence(&self, game_id: &GameId) -> u64 {
        let entry = self
            .sequences
            .entry(game_id.clone())
            .or_insert_with(|| GameCounters {
                sequence: AtomicU64::new(0),
            });
        entry.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Diffs the session's current chunk set against the one implied by
    /// `viewport`, applies the diff to the Session Hub, and republishes the
    /// process-wide active-chunks set for this game.
    pub async fn subscribe_to_viewport(
        &self,
        session_id: &SessionId,
        game_id: &GameId,
        viewport: Viewport,
    ) -> crate::error::CoreResult<SubscriptionDiff> {
        let new_set: HashSet<ChunkId> = viewport.chunks(self.chunk_size).into_iter().collect();
        let key = (session_id.clone(), game_id.clone());
        let old_set = self
            .session_viewport_chunks
            .get(&key)
            .map(|s| s.clone())
            .unwrap_or_default();

        let added: Vec<ChunkId> = new_set.difference(&old_set).copied().collect();
        let removed: Vec<ChunkId> = old_set.difference(&new_set).copied().collect();

        for chunk in &added {
            self.hub.subscribe_chunk(session_id, game_id, *chunk).await?;
        }
        for chunk in &removed {
            self.hub.unsubscribe_chunk(session_id, game_id, *chunk).await?;
        }

        self.session_viewport_chunks.insert(key, new_set.clone());

        self.republish_active_chunks(game_id).await?;

        let mut current: Vec<ChunkId> = new_set.into_iter().collect();
        current.sort();
        Ok(SubscriptionDiff {
            added,
            removed,
            current,
        })
    }

    /// Recomputes this process's active-chunks set for `game_id` as the
    /// union of every locally-tracked session's subscribed chunks, and
    /// writes it to the Bus.
    async fn republish_active_chunks(&self, game_id: &GameId) -> crate::error::CoreResult<()> {
        let mut union: HashSet<ChunkId> = HashSet::new();
        for entry in self.session_viewport_chunks.iter() {
            let (_, g) = entry.key();
            if g == game_id {
                union.extend(entry.value().iter().copied());
            }
        }
        self.bus
            .set_active_chunks(game_id, &union, self.active_chunks_ttl_secs)
            .await
    }

    /// Batches `changes` by chunk, stamps one sequence number for the whole
    /// batch, and delivers each chunk group via the Bus and locally via the
    /// Session Hub (spec §4.3).
    pub async fn publish_chunk_update(
        &self,
        game_id: &GameId,
        changes: Vec<crate::types::CellChange>,
    ) -> crate::error::CoreResult<()> {
        let mut by_chunk: std::collections::HashMap<ChunkId, Vec<crate::types::CellChange>> =
            std::collections::HashMap::new();
        for change in changes {
            let chunk = crate::types::chunk_of(change.x, change.y, self.chunk_size);
            by_chunk.entry(chunk).or_default().push(change);
        }

        let sequence = self.next_sequence(game_id);
        let timestamp = crate::protocol::now_iso8601();

        for (chunk_id, group) in by_chunk {
            let update = ChunkUpdate {
                game_id: game_id.clone(),
                chunk_id,
                changes: group,
                timestamp: timestamp.clone(),
                sequence,
            };

            let envelope = BusEnvelope::new(
                game_id.clone(),
                EnvelopeType::ChunkUpdate,
                serde_json::to_value(&update).map_err(|e| crate::error::CoreError::MalformedPayload(e.to_string()))?,
                None,
                Some(chunk_id.to_string()),
            );

            self.dedup.mark_originated(game_id, chunk_id, sequence);
            self.bus.publish_chunk(game_id, chunk_id, envelope).await?;

            self.hub
                .broadcast_to_chunk(
                    game_id,
                    chunk_id,
                    events::CHUNK_UPDATED,
                    serde_json::to_value(&update)
                        .map_err(|e| crate::error::CoreError::MalformedPayload(e.to_string()))?,
                )
                .await;
        }
        Ok(())
    }

    /// Subscribes to every game's traffic at startup and dispatches
    /// `chunk-update` envelopes to the local chunk sub-room, deduplicating
    /// against this process's own local delivery (scenario E4).
    pub async fn run_inbound_loop(self: Arc<Self>) -> crate::error::CoreResult<()> {
        let mut sub = self.bus.subscribe_all_games().await?;
        // Both backends echo a process's own publishes back through this
        // same subscription (MemoryBus's `subscribe_all_games` pattern
        // subscriber sees every `deliver()` call; Redis pub/sub delivers to
        // the publishing connection's own subscriptions too). `dedup`
        // recognizes updates this process just originated via
        // `publish_chunk_update` — which already did the local
        // `broadcast_to_chunk` — and skips rebroadcasting them here so each
        // chunk update reaches local subscribers exactly once.
        while let Some(msg) = sub.recv().await {
            let parsed = match Envelope::try_from(msg.envelope) {
                Ok(p) => p,
                Err(e) => {
                    debug!("dropping malformed inbound envelope on {}: {e}", msg.channel);
                    continue;
                }
            };
            if let Envelope::ChunkUpdate {
                game_id,
                chunk_id,
                update,
                ..
            } = parsed
            {
                if self.dedup.was_originated_locally(&game_id, chunk_id, update.sequence) {
                    continue;
                }
                self.hub
                    .broadcast_to_chunk(
                        &game_id,
                        chunk_id,
                        events::CHUNK_UPDATED,
                        serde_json::to_value(&update).unwrap_or(serde_json::Value::Null),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Disconnect cleanup (spec §4.3): unsubscribe every chunk the session
    /// held for `game_id`, then republish the active set — chunks with zero
    /// local subscribers left drop out of it, while chunks still held by
    /// other sessions (on this or another process) remain.
    pub async fn cleanup_session(&self, session_id: &SessionId, game_id: &GameId) -> crate::error::CoreResult<()> {
        let key = (session_id.clone(), game_id.clone());
        if let Some((_, chunks)) = self.session_viewport_chunks.remove(&key) {
            for chunk in chunks {
                self.hub.unsubscribe_chunk(session_id, game_id, chunk).await?;
            }
        }
        self.republish_active_chunks(game_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::session_hub::SendHandle;
    use async_trait::async_trait;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingHandle {
        received: Arc<AsyncMutex<Vec<(String, serde_json::Value)>>>,
    }

    impl RecordingHandle {
        fn new() -> (Arc<Self>, Arc<AsyncMutex<Vec<(String, serde_json::Value)>>>) {
            let received = Arc::new(AsyncMutex::new(Vec::new()));
            (
                Arc::new(Self {
                    received: received.clone(),
                }),
                received,
            )
        }
    }

    #[async_trait]
    impl SendHandle for RecordingHandle {
        async fn send(&self, event: &str, payload: serde_json::Value) -> crate::error::CoreResult<()> {
            self.received.lock().await.push((event.to_string(), payload));
            Ok(())
        }
    }

    fn router() -> (Arc<ChunkRouter<MemoryBus>>, Arc<SessionHub>) {
        let bus = Arc::new(MemoryBus::new("game:"));
        let hub = Arc::new(SessionHub::new());
        let router = Arc::new(ChunkRouter::new(bus, hub.clone(), "game:", 64, 300));
        (router, hub)
    }

    fn cell(x: i64, y: i64) -> crate::types::CellChange {
        crate::types::CellChange {
            x,
            y,
            old_value: None,
            new_value: serde_json::json!(1),
            player_id: None,
        }
    }

    // P2 from spec §8
    #[tokio::test]
    async fn repeated_subscribe_to_same_viewport_is_idempotent() {
        let (router, hub) = router();
        let (h1, _) = RecordingHandle::new();
        hub.on_connect("s1".into(), h1);
        hub.join_game(&"s1".to_string(), &"g".to_string(), None).await.unwrap();

        let v = Viewport::new(0, 10, 0, 10);
        let first = router
            .subscribe_to_viewport(&"s1".to_string(), &"g".to_string(), v)
            .await
            .unwrap();
        assert!(!first.added.is_empty());

        let second = router
            .subscribe_to_viewport(&"s1".to_string(), &"g".to_string(), v)
            .await
            .unwrap();
        assert!(second.added.is_empty());
        assert!(second.removed.is_empty());
    }

    // Scenario E2
    #[tokio::test]
    async fn viewport_move_diffs_old_and_new_chunks() {
        let (router, hub) = router();
        let (h1, _) = RecordingHandle::new();
        hub.on_connect("s1".into(), h1);
        hub.join_game(&"s1".to_string(), &"g".to_string(), None).await.unwrap();

        let before = Viewport::from_center(0.0, 0.0, 4.0, 4.0);
        router
            .subscribe_to_viewport(&"s1".to_string(), &"g".to_string(), before)
            .await
            .unwrap();

        let after = Viewport::from_center(200.0, 0.0, 4.0, 4.0);
        let diff = router
            .subscribe_to_viewport(&"s1".to_string(), &"g".to_string(), after)
            .await
            .unwrap();

        assert!(!diff.added.is_empty());
        assert!(!diff.removed.is_empty());
        assert!(diff.removed.iter().all(|c| !diff.current.contains(c)));
    }

    // Scenario E1 / P4 / P5
    #[tokio::test]
    async fn chunk_update_reaches_only_subscribers_with_monotonic_sequence() {
        let (router, hub) = router();
        let (h1, r1) = RecordingHandle::new();
        let (h2, r2) = RecordingHandle::new();
        let (h3, r3) = RecordingHandle::new();
        hub.on_connect("s1".into(), h1);
        hub.on_connect("s2".into(), h2);
        hub.on_connect("s3".into(), h3);

        hub.join_game(&"s1".to_string(), &"a".to_string(), None).await.unwrap();
        hub.join_game(&"s2".to_string(), &"a".to_string(), None).await.unwrap();
        hub.join_game(&"s3".to_string(), &"b".to_string(), None).await.unwrap();

        router
            .subscribe_to_viewport(&"s1".to_string(), &"a".to_string(), Viewport::new(0, 63, 0, 63))
            .await
            .unwrap();
        router
            .subscribe_to_viewport(&"s2".to_string(), &"a".to_string(), Viewport::new(64, 127, 0, 63))
            .await
            .unwrap();

        router
            .publish_chunk_update(&"a".to_string(), vec![cell(5, 5)])
            .await
            .unwrap();

        let s1_updates: Vec<_> = r1
            .lock()
            .await
            .iter()
            .filter(|(e, _)| e == events::CHUNK_UPDATED)
            .cloned()
            .collect();
        assert_eq!(s1_updates.len(), 1);
        assert_eq!(s1_updates[0].1["sequence"], 1);
        assert!(r2.lock().await.iter().all(|(e, _)| e != events::CHUNK_UPDATED));
        assert!(r3.lock().await.iter().all(|(e, _)| e != events::CHUNK_UPDATED));

        router
            .publish_chunk_update(&"a".to_string(), vec![cell(5, 5)])
            .await
            .unwrap();
        let second: Vec<_> = r1
            .lock()
            .await
            .iter()
            .filter(|(e, _)| e == events::CHUNK_UPDATED)
            .cloned()
            .collect();
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].1["sequence"], 2);
    }

    #[tokio::test]
    async fn cleanup_session_drops_chunk_from_active_set_when_last_subscriber_leaves() {
        let (router, hub) = router();
        let (h1, _) = RecordingHandle::new();
        hub.on_connect("s1".into(), h1);
        hub.join_game(&"s1".to_string(), &"g".to_string(), None).await.unwrap();

        router
            .subscribe_to_viewport(&"s1".to_string(), &"g".to_string(), Viewport::new(0, 10, 0, 10))
            .await
            .unwrap();

        router.cleanup_session(&"s1".to_string(), &"g".to_string()).await.unwrap();
        let active = router.bus.get_active_chunks(&"g".to_string()).await.unwrap();
        assert!(active.is_empty());
    }

    // Regression for spec §4.3/E4: with the inbound loop running on the
    // *same* process that publishes, the Bus echoes the publish back to the
    // `subscribe_all_games` pattern subscriber the loop owns. Without dedup
    // against local origin this would double-deliver to s1.
    #[tokio::test]
    async fn inbound_loop_does_not_redeliver_its_own_process_publish() {
        let (router, hub) = router();
        let (h1, r1) = RecordingHandle::new();
        hub.on_connect("s1".into(), h1);
        hub.join_game(&"s1".to_string(), &"g".to_string(), None).await.unwrap();
        router
            .subscribe_to_viewport(&"s1".to_string(), &"g".to_string(), Viewport::new(0, 10, 0, 10))
            .await
            .unwrap();

        let inbound = tokio::spawn(router.clone().run_inbound_loop());

        router
            .publish_chunk_update(&"g".to_string(), vec![cell(5, 5)])
            .await
            .unwrap();

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        inbound.abort();

        let delivered: Vec<_> = r1
            .lock()
            .await
            .iter()
            .filter(|(e, _)| e == events::CHUNK_UPDATED)
            .cloned()
            .collect();
        assert_eq!(delivered.len(), 1);
    }
}
