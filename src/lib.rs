//! Real-time synchronization fabric for spatial multiplayer grid games.
//!
//! ## Architecture
//!
//! ```text
//! ChunkRouter     (chunk_router.rs)  ← spatial fan-out, sequencing
//!   ├── Bus          (bus.rs)          ← cross-process pub/sub + KV
//!   └── SessionHub    (session_hub.rs) ← connections, room fan-out
//!
//! SyncCoordinator (sync_coordinator.rs) ← snapshots, optimistic reconciliation
//!   ├── Bus
//!   └── SessionHub
//! ```
//!
//! The Bus, Session Hub, Chunk Router and Sync Coordinator are composed, not
//! layered by inheritance: the Router and the Coordinator each hold shared
//! references to the Bus and the Hub, and the Hub has no knowledge of
//! either.
//!
//! Protocol and value types (`protocol`, `types`, `error`, `config`) have no
//! feature requirements. `MemoryBus` is always available for embedding this
//! crate without an external broker; `RedisBus` requires the `redis`
//! feature for its production Bus backend.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

pub mod bus;
pub mod chunk_router;
pub mod session_hub;
pub mod sync_coordinator;

#[cfg(feature = "redis")]
pub use bus::RedisBus;
pub use bus::{Bus, BusMessage, BusSubscription, LockHandle, MemoryBus, SubscriptionId};
pub use chunk_router::{ChunkRouter, SubscriptionDiff};
pub use config::CoreConfig;
pub use error::{ClientError, CoreError, CoreResult};
pub use protocol::{BusEnvelope, Envelope, EnvelopeParseError, EnvelopeType};
pub use session_hub::{events, GameHandler, SendHandle, SessionHub};
pub use sync_coordinator::{ConflictDetector, CustomResolver, SyncCoordinator, SyncCoordinatorConfig};
pub use types::{
    AuthoritativeUpdate, CellChange, ChunkId, ChunkUpdate, ConflictPolicy, GameId, OptimisticUpdate,
    PlayerId, SessionId, UpdateLifecycle, Viewport,
};
