//! Demonstration binary: wires the Bus, Session Hub, Chunk Router and Sync
//! Coordinator together against an in-process [`MemoryBus`] and drives a
//! toy two-session scenario, logging the fan-out it observes.
//!
//! This is not a deployment artifact — it exists to give the crate an
//! executable surface the way a thin `main()` gives a library crate a
//! runnable demonstration of its own wiring.

use clap::Parser;
use serde_json::Value;
use std::sync::Arc;
use sync_fabric::{
    events, Bus, CellChange, ChunkId, ChunkRouter, CoreConfig, CoreResult, MemoryBus, SendHandle,
    SessionHub, Viewport,
};

struct LoggingSendHandle {
    label: &'static str,
}

#[async_trait::async_trait]
impl SendHandle for LoggingSendHandle {
    async fn send(&self, event: &str, payload: Value) -> CoreResult<()> {
        tracing::info!(session = self.label, event, %payload, "delivered");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CoreConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sync_fabric=debug")),
        )
        .init();

    let bus = Arc::new(MemoryBus::new(config.channel_prefix.clone()));
    let hub = Arc::new(SessionHub::new());
    let router = Arc::new(ChunkRouter::new(
        bus.clone(),
        hub.clone(),
        config.channel_prefix.clone(),
        config.chunk_size,
        config.active_chunks_ttl_secs,
    ));

    hub.on_connect("alice".to_string(), Arc::new(LoggingSendHandle { label: "alice" }));
    hub.on_connect("bob".to_string(), Arc::new(LoggingSendHandle { label: "bob" }));

    hub.join_game(&"alice".to_string(), &"demo-game".to_string(), None).await?;
    hub.join_game(&"bob".to_string(), &"demo-game".to_string(), None).await?;

    router
        .subscribe_to_viewport(
            &"alice".to_string(),
            &"demo-game".to_string(),
            Viewport::from_center(0.0, 0.0, 4.0, 4.0),
        )
        .await?;
    router
        .subscribe_to_viewport(
            &"bob".to_string(),
            &"demo-game".to_string(),
            Viewport::from_center(0.0, 0.0, 4.0, 4.0),
        )
        .await?;

    tracing::info!("publishing a cell change at (3, 5)");
    router
        .publish_chunk_update(
            &"demo-game".to_string(),
            vec![CellChange {
                x: 3,
                y: 5,
                old_value: None,
                new_value: serde_json::json!("wall"),
                player_id: Some("alice".to_string()),
            }],
        )
        .await?;

    hub.broadcast_to_chunk(
        &"demo-game".to_string(),
        ChunkId::new(0, 0),
        events::CHUNK_UPDATED,
        serde_json::json!({ "note": "final fan-out check" }),
    )
    .await;

    hub.disconnect(&"alice".to_string()).await;
    hub.disconnect(&"bob".to_string()).await;

    Ok(())
}
