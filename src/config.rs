//! Configuration (spec §6), loadable from the environment via `clap`
//! (`derive`, `env`) the way the teacher's `src/bin/world.rs` loads its
//! `Args`, with sensible library defaults for callers who construct the
//! fabric's components directly instead of running the demo binary.

use clap::Parser;
use crate::types::ConflictPolicy;

/// Every configuration row from spec §6 in one place.
#[derive(Parser, Debug, Clone)]
#[command(name = "sync-fabric", about = "Real-time synchronization fabric", version)]
pub struct CoreConfig {
    /// Address of the pub/sub + KV broker.
    #[arg(long, env = "SYNC_FABRIC_BROKER_URL", default_value = "redis://localhost:6379")]
    pub broker_url: String,

    /// Per-deployment channel namespace.
    #[arg(long, env = "SYNC_FABRIC_CHANNEL_PREFIX", default_value = "game:")]
    pub channel_prefix: String,

    /// Cells per chunk edge.
    #[arg(long, env = "SYNC_FABRIC_CHUNK_SIZE", default_value_t = 64)]
    pub chunk_size: i64,

    /// Sync Coordinator acknowledgement deadline, in milliseconds.
    #[arg(long, env = "SYNC_FABRIC_ACK_TIMEOUT_MS", default_value_t = 5000)]
    pub ack_timeout_ms: u64,

    /// Cap on pending optimistic updates per game.
    #[arg(long, env = "SYNC_FABRIC_MAX_PENDING_UPDATES", default_value_t = 100)]
    pub max_pending_updates: usize,

    /// Conflict resolution policy.
    #[arg(long, env = "SYNC_FABRIC_CONFLICT_POLICY", default_value = "server-wins")]
    pub conflict_policy: String,

    /// Whether client deltas are pre-applied locally before server ack.
    #[arg(long, env = "SYNC_FABRIC_OPTIMISTIC_ENABLED", default_value_t = true)]
    pub optimistic_enabled: bool,

    /// Transport heartbeat ping interval, in milliseconds.
    #[arg(long, env = "SYNC_FABRIC_PING_INTERVAL_MS", default_value_t = 25_000)]
    pub ping_interval_ms: u64,

    /// Transport heartbeat timeout, in milliseconds.
    #[arg(long, env = "SYNC_FABRIC_PING_TIMEOUT_MS", default_value_t = 60_000)]
    pub ping_timeout_ms: u64,

    /// TTL for the Bus's cached game-state side channel, in seconds.
    #[arg(long, env = "SYNC_FABRIC_STATE_TTL_SECS", default_value_t = 300)]
    pub state_ttl_secs: u64,

    /// TTL for the Bus's active-chunks membership set, in seconds.
    #[arg(long, env = "SYNC_FABRIC_ACTIVE_CHUNKS_TTL_SECS", default_value_t = 300)]
    pub active_chunks_ttl_secs: u64,
}

impl CoreConfig {
    pub fn conflict_policy(&self) -> ConflictPolicy {
        match self.conflict_policy.as_str() {
            "client-wins" => ConflictPolicy::ClientWins,
            "merge" => ConflictPolicy::Merge,
            "custom" => ConflictPolicy::Custom,
            _ => ConflictPolicy::ServerWins,
        }
    }

    /// Layered load: defaults, overridden by an optional config file,
    /// overridden by environment variables — the pattern the `config` crate
    /// exists in this manifest for (the teacher carries the dependency but
    /// never calls it; this is the first consumer in this lineage).
    pub fn load(config_file: Option<&str>) -> anyhow::Result<Self> {
        let defaults = CoreConfig::default();
        let mut builder = config::Config::builder()
            .set_default("broker_url", defaults.broker_url.clone())?
            .set_default("channel_prefix", defaults.channel_prefix.clone())?
            .set_default("chunk_size", defaults.chunk_size)?
            .set_default("ack_timeout_ms", defaults.ack_timeout_ms as i64)?
            .set_default("max_pending_updates", defaults.max_pending_updates as i64)?
            .set_default("conflict_policy", defaults.conflict_policy.clone())?
            .set_default("optimistic_enabled", defaults.optimistic_enabled)?
            .set_default("ping_interval_ms", defaults.ping_interval_ms as i64)?
            .set_default("ping_timeout_ms", defaults.ping_timeout_ms as i64)?
            .set_default("state_ttl_secs", defaults.state_ttl_secs as i64)?
            .set_default(
                "active_chunks_ttl_secs",
                defaults.active_chunks_ttl_secs as i64,
            )?;

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SYNC_FABRIC").try_parsing(true),
        );

        let loaded = builder.build()?;
        Ok(CoreConfig {
            broker_url: loaded.get_string("broker_url")?,
            channel_prefix: loaded.get_string("channel_prefix")?,
            chunk_size: loaded.get_int("chunk_size")?,
            ack_timeout_ms: loaded.get_int("ack_timeout_ms")? as u64,
            max_pending_updates: loaded.get_int("max_pending_updates")? as usize,
            conflict_policy: loaded.get_string("conflict_policy")?,
            optimistic_enabled: loaded.get_bool("optimistic_enabled")?,
            ping_interval_ms: loaded.get_int("ping_interval_ms")? as u64,
            ping_timeout_ms: loaded.get_int("ping_timeout_ms")? as u64,
            state_ttl_secs: loaded.get_int("state_ttl_secs")? as u64,
            active_chunks_ttl_secs: loaded.get_int("active_chunks_ttl_secs")? as u64,
        })
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            broker_url: "redis://localhost:6379".to_string(),
            channel_prefix: "game:".to_string(),
            chunk_size: 64,
            ack_timeout_ms: 5000,
            max_pending_updates: 100,
            conflict_policy: "server-wins".to_string(),
            optimistic_enabled: true,
            ping_interval_ms: 25_000,
            ping_timeout_ms: 60_000,
            state_ttl_secs: 300,
            active_chunks_ttl_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let c = CoreConfig::default();
        assert_eq!(c.broker_url, "redis://localhost:6379");
        assert_eq!(c.channel_prefix, "game:");
        assert_eq!(c.chunk_size, 64);
        assert_eq!(c.ack_timeout_ms, 5000);
        assert_eq!(c.max_pending_updates, 100);
        assert_eq!(c.conflict_policy(), ConflictPolicy::ServerWins);
        assert!(c.optimistic_enabled);
        assert_eq!(c.ping_interval_ms, 25_000);
        assert_eq!(c.ping_timeout_ms, 60_000);
    }
}
