//! Core value types shared across the bus, session hub, chunk router and
//! sync coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Opaque identifiers
// ---------------------------------------------------------------------------

/// Opaque game identifier. Created externally; the fabric only ever sees the
/// string handed to it by the caller.
pub type GameId = String;

/// Opaque session identifier minted by the transport layer on connect.
pub type SessionId = String;

/// Opaque player identifier, as assigned by the external auth/game layer.
pub type PlayerId = String;

// ---------------------------------------------------------------------------
// ChunkId
// ---------------------------------------------------------------------------

/// The pair of integer chunk coordinates obtained by floor-dividing world
/// coordinates by a game's chunk size. Renders canonically as `"cx,cy"`,
/// which is also its wire representation — it serializes and deserializes
/// as that string, not as a `{cx, cy}` object, matching the `chunkId`
/// string fields used throughout the Bus envelope and channel names.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ChunkId {
    pub cx: i64,
    pub cy: i64,
}

impl ChunkId {
    pub fn new(cx: i64, cy: i64) -> Self {
        Self { cx, cy }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.cx, self.cy)
    }
}

impl std::str::FromStr for ChunkId {
    type Err = ParseChunkIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cx_s, cy_s) = s.split_once(',').ok_or(ParseChunkIdError)?;
        let cx = cx_s.parse().map_err(|_| ParseChunkIdError)?;
        let cy = cy_s.parse().map_err(|_| ParseChunkIdError)?;
        Ok(ChunkId { cx, cy })
    }
}

impl From<ChunkId> for String {
    fn from(id: ChunkId) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for ChunkId {
    type Error = ParseChunkIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParseChunkIdError;

impl fmt::Display for ParseChunkIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed chunk id")
    }
}

impl std::error::Error for ParseChunkIdError {}

/// Floor-division by an `i64` chunk size, correct for negative world
/// coordinates (Rust's `/` truncates toward zero, which is wrong here).
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    let r = a % b;
    if (r != 0) && ((r < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

pub fn chunk_of(x: i64, y: i64, chunk_size: i64) -> ChunkId {
    ChunkId::new(floor_div(x, chunk_size), floor_div(y, chunk_size))
}

// ---------------------------------------------------------------------------
// Viewport
// ---------------------------------------------------------------------------

/// An axis-aligned rectangle in world coordinates, inclusive on all four
/// edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub min_x: i64,
    pub max_x: i64,
    pub min_y: i64,
    pub max_y: i64,
}

impl Viewport {
    pub fn new(min_x: i64, max_x: i64, min_y: i64, max_y: i64) -> Self {
        Self {
            min_x,
            max_x,
            min_y,
            max_y,
        }
    }

    /// Build a viewport centered on `(cx, cy)` with half-extents derived from
    /// `width`/`height`, rounding outward so boundary cells are always
    /// included (floor on the min edge, ceil on the max edge).
    pub fn from_center(cx: f64, cy: f64, width: f64, height: f64) -> Self {
        let hw = width / 2.0;
        let hh = height / 2.0;
        Self {
            min_x: (cx - hw).floor() as i64,
            max_x: (cx + hw).ceil() as i64,
            min_y: (cy - hh).floor() as i64,
            max_y: (cy + hh).ceil() as i64,
        }
    }

    /// Grow the viewport symmetrically by `buf` on every edge.
    pub fn expand(&self, buf: i64) -> Self {
        Self {
            min_x: self.min_x - buf,
            max_x: self.max_x + buf,
            min_y: self.min_y - buf,
            max_y: self.max_y + buf,
        }
    }

    /// True iff the two rectangles overlap (touching edges count as overlap;
    /// only strict separation on an axis rules it out).
    pub fn intersects(&self, other: &Viewport) -> bool {
        !(self.max_x < other.min_x
            || self.min_x > other.max_x
            || self.max_y < other.min_y
            || self.min_y > other.max_y)
    }

    /// Enumerate the set of chunks this viewport overlaps for a given chunk
    /// size: the closed-interval product of the chunk ranges covering each
    /// axis.
    pub fn chunks(&self, chunk_size: i64) -> Vec<ChunkId> {
        let cx0 = floor_div(self.min_x, chunk_size);
        let cx1 = floor_div(self.max_x, chunk_size);
        let cy0 = floor_div(self.min_y, chunk_size);
        let cy1 = floor_div(self.max_y, chunk_size);

        let mut out = Vec::with_capacity(((cx1 - cx0 + 1) * (cy1 - cy0 + 1)).max(0) as usize);
        for cy in cy0..=cy1 {
            for cx in cx0..=cx1 {
                out.push(ChunkId::new(cx, cy));
            }
        }
        out
    }
}

/// The world-space bounding box covered by a single chunk.
pub fn bounds_of_chunk(chunk: ChunkId, chunk_size: i64) -> Viewport {
    Viewport {
        min_x: chunk.cx * chunk_size,
        max_x: (chunk.cx + 1) * chunk_size - 1,
        min_y: chunk.cy * chunk_size,
        max_y: (chunk.cy + 1) * chunk_size - 1,
    }
}

// ---------------------------------------------------------------------------
// Cell changes and chunk updates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellChange {
    pub x: i64,
    pub y: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub old_value: Option<serde_json::Value>,
    pub new_value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub player_id: Option<PlayerId>,
}

/// A batch of cell changes confined to one chunk of one game, stamped with a
/// monotonic per-process-per-game sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUpdate {
    pub game_id: GameId,
    pub chunk_id: ChunkId,
    pub changes: Vec<CellChange>,
    pub timestamp: String,
    pub sequence: u64,
}

// ---------------------------------------------------------------------------
// Optimistic / authoritative updates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateLifecycle {
    Pending,
    Acknowledged,
    TimedOut,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimisticUpdate {
    pub update_id: String,
    pub game_id: GameId,
    pub player_id: PlayerId,
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rollback_payload: Option<serde_json::Value>,
    pub created_at_millis: i64,
    pub lifecycle: UpdateLifecycle,
}

/// A server-originated state delta, delivered via the Bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthoritativeUpdate {
    pub game_id: GameId,
    pub updates: serde_json::Value,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub player_id: Option<PlayerId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub update_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Conflict policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    ServerWins,
    ClientWins,
    Merge,
    Custom,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::ServerWins
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_roundtrips_through_display_and_parse() {
        let id = ChunkId::new(-3, 7);
        let s = id.to_string();
        assert_eq!(s, "-3,7");
        let parsed: ChunkId = s.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn floor_div_matches_math_floor_for_negative_values() {
        assert_eq!(floor_div(-10, 64), -1);
        assert_eq!(floor_div(-64, 64), -1);
        assert_eq!(floor_div(-65, 64), -2);
        assert_eq!(floor_div(63, 64), 0);
        assert_eq!(floor_div(64, 64), 1);
    }

    // P1 from spec §8
    #[test]
    fn viewport_chunks_matches_spatial_math_examples() {
        let v = Viewport::new(-10, 10, -10, 10);
        let got: std::collections::HashSet<String> =
            v.chunks(64).into_iter().map(|c| c.to_string()).collect();
        let want: std::collections::HashSet<String> = ["-1,-1", "-1,0", "0,-1", "0,0"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(got, want);

        let v2 = Viewport::new(0, 63, 0, 63);
        let got2: Vec<String> = v2.chunks(64).into_iter().map(|c| c.to_string()).collect();
        assert_eq!(got2, vec!["0,0".to_string()]);

        let v3 = Viewport::new(0, 64, 0, 0);
        let got3: std::collections::HashSet<String> =
            v3.chunks(64).into_iter().map(|c| c.to_string()).collect();
        let want3: std::collections::HashSet<String> =
            ["0,0", "1,0"].iter().map(|s| s.to_string()).collect();
        assert_eq!(got3, want3);
    }

    // E6 from spec §8
    #[test]
    fn expand_bounds_matches_example() {
        let v = Viewport::new(-5, 5, -5, 5);
        let e = v.expand(2);
        assert_eq!(e, Viewport::new(-7, 7, -7, 7));
    }

    #[test]
    fn intersects_uses_strict_separation() {
        let a = Viewport::new(0, 10, 0, 10);
        let touching = Viewport::new(10, 20, 0, 10);
        let separated = Viewport::new(11, 20, 0, 10);
        assert!(a.intersects(&touching));
        assert!(!a.intersects(&separated));
    }

    #[test]
    fn from_center_includes_boundary_cells() {
        let v = Viewport::from_center(0.0, 0.0, 4.0, 4.0);
        assert_eq!(v, Viewport::new(-2, 2, -2, 2));
    }

    #[test]
    fn bounds_of_chunk_is_inverse_of_chunk_of_interior_points() {
        let b = bounds_of_chunk(ChunkId::new(2, -3), 64);
        assert_eq!(b, Viewport::new(128, 191, -192, -129));
        assert_eq!(chunk_of(128, -192, 64), ChunkId::new(2, -3));
        assert_eq!(chunk_of(191, -129, 64), ChunkId::new(2, -3));
    }
}
