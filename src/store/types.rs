//! Record types for the durable store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::clock::Clock;
use crate::constants::IMPORTANCE_BUCKETS;

/// Unique, time-sortable memory identifier.
///
/// UUIDv7: the hyphenated hex form sorts lexicographically by creation time,
/// which keeps per-user index scans newest-first without a separate sort key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    /// Mint a new id stamped with the given clock's current time.
    pub fn generate(clock: &dyn Clock) -> Self {
        let now = clock.now();
        let seconds = now.timestamp().max(0) as u64;
        let nanos = now.timestamp_subsec_nanos();
        let ts = uuid::Timestamp::from_unix(uuid::NoContext, seconds, nanos);
        Self(Uuid::new_v7(ts))
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MemoryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A stored memory. Everything except access metadata is immutable after
/// `save`; changing other fields means delete + re-save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub user_id: String,
    pub session_id: String,
    pub content: String,

    /// Free-form JSON-shaped metadata, bounded to 16 KiB encoded.
    #[serde(default, with = "json_map")]
    pub metadata: Map<String, Value>,

    /// Salience weight in [0.0, 1.0].
    pub importance: f32,

    pub created_at: DateTime<Utc>,

    /// `None` means the default TTL governs expiry.
    pub expires_at: Option<DateTime<Utc>>,

    /// Advanced on successful recall. Advisory; lossy across crashes.
    pub last_accessed_at: DateTime<Utc>,

    /// Count of successful recalls. Advisory; lossy across crashes.
    pub access_count: u32,

    /// Instant `importance` was last written. Decay attenuation measures its
    /// interval from here, so repeated sweeps at one wall-clock are no-ops.
    pub importance_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Importance bucket index in 0..=9 (fixed width 0.1).
    pub fn importance_bucket(&self) -> u8 {
        importance_bucket(self.importance)
    }
}

/// Bucket an importance value into one of the ten fixed-width partitions.
pub fn importance_bucket(importance: f32) -> u8 {
    let bucket = (importance * IMPORTANCE_BUCKETS as f32).floor() as i32;
    bucket.clamp(0, IMPORTANCE_BUCKETS as i32 - 1) as u8
}

/// Deletion marker appended in place of physical removal. Compaction drops
/// both the tombstone and the record it shadows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: MemoryId,
}

/// Format-aware serde for JSON-shaped metadata maps.
///
/// `serde_json::Value` cannot round-trip through non-self-describing formats
/// like bincode, so binary encodings carry the map as one JSON string while
/// human-readable encodings keep the native structure.
pub(crate) mod json_map {
    use serde::de::Error as DeError;
    use serde::ser::Error as SerError;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::{Map, Value};

    pub fn serialize<S>(map: &Map<String, Value>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            map.serialize(serializer)
        } else {
            let encoded = serde_json::to_string(map).map_err(S::Error::custom)?;
            serializer.serialize_str(&encoded)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            Map::deserialize(deserializer)
        } else {
            let encoded = String::deserialize(deserializer)?;
            serde_json::from_str(&encoded).map_err(D::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    #[test]
    fn test_ids_sort_by_time() {
        let clock = ManualClock::starting_now();
        let a = MemoryId::generate(clock.as_ref());
        clock.advance(Duration::milliseconds(5));
        let b = MemoryId::generate(clock.as_ref());
        clock.advance(Duration::seconds(1));
        let c = MemoryId::generate(clock.as_ref());

        assert!(a.to_string() < b.to_string());
        assert!(b.to_string() < c.to_string());
        assert!(a < b && b < c);
    }

    #[test]
    fn test_importance_buckets() {
        assert_eq!(importance_bucket(0.0), 0);
        assert_eq!(importance_bucket(0.05), 0);
        assert_eq!(importance_bucket(0.1), 1);
        assert_eq!(importance_bucket(0.45), 4);
        assert_eq!(importance_bucket(0.99), 9);
        assert_eq!(importance_bucket(1.0), 9);
    }

    #[test]
    fn test_id_roundtrips_through_display() {
        let clock = ManualClock::starting_now();
        let id = MemoryId::generate(clock.as_ref());
        let parsed: MemoryId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
