//! Secondary index structures
//!
//! Five in-memory indexes kept transactionally in step with segment appends:
//! by-user, by-session, by-time (hourly buckets), by-importance (ten fixed
//! buckets) and the inverted term index. A primary location map doubles as
//! the live-record authority and carries the advisory access metadata.
//!
//! The whole state is snapshotted to `indexes/snapshot-<seq>.idx` and rebuilt
//! on startup from the newest snapshot plus manifest entries with a higher
//! seq. All mutations are idempotent keyed on record id, so replay is safe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::constants::TIME_BUCKET_SECS;
use crate::errors::{MemoryError, Result};
use crate::store::types::{importance_bucket, MemoryId, MemoryRecord};

/// Where a live record lives on disk, plus the hot fields queries filter and
/// rank on without touching the segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordLocation {
    pub segment_id: u64,
    pub offset: u64,
    pub len: u32,
    pub user_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub importance: f32,
    pub importance_at: DateTime<Utc>,
    pub access_count: u32,
    pub last_accessed_at: DateTime<Utc>,
}

impl RecordLocation {
    pub fn importance_bucket(&self) -> u8 {
        importance_bucket(self.importance)
    }
}

/// Hour bucket for the time index.
pub fn time_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(TIME_BUCKET_SECS)
}

type TimeKey = (i64, MemoryId);

fn time_key(loc: &RecordLocation, id: MemoryId) -> TimeKey {
    (loc.created_at.timestamp_millis(), id)
}

/// The complete index image. Everything is `BTreeMap`/`BTreeSet` so scans
/// are ordered and snapshots are deterministic.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IndexState {
    /// Seq of the next manifest entry to fold in; everything below is
    /// already reflected in this image.
    pub last_seq: u64,

    /// id → location; membership here defines liveness.
    primary: BTreeMap<MemoryId, RecordLocation>,

    /// user → (created_at millis, id); reverse iteration is newest-first.
    by_user: BTreeMap<String, BTreeSet<TimeKey>>,

    /// session → (created_at millis, id).
    by_session: BTreeMap<String, BTreeSet<TimeKey>>,

    /// session → owning user, derived from member memories.
    session_owner: BTreeMap<String, String>,

    /// (user, hour bucket) → ids.
    by_time: BTreeMap<(String, i64), BTreeSet<MemoryId>>,

    /// (user, importance bucket) → ids.
    by_importance: BTreeMap<(String, u8), BTreeSet<MemoryId>>,

    /// term → id → term frequency. May reference dead ids between snapshots;
    /// readers filter through `primary`, pruning happens at snapshot time.
    postings: BTreeMap<String, BTreeMap<MemoryId, u32>>,

    /// Frames appended per segment (records and tombstones).
    segment_totals: BTreeMap<u64, u64>,

    /// Live records per segment.
    segment_live: BTreeMap<u64, u64>,
}

impl IndexState {
    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Index a stored record. Re-applying for a known id (manifest replay,
    /// compaction relocation, decay rewrite) first unlinks the old entries.
    pub fn apply_put(
        &mut self,
        record: &MemoryRecord,
        terms: &BTreeMap<String, u32>,
        segment_id: u64,
        offset: u64,
        len: u32,
    ) {
        let id = record.id;
        let relocation = self.primary.contains_key(&id);
        if relocation {
            self.unlink(id);
        }

        let loc = RecordLocation {
            segment_id,
            offset,
            len,
            user_id: record.user_id.clone(),
            session_id: record.session_id.clone(),
            created_at: record.created_at,
            expires_at: record.expires_at,
            importance: record.importance,
            importance_at: record.importance_at,
            access_count: record.access_count,
            last_accessed_at: record.last_accessed_at,
        };

        self.by_user
            .entry(loc.user_id.clone())
            .or_default()
            .insert(time_key(&loc, id));
        self.by_session
            .entry(loc.session_id.clone())
            .or_default()
            .insert(time_key(&loc, id));
        self.session_owner
            .entry(loc.session_id.clone())
            .or_insert_with(|| loc.user_id.clone());
        self.by_time
            .entry((loc.user_id.clone(), time_bucket(loc.created_at)))
            .or_default()
            .insert(id);
        self.by_importance
            .entry((loc.user_id.clone(), loc.importance_bucket()))
            .or_default()
            .insert(id);
        for (term, tf) in terms {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(id, *tf);
        }

        *self.segment_totals.entry(segment_id).or_default() += 1;
        *self.segment_live.entry(segment_id).or_default() += 1;
        self.primary.insert(id, loc);

        if relocation {
            debug!(%id, segment_id, "reindexed relocated record");
        }
    }

    /// Apply a tombstone. `tombstone_segment` is where the tombstone frame
    /// itself landed (it counts as a dead frame there); `None` during decay
    /// replays that only need the unlink.
    pub fn apply_tombstone(&mut self, id: MemoryId, tombstone_segment: Option<u64>) {
        if let Some(segment_id) = tombstone_segment {
            *self.segment_totals.entry(segment_id).or_default() += 1;
        }
        self.unlink(id);
    }

    fn unlink(&mut self, id: MemoryId) {
        let Some(loc) = self.primary.remove(&id) else {
            return;
        };

        if let Some(set) = self.by_user.get_mut(&loc.user_id) {
            set.remove(&time_key(&loc, id));
            if set.is_empty() {
                self.by_user.remove(&loc.user_id);
            }
        }
        if let Some(set) = self.by_session.get_mut(&loc.session_id) {
            set.remove(&time_key(&loc, id));
            if set.is_empty() {
                self.by_session.remove(&loc.session_id);
                self.session_owner.remove(&loc.session_id);
            }
        }
        let tkey = (loc.user_id.clone(), time_bucket(loc.created_at));
        if let Some(set) = self.by_time.get_mut(&tkey) {
            set.remove(&id);
            if set.is_empty() {
                self.by_time.remove(&tkey);
            }
        }
        let ikey = (loc.user_id.clone(), loc.importance_bucket());
        if let Some(set) = self.by_importance.get_mut(&ikey) {
            set.remove(&id);
            if set.is_empty() {
                self.by_importance.remove(&ikey);
            }
        }
        if let Some(live) = self.segment_live.get_mut(&loc.segment_id) {
            *live = live.saturating_sub(1);
        }
    }

    /// Record a compaction: the old segment's accounting disappears.
    pub fn forget_segment(&mut self, segment_id: u64) {
        self.segment_totals.remove(&segment_id);
        self.segment_live.remove(&segment_id);
    }

    /// Advance advisory access metadata. Only ever moves forward.
    pub fn touch(&mut self, id: MemoryId, at: DateTime<Utc>) {
        if let Some(loc) = self.primary.get_mut(&id) {
            loc.access_count = loc.access_count.saturating_add(1);
            if at > loc.last_accessed_at {
                loc.last_accessed_at = at;
            }
        }
    }

    pub fn set_last_seq(&mut self, seq: u64) {
        self.last_seq = seq;
    }

    /// Point a live record at its post-compaction frame. Counters move to
    /// the new segment; the old segment is dropped via [`Self::forget_segment`].
    pub fn relocate(&mut self, id: &MemoryId, segment_id: u64, offset: u64, len: u32) {
        if let Some(loc) = self.primary.get_mut(id) {
            loc.segment_id = segment_id;
            loc.offset = offset;
            loc.len = len;
            *self.segment_totals.entry(segment_id).or_default() += 1;
            *self.segment_live.entry(segment_id).or_default() += 1;
        }
    }

    /// Drop posting entries for dead ids. Run before snapshots so the image
    /// on disk is clean.
    pub fn prune_postings(&mut self) {
        let primary = &self.primary;
        self.postings.retain(|_, ids| {
            ids.retain(|id, _| primary.contains_key(id));
            !ids.is_empty()
        });
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    pub fn location(&self, id: &MemoryId) -> Option<&RecordLocation> {
        self.primary.get(id)
    }

    pub fn contains(&self, id: &MemoryId) -> bool {
        self.primary.contains_key(id)
    }

    pub fn live_count(&self) -> usize {
        self.primary.len()
    }

    pub fn user_count(&self, user_id: &str) -> usize {
        self.by_user.get(user_id).map_or(0, |s| s.len())
    }

    /// All users with at least one live memory, lexicographic.
    pub fn users(&self) -> Vec<String> {
        self.by_user.keys().cloned().collect()
    }

    /// A user's memory ids, newest first.
    pub fn user_ids_newest_first(&self, user_id: &str) -> Vec<MemoryId> {
        self.by_user
            .get(user_id)
            .map(|set| set.iter().rev().map(|(_, id)| *id).collect())
            .unwrap_or_default()
    }

    /// A session's memory ids, newest first.
    pub fn session_ids_newest_first(&self, session_id: &str) -> Vec<MemoryId> {
        self.by_session
            .get(session_id)
            .map(|set| set.iter().rev().map(|(_, id)| *id).collect())
            .unwrap_or_default()
    }

    pub fn session_owner(&self, session_id: &str) -> Option<&str> {
        self.session_owner.get(session_id).map(String::as_str)
    }

    /// Sessions with live memories for a user: (session, count, first, last).
    pub fn sessions_for_user(
        &self,
        user_id: &str,
    ) -> Vec<(String, usize, DateTime<Utc>, DateTime<Utc>)> {
        self.session_owner
            .iter()
            .filter(|(_, owner)| owner.as_str() == user_id)
            .filter_map(|(session, _)| {
                let set = self.by_session.get(session)?;
                let first = set.iter().next()?.0;
                let last = set.iter().next_back()?.0;
                Some((
                    session.clone(),
                    set.len(),
                    DateTime::from_timestamp_millis(first).unwrap_or(DateTime::UNIX_EPOCH),
                    DateTime::from_timestamp_millis(last).unwrap_or(DateTime::UNIX_EPOCH),
                ))
            })
            .collect()
    }

    /// Ids for a user inside [from, to] by hour-bucket scan. Callers still
    /// apply the exact bound check; buckets are coarse.
    pub fn time_range_ids(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BTreeSet<MemoryId> {
        let mut out = BTreeSet::new();
        let lo = time_bucket(from);
        let hi = time_bucket(to);
        for ((_, _), ids) in self
            .by_time
            .range((user_id.to_string(), lo)..=(user_id.to_string(), hi))
        {
            out.extend(ids.iter().copied());
        }
        out
    }

    /// Ids for a user in importance buckets `min_bucket..=9`.
    pub fn importance_ids(&self, user_id: &str, min_bucket: u8) -> BTreeSet<MemoryId> {
        let mut out = BTreeSet::new();
        for ((_, _), ids) in self
            .by_importance
            .range((user_id.to_string(), min_bucket)..=(user_id.to_string(), u8::MAX))
        {
            out.extend(ids.iter().copied());
        }
        out
    }

    /// Live posting list for a term: (id, tf).
    pub fn posting(&self, term: &str) -> Vec<(MemoryId, u32)> {
        self.postings
            .get(term)
            .map(|ids| {
                ids.iter()
                    .filter(|(id, _)| self.primary.contains_key(id))
                    .map(|(id, tf)| (*id, *tf))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live document frequency for a term.
    pub fn document_frequency(&self, term: &str) -> usize {
        self.postings
            .get(term)
            .map(|ids| {
                ids.keys()
                    .filter(|id| self.primary.contains_key(id))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    /// Sealed segments whose live fraction dropped below the threshold,
    /// together with their live frames ordered by offset.
    pub fn compactable_segments(
        &self,
        active_segment: u64,
        live_threshold: f64,
    ) -> Vec<(u64, Vec<(MemoryId, u64, u32)>)> {
        let mut live_frames: BTreeMap<u64, Vec<(MemoryId, u64, u32)>> = BTreeMap::new();
        for (id, loc) in &self.primary {
            live_frames
                .entry(loc.segment_id)
                .or_default()
                .push((*id, loc.offset, loc.len));
        }

        let mut out = Vec::new();
        for (&segment_id, &total) in &self.segment_totals {
            if segment_id >= active_segment || total == 0 {
                continue;
            }
            let live = self.segment_live.get(&segment_id).copied().unwrap_or(0);
            if (live as f64) / (total as f64) < live_threshold {
                let mut frames = live_frames.remove(&segment_id).unwrap_or_default();
                frames.sort_by_key(|&(_, offset, _)| offset);
                out.push((segment_id, frames));
            }
        }
        out
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Write a snapshot image via temp file + rename, then drop older ones.
    pub fn write_snapshot(&mut self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        self.prune_postings();

        let path = dir.join(format!("snapshot-{:020}.idx", self.last_seq));
        let tmp = dir.join(".snapshot.tmp");
        let bytes =
            bincode::serialize(self).map_err(|e| MemoryError::Internal(anyhow::anyhow!(e)))?;
        std::fs::write(&tmp, &bytes)?;
        let file = std::fs::File::open(&tmp)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &path)?;

        // Older images are superseded; keep the directory tidy.
        for (other_seq, other_path) in list_snapshots(dir)? {
            if other_seq < self.last_seq {
                let _ = std::fs::remove_file(other_path);
            }
        }

        debug!(seq = self.last_seq, path = %path.display(), "wrote index snapshot");
        Ok(path)
    }

    /// Load the newest decodable snapshot, if any.
    pub fn load_newest(dir: &Path) -> Result<Option<IndexState>> {
        let mut snapshots = list_snapshots(dir)?;
        snapshots.sort_by_key(|(seq, _)| std::cmp::Reverse(*seq));
        for (seq, path) in snapshots {
            match std::fs::read(&path) {
                Ok(bytes) => match bincode::deserialize::<IndexState>(&bytes) {
                    Ok(state) => return Ok(Some(state)),
                    Err(e) => {
                        warn!(seq, path = %path.display(), error = %e, "unreadable snapshot; trying older");
                    }
                },
                Err(e) => {
                    warn!(seq, path = %path.display(), error = %e, "unreadable snapshot; trying older");
                }
            }
        }
        Ok(None)
    }
}

fn list_snapshots(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix("snapshot-") {
            if let Some(stem) = rest.strip_suffix(".idx") {
                if let Ok(seq) = stem.parse::<u64>() {
                    out.push((seq, entry.path()));
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer;
    use crate::clock::SystemClock;
    use serde_json::Map;
    use tempfile::TempDir;

    fn record(user: &str, session: &str, content: &str, importance: f32) -> MemoryRecord {
        let now = Utc::now();
        MemoryRecord {
            id: MemoryId::generate(&SystemClock),
            user_id: user.to_string(),
            session_id: session.to_string(),
            content: content.to_string(),
            metadata: Map::new(),
            importance,
            created_at: now,
            expires_at: None,
            last_accessed_at: now,
            access_count: 0,
            importance_at: now,
        }
    }

    fn apply(state: &mut IndexState, rec: &MemoryRecord, segment: u64, offset: u64) {
        let terms: BTreeMap<String, u32> =
            analyzer::term_frequencies(&rec.content).into_iter().collect();
        state.apply_put(rec, &terms, segment, offset, 64);
    }

    #[test]
    fn test_put_populates_every_index() {
        let mut state = IndexState::default();
        let rec = record("u1", "s1", "rust memory decay", 0.85);
        apply(&mut state, &rec, 1, 0);

        assert!(state.contains(&rec.id));
        assert_eq!(state.user_ids_newest_first("u1"), vec![rec.id]);
        assert_eq!(state.session_ids_newest_first("s1"), vec![rec.id]);
        assert_eq!(state.session_owner("s1"), Some("u1"));
        assert_eq!(state.importance_ids("u1", 8).len(), 1);
        assert!(state.importance_ids("u1", 9).is_empty());
        assert_eq!(state.posting("rust"), vec![(rec.id, 1)]);
        let window = state.time_range_ids(
            "u1",
            rec.created_at - chrono::Duration::hours(1),
            rec.created_at + chrono::Duration::hours(1),
        );
        assert!(window.contains(&rec.id));
    }

    #[test]
    fn test_tombstone_unlinks_everywhere() {
        let mut state = IndexState::default();
        let rec = record("u1", "s1", "ephemeral note", 0.4);
        apply(&mut state, &rec, 1, 0);
        state.apply_tombstone(rec.id, Some(1));

        assert!(!state.contains(&rec.id));
        assert!(state.user_ids_newest_first("u1").is_empty());
        assert!(state.session_ids_newest_first("s1").is_empty());
        assert_eq!(state.session_owner("s1"), None);
        // Postings filter through liveness even before pruning.
        assert!(state.posting("ephemeral").is_empty());
        state.prune_postings();
        assert_eq!(state.term_count(), 0);
    }

    #[test]
    fn test_reapply_is_idempotent() {
        let mut state = IndexState::default();
        let rec = record("u1", "s1", "replayed twice", 0.5);
        apply(&mut state, &rec, 1, 0);
        apply(&mut state, &rec, 1, 0);

        assert_eq!(state.live_count(), 1);
        assert_eq!(state.user_count("u1"), 1);
        assert_eq!(state.posting("replayed").len(), 1);
    }

    #[test]
    fn test_newest_first_ordering() {
        let mut state = IndexState::default();
        let mut older = record("u1", "s1", "first", 0.5);
        older.created_at = Utc::now() - chrono::Duration::hours(2);
        let newer = record("u1", "s1", "second", 0.5);
        apply(&mut state, &older, 1, 0);
        apply(&mut state, &newer, 1, 64);

        assert_eq!(
            state.user_ids_newest_first("u1"),
            vec![newer.id, older.id]
        );
    }

    #[test]
    fn test_compactable_detection() {
        let mut state = IndexState::default();
        let keep = record("u1", "s1", "keeper", 0.5);
        let gone = record("u1", "s1", "goner", 0.5);
        apply(&mut state, &keep, 1, 0);
        apply(&mut state, &gone, 1, 64);
        state.apply_tombstone(gone.id, Some(2));

        // Segment 1: 2 frames, 1 live → 0.5 live fraction.
        assert!(state.compactable_segments(2, 0.5).is_empty());
        let hits = state.compactable_segments(2, 0.6);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 1);
        assert_eq!(hits[0].1, vec![(keep.id, 0, 64)]);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut state = IndexState::default();
        let rec = record("u1", "s1", "durable fact", 0.7);
        apply(&mut state, &rec, 1, 0);
        state.set_last_seq(41);
        state.write_snapshot(dir.path()).unwrap();

        let loaded = IndexState::load_newest(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.last_seq, 41);
        assert!(loaded.contains(&rec.id));
        assert_eq!(loaded.posting("durable"), vec![(rec.id, 1)]);
    }

    #[test]
    fn test_snapshot_supersedes_older() {
        let dir = TempDir::new().unwrap();
        let mut state = IndexState::default();
        state.set_last_seq(1);
        state.write_snapshot(dir.path()).unwrap();
        state.set_last_seq(9);
        state.write_snapshot(dir.path()).unwrap();

        let snaps = list_snapshots(dir.path()).unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].0, 9);
    }
}
