//! Durable store facade
//!
//! Ties the codec, segment store and indexes together behind transactional
//! `put`/`get`/`delete`/`touch` operations and owns crash recovery: on open,
//! the newest index snapshot is loaded and manifests newer than it are
//! replayed, so a memory is either fully visible (record and all index
//! entries) or not visible at all.

pub mod codec;
pub mod index;
pub mod segment;
pub mod types;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::analyzer;
use crate::clock::Clock;
use crate::config::MindCacheConfig;
use crate::constants::IO_RETRY_BACKOFF_MS;
use crate::errors::{MemoryError, Result};

use codec::{CodecOptions, Frame};
use index::IndexState;
use segment::{ManifestKind, SegmentStore};
use types::{MemoryId, MemoryRecord, Tombstone};

/// Subdirectory names under the storage root.
const SEGMENTS_DIR: &str = "segments";
const INDEXES_DIR: &str = "indexes";

pub struct Store {
    config: Arc<MindCacheConfig>,
    clock: Arc<dyn Clock>,
    segments: SegmentStore,
    index: RwLock<IndexState>,
    snapshot_dir: PathBuf,

    /// Batched advisory access updates, flushed on an interval.
    touch_queue: Mutex<Vec<(MemoryId, DateTime<Utc>)>>,
    last_touch_flush: Mutex<DateTime<Utc>>,
    last_snapshot: Mutex<DateTime<Utc>>,

    /// Ids whose frames failed decoding; tombstoned by the next decay sweep.
    quarantine: Mutex<BTreeSet<MemoryId>>,
}

impl Store {
    /// Open (or create) the store under the configured root and recover
    /// state: newest snapshot, then manifest replay, then resume the active
    /// segment for append.
    pub fn open(config: Arc<MindCacheConfig>, clock: Arc<dyn Clock>) -> Result<Self> {
        let segments_dir = config.storage_path.join(SEGMENTS_DIR);
        let snapshot_dir = config.storage_path.join(INDEXES_DIR);
        std::fs::create_dir_all(&segments_dir)?;
        std::fs::create_dir_all(&snapshot_dir)?;

        let mut index = IndexState::load_newest(&snapshot_dir)?.unwrap_or_default();
        let snapshot_seq = index.last_seq;

        let entries = segment::read_all_manifests(&segments_dir)?;
        let next_seq = entries.last().map(|e| e.seq + 1).unwrap_or(0);
        let segments = SegmentStore::open(&segments_dir, config.segment_roll_bytes, next_seq)?;

        let mut replayed = 0usize;
        for entry in entries {
            if entry.seq < snapshot_seq {
                continue;
            }
            match entry.kind {
                ManifestKind::Put => {
                    let frame =
                        segments.read_frame(entry.segment_id, entry.offset, entry.len)?;
                    match codec::decode_frame(&frame) {
                        Ok(Frame::Put(record)) => {
                            let terms: BTreeMap<String, u32> =
                                analyzer::term_frequencies(&record.content)
                                    .into_iter()
                                    .collect();
                            index.apply_put(
                                &record,
                                &terms,
                                entry.segment_id,
                                entry.offset,
                                entry.len,
                            );
                        }
                        Ok(Frame::Tombstone(t)) => {
                            // Manifest said put but the frame is a tombstone;
                            // trust the frame.
                            index.apply_tombstone(t.id, Some(entry.segment_id));
                        }
                        Err(e) => {
                            warn!(
                                segment = entry.segment_id,
                                offset = entry.offset,
                                error = %e,
                                "skipping undecodable frame during replay"
                            );
                        }
                    }
                }
                ManifestKind::Tombstone => {
                    index.apply_tombstone(entry.record_id, Some(entry.segment_id));
                }
            }
            index.set_last_seq(entry.seq + 1);
            replayed += 1;
        }

        if replayed > 0 {
            info!(replayed, "replayed manifest entries into indexes");
            // Snapshot immediately: compaction may delete the manifests the
            // replayed entries came from, so they must be covered on disk
            // before any segment is rewritten.
            index.write_snapshot(&snapshot_dir)?;
        }

        let now = clock.now();
        Ok(Self {
            config,
            clock,
            segments,
            index: RwLock::new(index),
            snapshot_dir,
            touch_queue: Mutex::new(Vec::new()),
            last_touch_flush: Mutex::new(now),
            last_snapshot: Mutex::new(now),
            quarantine: Mutex::new(BTreeSet::new()),
        })
    }

    fn codec_options(&self) -> CodecOptions {
        CodecOptions {
            enable_compression: self.config.enable_compression,
            compression_threshold: self.config.compression_threshold_bytes,
        }
    }

    /// Append a record durably and index it. Callers hold the user stripe.
    pub fn put(&self, record: &MemoryRecord) -> Result<()> {
        let frame = codec::encode_record(record, self.codec_options())?;
        let outcome = with_io_retry("put", || {
            self.segments.append(record.id, ManifestKind::Put, &frame)
        })?;

        let terms: BTreeMap<String, u32> = analyzer::term_frequencies(&record.content)
            .into_iter()
            .collect();
        {
            let mut index = self.index.write();
            index.apply_put(record, &terms, outcome.segment_id, outcome.offset, outcome.len);
            index.set_last_seq(outcome.seq + 1);
        }

        if outcome.rolled {
            self.snapshot_now()?;
        } else {
            self.maybe_snapshot()?;
        }
        Ok(())
    }

    /// Fetch a record by id, overlaying the advisory access metadata and the
    /// current (possibly attenuated) importance from the index.
    pub fn get(&self, id: &MemoryId) -> Result<MemoryRecord> {
        // One retry: compaction may relocate the frame between the location
        // read and the segment read.
        for attempt in 0..2 {
            let Some(loc) = self.index.read().location(id).cloned() else {
                return Err(MemoryError::NotFound(format!("memory {id}")));
            };

            let frame = match with_io_retry("get", || {
                self.segments.read_frame(loc.segment_id, loc.offset, loc.len)
            }) {
                Ok(frame) => frame,
                Err(e) if attempt == 0 => {
                    debug!(%id, error = %e, "segment read raced a relocation; retrying");
                    continue;
                }
                Err(e) => return Err(e),
            };

            match codec::decode_frame(&frame) {
                Ok(Frame::Put(mut record)) if record.id == *id => {
                    record.importance = loc.importance;
                    record.importance_at = loc.importance_at;
                    record.access_count = loc.access_count;
                    record.last_accessed_at = loc.last_accessed_at;
                    return Ok(record);
                }
                Ok(_) => {
                    if attempt == 0 {
                        continue;
                    }
                    return Err(self.quarantine_corrupt(
                        *id,
                        loc.segment_id,
                        loc.offset,
                        "frame does not contain the expected record".to_string(),
                    ));
                }
                Err(MemoryError::CorruptRecord(detail)) => {
                    return Err(self.quarantine_corrupt(
                        *id,
                        loc.segment_id,
                        loc.offset,
                        detail,
                    ));
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("get loop always returns")
    }

    fn quarantine_corrupt(
        &self,
        id: MemoryId,
        segment_id: u64,
        offset: u64,
        detail: String,
    ) -> MemoryError {
        warn!(
            %id,
            segment = segment_id,
            offset,
            detail = %detail,
            "corrupt record quarantined for tombstoning on next decay sweep"
        );
        self.quarantine.lock().insert(id);
        MemoryError::CorruptRecord(format!("segment {segment_id} offset {offset}: {detail}"))
    }

    /// Append a tombstone for a live record. Callers hold the user stripe.
    pub fn delete(&self, id: &MemoryId) -> Result<()> {
        if !self.index.read().contains(id) {
            return Err(MemoryError::NotFound(format!("memory {id}")));
        }
        let frame = codec::encode_tombstone(&Tombstone { id: *id })?;
        let outcome = with_io_retry("delete", || {
            self.segments.append(*id, ManifestKind::Tombstone, &frame)
        })?;
        let mut index = self.index.write();
        index.apply_tombstone(*id, Some(outcome.segment_id));
        index.set_last_seq(outcome.seq + 1);
        Ok(())
    }

    /// Queue advisory access updates for a batch of recalled ids. The queue
    /// flushes once the flush interval has elapsed; crash loses at most one
    /// interval of access metadata by design.
    pub fn touch(&self, ids: &[MemoryId]) {
        if ids.is_empty() {
            return;
        }
        let now = self.clock.now();
        self.touch_queue
            .lock()
            .extend(ids.iter().map(|id| (*id, now)));

        let due = {
            let last = self.last_touch_flush.lock();
            now - *last
                >= ChronoDuration::seconds(self.config.access_flush_interval_secs as i64)
        };
        if due {
            self.flush_touches();
        }
    }

    /// Apply queued access updates to the index.
    pub fn flush_touches(&self) {
        let drained: Vec<(MemoryId, DateTime<Utc>)> =
            std::mem::take(&mut *self.touch_queue.lock());
        if drained.is_empty() {
            return;
        }
        let mut index = self.index.write();
        for (id, at) in drained {
            index.touch(id, at);
        }
        *self.last_touch_flush.lock() = self.clock.now();
    }

    /// Rewrite a record in place with new importance (decay attenuation).
    /// The new frame appends like any other put; the old frame becomes dead.
    pub fn rewrite_importance(&self, id: &MemoryId, importance: f32) -> Result<()> {
        let mut record = self.get(id)?;
        record.importance = importance;
        record.importance_at = self.clock.now();
        self.put(&record)
    }

    /// Ids quarantined by failed decodes since the last drain.
    pub fn drain_quarantine(&self) -> Vec<MemoryId> {
        let mut quarantine = self.quarantine.lock();
        let ids: Vec<MemoryId> = quarantine.iter().copied().collect();
        quarantine.clear();
        ids
    }

    /// Run compaction over every sealed segment below the live threshold.
    /// Returns how many segments were rewritten.
    pub fn compact_eligible(&self, live_threshold: f64) -> Result<u64> {
        let active = self.segments.active_segment_id();
        let candidates = {
            let index = self.index.read();
            index.compactable_segments(active, live_threshold)
        };

        let mut compacted = 0u64;
        for (segment_id, frames) in candidates {
            let relocations = with_io_retry("compact", || {
                self.segments.compact(segment_id, &frames)
            })?;
            let mut index = self.index.write();
            let mut next_seq = index.last_seq;
            for (id, outcome) in &relocations {
                index.relocate(id, outcome.segment_id, outcome.offset, outcome.len);
                next_seq = next_seq.max(outcome.seq + 1);
            }
            index.forget_segment(segment_id);
            index.set_last_seq(next_seq);
            compacted += 1;
        }

        if compacted > 0 {
            self.snapshot_now()?;
        }
        Ok(compacted)
    }

    /// Write an index snapshot now.
    pub fn snapshot_now(&self) -> Result<()> {
        self.flush_touches();
        self.index.write().write_snapshot(&self.snapshot_dir)?;
        *self.last_snapshot.lock() = self.clock.now();
        Ok(())
    }

    /// Write a snapshot if the snapshot interval has elapsed.
    pub fn maybe_snapshot(&self) -> Result<()> {
        let due = {
            let last = self.last_snapshot.lock();
            self.clock.now() - *last
                >= ChronoDuration::seconds(self.config.index_snapshot_interval_secs as i64)
        };
        if due {
            self.snapshot_now()?;
        }
        Ok(())
    }

    /// Shared read access for the planner, summarizer and decay engine.
    pub fn index(&self) -> RwLockReadGuard<'_, IndexState> {
        self.index.read()
    }

    /// Segment count and total bytes on disk.
    pub fn disk_usage(&self) -> Result<(usize, u64)> {
        self.segments.disk_usage()
    }

    /// Sync everything and write a final snapshot. Called on shutdown.
    pub fn close(&self) -> Result<()> {
        self.flush_touches();
        self.segments.sync()?;
        self.snapshot_now()
    }
}

/// Run a persistence operation, retrying `Io` failures on the fixed backoff
/// schedule before surfacing.
fn with_io_retry<T>(op_name: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0usize;
    loop {
        match op() {
            Err(e) if e.is_io() && attempt < IO_RETRY_BACKOFF_MS.len() => {
                let backoff = IO_RETRY_BACKOFF_MS[attempt];
                warn!(op = op_name, attempt, backoff_ms = backoff, error = %e, "I/O failure, retrying");
                std::thread::sleep(Duration::from_millis(backoff));
                attempt += 1;
            }
            other => return other,
        }
    }
}
