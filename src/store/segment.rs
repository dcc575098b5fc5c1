//! Append-only segment files and their write manifests
//!
//! Durable storage is an ordered set of segments under `segments/`. Each
//! segment `NNNNNNNNNN.seg` is a run of codec frames; its sibling
//! `NNNNNNNNNN.manifest` is the fsync'd journal of every frame appended.
//!
//! The append path is: reserve offset → write frame → fsync segment → append
//! manifest entry → fsync manifest → acknowledge. On restart the manifests
//! are the authoritative record of which frames exist; anything written to a
//! segment without a synced manifest entry is invisible and gets overwritten
//! into irrelevance by compaction.

use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::errors::{MemoryError, Result};
use crate::store::types::MemoryId;

/// Operation recorded by a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestKind {
    Put,
    Tombstone,
}

/// One fsync'd journal line per appended frame. `seq` is a store-wide
/// monotone counter; index snapshots record the last applied seq so replay
/// knows where to resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub seq: u64,
    pub record_id: MemoryId,
    pub segment_id: u64,
    pub offset: u64,
    pub len: u32,
    pub kind: ManifestKind,
}

/// Result of a single append.
#[derive(Debug, Clone, Copy)]
pub struct AppendOutcome {
    pub segment_id: u64,
    pub offset: u64,
    pub len: u32,
    pub seq: u64,
    /// The active segment sealed and a new one opened during this append.
    pub rolled: bool,
}

struct Writer {
    active_id: u64,
    segment: File,
    manifest: File,
    offset: u64,
    next_seq: u64,
    next_segment_id: u64,
}

/// The segment store. A single writer handle guarded by a mutex; readers
/// open their own handles and never contend with each other.
pub struct SegmentStore {
    dir: PathBuf,
    roll_bytes: u64,
    writer: Mutex<Writer>,
}

impl SegmentStore {
    /// Open the store, resuming the highest-numbered segment for append.
    ///
    /// `next_seq` continues the manifest counter; callers derive it from
    /// [`read_all_manifests`] during recovery.
    pub fn open(dir: &Path, roll_bytes: u64, next_seq: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let ids = list_segment_ids(dir)?;
        let active_id = ids.last().copied().unwrap_or(1);
        let next_segment_id = active_id + 1;

        let segment = open_append(&segment_path(dir, active_id))?;
        let manifest = open_append(&manifest_path(dir, active_id))?;
        let offset = segment.metadata()?.len();

        debug!(
            active_id,
            offset, next_seq, "opened segment store for append"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            roll_bytes,
            writer: Mutex::new(Writer {
                active_id,
                segment,
                manifest,
                offset,
                next_seq,
                next_segment_id,
            }),
        })
    }

    /// Append one frame durably. The frame and its manifest entry are both
    /// synced before this returns.
    pub fn append(
        &self,
        record_id: MemoryId,
        kind: ManifestKind,
        frame: &[u8],
    ) -> Result<AppendOutcome> {
        let mut writer = self.writer.lock();

        let mut rolled = false;
        if writer.offset > 0 && writer.offset + frame.len() as u64 > self.roll_bytes {
            self.roll_locked(&mut writer)?;
            rolled = true;
        }

        let offset = writer.offset;
        writer
            .segment
            .write_all(frame)
            .map_err(|e| MemoryError::Io(format!("segment append: {e}")))?;
        writer
            .segment
            .sync_data()
            .map_err(|e| MemoryError::Io(format!("segment sync: {e}")))?;
        writer.offset += frame.len() as u64;

        let entry = ManifestEntry {
            seq: writer.next_seq,
            record_id,
            segment_id: writer.active_id,
            offset,
            len: frame.len() as u32,
            kind,
        };
        write_manifest_entry(&mut writer.manifest, &entry)?;
        writer.next_seq += 1;

        Ok(AppendOutcome {
            segment_id: entry.segment_id,
            offset,
            len: entry.len,
            seq: entry.seq,
            rolled,
        })
    }

    fn roll_locked(&self, writer: &mut Writer) -> Result<()> {
        writer.segment.sync_all()?;
        writer.manifest.sync_all()?;

        let new_id = writer.next_segment_id;
        writer.segment = open_append(&segment_path(&self.dir, new_id))?;
        writer.manifest = open_append(&manifest_path(&self.dir, new_id))?;
        writer.active_id = new_id;
        writer.next_segment_id = new_id + 1;
        writer.offset = 0;

        info!(segment_id = new_id, "sealed active segment, rolled to new");
        Ok(())
    }

    /// Read one frame back. Readers open a fresh handle; the writer lock is
    /// never taken.
    pub fn read_frame(&self, segment_id: u64, offset: u64, len: u32) -> Result<Vec<u8>> {
        let path = segment_path(&self.dir, segment_id);
        let mut file = File::open(&path)
            .map_err(|e| MemoryError::Io(format!("open {}: {e}", path.display())))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut frame = vec![0u8; len as usize];
        file.read_exact(&mut frame).map_err(|e| {
            MemoryError::Io(format!(
                "read segment {segment_id} offset {offset} len {len}: {e}"
            ))
        })?;
        Ok(frame)
    }

    /// Id of the segment currently receiving appends. Only sealed segments
    /// (id below this) are eligible for compaction.
    pub fn active_segment_id(&self) -> u64 {
        self.writer.lock().active_id
    }

    /// Rewrite a sealed segment keeping only the given live frames.
    ///
    /// Live frames are copied into a fresh segment with fresh manifest
    /// entries; both files are synced before the old pair is unlinked, so a
    /// crash at any point leaves either the old or the new copy fully
    /// recoverable. Returns the relocation for every copied record.
    pub fn compact(
        &self,
        segment_id: u64,
        live: &[(MemoryId, u64, u32)],
    ) -> Result<Vec<(MemoryId, AppendOutcome)>> {
        let mut writer = self.writer.lock();
        if segment_id >= writer.active_id {
            return Err(MemoryError::Internal(anyhow::anyhow!(
                "refusing to compact active segment {segment_id}"
            )));
        }

        let source_path = segment_path(&self.dir, segment_id);
        let mut source = File::open(&source_path)
            .map_err(|e| MemoryError::Io(format!("open {}: {e}", source_path.display())))?;

        let new_id = writer.next_segment_id;
        writer.next_segment_id = new_id + 1;
        let mut new_segment = open_append(&segment_path(&self.dir, new_id))?;
        let mut new_manifest = open_append(&manifest_path(&self.dir, new_id))?;

        let mut relocations = Vec::with_capacity(live.len());
        let mut new_offset = 0u64;
        for &(record_id, offset, len) in live {
            source.seek(SeekFrom::Start(offset))?;
            let mut frame = vec![0u8; len as usize];
            source.read_exact(&mut frame)?;
            new_segment.write_all(&frame)?;

            let entry = ManifestEntry {
                seq: writer.next_seq,
                record_id,
                segment_id: new_id,
                offset: new_offset,
                len,
                kind: ManifestKind::Put,
            };
            writer.next_seq += 1;
            write_manifest_entry_unsynced(&mut new_manifest, &entry)?;
            relocations.push((
                record_id,
                AppendOutcome {
                    segment_id: new_id,
                    offset: new_offset,
                    len,
                    seq: entry.seq,
                    rolled: false,
                },
            ));
            new_offset += len as u64;
        }

        new_segment.sync_all()?;
        new_manifest.sync_all()?;

        std::fs::remove_file(&source_path)?;
        std::fs::remove_file(manifest_path(&self.dir, segment_id))?;

        info!(
            old = segment_id,
            new = new_id,
            live = live.len(),
            "compacted segment"
        );
        Ok(relocations)
    }

    /// Total on-disk segment count and bytes, for stats.
    pub fn disk_usage(&self) -> Result<(usize, u64)> {
        let ids = list_segment_ids(&self.dir)?;
        let mut bytes = 0u64;
        for id in &ids {
            bytes += std::fs::metadata(segment_path(&self.dir, *id))
                .map(|m| m.len())
                .unwrap_or(0);
        }
        Ok((ids.len(), bytes))
    }

    /// Sync the active files. Called on shutdown.
    pub fn sync(&self) -> Result<()> {
        let writer = self.writer.lock();
        writer.segment.sync_all()?;
        writer.manifest.sync_all()?;
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .read(true)
        .open(path)
        .map_err(|e| MemoryError::Io(format!("open {}: {e}", path.display())))
}

pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:010}.seg"))
}

pub fn manifest_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:010}.manifest"))
}

/// Segment ids present on disk, ascending.
pub fn list_segment_ids(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".seg") {
            if let Ok(id) = stem.parse::<u64>() {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Read every manifest entry on disk, ascending by seq.
///
/// A torn tail (partial entry from a crash mid-write) terminates that
/// manifest; everything before it is intact because entries are only
/// acknowledged after fsync.
pub fn read_all_manifests(dir: &Path) -> Result<Vec<ManifestEntry>> {
    let mut entries = Vec::new();
    for id in list_segment_ids(dir)? {
        let path = manifest_path(dir, id);
        if !path.exists() {
            warn!(segment_id = id, "segment has no manifest; skipping");
            continue;
        }
        let bytes = std::fs::read(&path)
            .with_context(|| format!("read manifest {}", path.display()))
            .map_err(MemoryError::from)?;
        read_manifest_bytes(&bytes, &path, &mut entries);
    }
    entries.sort_by_key(|e| e.seq);
    Ok(entries)
}

fn read_manifest_bytes(bytes: &[u8], path: &Path, out: &mut Vec<ManifestEntry>) {
    let mut pos = 0usize;
    while pos + 4 <= bytes.len() {
        let len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        let body_end = pos + 4 + len;
        if body_end + 4 > bytes.len() {
            warn!(path = %path.display(), offset = pos, "torn manifest tail; stopping replay here");
            return;
        }
        let body = &bytes[pos + 4..body_end];
        let crc = u32::from_le_bytes(bytes[body_end..body_end + 4].try_into().unwrap());
        if crc32fast::hash(body) != crc {
            warn!(path = %path.display(), offset = pos, "manifest entry crc mismatch; stopping replay here");
            return;
        }
        match bincode::deserialize::<ManifestEntry>(body) {
            Ok(entry) => out.push(entry),
            Err(e) => {
                warn!(path = %path.display(), offset = pos, error = %e, "undecodable manifest entry; stopping replay here");
                return;
            }
        }
        pos = body_end + 4;
    }
}

fn write_manifest_entry(manifest: &mut File, entry: &ManifestEntry) -> Result<()> {
    write_manifest_entry_unsynced(manifest, entry)?;
    manifest
        .sync_data()
        .map_err(|e| MemoryError::Io(format!("manifest sync: {e}")))
}

fn write_manifest_entry_unsynced(manifest: &mut File, entry: &ManifestEntry) -> Result<()> {
    let body =
        bincode::serialize(entry).map_err(|e| MemoryError::Internal(anyhow::anyhow!(e)))?;
    let mut buf = Vec::with_capacity(body.len() + 8);
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    manifest
        .write_all(&buf)
        .map_err(|e| MemoryError::Io(format!("manifest append: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use tempfile::TempDir;

    fn new_id() -> MemoryId {
        MemoryId::generate(&SystemClock)
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::open(dir.path(), 1024 * 1024, 0).unwrap();

        let id = new_id();
        let frame = b"0123456789".to_vec();
        let outcome = store.append(id, ManifestKind::Put, &frame).unwrap();
        assert_eq!(outcome.offset, 0);

        let back = store
            .read_frame(outcome.segment_id, outcome.offset, outcome.len)
            .unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_segment_rolls_at_threshold() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::open(dir.path(), 4096, 0).unwrap();

        let mut rolled = false;
        for _ in 0..10 {
            let outcome = store
                .append(new_id(), ManifestKind::Put, &[7u8; 1000])
                .unwrap();
            rolled |= outcome.rolled;
        }
        assert!(rolled, "expected a roll after exceeding 4096 bytes");
        assert!(store.active_segment_id() > 1);
        assert!(list_segment_ids(dir.path()).unwrap().len() >= 2);
    }

    #[test]
    fn test_manifest_replay_sees_all_entries() {
        let dir = TempDir::new().unwrap();
        let ids: Vec<MemoryId> = (0..5).map(|_| new_id()).collect();
        {
            let store = SegmentStore::open(dir.path(), 1024 * 1024, 0).unwrap();
            for id in &ids {
                store.append(*id, ManifestKind::Put, &[1u8; 64]).unwrap();
            }
        }

        let entries = read_all_manifests(dir.path()).unwrap();
        assert_eq!(entries.len(), 5);
        for (entry, id) in entries.iter().zip(&ids) {
            assert_eq!(entry.record_id, *id);
            assert_eq!(entry.kind, ManifestKind::Put);
        }
        // Seqs are dense and ascending.
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_torn_manifest_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        {
            let store = SegmentStore::open(dir.path(), 1024 * 1024, 0).unwrap();
            store.append(new_id(), ManifestKind::Put, &[1u8; 32]).unwrap();
            store.append(new_id(), ManifestKind::Put, &[2u8; 32]).unwrap();
        }

        // Simulate a crash mid manifest write.
        let path = manifest_path(dir.path(), 1);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0x55, 0x00, 0x00, 0x00, 0xAA]);
        std::fs::write(&path, bytes).unwrap();

        let entries = read_all_manifests(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_compaction_drops_dead_frames() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::open(dir.path(), 2048, 0).unwrap();

        let keep = new_id();
        let drop_ = new_id();
        let kept = store
            .append(keep, ManifestKind::Put, b"keep-this-frame!")
            .unwrap();
        store
            .append(drop_, ManifestKind::Put, b"drop-this-frame!")
            .unwrap();
        // Force a roll so segment 1 seals.
        store
            .append(new_id(), ManifestKind::Put, &[0u8; 2048])
            .unwrap();
        assert!(store.active_segment_id() > 1);

        let relocations = store
            .compact(1, &[(keep, kept.offset, kept.len)])
            .unwrap();
        assert_eq!(relocations.len(), 1);
        let (_, moved) = relocations[0];
        let frame = store
            .read_frame(moved.segment_id, moved.offset, moved.len)
            .unwrap();
        assert_eq!(frame, b"keep-this-frame!");
        assert!(!segment_path(dir.path(), 1).exists());
    }
}
