//! Crash recovery, corruption isolation and compaction tests
//!
//! Restart paths: snapshot + manifest replay, manifest-only recovery,
//! corrupt-frame quarantine with decay self-healing, and content
//! preservation across compaction.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use mindcache::{MindCache, MindCacheConfig, RecallFilter, SaveRequest};

// ============================================================================
// TEST INFRASTRUCTURE
// ============================================================================

fn test_config(dir: &Path) -> MindCacheConfig {
    MindCacheConfig {
        storage_path: dir.to_path_buf(),
        auto_decay_enabled: false,
        ..Default::default()
    }
}

fn save(engine: &MindCache, user: &str, content: &str) -> mindcache::MemoryId {
    engine
        .save(SaveRequest {
            user_id: user.to_string(),
            // Session ids never span users.
            session_id: format!("{user}-s1"),
            content: content.to_string(),
            ..Default::default()
        })
        .expect("Failed to save memory")
}

fn delete_snapshots(dir: &Path) {
    let indexes = dir.join("indexes");
    if let Ok(entries) = fs::read_dir(indexes) {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().ends_with(".idx") {
                fs::remove_file(entry.path()).unwrap();
            }
        }
    }
}

fn only_segment_file(dir: &Path) -> std::path::PathBuf {
    let mut segs: Vec<_> = fs::read_dir(dir.join("segments"))
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().ends_with(".seg"))
        .map(|e| e.path())
        .collect();
    segs.sort();
    assert_eq!(segs.len(), 1, "expected exactly one segment");
    segs.remove(0)
}

// ============================================================================
// RESTART RECOVERY
// ============================================================================

#[test]
fn test_clean_restart_preserves_everything() {
    let dir = TempDir::new().unwrap();
    let id;
    {
        let engine = MindCache::open(test_config(dir.path())).unwrap();
        id = save(&engine, "u1", "survives a clean restart");
        save(&engine, "u1", "so does this one");
    }

    let engine = MindCache::open(test_config(dir.path())).unwrap();
    let result = engine.recall(RecallFilter::for_user("u1")).unwrap();
    assert_eq!(result.count, 2);
    assert_eq!(
        engine.get("u1", &id).unwrap().content,
        "survives a clean restart"
    );
}

#[test]
fn test_recovery_without_snapshot_uses_manifests() {
    let dir = TempDir::new().unwrap();
    {
        let engine = MindCache::open(test_config(dir.path())).unwrap();
        save(&engine, "u1", "acknowledged before the crash");
        save(&engine, "u2", "from another user");
    }
    // Simulate dying before any index snapshot landed.
    delete_snapshots(dir.path());

    let engine = MindCache::open(test_config(dir.path())).unwrap();
    assert_eq!(engine.recall(RecallFilter::for_user("u1")).unwrap().count, 1);
    assert_eq!(engine.recall(RecallFilter::for_user("u2")).unwrap().count, 1);

    // Full-text recovery too: terms were reindexed from the frames.
    let result = engine
        .recall(RecallFilter {
            user_id: "u1".into(),
            query: Some("acknowledged".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(result.count, 1);
}

#[test]
fn test_deletes_replay_after_restart() {
    let dir = TempDir::new().unwrap();
    let kept;
    {
        let engine = MindCache::open(test_config(dir.path())).unwrap();
        let doomed = save(&engine, "u1", "deleted before crash");
        kept = save(&engine, "u1", "still here");
        engine.delete("u1", &doomed).unwrap();
    }
    delete_snapshots(dir.path());

    let engine = MindCache::open(test_config(dir.path())).unwrap();
    let result = engine.recall(RecallFilter::for_user("u1")).unwrap();
    assert_eq!(result.count, 1);
    assert_eq!(result.memories[0].id, kept);
}

#[test]
fn test_torn_segment_tail_is_invisible() {
    let dir = TempDir::new().unwrap();
    {
        let engine = MindCache::open(test_config(dir.path())).unwrap();
        save(&engine, "u1", "fully acknowledged");
    }
    // A crash mid-append leaves frame bytes without a manifest entry.
    let seg = only_segment_file(dir.path());
    let mut bytes = fs::read(&seg).unwrap();
    bytes.extend_from_slice(b"MCR1\x01\x00garbage-half-frame");
    fs::write(&seg, bytes).unwrap();
    delete_snapshots(dir.path());

    let engine = MindCache::open(test_config(dir.path())).unwrap();
    let result = engine.recall(RecallFilter::for_user("u1")).unwrap();
    assert_eq!(result.count, 1);
    assert_eq!(result.memories[0].content, "fully acknowledged");
}

// ============================================================================
// CORRUPTION ISOLATION AND SELF-HEALING
// ============================================================================

#[test]
fn test_corrupt_record_is_isolated_and_self_heals() {
    let dir = TempDir::new().unwrap();
    let (good, bad);
    {
        let engine = MindCache::open(test_config(dir.path())).unwrap();
        good = save(&engine, "u1", "intact record");
        bad = save(&engine, "u1", "this frame will rot");
        // Drop writes a snapshot, so reopen recovers locations from it and
        // never re-decodes the frames.
    }

    // Flip a byte inside the last frame's CRC trailer.
    let seg = only_segment_file(dir.path());
    let mut bytes = fs::read(&seg).unwrap();
    let last = bytes.len() - 2;
    bytes[last] ^= 0xFF;
    fs::write(&seg, bytes).unwrap();

    let engine = MindCache::open(test_config(dir.path())).unwrap();

    // The scan skips the bad record and keeps going.
    let result = engine.recall(RecallFilter::for_user("u1")).unwrap();
    assert_eq!(result.count, 1);
    assert_eq!(result.memories[0].id, good);

    // Direct access reports the corruption.
    let err = engine.get("u1", &bad).unwrap_err();
    assert_eq!(err.code(), "CORRUPT_RECORD");
    assert_eq!(err.exit_code(), 5);

    // The next sweep tombstones the quarantined id: the store self-heals.
    let stats = engine.run_decay(false).unwrap();
    assert!(stats.evicted >= 1);
    assert_eq!(engine.get("u1", &bad).unwrap_err().code(), "NOT_FOUND");
    assert_eq!(engine.recall(RecallFilter::for_user("u1")).unwrap().count, 1);
}

// ============================================================================
// COMPACTION
// ============================================================================

#[test]
fn test_compaction_preserves_live_content() {
    let dir = TempDir::new().unwrap();
    let engine = MindCache::open(MindCacheConfig {
        // Small segments so deletions strand sealed, mostly-dead segments.
        segment_roll_bytes: 4096,
        ..test_config(dir.path())
    })
    .unwrap();

    let mut kept = Vec::new();
    let mut doomed = Vec::new();
    for i in 0..12 {
        let content = format!("note {i} {}", "filler ".repeat(100));
        let id = save(&engine, "u1", &content);
        if i % 2 == 0 {
            doomed.push(id);
        } else {
            kept.push((id, content));
        }
    }
    for id in &doomed {
        engine.delete("u1", id).unwrap();
    }

    let before = engine.stats().unwrap();
    let stats = engine.run_decay(true).unwrap();
    assert!(stats.compacted >= 1, "expected at least one compaction");

    // Every live record reads back identically.
    for (id, content) in &kept {
        assert_eq!(engine.get("u1", id).unwrap().content, *content);
    }
    let after = engine.stats().unwrap();
    assert!(after.segment_bytes < before.segment_bytes);
    assert_eq!(after.total_memories, kept.len());
}

#[test]
fn test_restart_after_compaction() {
    let dir = TempDir::new().unwrap();
    let mut kept = Vec::new();
    {
        let engine = MindCache::open(MindCacheConfig {
            segment_roll_bytes: 4096,
            ..test_config(dir.path())
        })
        .unwrap();
        for i in 0..12 {
            let content = format!("durable {i} {}", "pad ".repeat(120));
            let id = save(&engine, "u1", &content);
            if i % 2 == 1 {
                kept.push((id, content));
            } else {
                engine.delete("u1", &id).unwrap();
            }
        }
        engine.run_decay(true).unwrap();
    }

    let engine = MindCache::open(MindCacheConfig {
        segment_roll_bytes: 4096,
        ..test_config(dir.path())
    })
    .unwrap();
    for (id, content) in &kept {
        assert_eq!(engine.get("u1", id).unwrap().content, *content);
    }
}

// ============================================================================
// CONFIG FREEZING
// ============================================================================

#[test]
fn test_frozen_config_wins_on_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let engine = MindCache::open(MindCacheConfig {
            max_memories_per_user: 123,
            ..test_config(dir.path())
        })
        .unwrap();
        assert_eq!(engine.config().max_memories_per_user, 123);
    }

    // Different knobs on reopen lose to the frozen file.
    let engine = MindCache::open(MindCacheConfig {
        max_memories_per_user: 999,
        ..test_config(dir.path())
    })
    .unwrap();
    assert_eq!(engine.config().max_memories_per_user, 123);
}
