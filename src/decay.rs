//! Decay engine
//!
//! A periodic sweep over every user, in lexicographic order, under that
//! user's write stripe:
//!
//! 1. TTL expiry (explicit `expires_at`, or the default TTL for records
//!    without one)
//! 2. importance attenuation — `importance · exp(−Δ/30d)` measured from the
//!    record's last importance write, rewritten only when the importance
//!    bucket changes
//! 3. low-importance sweep (below threshold, never accessed, older than a
//!    week)
//! 4. per-user cap enforcement by lowest composite score
//! 5. segment compaction for anything the sweep pushed below the live
//!    threshold
//!
//! Step 2's anchor makes the sweep idempotent: two runs at the same wall
//! clock attenuate nothing the second time.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::MindCacheConfig;
use crate::constants::{IMPORTANCE_HALF_LIFE_DAYS, LOW_IMPORTANCE_MIN_AGE_DAYS};
use crate::engine::LockStripes;
use crate::errors::Result;
use crate::query::textless_score;
use crate::store::types::{importance_bucket, MemoryId};
use crate::store::Store;

/// Outcome of one decay sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayStats {
    /// Memories examined.
    pub scanned: u64,
    /// Tombstoned by TTL expiry.
    pub expired: u64,
    /// Rewritten with attenuated importance.
    pub attenuated: u64,
    /// Tombstoned by the low-importance sweep or the per-user cap.
    pub evicted: u64,
    /// Segments compacted as a result of this sweep.
    pub compacted: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub(crate) struct DecayEngine {
    store: Arc<Store>,
    config: Arc<MindCacheConfig>,
    clock: Arc<dyn Clock>,
}

impl DecayEngine {
    pub fn new(store: Arc<Store>, config: Arc<MindCacheConfig>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    /// Run one full sweep. `force` compacts every sealed segment holding any
    /// dead frame, regardless of the live-fraction threshold.
    pub fn sweep(&self, stripes: &LockStripes, force: bool) -> Result<DecayStats> {
        // Pending access updates shield recently-recalled records from the
        // low-importance sweep.
        self.store.flush_touches();

        let started_at = self.clock.now();
        let mut stats = DecayStats {
            scanned: 0,
            expired: 0,
            attenuated: 0,
            evicted: 0,
            compacted: 0,
            started_at,
            finished_at: started_at,
        };

        // Records quarantined by failed decodes self-heal first.
        for id in self.store.drain_quarantine() {
            let owner = self.store.index().location(&id).map(|l| l.user_id.clone());
            if let Some(user) = owner {
                let _guard = stripes.lock(&user);
                if self.store.delete(&id).is_ok() {
                    info!(%id, user, "tombstoned quarantined corrupt record");
                    stats.evicted += 1;
                }
            }
        }

        let users = self.store.index().users();
        for user in users {
            let _guard = stripes.lock(&user);
            self.sweep_user(&user, &mut stats)?;
        }

        let deletions = stats.expired + stats.evicted;
        let threshold = if force || deletions >= self.config.compaction_min_evictions {
            1.0
        } else {
            self.config.compaction_threshold
        };
        stats.compacted = self.store.compact_eligible(threshold)?;

        stats.finished_at = self.clock.now();
        info!(
            scanned = stats.scanned,
            expired = stats.expired,
            attenuated = stats.attenuated,
            evicted = stats.evicted,
            compacted = stats.compacted,
            "decay sweep finished"
        );
        Ok(stats)
    }

    fn sweep_user(&self, user: &str, stats: &mut DecayStats) -> Result<()> {
        let now = self.clock.now();
        let ids = self.store.index().user_ids_newest_first(user);
        stats.scanned += ids.len() as u64;

        let default_ttl = Duration::hours(self.config.default_memory_ttl_hours as i64);

        for id in ids {
            let Some(loc) = self.store.index().location(&id).cloned() else {
                continue;
            };

            // 1. TTL expiry.
            let expiry = loc.expires_at.unwrap_or(loc.created_at + default_ttl);
            if expiry <= now {
                self.store.delete(&id)?;
                debug!(%id, user, "expired by ttl");
                stats.expired += 1;
                continue;
            }

            // 2. Importance attenuation, rewritten only on bucket change.
            let days = (now - loc.importance_at).num_milliseconds().max(0) as f64
                / 86_400_000.0;
            let effective =
                (loc.importance as f64 * (-days / IMPORTANCE_HALF_LIFE_DAYS).exp()) as f32;
            let effective = effective.max(0.0);
            let mut importance = loc.importance;
            if importance_bucket(effective) != importance_bucket(loc.importance) {
                self.store.rewrite_importance(&id, effective)?;
                importance = effective;
                stats.attenuated += 1;
            }

            // 3. Low-importance sweep.
            let age_days = (now - loc.created_at).num_days();
            if importance < self.config.importance_threshold
                && loc.access_count == 0
                && age_days > LOW_IMPORTANCE_MIN_AGE_DAYS
            {
                self.store.delete(&id)?;
                debug!(%id, user, importance, "swept low-importance record");
                stats.evicted += 1;
            }
        }

        // 4. Per-user cap.
        while self.store.index().user_count(user) > self.config.max_memories_per_user {
            match lowest_scored(&self.store, user, now) {
                Some(id) => {
                    self.store.delete(&id)?;
                    debug!(%id, user, "evicted over per-user cap");
                    stats.evicted += 1;
                }
                None => break,
            }
        }

        Ok(())
    }
}

/// The user's record with the lowest textless composite score — the next
/// eviction candidate under the per-user cap.
pub(crate) fn lowest_scored(store: &Store, user: &str, now: DateTime<Utc>) -> Option<MemoryId> {
    let index = store.index();
    let mut worst: Option<(f32, MemoryId)> = None;
    for id in index.user_ids_newest_first(user) {
        let Some(loc) = index.location(&id) else {
            continue;
        };
        let score = textless_score(loc, now);
        let replace = match worst {
            Some((worst_score, _)) => score < worst_score,
            None => true,
        };
        if replace {
            worst = Some((score, id));
        }
    }
    if worst.is_none() {
        warn!(user, "cap eviction found no candidates");
    }
    worst.map(|(_, id)| id)
}
