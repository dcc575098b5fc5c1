//! Engine coordinator
//!
//! [`MindCache`] is the public façade: it owns configuration, the store, the
//! planner, the summarizer and the decay engine, runs the background decay
//! scheduler, and enforces the concurrency discipline — a striped per-user
//! write lock, lock-free reads, per-call deadlines, and request-id
//! idempotency for retried saves.

use chrono::Duration as ChronoDuration;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::MindCacheConfig;
use crate::constants::{DEDUP_MAX_ENTRIES, DEDUP_WINDOW_SECS, LOCK_STRIPES};
use crate::decay::{lowest_scored, DecayEngine, DecayStats};
use crate::errors::{MemoryError, Result};
use crate::query::{self, RecallFilter};
use crate::sessions::{SessionInfo, SessionMeta, SessionStore};
use crate::store::types::{MemoryId, MemoryRecord};
use crate::store::Store;
use crate::summarize::{summarize_session, SessionSummary};
use crate::validation;

// =============================================================================
// REQUEST / RESPONSE TYPES
// =============================================================================

/// Input to [`MindCache::save`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveRequest {
    pub user_id: String,
    pub session_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Defaults to 0.5.
    #[serde(default)]
    pub importance: Option<f32>,
    /// Explicit TTL; absent means the configured default governs expiry.
    #[serde(default)]
    pub ttl_hours: Option<u32>,
    /// Retried saves carrying the same request id return the original id
    /// instead of writing twice.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Per-call deadline.
    #[serde(default)]
    pub deadline: Option<Duration>,
}

/// Output of [`MindCache::recall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallResult {
    pub memories: Vec<MemoryRecord>,
    pub count: usize,
}

/// Output of [`MindCache::delete_session`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeleteSessionOutcome {
    pub memories_deleted: usize,
}

/// Runtime statistics aggregated across the store and indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub total_memories: usize,
    pub total_users: usize,
    pub total_terms: usize,
    pub segment_count: usize,
    pub segment_bytes: u64,
    pub last_decay: Option<DecayStats>,
}

// =============================================================================
// CONCURRENCY PRIMITIVES
// =============================================================================

/// Striped per-user write locks. Writers to different users only contend
/// when their stripes collide; readers never take these.
pub(crate) struct LockStripes {
    stripes: Vec<Mutex<()>>,
}

impl LockStripes {
    fn new(count: usize) -> Self {
        Self {
            stripes: (0..count).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, user_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    pub(crate) fn lock(&self, user_id: &str) -> MutexGuard<'_, ()> {
        self.stripe(user_id).lock()
    }

    fn lock_before(
        &self,
        user_id: &str,
        deadline: &Deadline,
        op: &str,
    ) -> Result<MutexGuard<'_, ()>> {
        match deadline.remaining() {
            None => Ok(self.stripe(user_id).lock()),
            Some(budget) => self
                .stripe(user_id)
                .try_lock_for(budget)
                .ok_or_else(|| MemoryError::Timeout(op.to_string())),
        }
    }
}

/// Per-call deadline. Checked at suspension points; once a durable write
/// begins it always completes, so a `Timeout` means no durable effect.
struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    fn new(budget: Option<Duration>) -> Self {
        Self {
            at: budget.map(|d| Instant::now() + d),
        }
    }

    fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn check(&self, op: &str) -> Result<()> {
        match self.at {
            Some(at) if Instant::now() >= at => Err(MemoryError::Timeout(op.to_string())),
            _ => Ok(()),
        }
    }
}

#[derive(Clone)]
struct DedupEntry {
    id: MemoryId,
    fingerprint: u64,
}

// =============================================================================
// ENGINE
// =============================================================================

struct EngineCore {
    config: Arc<MindCacheConfig>,
    clock: Arc<dyn Clock>,
    store: Arc<Store>,
    sessions: SessionStore,
    stripes: LockStripes,
    dedup: moka::sync::Cache<(String, String), DedupEntry>,
    decay: DecayEngine,
    last_decay: RwLock<Option<DecayStats>>,
    /// Serializes sweeps; an explicit `run_decay` racing the scheduler waits.
    decay_gate: Mutex<()>,
}

/// The memory engine. Construct with [`MindCache::open`]; everything else
/// hangs off this handle. Dropping it stops the scheduler and syncs state.
pub struct MindCache {
    core: Arc<EngineCore>,
    scheduler: Option<JoinHandle<()>>,
    shutdown: Arc<(Mutex<bool>, Condvar)>,
}

impl MindCache {
    /// Open a store with the system clock.
    pub fn open(config: MindCacheConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open a store with an injected clock. Decay, TTLs and timestamps all
    /// flow from it.
    pub fn open_with_clock(config: MindCacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let root = config.storage_path.clone();
        let config = Arc::new(config.freeze(&root)?);
        config.log();

        let store = Arc::new(Store::open(config.clone(), clock.clone())?);
        let sessions = SessionStore::open(&config.storage_path)?;
        let decay = DecayEngine::new(store.clone(), config.clone(), clock.clone());

        let dedup = moka::sync::Cache::builder()
            .max_capacity(DEDUP_MAX_ENTRIES)
            .time_to_live(Duration::from_secs(DEDUP_WINDOW_SECS))
            .build();

        let core = Arc::new(EngineCore {
            config: config.clone(),
            clock,
            store,
            sessions,
            stripes: LockStripes::new(LOCK_STRIPES),
            dedup,
            decay,
            last_decay: RwLock::new(None),
            decay_gate: Mutex::new(()),
        });

        let shutdown = Arc::new((Mutex::new(false), Condvar::new()));
        let scheduler = if config.auto_decay_enabled {
            Some(spawn_scheduler(core.clone(), shutdown.clone())?)
        } else {
            None
        };

        info!(
            memories = core.store.index().live_count(),
            "memory engine ready"
        );
        Ok(Self {
            core,
            scheduler,
            shutdown,
        })
    }

    // -------------------------------------------------------------------------
    // Public operations
    // -------------------------------------------------------------------------

    /// Persist a memory. Returns its id.
    pub fn save(&self, request: SaveRequest) -> Result<MemoryId> {
        self.core.save(request)
    }

    /// Multi-criterion recall: filters composed into an index plan, results
    /// ranked by the composite score and trimmed to the limit. Returned ids
    /// get their access metadata advanced (batched).
    pub fn recall(&self, filter: RecallFilter) -> Result<RecallResult> {
        self.core.recall(filter)
    }

    /// Fetch one memory, enforcing ownership.
    pub fn get(&self, user_id: &str, id: &MemoryId) -> Result<MemoryRecord> {
        validation::validate_principal("user_id", user_id)?;
        self.core.check_owner_of_memory(user_id, id)?;
        self.core.store.get(id)
    }

    /// Tombstone one memory, enforcing ownership.
    pub fn delete(&self, user_id: &str, id: &MemoryId) -> Result<()> {
        validation::validate_principal("user_id", user_id)?;
        let _guard = self.core.stripes.lock(user_id);
        self.core.check_owner_of_memory(user_id, id)?;
        self.core.store.delete(id)
    }

    /// Deterministic digest of one session.
    pub fn summarize(&self, session_id: &str) -> Result<SessionSummary> {
        validation::validate_principal("session_id", session_id)?;
        summarize_session(&self.core.store, session_id, self.core.clock.now())
    }

    /// Stream every memory a user owns, newest first. Corrupt records are
    /// logged, quarantined and skipped.
    pub fn export_user(&self, user_id: &str) -> Result<ExportIter> {
        validation::validate_principal("user_id", user_id)?;
        let ids = self.core.store.index().user_ids_newest_first(user_id);
        Ok(ExportIter {
            store: self.core.store.clone(),
            ids: ids.into_iter(),
        })
    }

    /// Create a named session. Memories may also create sessions implicitly
    /// by saving into a fresh session id.
    pub fn create_session(
        &self,
        user_id: &str,
        name: Option<String>,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<String> {
        validation::validate_principal("user_id", user_id)?;
        let metadata = metadata.unwrap_or_default();
        validation::validate_metadata(&metadata)?;

        let session_id = MemoryId::generate(self.core.clock.as_ref()).to_string();
        self.core.sessions.save(&SessionMeta {
            id: session_id.clone(),
            user_id: user_id.to_string(),
            name,
            metadata,
            created_at: self.core.clock.now(),
        })?;
        debug!(user_id, session_id, "created session");
        Ok(session_id)
    }

    /// All of a user's sessions, most recently active first.
    pub fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionInfo>> {
        validation::validate_principal("user_id", user_id)?;
        let index = self.core.store.index();
        self.core.sessions.list_for_user(&index, user_id)
    }

    /// Delete a session and all its memories.
    pub fn delete_session(
        &self,
        user_id: &str,
        session_id: &str,
        deadline: Option<Duration>,
    ) -> Result<DeleteSessionOutcome> {
        validation::validate_principal("user_id", user_id)?;
        validation::validate_principal("session_id", session_id)?;
        self.core.delete_session(user_id, session_id, deadline)
    }

    /// Run a decay sweep now. `force` also compacts every sealed segment
    /// holding dead frames.
    pub fn run_decay(&self, force: bool) -> Result<DecayStats> {
        self.core.run_decay(force)
    }

    /// Storage, index and last-decay statistics.
    pub fn stats(&self) -> Result<EngineStats> {
        let (segment_count, segment_bytes) = self.core.store.disk_usage()?;
        let index = self.core.store.index();
        Ok(EngineStats {
            total_memories: index.live_count(),
            total_users: index.users().len(),
            total_terms: index.term_count(),
            segment_count,
            segment_bytes,
            last_decay: self.core.last_decay.read().clone(),
        })
    }

    /// Flush batched state and write a snapshot without shutting down.
    pub fn flush(&self) -> Result<()> {
        self.core.store.snapshot_now()
    }

    /// The effective (frozen) configuration.
    pub fn config(&self) -> &MindCacheConfig {
        &self.core.config
    }
}

impl Drop for MindCache {
    fn drop(&mut self) {
        {
            let (lock, condvar) = &*self.shutdown;
            *lock.lock() = true;
            condvar.notify_all();
        }
        if let Some(handle) = self.scheduler.take() {
            let _ = handle.join();
        }
        if let Err(e) = self.core.store.close() {
            error!(error = %e, "final sync failed on shutdown");
        }
    }
}

impl EngineCore {
    fn save(&self, request: SaveRequest) -> Result<MemoryId> {
        validation::validate_principal("user_id", &request.user_id)?;
        validation::validate_principal("session_id", &request.session_id)?;
        validation::validate_content(&request.content)?;
        validation::validate_metadata(&request.metadata)?;
        let importance = request
            .importance
            .unwrap_or(crate::constants::DEFAULT_IMPORTANCE);
        validation::validate_importance(importance)?;
        if let Some(ttl) = request.ttl_hours {
            validation::validate_ttl_hours(ttl)?;
        }

        let deadline = Deadline::new(request.deadline);
        let dedup_key = request
            .request_id
            .as_ref()
            .map(|rid| (request.user_id.clone(), rid.clone()));
        let fingerprint = save_fingerprint(&request);

        if let Some(key) = &dedup_key {
            if let Some(hit) = self.dedup.get(key) {
                return dedup_result(&hit, fingerprint, &key.1);
            }
        }

        let _guard = self
            .stripes
            .lock_before(&request.user_id, &deadline, "save")?;

        // Re-check under the stripe: a concurrent retry may have won.
        if let Some(key) = &dedup_key {
            if let Some(hit) = self.dedup.get(key) {
                return dedup_result(&hit, fingerprint, &key.1);
            }
        }

        // Session ids never span users.
        if let Some(owner) = self
            .sessions
            .owner(&self.store.index(), &request.session_id)
        {
            if owner != request.user_id {
                return Err(MemoryError::Forbidden(format!(
                    "session {} belongs to another user",
                    request.session_id
                )));
            }
        }

        // Last deadline check before durable effects; eviction and the
        // append both run to completion once started.
        deadline.check("save")?;

        // The cap admits the new memory by evicting the lowest-scoring one
        // first; saves are never rejected for being over quota.
        let now = self.clock.now();
        while self.store.index().user_count(&request.user_id)
            >= self.config.max_memories_per_user
        {
            match lowest_scored(&self.store, &request.user_id, now) {
                Some(victim) => {
                    self.store.delete(&victim)?;
                    debug!(user = %request.user_id, %victim, "evicted to stay under cap");
                }
                None => break,
            }
        }

        let created_at = self.clock.now();
        let record = MemoryRecord {
            id: MemoryId::generate(self.clock.as_ref()),
            user_id: request.user_id.clone(),
            session_id: request.session_id.clone(),
            content: request.content.clone(),
            metadata: request.metadata.clone(),
            importance,
            created_at,
            expires_at: request
                .ttl_hours
                .map(|h| created_at + ChronoDuration::hours(h as i64)),
            last_accessed_at: created_at,
            access_count: 0,
            importance_at: created_at,
        };
        self.store.put(&record)?;

        if let Some(key) = dedup_key {
            self.dedup.insert(
                key,
                DedupEntry {
                    id: record.id,
                    fingerprint,
                },
            );
        }
        Ok(record.id)
    }

    fn recall(&self, filter: RecallFilter) -> Result<RecallResult> {
        filter.validate()?;
        let deadline = Deadline::new(filter.deadline);
        let now = self.clock.now();

        // The plan runs against a consistent index image; fetches happen
        // outside the read guard so appends are never blocked by a scan.
        let ranked = {
            let index = self.store.index();
            query::plan(&index, &filter, now)
        };

        let mut memories = Vec::with_capacity(ranked.len());
        let mut touched = Vec::with_capacity(ranked.len());
        for ranked_id in ranked {
            deadline.check("recall")?;
            match self.store.get(&ranked_id.id) {
                Ok(record) => {
                    touched.push(ranked_id.id);
                    memories.push(record);
                }
                // Quarantined and logged inside the store; scan continues.
                Err(MemoryError::CorruptRecord(_)) => continue,
                // Raced a concurrent delete.
                Err(MemoryError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        self.store.touch(&touched);
        let count = memories.len();
        Ok(RecallResult { memories, count })
    }

    fn delete_session(
        &self,
        user_id: &str,
        session_id: &str,
        deadline: Option<Duration>,
    ) -> Result<DeleteSessionOutcome> {
        let deadline = Deadline::new(deadline);

        match self.sessions.owner(&self.store.index(), session_id) {
            None => {
                return Err(MemoryError::NotFound(format!("session {session_id}")));
            }
            Some(owner) if owner != user_id => {
                return Err(MemoryError::Forbidden(format!(
                    "session {session_id} belongs to another user"
                )));
            }
            Some(_) => {}
        }

        let _guard = self.stripes.lock_before(user_id, &deadline, "delete_session")?;

        let ids = self.store.index().session_ids_newest_first(session_id);
        deadline.check("delete_session")?;

        let mut memories_deleted = 0usize;
        for id in ids {
            match self.store.delete(&id) {
                Ok(()) => memories_deleted += 1,
                Err(MemoryError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.sessions.delete(session_id)?;

        info!(user_id, session_id, memories_deleted, "deleted session");
        Ok(DeleteSessionOutcome { memories_deleted })
    }

    fn run_decay(&self, force: bool) -> Result<DecayStats> {
        let _gate = self.decay_gate.lock();
        let stats = self.decay.sweep(&self.stripes, force)?;
        *self.last_decay.write() = Some(stats.clone());
        self.store.snapshot_now()?;
        Ok(stats)
    }

    fn check_owner_of_memory(&self, user_id: &str, id: &MemoryId) -> Result<()> {
        match self.store.index().location(id) {
            None => Err(MemoryError::NotFound(format!("memory {id}"))),
            Some(loc) if loc.user_id != user_id => Err(MemoryError::Forbidden(format!(
                "memory {id} belongs to another user"
            ))),
            Some(_) => Ok(()),
        }
    }
}

fn dedup_result(hit: &DedupEntry, fingerprint: u64, request_id: &str) -> Result<MemoryId> {
    if hit.fingerprint == fingerprint {
        debug!(request_id, id = %hit.id, "request id replayed; returning original");
        Ok(hit.id)
    } else {
        Err(MemoryError::Conflict(format!(
            "request id {request_id} was already used with a different payload"
        )))
    }
}

/// Payload fingerprint for request-id dedup: identical retries are
/// idempotent, divergent reuse of an id is a conflict.
fn save_fingerprint(request: &SaveRequest) -> u64 {
    let mut hasher = DefaultHasher::new();
    request.session_id.hash(&mut hasher);
    request.content.hash(&mut hasher);
    if let Ok(encoded) = serde_json::to_string(&request.metadata) {
        encoded.hash(&mut hasher);
    }
    request
        .importance
        .unwrap_or(crate::constants::DEFAULT_IMPORTANCE)
        .to_bits()
        .hash(&mut hasher);
    request.ttl_hours.hash(&mut hasher);
    hasher.finish()
}

fn spawn_scheduler(
    core: Arc<EngineCore>,
    shutdown: Arc<(Mutex<bool>, Condvar)>,
) -> Result<JoinHandle<()>> {
    let tick = Duration::from_secs(core.config.access_flush_interval_secs.max(1));
    let sweep_every = Duration::from_secs(core.config.decay_interval_hours * 3600);

    std::thread::Builder::new()
        .name("mindcache-decay".to_string())
        .spawn(move || {
            let mut last_sweep = Instant::now();
            loop {
                {
                    let (lock, condvar) = &*shutdown;
                    let mut stop = lock.lock();
                    if *stop {
                        break;
                    }
                    condvar.wait_for(&mut stop, tick);
                    if *stop {
                        break;
                    }
                }

                core.store.flush_touches();
                if let Err(e) = core.store.maybe_snapshot() {
                    warn!(error = %e, "periodic snapshot failed");
                }
                if last_sweep.elapsed() >= sweep_every {
                    match core.run_decay(false) {
                        Ok(stats) => debug!(
                            expired = stats.expired,
                            evicted = stats.evicted,
                            "scheduled decay sweep done"
                        ),
                        Err(e) => warn!(error = %e, "scheduled decay sweep failed"),
                    }
                    last_sweep = Instant::now();
                }
            }
            debug!("decay scheduler stopped");
        })
        .map_err(|e| MemoryError::Internal(anyhow::anyhow!("spawn scheduler: {e}")))
}

/// Lazy stream over a user's memories, newest first.
pub struct ExportIter {
    store: Arc<Store>,
    ids: std::vec::IntoIter<MemoryId>,
}

impl Iterator for ExportIter {
    type Item = Result<MemoryRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.ids.next()?;
            match self.store.get(&id) {
                Ok(record) => return Some(Ok(record)),
                // Quarantined and logged inside the store; keep streaming.
                Err(MemoryError::CorruptRecord(_)) => continue,
                Err(MemoryError::NotFound(_)) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Convenience: does a path already hold a store?
pub fn store_exists(root: &Path) -> bool {
    root.join(crate::config::CONFIG_FILE).exists()
}
