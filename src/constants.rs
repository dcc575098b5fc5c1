//! Documented constants for the memory engine
//!
//! All fixed tunables in one place. Values that deployments may override at
//! runtime live in [`crate::config::MindCacheConfig`]; everything here is
//! compile-time.

// =============================================================================
// RECORD BOUNDS
// =============================================================================

/// Maximum UTF-8 content payload per memory (100 KiB).
pub const MAX_CONTENT_BYTES: usize = 100 * 1024;

/// Maximum encoded metadata size per memory (16 KiB).
pub const MAX_METADATA_BYTES: usize = 16 * 1024;

/// Maximum byte length of a user or session identifier.
pub const MAX_PRINCIPAL_BYTES: usize = 255;

/// Importance assigned when the caller does not provide one.
pub const DEFAULT_IMPORTANCE: f32 = 0.5;

// =============================================================================
// RANKING WEIGHTS
//
// score = 0.55·importance + 0.25·recency + 0.15·text + 0.05·access
//
// The same weights (with the text term forced to 0) rank eviction candidates
// and summary excerpts.
// =============================================================================

pub const SCORE_IMPORTANCE_WEIGHT: f32 = 0.55;
pub const SCORE_RECENCY_WEIGHT: f32 = 0.25;
pub const SCORE_TEXT_WEIGHT: f32 = 0.15;
pub const SCORE_ACCESS_WEIGHT: f32 = 0.05;

/// Half-life of the recency term: recency(Δ) = exp(−Δ / 14 days).
pub const RECENCY_HALF_LIFE_DAYS: f64 = 14.0;

/// BM25 saturation constant for the text-relevance term.
pub const BM25_K: f32 = 1.2;

// =============================================================================
// QUERY PLANNER
// =============================================================================

/// Result limit applied when the filter does not set one.
pub const DEFAULT_RECALL_LIMIT: usize = 50;

/// Hard ceiling on the result limit.
pub const MAX_RECALL_LIMIT: usize = 1000;

/// A date range narrower than this many days seeds the plan from the time
/// index instead of the user index.
pub const NARROW_RANGE_DAYS: i64 = 7;

/// Width of a time-index bucket in seconds (hourly).
pub const TIME_BUCKET_SECS: i64 = 3600;

/// Number of fixed-width importance buckets over [0, 1].
pub const IMPORTANCE_BUCKETS: u8 = 10;

// =============================================================================
// ANALYZER
// =============================================================================

/// Tokens shorter than this many characters are dropped.
pub const MIN_TOKEN_CHARS: usize = 2;

// =============================================================================
// DECAY
// =============================================================================

/// Half-life of importance attenuation applied by the decay sweep.
pub const IMPORTANCE_HALF_LIFE_DAYS: f64 = 30.0;

/// Minimum age before the low-importance sweep may tombstone a record.
pub const LOW_IMPORTANCE_MIN_AGE_DAYS: i64 = 7;

// =============================================================================
// SUMMARIZER
// =============================================================================

/// Number of key topics reported per session digest.
pub const KEY_TOPICS_K: usize = 5;

/// A topic term must occur in at least this many of the session's memories.
pub const TOPIC_MIN_MEMORIES: usize = 2;

/// Number of excerpt memories folded into the digest text.
pub const SUMMARY_EXCERPT_COUNT: usize = 3;

/// Each excerpt is truncated to this many characters.
pub const SUMMARY_EXCERPT_CHARS: usize = 240;

// =============================================================================
// COORDINATOR
// =============================================================================

/// Number of per-user lock stripes.
pub const LOCK_STRIPES: usize = 64;

/// Retry-idempotency window for request ids.
pub const DEDUP_WINDOW_SECS: u64 = 300;

/// Maximum entries held in the request-id dedup cache.
pub const DEDUP_MAX_ENTRIES: u64 = 100_000;

/// Backoff schedule for the I/O retry policy (two retries, then surface).
pub const IO_RETRY_BACKOFF_MS: [u64; 2] = [50, 200];

// =============================================================================
// CODEC SAFETY LIMITS
//
// Both caps bound decompression of a hostile or corrupted frame before any
// bytes reach the record decoder.
// =============================================================================

/// Maximum decompressed body size in bytes.
pub const MAX_DECOMPRESSED_SIZE: usize = 10 * 1024 * 1024;

/// Maximum allowed decompressed/compressed ratio.
pub const MAX_COMPRESSION_RATIO: usize = 100;
