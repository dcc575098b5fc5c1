//! MindCache — persistent per-user memory for AI agents
//!
//! Every interaction is a *memory* belonging to a *session* belonging to a
//! *user*. The engine keeps the most salient memories cheaply recallable and
//! retires irrelevant ones automatically.
//!
//! # Key pieces
//! - Append-only segment store with crash-safe writes (fsync'd manifests)
//!   and background compaction
//! - Five secondary indexes: user, session, time, importance buckets, and an
//!   inverted term index
//! - A deterministic query planner composing filters into index
//!   intersections, ranked by a composite salience score
//! - A decay engine: TTL expiry, importance attenuation, low-importance
//!   sweeps and per-user caps on a schedule
//! - Deterministic session digests (statistics + TF-IDF topics + excerpt)
//!
//! # Quick start
//! ```no_run
//! use mindcache::{MindCache, MindCacheConfig, RecallFilter, SaveRequest};
//!
//! let engine = MindCache::open(MindCacheConfig::default())?;
//! engine.save(SaveRequest {
//!     user_id: "u1".into(),
//!     session_id: "s1".into(),
//!     content: "I learned about memory decay".into(),
//!     importance: Some(0.8),
//!     ..Default::default()
//! })?;
//!
//! let found = engine.recall(RecallFilter {
//!     user_id: "u1".into(),
//!     query: Some("decay".into()),
//!     ..Default::default()
//! })?;
//! assert_eq!(found.count, 1);
//! # Ok::<(), mindcache::MemoryError>(())
//! ```

pub mod analyzer;
pub mod clock;
pub mod config;
pub mod constants;
pub mod decay;
pub mod engine;
pub mod errors;
pub mod query;
pub mod sessions;
pub mod store;
pub mod summarize;
pub mod validation;

// Re-export dependencies so tests and downstream callers share versions.
pub use chrono;
pub use parking_lot;
pub use serde_json;
pub use uuid;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MindCacheConfig;
pub use decay::DecayStats;
pub use engine::{
    DeleteSessionOutcome, EngineStats, ExportIter, MindCache, RecallResult, SaveRequest,
};
pub use errors::{MemoryError, Result};
pub use query::RecallFilter;
pub use sessions::{SessionInfo, SessionMeta};
pub use store::types::{MemoryId, MemoryRecord};
pub use summarize::SessionSummary;
