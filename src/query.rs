//! Query planner for recall
//!
//! Composes the user/session/time/importance/full-text filters into an index
//! intersection plan, scores the survivors and trims to the limit. Plan
//! construction is deterministic: the seed set comes from the most selective
//! index available (session > narrow time range > user), then the remaining
//! filters intersect and exact-check against record locations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::analyzer;
use crate::constants::{
    BM25_K, DEFAULT_RECALL_LIMIT, MAX_RECALL_LIMIT, NARROW_RANGE_DAYS,
    SCORE_ACCESS_WEIGHT, SCORE_IMPORTANCE_WEIGHT, SCORE_RECENCY_WEIGHT,
    SCORE_TEXT_WEIGHT,
};
use crate::errors::{MemoryError, Result};
use crate::store::index::{IndexState, RecordLocation};
use crate::store::types::{importance_bucket, MemoryId};
use crate::validation::validate_principal;

/// Multi-criterion recall filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecallFilter {
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub date_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_to: Option<DateTime<Utc>>,
    /// Free-form query; tokenized and ANDed after stopword removal.
    #[serde(default)]
    pub query: Option<String>,
    /// Explicit keywords; AND semantics across all of them.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub min_importance: Option<f32>,
    /// Default 50, capped at 1000.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Per-call deadline.
    #[serde(default)]
    pub deadline: Option<Duration>,
}

impl RecallFilter {
    /// Convenience constructor for the common user-scoped recall.
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_RECALL_LIMIT)
            .clamp(1, MAX_RECALL_LIMIT)
    }

    pub fn validate(&self) -> Result<()> {
        validate_principal("user_id", &self.user_id)?;
        if let Some(session_id) = &self.session_id {
            validate_principal("session_id", session_id)?;
        }
        if let Some(min) = self.min_importance {
            if !min.is_finite() || !(0.0..=1.0).contains(&min) {
                return Err(MemoryError::invalid(
                    "min_importance",
                    "must be within [0.0, 1.0]",
                ));
            }
        }
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                return Err(MemoryError::invalid(
                    "date_from",
                    "must not be after date_to",
                ));
            }
        }
        Ok(())
    }

    fn has_narrow_range(&self) -> bool {
        match (self.date_from, self.date_to) {
            (Some(from), Some(to)) => (to - from).num_days() < NARROW_RANGE_DAYS,
            _ => false,
        }
    }

    /// Query and keyword text folded into one AND term set.
    fn terms(&self) -> BTreeSet<String> {
        let mut terms = BTreeSet::new();
        if let Some(query) = &self.query {
            terms.extend(analyzer::tokenize(query));
        }
        for keyword in &self.keywords {
            terms.extend(analyzer::tokenize(keyword));
        }
        terms
    }
}

/// A planned result: id plus its composite score.
#[derive(Debug, Clone, Copy)]
pub struct RankedId {
    pub id: MemoryId,
    pub score: f32,
}

/// Build and execute the plan against an index image. Returns ranked ids,
/// best first, already trimmed to the filter limit.
pub fn plan(index: &IndexState, filter: &RecallFilter, now: DateTime<Utc>) -> Vec<RankedId> {
    let user = filter.user_id.as_str();

    // Seed from the most selective index available.
    let seeded_from_time;
    let mut candidates: BTreeSet<MemoryId> = if let Some(session) = &filter.session_id {
        seeded_from_time = false;
        if index.session_owner(session) != Some(user) {
            return Vec::new();
        }
        index.session_ids_newest_first(session).into_iter().collect()
    } else if filter.has_narrow_range() {
        seeded_from_time = true;
        index.time_range_ids(
            user,
            filter.date_from.unwrap_or(now),
            filter.date_to.unwrap_or(now),
        )
    } else {
        seeded_from_time = false;
        index.user_ids_newest_first(user).into_iter().collect()
    };

    if candidates.is_empty() {
        return Vec::new();
    }

    // Importance buckets ⌊10·min⌋..=9, followed by the exact threshold check.
    if let Some(min) = filter.min_importance {
        if min > 0.0 {
            let floor_bucket = importance_bucket(min);
            let eligible = index.importance_ids(user, floor_bucket);
            candidates.retain(|id| eligible.contains(id));
        }
    }

    // Time buckets, when a full range exists and was not already the seed.
    if !seeded_from_time {
        if let (Some(from), Some(to)) = (filter.date_from, filter.date_to) {
            let eligible = index.time_range_ids(user, from, to);
            candidates.retain(|id| eligible.contains(id));
        }
    }

    // Full text: AND across all terms. Zero terms after tokenization is a
    // no-op, not an error.
    let terms = filter.terms();
    let mut term_hits: HashMap<MemoryId, Vec<(u32, usize)>> = HashMap::new();
    if !terms.is_empty() {
        for term in &terms {
            let posting = index.posting(term);
            let df = posting.len();
            let hits: HashMap<MemoryId, u32> = posting.into_iter().collect();
            candidates.retain(|id| hits.contains_key(id));
            if candidates.is_empty() {
                return Vec::new();
            }
            for id in &candidates {
                term_hits.entry(*id).or_default().push((hits[id], df));
            }
        }
        // Drop hit lists for ids eliminated by later terms.
        term_hits.retain(|id, hits| candidates.contains(id) && hits.len() == terms.len());
    }

    // Exact checks and scoring off the location map.
    let has_text = !terms.is_empty();
    let total_docs = index.live_count().max(1);
    let mut ranked: Vec<(RankedId, DateTime<Utc>)> = Vec::with_capacity(candidates.len());
    for id in candidates {
        let Some(loc) = index.location(&id) else {
            continue;
        };
        if loc.user_id != user {
            continue;
        }
        if let Some(min) = filter.min_importance {
            if loc.importance < min {
                continue;
            }
        }
        if let Some(from) = filter.date_from {
            if loc.created_at < from {
                continue;
            }
        }
        if let Some(to) = filter.date_to {
            if loc.created_at > to {
                continue;
            }
        }

        let text_relevance = if has_text {
            bm25_lite(term_hits.get(&id).map(Vec::as_slice).unwrap_or(&[]), total_docs)
        } else {
            0.0
        };
        let score = composite_score(loc, now, text_relevance);
        ranked.push((RankedId { id, score }, loc.created_at));
    }

    // Score desc, created_at desc, id asc.
    ranked.sort_by(|(a, a_at), (b, b_at)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b_at.cmp(a_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked.truncate(filter.effective_limit());
    ranked.into_iter().map(|(r, _)| r).collect()
}

/// Composite ranking score.
///
/// `score = 0.55·importance + 0.25·recency + 0.15·text + 0.05·access`
pub fn composite_score(loc: &RecordLocation, now: DateTime<Utc>, text_relevance: f32) -> f32 {
    SCORE_IMPORTANCE_WEIGHT * loc.importance
        + SCORE_RECENCY_WEIGHT * recency_decay(now, loc.created_at)
        + SCORE_TEXT_WEIGHT * text_relevance
        + SCORE_ACCESS_WEIGHT * access_weight(loc.access_count)
}

/// Ranking score with the text term forced to zero. Used for eviction
/// ordering and summary excerpts.
pub fn textless_score(loc: &RecordLocation, now: DateTime<Utc>) -> f32 {
    composite_score(loc, now, 0.0)
}

/// recency(Δ) = exp(−Δ / half_life), half-life 14 days.
pub fn recency_decay(now: DateTime<Utc>, created_at: DateTime<Utc>) -> f32 {
    let age_days = (now - created_at).num_milliseconds().max(0) as f64 / 86_400_000.0;
    (-age_days / crate::constants::RECENCY_HALF_LIFE_DAYS).exp() as f32
}

/// access_weight(n) = 1 − 1/(1+n).
pub fn access_weight(access_count: u32) -> f32 {
    1.0 - 1.0 / (1.0 + access_count as f32)
}

/// BM25-lite over the matched terms, normalized into [0, 1]:
/// Σ idf·tf/(tf+k) over Σ idf.
fn bm25_lite(hits: &[(u32, usize)], total_docs: usize) -> f32 {
    if hits.is_empty() {
        return 0.0;
    }
    let mut numerator = 0.0f32;
    let mut denominator = 0.0f32;
    for &(tf, df) in hits {
        let idf =
            (1.0 + (total_docs as f32 - df as f32 + 0.5) / (df as f32 + 0.5)).ln();
        numerator += idf * (tf as f32 / (tf as f32 + BM25_K));
        denominator += idf;
    }
    if denominator <= 0.0 {
        0.0
    } else {
        (numerator / denominator).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::types::MemoryRecord;
    use serde_json::Map;
    use std::collections::BTreeMap;

    fn insert(
        index: &mut IndexState,
        user: &str,
        session: &str,
        content: &str,
        importance: f32,
        created_at: DateTime<Utc>,
        offset: u64,
    ) -> MemoryId {
        let record = MemoryRecord {
            id: MemoryId::generate(&SystemClock),
            user_id: user.to_string(),
            session_id: session.to_string(),
            content: content.to_string(),
            metadata: Map::new(),
            importance,
            created_at,
            expires_at: None,
            last_accessed_at: created_at,
            access_count: 0,
            importance_at: created_at,
        };
        let terms: BTreeMap<String, u32> =
            analyzer::term_frequencies(content).into_iter().collect();
        index.apply_put(&record, &terms, 1, offset, 64);
        record.id
    }

    #[test]
    fn test_user_seed_and_text_and() {
        let mut index = IndexState::default();
        let now = Utc::now();
        let hit = insert(&mut index, "u1", "s1", "rust borrow checker", 0.5, now, 0);
        insert(&mut index, "u1", "s1", "pizza night", 0.5, now, 64);
        insert(&mut index, "u2", "s2", "rust elsewhere", 0.5, now, 128);

        let filter = RecallFilter {
            user_id: "u1".into(),
            query: Some("rust checker".into()),
            ..Default::default()
        };
        let ranked = plan(&index, &filter, now);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id, hit);
    }

    #[test]
    fn test_min_importance_ordering() {
        let mut index = IndexState::default();
        let now = Utc::now();
        insert(&mut index, "u1", "s1", "low", 0.2, now, 0);
        let mid = insert(&mut index, "u1", "s1", "mid", 0.5, now, 64);
        let high = insert(&mut index, "u1", "s1", "high", 0.9, now, 128);

        let filter = RecallFilter {
            user_id: "u1".into(),
            min_importance: Some(0.4),
            ..Default::default()
        };
        let ranked = plan(&index, &filter, now);
        assert_eq!(
            ranked.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![high, mid]
        );
    }

    #[test]
    fn test_exact_threshold_inside_bucket() {
        let mut index = IndexState::default();
        let now = Utc::now();
        insert(&mut index, "u1", "s1", "just below", 0.42, now, 0);
        let above = insert(&mut index, "u1", "s1", "just above", 0.47, now, 64);

        let filter = RecallFilter {
            user_id: "u1".into(),
            min_importance: Some(0.45),
            ..Default::default()
        };
        let ranked = plan(&index, &filter, now);
        assert_eq!(ranked.iter().map(|r| r.id).collect::<Vec<_>>(), vec![above]);
    }

    #[test]
    fn test_session_seed_requires_ownership() {
        let mut index = IndexState::default();
        let now = Utc::now();
        insert(&mut index, "u1", "shared-name", "mine", 0.5, now, 0);

        let foreign = RecallFilter {
            user_id: "u2".into(),
            session_id: Some("shared-name".into()),
            ..Default::default()
        };
        assert!(plan(&index, &foreign, now).is_empty());
    }

    #[test]
    fn test_date_range_filters_exactly() {
        let mut index = IndexState::default();
        let now = Utc::now();
        let recent = insert(&mut index, "u1", "s1", "recent", 0.5, now, 0);
        insert(
            &mut index,
            "u1",
            "s1",
            "ancient",
            0.5,
            now - chrono::Duration::days(30),
            64,
        );

        let filter = RecallFilter {
            user_id: "u1".into(),
            date_from: Some(now - chrono::Duration::days(2)),
            date_to: Some(now + chrono::Duration::days(1)),
            ..Default::default()
        };
        let ranked = plan(&index, &filter, now);
        assert_eq!(ranked.iter().map(|r| r.id).collect::<Vec<_>>(), vec![recent]);
    }

    #[test]
    fn test_stopword_only_query_is_noop() {
        let mut index = IndexState::default();
        let now = Utc::now();
        insert(&mut index, "u1", "s1", "anything at all", 0.5, now, 0);

        let filter = RecallFilter {
            user_id: "u1".into(),
            query: Some("the and of".into()),
            ..Default::default()
        };
        assert_eq!(plan(&index, &filter, now).len(), 1);
    }

    #[test]
    fn test_limit_trims() {
        let mut index = IndexState::default();
        let now = Utc::now();
        for i in 0..10 {
            insert(&mut index, "u1", "s1", "note", 0.5, now, i * 64);
        }
        let filter = RecallFilter {
            user_id: "u1".into(),
            limit: Some(3),
            ..Default::default()
        };
        assert_eq!(plan(&index, &filter, now).len(), 3);
    }

    #[test]
    fn test_access_weight_curve() {
        assert_eq!(access_weight(0), 0.0);
        assert!((access_weight(1) - 0.5).abs() < 1e-6);
        assert!(access_weight(9) > access_weight(3));
        assert!(access_weight(u32::MAX) < 1.0);
    }

    #[test]
    fn test_recency_half_life() {
        let now = Utc::now();
        let fresh = recency_decay(now, now);
        let old = recency_decay(now, now - chrono::Duration::days(14));
        assert!((fresh - 1.0).abs() < 1e-6);
        // exp(-1) after one half-life parameter interval.
        assert!((old - (-1.0f32).exp()).abs() < 1e-3);
    }
}
