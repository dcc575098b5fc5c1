//! Deterministic session digests
//!
//! No model in the loop: the digest is statistics, TF-IDF key topics against
//! the global term index, and the highest-scoring memories as an excerpt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::analyzer;
use crate::constants::{
    KEY_TOPICS_K, SUMMARY_EXCERPT_CHARS, SUMMARY_EXCERPT_COUNT, TOPIC_MIN_MEMORIES,
};
use crate::errors::{MemoryError, Result};
use crate::query::textless_score;
use crate::store::types::MemoryRecord;
use crate::store::Store;

/// Structured session digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: String,
    pub memory_count: usize,
    /// Mean importance across the session.
    pub importance_score: f32,
    /// The top-scoring memories, newest first, each truncated.
    pub summary_text: String,
    /// Top terms by TF-IDF, best first.
    pub key_topics: Vec<String>,
    /// [min created_at, max created_at] over member memories.
    pub time_span: (DateTime<Utc>, DateTime<Utc>),
}

/// Fold a session's memories into a digest. `SessionEmpty` when the session
/// holds no readable memories.
pub(crate) fn summarize_session(
    store: &Store,
    session_id: &str,
    now: DateTime<Utc>,
) -> Result<SessionSummary> {
    let ids = store.index().session_ids_newest_first(session_id);
    if ids.is_empty() {
        return Err(MemoryError::SessionEmpty(session_id.to_string()));
    }

    let mut records = Vec::with_capacity(ids.len());
    for id in &ids {
        match store.get(id) {
            Ok(record) => records.push(record),
            Err(MemoryError::CorruptRecord(detail)) => {
                warn!(%id, session_id, detail = %detail, "skipping corrupt record in digest");
            }
            Err(e) => return Err(e),
        }
    }
    if records.is_empty() {
        return Err(MemoryError::SessionEmpty(session_id.to_string()));
    }

    let user_id = records[0].user_id.clone();
    let memory_count = records.len();
    let importance_score =
        records.iter().map(|r| r.importance).sum::<f32>() / memory_count as f32;
    let time_span = (
        records.iter().map(|r| r.created_at).min().unwrap_or(now),
        records.iter().map(|r| r.created_at).max().unwrap_or(now),
    );

    let key_topics = key_topics(store, &records);
    let summary_text = excerpt(store, &records, now);

    Ok(SessionSummary {
        session_id: session_id.to_string(),
        user_id,
        memory_count,
        importance_score,
        summary_text,
        key_topics,
        time_span,
    })
}

/// Top-k terms by TF-IDF across the session, using document frequency from
/// the global inverted index. Terms occurring in fewer than two of the
/// session's memories are skipped; ties break on the term itself so the
/// output is stable.
fn key_topics(store: &Store, records: &[MemoryRecord]) -> Vec<String> {
    let mut session_tf: BTreeMap<String, u32> = BTreeMap::new();
    let mut session_df: BTreeMap<String, usize> = BTreeMap::new();
    for record in records {
        let frequencies = analyzer::term_frequencies(&record.content);
        for (term, tf) in frequencies {
            *session_tf.entry(term.clone()).or_default() += tf;
            *session_df.entry(term).or_default() += 1;
        }
    }

    let index = store.index();
    let total_docs = index.live_count().max(1);
    let mut scored: Vec<(f64, String)> = session_tf
        .into_iter()
        .filter(|(term, _)| session_df.get(term).copied().unwrap_or(0) >= TOPIC_MIN_MEMORIES)
        .map(|(term, tf)| {
            let df = index.document_frequency(&term).max(1);
            let idf = (1.0 + total_docs as f64 / df as f64).ln();
            (tf as f64 * idf, term)
        })
        .collect();

    scored.sort_by(|(a_score, a_term), (b_score, b_term)| {
        b_score
            .partial_cmp(a_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a_term.cmp(b_term))
    });
    scored
        .into_iter()
        .take(KEY_TOPICS_K)
        .map(|(_, term)| term)
        .collect()
}

/// The highest-scoring memories (text weight zero), concatenated newest
/// first, each clipped to the excerpt length.
fn excerpt(store: &Store, records: &[MemoryRecord], now: DateTime<Utc>) -> String {
    let index = store.index();
    let mut scored: Vec<(f32, &MemoryRecord)> = records
        .iter()
        .filter_map(|record| {
            index
                .location(&record.id)
                .map(|loc| (textless_score(loc, now), record))
        })
        .collect();
    scored.sort_by(|(a, _), (b, _)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let mut picked: Vec<&MemoryRecord> = scored
        .into_iter()
        .take(SUMMARY_EXCERPT_COUNT)
        .map(|(_, record)| record)
        .collect();
    picked.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    picked
        .iter()
        .map(|record| truncate_chars(&record.content, SUMMARY_EXCERPT_CHARS))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Clip to a character budget on a char boundary, marking the cut.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{clipped}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("short", 240), "short");
        let long = "é".repeat(300);
        let clipped = truncate_chars(&long, 240);
        assert_eq!(clipped.chars().count(), 240);
        assert!(clipped.ends_with('…'));
    }
}
