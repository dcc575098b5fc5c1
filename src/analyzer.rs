//! Text analyzer shared by the inverted index and the query planner
//!
//! Indexing and querying must tokenize identically or posting lookups miss.
//! The pipeline: Unicode word segmentation, lowercase, drop tokens shorter
//! than two characters, drop stopwords.

use std::collections::HashMap;

use crate::constants::MIN_TOKEN_CHARS;

/// Produce the token stream for a piece of text, stopwords removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| t.chars().count() >= MIN_TOKEN_CHARS && !is_stop_word(t))
        .collect()
}

/// Token stream folded into per-term frequencies.
pub fn term_frequencies(text: &str) -> HashMap<String, u32> {
    let mut frequencies = HashMap::new();
    for token in tokenize(text) {
        *frequencies.entry(token).or_insert(0) += 1;
    }
    frequencies
}

/// Fixed English stopword list.
pub fn is_stop_word(word: &str) -> bool {
    matches!(
        word,
        "the" | "and" | "or" | "but" | "in" | "on" | "at" | "to" | "for" | "of" | "with" | "by"
            | "from" | "up" | "about" | "into" | "through" | "during" | "before" | "after"
            | "above" | "below" | "between" | "among" | "this" | "that" | "these" | "those"
            | "you" | "he" | "she" | "it" | "we" | "they" | "am" | "is" | "are" | "was" | "were"
            | "be" | "been" | "being" | "have" | "has" | "had" | "do" | "does" | "did" | "will"
            | "would" | "an" | "as" | "not" | "no" | "so" | "if" | "then" | "than" | "too"
            | "very" | "can" | "just" | "its" | "my" | "me" | "your" | "our" | "their" | "what"
            | "when" | "where" | "who" | "how" | "all" | "each" | "more" | "most" | "other"
            | "some" | "such" | "only" | "own" | "same"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowercases_and_splits() {
        let tokens = tokenize("I learned about Memory-Decay today!");
        assert_eq!(tokens, vec!["learned", "memory", "decay", "today"]);
    }

    #[test]
    fn test_drops_short_tokens_and_stopwords() {
        let tokens = tokenize("a to be or not x rust");
        assert_eq!(tokens, vec!["rust"]);
    }

    #[test]
    fn test_unicode_segmentation() {
        let tokens = tokenize("café über résumé");
        assert_eq!(tokens, vec!["café", "über", "résumé"]);
    }

    #[test]
    fn test_term_frequencies() {
        let tf = term_frequencies("rust rust pizza");
        assert_eq!(tf.get("rust"), Some(&2));
        assert_eq!(tf.get("pizza"), Some(&1));
    }

    #[test]
    fn test_all_stopwords_yields_empty() {
        assert!(tokenize("the and of to").is_empty());
    }
}
