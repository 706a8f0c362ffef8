//! Relevance scoring.
//!
//! Lexical scoring backs the in-process backend and is the baseline every
//! other backend is compared against. Cosine similarity backs the embedded
//! vector backend.

/// Score for a case-insensitive exact match.
pub const EXACT_MATCH_SCORE: f32 = 1.0;
/// Score when the whole query appears inside the text.
pub const CONTAINS_SCORE: f32 = 0.8;
/// Ceiling for partial word overlap.
pub const WORD_OVERLAP_WEIGHT: f32 = 0.6;

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
}

/// Lexical relevance of `text` for `query`, in `0.0..=1.0`.
///
/// Exact match scores 1.0, containment 0.8, otherwise 0.6 times the
/// fraction of query words that are a substring of, or contain, some word of
/// the text.
pub fn lexical_score(query: &str, text: &str) -> f32 {
    let query = query.trim().to_lowercase();
    let text = text.trim().to_lowercase();
    if query.is_empty() || text.is_empty() {
        return 0.0;
    }

    if query == text {
        return EXACT_MATCH_SCORE;
    }
    if text.contains(&query) {
        return CONTAINS_SCORE;
    }

    let text_words: Vec<&str> = words(&text).collect();
    let query_words: Vec<&str> = words(&query).collect();
    if query_words.is_empty() || text_words.is_empty() {
        return 0.0;
    }

    let matched = query_words
        .iter()
        .filter(|qw| {
            text_words
                .iter()
                .any(|tw| tw.contains(*qw) || qw.contains(*tw))
        })
        .count();

    WORD_OVERLAP_WEIGHT * matched as f32 / query_words.len() as f32
}

/// Best lexical score over several fields (content, tags, title).
pub fn best_lexical_score<'a>(query: &str, fields: impl IntoIterator<Item = &'a str>) -> f32 {
    fields
        .into_iter()
        .map(|field| lexical_score(query, field))
        .fold(0.0, f32::max)
}

/// Cosine similarity between two vectors.
///
/// Returns 0.0 for mismatched lengths or a zero-norm operand.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Sort by descending score, keeping insertion order for ties.
pub fn sort_by_score_desc<T>(items: &mut [(f32, T)]) {
    items.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("the sky is blue", "The sky is blue" => 1.0 ; "exact match ignores case")]
    #[test_case("sky", "The sky is blue" => 0.8 ; "containment")]
    #[test_case("blue ocean", "The sky is blue" => 0.3 ; "half the words match")]
    #[test_case("perf go", "Go performance tips" => 0.6 ; "query word inside content word")]
    #[test_case("performance!", "Go perf." => 0.6 ; "content word inside query word")]
    #[test_case("rain", "The sky is blue" => 0.0 ; "no overlap")]
    #[test_case("", "anything" => 0.0 ; "empty query")]
    fn lexical_scores(query: &str, text: &str) -> f32 {
        (lexical_score(query, text) * 100.0).round() / 100.0
    }

    #[test]
    fn best_score_takes_maximum_field() {
        let score = best_lexical_score("rust", ["nothing here", "rust"]);
        assert!((score - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn cosine_identical_vectors() {
        let v = vec![0.1, 0.2, 0.3];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_vectors() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_length_mismatch_is_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn sort_is_stable_for_ties() {
        let mut items = vec![(0.5, "a"), (0.9, "b"), (0.5, "c")];
        sort_by_score_desc(&mut items);
        let order: Vec<_> = items.iter().map(|(_, s)| *s).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }
}
