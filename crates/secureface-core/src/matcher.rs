//! Gallery matching and the three-way access decision.

use crate::gallery::{Gallery, GalleryEntry};
use crate::types::{round_score, Decision, Embedding, MatchResult};
use std::cmp::Ordering;

/// Strategy for finding the closest gallery entry to a query embedding.
pub trait Matcher {
    /// Index of the best entry and its score, or `None` for an empty gallery.
    ///
    /// Ties must resolve to the lowest person identifier.
    fn best_match(&self, query: &Embedding, gallery: &Gallery) -> Option<(usize, f32)>;
}

/// Cosine similarity matcher.
///
/// An entry scores the maximum similarity over its reference embeddings.
/// Higher scores rank first; equal scores rank by lowest person identifier.
pub struct CosineMatcher;

impl CosineMatcher {
    fn entry_score(query: &Embedding, entry: &GalleryEntry) -> f32 {
        entry
            .references
            .iter()
            .map(|r| query.similarity(r))
            .fold(f32::NEG_INFINITY, f32::max)
    }

    /// The `k` best entries for `query`, best first, as (index, score).
    pub fn top_k(&self, query: &Embedding, gallery: &Gallery, k: usize) -> Vec<(usize, f32)> {
        let entries = gallery.entries();
        let mut ranked: Vec<(usize, f32)> = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (i, Self::entry_score(query, entry)))
            .collect();
        ranked.sort_by(|(ia, sa), (ib, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| entries[*ia].person_id.cmp(&entries[*ib].person_id))
        });
        ranked.truncate(k);
        ranked
    }
}

impl Matcher for CosineMatcher {
    fn best_match(&self, query: &Embedding, gallery: &Gallery) -> Option<(usize, f32)> {
        let entries = gallery.entries();
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in entries.iter().enumerate() {
            let score = Self::entry_score(query, entry);
            let is_better = match best {
                None => true,
                Some((best_idx, best_score)) => {
                    score > best_score
                        || (score == best_score && entry.person_id < entries[best_idx].person_id)
                }
            };
            if is_better {
                best = Some((i, score));
            }
        }

        best
    }
}

/// Turns an embedding (or its absence) into a [`MatchResult`].
///
/// The result is a pure function of (embedding, gallery, threshold,
/// required access level).
pub struct MatchEngine<M: Matcher = CosineMatcher> {
    matcher: M,
}

impl Default for MatchEngine<CosineMatcher> {
    fn default() -> Self {
        Self { matcher: CosineMatcher }
    }
}

impl<M: Matcher> MatchEngine<M> {
    pub fn with_matcher(matcher: M) -> Self {
        Self { matcher }
    }

    /// Decide access for one face.
    ///
    /// Evaluated in order: no embedding → UNKNOWN without score; best
    /// similarity below `threshold` → UNKNOWN with score; matched role's
    /// access level below `required_level` → BLOCKED; otherwise ALLOWED.
    ///
    /// The threshold is compared at the 4-decimal precision the log records,
    /// so a logged score of 0.6000 never appears as UNKNOWN at threshold 0.60.
    pub fn evaluate(
        &self,
        embedding: Option<&Embedding>,
        gallery: &Gallery,
        threshold: f32,
        required_level: i32,
    ) -> MatchResult {
        let Some(query) = embedding else {
            return MatchResult::no_embedding();
        };

        let Some((idx, similarity)) = self.matcher.best_match(query, gallery) else {
            return MatchResult {
                decision: Decision::Unknown,
                person_id: None,
                display_name: None,
                similarity: Some(0.0),
            };
        };

        // NaN never passes the threshold.
        if !(round_score(similarity) >= round_score(threshold)) {
            return MatchResult {
                decision: Decision::Unknown,
                person_id: None,
                display_name: None,
                similarity: Some(similarity),
            };
        }

        let entry = &gallery.entries()[idx];
        let decision = if entry.role.access_level < required_level {
            Decision::Blocked
        } else {
            Decision::Allowed
        };

        MatchResult {
            decision,
            person_id: Some(entry.person_id),
            display_name: Some(entry.display_name.clone()),
            similarity: Some(similarity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::{GalleryEntry, Role};

    /// Unit vector whose cosine with [1, 0, ...] is exactly `cos`.
    fn query_at(cos: f32) -> Embedding {
        let sin = (1.0 - cos * cos).max(0.0).sqrt();
        Embedding { values: vec![cos, sin, 0.0], model_version: None }
    }

    fn axis() -> Embedding {
        Embedding { values: vec![1.0, 0.0, 0.0], model_version: None }
    }

    fn entry(person_id: i64, access_level: i32, references: Vec<Embedding>) -> GalleryEntry {
        GalleryEntry {
            person_id,
            display_name: format!("person {person_id}"),
            role: Role { id: access_level as i64, name: "r".into(), access_level },
            references,
        }
    }

    #[test]
    fn test_allowed_high_level() {
        let gallery = Gallery::new(vec![entry(7, 100, vec![axis()])]);
        let r = MatchEngine::default().evaluate(Some(&query_at(0.82)), &gallery, 0.60, 50);
        assert_eq!(r.decision, Decision::Allowed);
        assert_eq!(r.person_id, Some(7));
        assert_eq!(r.score(), Some(0.82));
    }

    #[test]
    fn test_blocked_low_level() {
        let gallery = Gallery::new(vec![entry(8, 10, vec![axis()])]);
        let r = MatchEngine::default().evaluate(Some(&query_at(0.75)), &gallery, 0.60, 50);
        assert_eq!(r.decision, Decision::Blocked);
        assert_eq!(r.person_id, Some(8));
        assert_eq!(r.score(), Some(0.75));
    }

    #[test]
    fn test_unknown_below_threshold() {
        let gallery = Gallery::new(vec![entry(9, 100, vec![axis()])]);
        let r = MatchEngine::default().evaluate(Some(&query_at(0.30)), &gallery, 0.60, 50);
        assert_eq!(r.decision, Decision::Unknown);
        assert_eq!(r.person_id, None);
        assert_eq!(r.score(), Some(0.3));
    }

    #[test]
    fn test_unknown_without_embedding() {
        let gallery = Gallery::new(vec![entry(9, 100, vec![axis()])]);
        let r = MatchEngine::default().evaluate(None, &gallery, 0.60, 50);
        assert_eq!(r.decision, Decision::Unknown);
        assert_eq!(r.person_id, None);
        assert_eq!(r.score(), None);
    }

    #[test]
    fn test_low_similarity_wins_over_low_level() {
        // Both conditions apply: identity confidence gates first.
        let gallery = Gallery::new(vec![entry(3, 10, vec![axis()])]);
        let r = MatchEngine::default().evaluate(Some(&query_at(0.40)), &gallery, 0.60, 50);
        assert_eq!(r.decision, Decision::Unknown);
        assert_eq!(r.person_id, None);
    }

    #[test]
    fn test_empty_gallery() {
        let r = MatchEngine::default().evaluate(Some(&axis()), &Gallery::default(), 0.60, 0);
        assert_eq!(r.decision, Decision::Unknown);
        assert_eq!(r.similarity, Some(0.0));
    }

    #[test]
    fn test_entry_scores_max_over_references() {
        let far = Embedding { values: vec![0.0, 0.0, 1.0], model_version: None };
        let gallery = Gallery::new(vec![
            entry(1, 100, vec![query_at(0.5)]),
            entry(2, 100, vec![far, axis()]),
        ]);
        let r = MatchEngine::default().evaluate(Some(&axis()), &gallery, 0.60, 0);
        assert_eq!(r.person_id, Some(2));
        assert!((r.similarity.unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_tie_breaks_on_lowest_person_id() {
        let gallery = Gallery::new(vec![
            entry(42, 100, vec![axis()]),
            entry(5, 100, vec![axis()]),
            entry(17, 100, vec![axis()]),
        ]);
        let engine = MatchEngine::default();
        let first = engine.evaluate(Some(&axis()), &gallery, 0.60, 0);
        assert_eq!(first.person_id, Some(5));
        for _ in 0..10 {
            assert_eq!(engine.evaluate(Some(&axis()), &gallery, 0.60, 0), first);
        }
    }

    #[test]
    fn test_threshold_compared_at_logged_precision() {
        let gallery = Gallery::new(vec![entry(4, 100, vec![axis()])]);
        let engine = MatchEngine::default();

        let at = engine.evaluate(Some(&query_at(0.59996)), &gallery, 0.60, 0);
        assert_eq!(at.score(), Some(0.6));
        assert_eq!(at.decision, Decision::Allowed);

        let below = engine.evaluate(Some(&query_at(0.5999)), &gallery, 0.60, 0);
        assert_eq!(below.score(), Some(0.5999));
        assert_eq!(below.decision, Decision::Unknown);
    }

    #[test]
    fn test_top_k_ranks_best_first() {
        let gallery = Gallery::new(vec![
            entry(1, 100, vec![query_at(0.2)]),
            entry(2, 10, vec![query_at(0.9)]),
            entry(3, 50, vec![query_at(0.1), query_at(0.6)]),
        ]);
        let ranked = CosineMatcher.top_k(&axis(), &gallery, 2);
        let ids: Vec<i64> = ranked.iter().map(|(i, _)| gallery.entries()[*i].person_id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!((ranked[0].1 - 0.9).abs() < 1e-5);
        assert!((ranked[1].1 - 0.6).abs() < 1e-5);
    }

    #[test]
    fn test_top_k_ties_and_bounds() {
        let gallery = Gallery::new(vec![
            entry(30, 100, vec![axis()]),
            entry(10, 100, vec![axis()]),
            entry(20, 100, vec![query_at(0.5)]),
        ]);
        let ranked = CosineMatcher.top_k(&axis(), &gallery, 10);
        let ids: Vec<i64> = ranked.iter().map(|(i, _)| gallery.entries()[*i].person_id).collect();
        assert_eq!(ids, vec![10, 30, 20]);

        // The first candidate agrees with the decision path.
        let best = MatchEngine::default().evaluate(Some(&axis()), &gallery, 0.6, 0);
        assert_eq!(best.person_id, Some(ids[0]));

        assert!(CosineMatcher.top_k(&axis(), &gallery, 0).is_empty());
        assert!(CosineMatcher.top_k(&axis(), &Gallery::default(), 3).is_empty());
    }

    #[test]
    fn test_all_entries_compared() {
        // Best match is the last entry.
        let gallery = Gallery::new(vec![
            entry(1, 100, vec![Embedding { values: vec![0.0, 1.0, 0.0], model_version: None }]),
            entry(2, 100, vec![Embedding { values: vec![0.0, 0.0, 1.0], model_version: None }]),
            entry(3, 100, vec![axis()]),
        ]);
        let r = MatchEngine::default().evaluate(Some(&axis()), &gallery, 0.5, 0);
        assert_eq!(r.decision, Decision::Allowed);
        assert_eq!(r.display_name.as_deref(), Some("person 3"));
    }
}
