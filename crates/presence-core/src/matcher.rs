//! Probe-vs-gallery matching under an explicit acceptance policy.

use crate::gallery::NearestNeighborIndex;
use crate::types::{Embedding, Identity};
use serde::{Deserialize, Serialize};

/// Default acceptance cutoff in cosine-distance units.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.4;

/// Tunable matching policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    /// Acceptance cutoff: a match needs `distance < threshold`.
    pub threshold: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

/// Outcome of one recognition attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Accepted identity, or `None` when nothing cleared the threshold.
    pub identity: Option<Identity>,
    /// Distance to the closest reference (0.0 when the gallery was empty).
    pub distance: f32,
    /// `(1 - distance) * 100` clamped to [0, 100]; 0 when not accepted.
    pub confidence: f32,
}

impl MatchResult {
    pub fn no_match(distance: f32) -> Self {
        Self {
            identity: None,
            distance,
            confidence: 0.0,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }
}

/// Confidence reported for an accepted match at `distance`.
///
/// Display value only; acceptance is decided on raw distance.
pub fn confidence_from_distance(distance: f32) -> f32 {
    ((1.0 - distance) * 100.0).clamp(0.0, 100.0)
}

/// Strategy for comparing a probe embedding against a gallery.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &dyn NearestNeighborIndex,
        policy: &MatchPolicy,
    ) -> MatchResult;
}

/// Nearest-neighbour matcher over cosine distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &dyn NearestNeighborIndex,
        policy: &MatchPolicy,
    ) -> MatchResult {
        if gallery.is_empty() {
            return MatchResult::no_match(0.0);
        }

        match gallery.nearest(probe) {
            Some(best) if best.distance < policy.threshold => {
                tracing::debug!(
                    user_id = best.identity.user_id,
                    distance = best.distance,
                    "probe accepted"
                );
                MatchResult {
                    identity: Some(best.identity.clone()),
                    distance: best.distance,
                    confidence: confidence_from_distance(best.distance),
                }
            }
            Some(best) => {
                tracing::debug!(
                    distance = best.distance,
                    threshold = policy.threshold,
                    "closest reference above threshold"
                );
                MatchResult::no_match(best.distance)
            }
            None => MatchResult::no_match(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::{EnrolledIdentity, GalleryIndex, Neighbor};

    fn unit(similarity: f32) -> Embedding {
        // Unit vector at the given cosine similarity to [1, 0].
        Embedding::new(vec![similarity, (1.0 - similarity * similarity).sqrt()])
    }

    fn gallery(entries: Vec<(i64, &str, Vec<Embedding>)>) -> GalleryIndex {
        GalleryIndex::from_identities(
            entries
                .into_iter()
                .filter_map(|(id, name, refs)| EnrolledIdentity::new(Identity::new(id, name), refs)),
        )
    }

    fn probe() -> Embedding {
        Embedding::new(vec![1.0, 0.0])
    }

    #[test]
    fn test_picks_closest_reference_of_identity() {
        // Alice: one reference at distance 0.1, one at 0.6.
        let index = gallery(vec![(1, "Alice", vec![unit(0.4), unit(0.9)])]);
        let result = CosineMatcher.compare(&probe(), &index, &MatchPolicy::default());

        assert_eq!(result.identity.as_ref().map(|i| i.name.as_str()), Some("Alice"));
        assert!((result.distance - 0.1).abs() < 1e-5, "distance {}", result.distance);
        assert!((result.confidence - 90.0).abs() < 1e-3, "confidence {}", result.confidence);
    }

    #[test]
    fn test_empty_gallery_never_matches() {
        for threshold in [0.0, 0.4, 1.0, 2.5] {
            let result = CosineMatcher.compare(&probe(), &GalleryIndex::new(), &MatchPolicy { threshold });
            assert!(!result.is_match());
            assert_eq!(result.confidence, 0.0);
        }
    }

    #[test]
    fn test_distance_equal_to_threshold_is_rejected() {
        let reference = unit(0.7);
        let index = gallery(vec![(1, "Alice", vec![reference.clone()])]);
        let d = probe().distance(&reference);

        let at = CosineMatcher.compare(&probe(), &index, &MatchPolicy { threshold: d });
        assert!(!at.is_match());
        assert_eq!(at.confidence, 0.0);
        assert_eq!(at.distance, d);

        let above = CosineMatcher.compare(&probe(), &index, &MatchPolicy { threshold: d + 1e-4 });
        assert_eq!(above.identity.map(|i| i.user_id), Some(1));
    }

    #[test]
    fn test_high_confidence_does_not_override_threshold() {
        // distance 0.05 → confidence 95, but a strict policy still rejects it
        let index = gallery(vec![(1, "Alice", vec![unit(0.95)])]);
        let result = CosineMatcher.compare(&probe(), &index, &MatchPolicy { threshold: 0.01 });
        assert!(!result.is_match());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_best_identity_wins_across_gallery() {
        let index = gallery(vec![
            (1, "Alice", vec![unit(0.5)]),
            (2, "Bob", vec![unit(0.2), unit(0.99)]),
            (3, "Carol", vec![unit(0.8)]),
        ]);
        let result = CosineMatcher.compare(&probe(), &index, &MatchPolicy::default());
        assert_eq!(result.identity.map(|i| i.name), Some("Bob".to_string()));
    }

    #[test]
    fn test_tie_returns_some_tied_identity() {
        let index = gallery(vec![
            (1, "Alice", vec![unit(0.9)]),
            (2, "Bob", vec![unit(0.9)]),
        ]);
        let result = CosineMatcher.compare(&probe(), &index, &MatchPolicy::default());
        let winner = result.identity.unwrap().user_id;
        assert!(winner == 1 || winner == 2);
    }

    #[test]
    fn test_self_match_is_exact() {
        let e = Embedding::new(vec![0.0, 1.0, 0.0]);
        let index = gallery(vec![(7, "Dana", vec![e.clone()])]);
        let result = CosineMatcher.compare(&e, &index, &MatchPolicy::default());
        assert_eq!(result.distance, 0.0);
        assert_eq!(result.confidence, 100.0);
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(confidence_from_distance(1.7), 0.0);
        assert_eq!(confidence_from_distance(-0.01), 100.0);
        assert!((confidence_from_distance(0.25) - 75.0).abs() < 1e-4);
    }

    /// Index that reports a fixed neighbour, to exercise the trait seam.
    struct FixedIndex(Identity, f32);

    impl NearestNeighborIndex for FixedIndex {
        fn nearest(&self, _probe: &Embedding) -> Option<Neighbor<'_>> {
            Some(Neighbor { identity: &self.0, distance: self.1 })
        }

        fn is_empty(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_matcher_works_over_any_index() {
        let index = FixedIndex(Identity::new(9, "Eve"), 0.3);
        let result = CosineMatcher.compare(&probe(), &index, &MatchPolicy::default());
        assert_eq!(result.identity.map(|i| i.user_id), Some(9));
        assert!((result.confidence - 70.0).abs() < 1e-4);
    }
}
