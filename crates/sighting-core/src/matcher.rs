//! Nearest-neighbour identification against a registry snapshot.

use crate::registry::RegistrySnapshot;
use crate::types::{BoundingBox, Embedding, Identity};
use serde::Serialize;
use thiserror::Error;

/// Default identification threshold. A match needs `distance < threshold`.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("registry holds no reference embeddings")]
    NoReferenceData,
    #[error("query embedding has {actual} dimensions, registry uses {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Classification of a single query embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "identity", rename_all = "snake_case")]
pub enum MatchOutcome {
    Known(Identity),
    Unknown,
}

/// Result of matching a query embedding against the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    #[serde(flatten)]
    pub outcome: MatchOutcome,
    /// Euclidean distance to the closest reference, known or not.
    pub distance: f32,
    /// Snapshot index of the closest reference.
    pub reference_index: usize,
}

impl MatchResult {
    pub fn identity(&self) -> Option<&Identity> {
        match &self.outcome {
            MatchOutcome::Known(identity) => Some(identity),
            MatchOutcome::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self.outcome, MatchOutcome::Known(_))
    }
}

/// A match paired with the face it was computed for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceMatch {
    pub bbox: BoundingBox,
    #[serde(flatten)]
    pub result: MatchResult,
}

/// Strategy for classifying a query embedding against the registry.
pub trait Matcher {
    fn compare(
        &self,
        query: &Embedding,
        registry: &RegistrySnapshot,
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Euclidean nearest-neighbour matcher.
///
/// Every reference embedding is compared on its own, with no per-identity
/// averaging. Exact ties resolve to the lowest snapshot index.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        query: &Embedding,
        registry: &RegistrySnapshot,
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        let Some(expected) = registry.dim() else {
            return Err(MatchError::NoReferenceData);
        };
        if query.dim() != expected {
            return Err(MatchError::DimensionMismatch {
                expected,
                actual: query.dim(),
            });
        }

        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in registry.entries().iter().enumerate() {
            let dist = query.euclidean_distance(&entry.embedding);
            // Strict comparison keeps the earliest index on ties.
            if best_idx.is_none() || dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        let idx = best_idx.ok_or(MatchError::NoReferenceData)?;
        let outcome = if best_dist < threshold {
            MatchOutcome::Known(registry.entries()[idx].identity.clone())
        } else {
            MatchOutcome::Unknown
        };

        Ok(MatchResult {
            outcome,
            distance: best_dist,
            reference_index: idx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryEntry, RegistrySnapshot};
    use chrono::{TimeZone, Utc};

    fn entry(label: &str, n: u32, values: Vec<f32>) -> RegistryEntry {
        RegistryEntry {
            identity: Identity::new(label).unwrap(),
            index: n,
            embedding: Embedding::new(values),
            national_id: None,
            created_at: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    fn known(result: &MatchResult) -> Option<&str> {
        result.identity().map(Identity::as_str)
    }

    #[test]
    fn test_empty_registry_is_no_reference_data() {
        let snapshot = RegistrySnapshot::default();
        let query = Embedding::new(vec![0.0, 0.0]);
        let err = EuclideanMatcher.compare(&query, &snapshot, 0.5).unwrap_err();
        assert_eq!(err, MatchError::NoReferenceData);
    }

    #[test]
    fn test_known_below_threshold() {
        let snapshot = RegistrySnapshot::from_entries(vec![entry("alice", 1, vec![0.0, 0.0])]);
        let query = Embedding::new(vec![0.3, 0.0]);
        let result = EuclideanMatcher.compare(&query, &snapshot, 0.5).unwrap();
        assert_eq!(known(&result), Some("alice"));
        assert!((result.distance - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_distance_equal_to_threshold_is_unknown() {
        let snapshot = RegistrySnapshot::from_entries(vec![entry("alice", 1, vec![0.0, 0.0])]);
        let query = Embedding::new(vec![0.5, 0.0]);
        let result = EuclideanMatcher.compare(&query, &snapshot, 0.5).unwrap();
        assert_eq!(result.outcome, MatchOutcome::Unknown);
        assert_eq!(result.reference_index, 0);
    }

    #[test]
    fn test_tie_break_prefers_lowest_index() {
        let snapshot = RegistrySnapshot::from_entries(vec![
            entry("alice", 1, vec![1.0, 0.0]),
            entry("bob", 1, vec![-1.0, 0.0]),
        ]);
        let query = Embedding::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher.compare(&query, &snapshot, 2.0).unwrap();
        assert_eq!(known(&result), Some("alice"));
        assert_eq!(result.reference_index, 0);
    }

    #[test]
    fn test_globally_closest_reference_wins() {
        // alice has two shots; one is far, one is the global nearest.
        // bob's single shot is second-closest and must not win.
        let snapshot = RegistrySnapshot::from_entries(vec![
            entry("alice", 1, vec![5.0, 5.0]),
            entry("bob", 1, vec![0.2, 0.0]),
            entry("alice", 2, vec![0.1, 0.0]),
        ]);
        let query = Embedding::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher.compare(&query, &snapshot, 0.5).unwrap();
        assert_eq!(known(&result), Some("alice"));
        assert_eq!(result.reference_index, 2);
    }

    #[test]
    fn test_dimension_mismatch() {
        let snapshot = RegistrySnapshot::from_entries(vec![entry("alice", 1, vec![0.0, 0.0])]);
        let query = Embedding::new(vec![0.0, 0.0, 0.0]);
        let err = EuclideanMatcher.compare(&query, &snapshot, 0.5).unwrap_err();
        assert_eq!(err, MatchError::DimensionMismatch { expected: 2, actual: 3 });
    }

    #[test]
    fn test_unknown_iff_min_distance_at_or_above_threshold() {
        let snapshot = RegistrySnapshot::from_entries(vec![
            entry("alice", 1, vec![0.0, 0.0]),
            entry("bob", 1, vec![1.0, 1.0]),
        ]);
        for (x, threshold) in [(0.1f32, 0.5f32), (0.49, 0.5), (0.6, 0.5), (0.9, 1.0), (2.0, 0.3)] {
            let query = Embedding::new(vec![x, 0.0]);
            let min = snapshot
                .entries()
                .iter()
                .map(|e| query.euclidean_distance(&e.embedding))
                .fold(f32::INFINITY, f32::min);
            let result = EuclideanMatcher.compare(&query, &snapshot, threshold).unwrap();
            assert_eq!(result.is_known(), min < threshold, "x={x} threshold={threshold}");
            assert_eq!(result.distance, min);
        }
    }

    #[test]
    fn test_serialized_shape() {
        let result = MatchResult {
            outcome: MatchOutcome::Known(Identity::new("bob").unwrap()),
            distance: 0.25,
            reference_index: 0,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "known");
        assert_eq!(json["identity"], "bob");

        let unknown = MatchResult { outcome: MatchOutcome::Unknown, ..result };
        let json = serde_json::to_value(&unknown).unwrap();
        assert_eq!(json["status"], "unknown");
    }
}
