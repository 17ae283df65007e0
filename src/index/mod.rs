// Flat vector index
// Exact nearest-neighbor search by squared Euclidean distance


use serde::{Deserialize, Serialize};

use crate::{RagError, Result};

/// Exact (flat) nearest-neighbor index over fixed-dimension vectors.
///
/// Every query compares against every stored vector, so search is O(n) in the
/// number of vectors. Corpus sizes for this workload stay in the thousands,
/// where exact ranking is fast enough and guarantees no recall loss.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlatIndex {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

impl FlatIndex {
    #[inline]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
        }
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Append one vector to the index.
    #[inline]
    pub fn insert(&mut self, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(RagError::Index(format!(
                "Vector dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }
        self.vectors.push(vector);
        Ok(())
    }

    /// Return the `k` nearest stored vectors to `query` as
    /// `(position, squared L2 distance)` pairs, ascending by distance.
    ///
    /// `k` is clamped to the current index size; an empty index returns an
    /// empty result without touching the query. Equal distances are broken by
    /// insertion order (earlier vectors first).
    #[inline]
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if self.vectors.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(position, vector)| (position, squared_l2_distance(query, vector)))
            .collect();

        // Stable sort keeps insertion order for equal distances
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(k.min(self.vectors.len()));
        scored
    }

    /// Discard all vectors, returning the index to its empty initial state.
    ///
    /// Used only by explicit maintenance operations.
    #[inline]
    pub fn reset(&mut self) {
        self.vectors.clear();
    }
}

fn squared_l2_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}
