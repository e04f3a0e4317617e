//! Exact nearest-neighbour vector index.

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// Contract of the similarity-search engine backing an artifact.
pub trait VectorIndex {
    /// Dimension of stored vectors, fixed by the first insert.
    fn dimension(&self) -> Option<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a vector, returning its position.
    fn add(&mut self, vector: Vec<f32>) -> Result<usize>;

    /// The `k` nearest stored vectors as `(position, distance)`, closest first.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>>;

    /// Drop every vector from position `len` onwards.
    fn truncate(&mut self, len: usize);
}

/// Squared L2 (Euclidean) distance.
#[inline]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Brute-force index scanning every vector with squared L2 distance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatIndex {
    dimension: Option<usize>,
    vectors: Vec<Vec<f32>>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: Some(dimension),
            vectors: Vec::new(),
        }
    }

    fn check_dimension(&self, actual: usize) -> Result<()> {
        match self.dimension {
            Some(expected) if expected != actual => {
                Err(FleetError::DimensionMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }
}

impl VectorIndex for FlatIndex {
    fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn add(&mut self, vector: Vec<f32>) -> Result<usize> {
        if vector.is_empty() {
            return Err(FleetError::DimensionMismatch {
                expected: self.dimension.unwrap_or(1),
                actual: 0,
            });
        }
        self.check_dimension(vector.len())?;
        self.dimension = Some(vector.len());
        self.vectors.push(vector);
        Ok(self.vectors.len() - 1)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        if self.vectors.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        self.check_dimension(query.len())?;

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, l2_distance(query, v)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    fn truncate(&mut self, len: usize) {
        self.vectors.truncate(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_of_identical_vectors_is_zero() {
        let v = [0.5, -1.0, 2.0];
        assert_eq!(l2_distance(&v, &v), 0.0);
        assert_eq!(l2_distance(&[0.0, 0.0], &[3.0, 4.0]), 25.0);
    }

    #[test]
    fn search_returns_nearest_first() {
        let mut index = FlatIndex::new();
        index.add(vec![0.0, 0.0]).unwrap();
        index.add(vec![10.0, 10.0]).unwrap();
        index.add(vec![1.0, 1.0]).unwrap();

        let hits = index.search(&[0.9, 0.9], 2).unwrap();
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![2, 0]);
    }

    #[test]
    fn dimension_is_fixed_by_first_vector() {
        let mut index = FlatIndex::new();
        assert_eq!(index.dimension(), None);
        index.add(vec![1.0, 2.0, 3.0]).unwrap();
        assert_eq!(index.dimension(), Some(3));
        assert!(matches!(
            index.add(vec![1.0]),
            Err(FleetError::DimensionMismatch { expected: 3, actual: 1 })
        ));
        assert!(index.search(&[1.0, 2.0], 1).is_err());
    }

    #[test]
    fn search_on_empty_index_is_empty() {
        let index = FlatIndex::with_dimension(4);
        assert!(index.search(&[0.0; 4], 3).unwrap().is_empty());
    }
}
