use std::ops::Range;
use std::sync::Arc;

use rand::Rng;

use crate::ForestError;

/// Owning storage for a dataset of `f32` feature vectors.
///
/// Points are row-major; labels are optional so that partially labeled
/// collections can be stored. The dimensionality is fixed by the first
/// point added and enforced on every subsequent insertion.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct DataStorage {
    points: Vec<Vec<f32>>,
    labels: Vec<Option<usize>>,
    class_count: usize,
    dimensionality: usize,
}

impl DataStorage {
    /// Create an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a labeled point.
    ///
    /// # Errors
    ///
    /// Returns [`ForestError::DimensionalityMismatch`] when `point` does not
    /// match the dimensionality of previously added points.
    pub fn add_labeled(&mut self, point: Vec<f32>, label: usize) -> Result<(), ForestError> {
        self.push(point, Some(label))
    }

    /// Append an unlabeled point.
    ///
    /// # Errors
    ///
    /// Returns [`ForestError::DimensionalityMismatch`] when `point` does not
    /// match the dimensionality of previously added points.
    pub fn add_unlabeled(&mut self, point: Vec<f32>) -> Result<(), ForestError> {
        self.push(point, None)
    }

    fn push(&mut self, point: Vec<f32>, label: Option<usize>) -> Result<(), ForestError> {
        if self.points.is_empty() {
            self.dimensionality = point.len();
        } else if point.len() != self.dimensionality {
            return Err(ForestError::DimensionalityMismatch {
                expected: self.dimensionality,
                got: point.len(),
            });
        }
        if let Some(label) = label
            && label >= self.class_count
        {
            self.class_count = label + 1;
        }
        self.points.push(point);
        self.labels.push(label);
        Ok(())
    }

    /// Return the number of stored points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Return `true` when no points are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Return the dimensionality of the stored points (0 while empty).
    #[must_use]
    pub fn dimensionality(&self) -> usize {
        self.dimensionality
    }

    /// Return one more than the largest label seen so far.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.class_count
    }

    /// Return the point at `index`.
    #[must_use]
    pub fn point(&self, index: usize) -> &[f32] {
        &self.points[index]
    }

    /// Return the label at `index`, or `None` for an unlabeled point.
    #[must_use]
    pub fn label(&self, index: usize) -> Option<usize> {
        self.labels[index]
    }
}

/// A lightweight, cheaply cloneable view onto a [`DataStorage`].
///
/// A view either covers the whole storage or a list of storage indices.
/// Derived views (excerpts, subsets, permutations, bootstrap resamples)
/// share the same backing storage and never copy point data.
#[derive(Debug, Clone)]
pub struct DatasetView {
    storage: Arc<DataStorage>,
    indices: Option<Vec<usize>>,
}

impl DatasetView {
    /// Create a view covering every point of `storage`.
    #[must_use]
    pub fn from_storage(storage: Arc<DataStorage>) -> Self {
        Self {
            storage,
            indices: None,
        }
    }

    /// Return the number of points visible through this view.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.indices {
            Some(indices) => indices.len(),
            None => self.storage.len(),
        }
    }

    /// Return `true` when the view contains no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the dimensionality of the underlying storage.
    #[must_use]
    pub fn dimensionality(&self) -> usize {
        self.storage.dimensionality()
    }

    /// Return the class count of the underlying storage.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.storage.class_count()
    }

    fn resolve(&self, index: usize) -> usize {
        match &self.indices {
            Some(indices) => indices[index],
            None => index,
        }
    }

    /// Return the point at view position `index`.
    #[must_use]
    pub fn point(&self, index: usize) -> &[f32] {
        self.storage.point(self.resolve(index))
    }

    /// Return the label at view position `index`.
    #[must_use]
    pub fn label(&self, index: usize) -> Option<usize> {
        self.storage.label(self.resolve(index))
    }

    /// Create a view over the half-open range `range` of this view.
    ///
    /// # Errors
    ///
    /// Returns [`ForestError::ExcerptOutOfBounds`] when the range does not
    /// lie within `0..self.len()`.
    pub fn excerpt(&self, range: Range<usize>) -> Result<Self, ForestError> {
        if range.start > range.end || range.end > self.len() {
            return Err(ForestError::ExcerptOutOfBounds {
                begin: range.start,
                end: range.end,
                len: self.len(),
            });
        }
        let indices = range.map(|i| self.resolve(i)).collect();
        Ok(Self {
            storage: Arc::clone(&self.storage),
            indices: Some(indices),
        })
    }

    /// Create a view containing the given view positions, in order.
    ///
    /// Positions may repeat; each occurrence appears in the derived view.
    #[must_use]
    pub fn subset(&self, positions: &[usize]) -> Self {
        let indices = positions.iter().map(|&i| self.resolve(i)).collect();
        Self {
            storage: Arc::clone(&self.storage),
            indices: Some(indices),
        }
    }

    /// Create a reordered view according to `perm`, where the point at view
    /// position `i` moves to position `perm[i]`.
    ///
    /// # Errors
    ///
    /// Returns [`ForestError::InvalidPermutation`] when `perm` is not a
    /// permutation of `0..self.len()`.
    pub fn permute(&self, perm: &[usize]) -> Result<Self, ForestError> {
        let n = self.len();
        let mut seen = vec![false; n];
        if perm.len() != n {
            return Err(ForestError::InvalidPermutation {
                expected: n,
                got: perm.len(),
            });
        }
        for &p in perm {
            if p >= n || seen[p] {
                return Err(ForestError::InvalidPermutation {
                    expected: n,
                    got: perm.len(),
                });
            }
            seen[p] = true;
        }
        let mut indices = vec![0usize; n];
        for (i, &p) in perm.iter().enumerate() {
            indices[p] = self.resolve(i);
        }
        Ok(Self {
            storage: Arc::clone(&self.storage),
            indices: Some(indices),
        })
    }

    /// Draw `n` points i.i.d. with replacement and return the resampled view
    /// together with a flag per view position saying whether it was drawn
    /// at least once.
    #[must_use]
    pub fn bootstrap<R: Rng>(&self, n: usize, rng: &mut R) -> (Self, Vec<bool>) {
        let len = self.len();
        let mut sampled = vec![false; len];
        let mut indices = Vec::with_capacity(n);
        for _ in 0..n {
            let pos = rng.gen_range(0..len);
            sampled[pos] = true;
            indices.push(self.resolve(pos));
        }
        (
            Self {
                storage: Arc::clone(&self.storage),
                indices: Some(indices),
            },
            sampled,
        )
    }
}
