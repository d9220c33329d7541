//! Density estimation with trees of Gaussian leaves.

use nalgebra::{Cholesky, DMatrix};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, instrument};

use crate::{
    ForestError,
    dataset::DatasetView,
    progress::{Action, CallbackSet, LearnerState},
    split::find_best_split,
    stats::{GaussianStats, SplitStatistic},
    tree::Tree,
};

/// Added to the covariance diagonal when the plain factorization fails.
const COVARIANCE_RIDGE: f32 = 1e-4;

/// A Gaussian fitted to the points that reached one leaf.
///
/// Stores the precision matrix and the log normalization constant so
/// density queries need no factorization.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct GaussianLeaf {
    mean: Vec<f32>,
    /// Inverse covariance, `d * d` entries.
    precision: Vec<f32>,
    /// `-0.5 * ln((2*pi)^d * det(cov))`.
    log_norm: f32,
    log_weight: f32,
}

impl GaussianLeaf {
    fn fit(stats: &mut GaussianStats, mass_share: f32) -> Self {
        let mean = stats.mean().clone();
        let d = mean.len();
        // Fewer than two points pin down no covariance; fall back to a
        // unit Gaussian around the single observation.
        let cov = if stats.mass() >= 2 {
            stats.covariance().clone()
        } else {
            DMatrix::identity(d, d)
        };
        let cholesky = Cholesky::new(cov.clone()).or_else(|| {
            let mut ridged = cov;
            for i in 0..d {
                ridged[(i, i)] += COVARIANCE_RIDGE;
            }
            Cholesky::new(ridged)
        });
        let (precision, log_det) = match cholesky {
            Some(cholesky) => {
                let log_det = cholesky.determinant().ln();
                (cholesky.inverse(), log_det)
            }
            None => (DMatrix::identity(d, d), 0.0),
        };
        let log_norm = -0.5 * (d as f32 * (2.0 * std::f32::consts::PI).ln() + log_det);
        Self {
            mean: mean.iter().copied().collect(),
            precision: precision.iter().copied().collect(),
            log_norm,
            log_weight: mass_share.ln(),
        }
    }

    /// Return the fitted mean, empty for an unfitted leaf.
    #[must_use]
    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    /// Return the fraction of the training mass this leaf absorbed.
    #[must_use]
    pub fn weight(&self) -> f32 {
        self.log_weight.exp()
    }

    fn log_density_at(&self, point: &[f32]) -> f32 {
        if self.mean.is_empty() {
            return f32::NEG_INFINITY;
        }
        let d = self.mean.len();
        let mut quadratic = 0.0f32;
        for i in 0..d {
            for j in 0..d {
                quadratic += (point[i] - self.mean[i])
                    * self.precision[i * d + j]
                    * (point[j] - self.mean[j]);
            }
        }
        self.log_weight + self.log_norm - 0.5 * quadratic
    }
}

/// A tree estimating `p(x)` with one weighted Gaussian per leaf.
pub type DensityTree = Tree<GaussianLeaf>;

impl DensityTree {
    /// Return the log of the estimated density at `point`.
    ///
    /// # Errors
    ///
    /// Returns [`ForestError::PredictionFeatureMismatch`] when `point` does
    /// not match the dimensionality the tree was trained on.
    pub fn log_density(&self, point: &[f32]) -> Result<f32, ForestError> {
        if point.len() != self.dimensionality() {
            return Err(ForestError::PredictionFeatureMismatch {
                expected: self.dimensionality(),
                got: point.len(),
            });
        }
        let leaf = self.route(point);
        Ok(self.data(leaf).log_density_at(point))
    }
}

/// Offline density-tree learner partitioning by covariance volume.
///
/// Uses the same exhaustive threshold sweep as the classification
/// learner, but over [`GaussianStats`]: a cut wins when it shrinks the
/// summed mass-weighted log-determinant of the children's covariances.
/// Labels are ignored.
///
/// # Defaults
///
/// | Parameter                  | Default               |
/// |----------------------------|-----------------------|
/// | `num_features`             | `None` (all features) |
/// | `max_depth`                | 100                   |
/// | `min_split_examples`       | 10                    |
/// | `min_child_split_examples` | 2                     |
/// | `seed`                     | 42                    |
#[derive(Debug)]
pub struct DensityTreeLearner {
    num_features: Option<usize>,
    max_depth: u32,
    min_split_examples: usize,
    min_child_split_examples: usize,
    seed: u64,
    callbacks: CallbackSet,
}

impl DensityTreeLearner {
    /// Create a learner with default parameters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            num_features: None,
            max_depth: 100,
            min_split_examples: 10,
            min_child_split_examples: 2,
            seed: 42,
            callbacks: CallbackSet::new(),
        }
    }

    /// Set the number of features sampled per split (`None` = all).
    #[must_use]
    pub fn with_num_features(mut self, num_features: Option<usize>) -> Self {
        self.num_features = num_features;
        self
    }

    /// Set the maximum node depth.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Set the minimum node mass required to attempt a split.
    #[must_use]
    pub fn with_min_split_examples(mut self, min_split_examples: usize) -> Self {
        self.min_split_examples = min_split_examples;
        self
    }

    /// Set the minimum mass each child must receive.
    #[must_use]
    pub fn with_min_child_split_examples(mut self, min_child_split_examples: usize) -> Self {
        self.min_child_split_examples = min_child_split_examples;
        self
    }

    /// Set the random seed for reproducibility.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Register a progress callback fired at node milestones.
    pub fn register_callback<F>(&mut self, callback: F)
    where
        F: Fn(Action, &LearnerState) -> i32 + Send + Sync + 'static,
    {
        self.callbacks.register(callback);
    }

    /// Train a density tree on the points of `view`, using the configured
    /// seed. Labels, if present, are ignored.
    ///
    /// # Errors
    ///
    /// | Variant                                | When                                     |
    /// |----------------------------------------|------------------------------------------|
    /// | [`ForestError::EmptyDataset`]          | `view` has no samples                    |
    /// | [`ForestError::InvalidNumFeatures`]    | `num_features` is 0 or exceeds the dimensionality |
    pub fn learn(&self, view: &DatasetView) -> Result<DensityTree, ForestError> {
        self.learn_with_seed(view, self.seed)
    }

    /// [`DensityTreeLearner::learn`] with an explicit seed.
    ///
    /// # Errors
    ///
    /// Same as [`DensityTreeLearner::learn`].
    #[instrument(skip(self, view), fields(n_samples = view.len()))]
    pub fn learn_with_seed(
        &self,
        view: &DatasetView,
        seed: u64,
    ) -> Result<DensityTree, ForestError> {
        if view.is_empty() {
            return Err(ForestError::EmptyDataset);
        }
        let dimensionality = view.dimensionality();
        let num_features = self.num_features.unwrap_or(dimensionality);
        if num_features == 0 || num_features > dimensionality {
            return Err(ForestError::InvalidNumFeatures {
                num_features,
                dimensionality,
            });
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        debug!(
            n_samples = view.len(),
            dimensionality, num_features, "growing density tree"
        );

        let mut tree = DensityTree::new();
        tree.set_dimensionality(dimensionality);
        let total_mass = view.len() as f32;
        let mut state = LearnerState::new(view.len());

        let mut pending: Vec<(usize, Vec<usize>)> = vec![(0, (0..view.len()).collect())];
        while let Some((node, positions)) = pending.pop() {
            let mut stats = GaussianStats::new(dimensionality);
            for &p in &positions {
                stats.add(view.point(p));
            }
            let depth = tree.config(node).depth();
            state.depth = depth;
            state.num_nodes = tree.num_nodes();
            state.processed += 1;

            let stop = positions.len() < self.min_split_examples
                || stats.is_pure()
                || depth >= self.max_depth;
            let candidate = if stop {
                None
            } else {
                let parent_impurity = stats.impurity();
                find_best_split(
                    view,
                    &positions,
                    &GaussianStats::new(dimensionality),
                    &stats,
                    parent_impurity,
                    num_features,
                    self.min_child_split_examples,
                    &mut rng,
                    |p| view.point(p),
                )
            };

            match candidate {
                Some(split) => {
                    let left = tree.split(node, split.feature, split.threshold);
                    let (left_positions, right_positions): (Vec<usize>, Vec<usize>) = positions
                        .into_iter()
                        .partition(|&p| view.point(p)[split.feature] < split.threshold);
                    state.objective = split.objective;
                    state.num_nodes = tree.num_nodes();
                    self.callbacks.emit(Action::SplitNode, &state);
                    pending.push((left + 1, right_positions));
                    pending.push((left, left_positions));
                }
                None => {
                    *tree.data_mut(node) =
                        GaussianLeaf::fit(&mut stats, positions.len() as f32 / total_mass);
                    self.callbacks.emit(Action::LeafReached, &state);
                }
            }
        }

        debug!(
            num_nodes = tree.num_nodes(),
            max_depth = tree.max_depth(),
            "density tree grown"
        );
        Ok(tree)
    }
}

impl Default for DensityTreeLearner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DataStorage;
    use std::sync::Arc;

    /// Two well separated 2-d clusters of 25 points each, no labels.
    fn two_blob_view() -> DatasetView {
        let mut storage = DataStorage::new();
        for i in 0..25 {
            let jitter_x = (i % 7) as f32 * 0.1;
            let jitter_y = (i % 5) as f32 * 0.1;
            storage.add_unlabeled(vec![jitter_x, jitter_y]).unwrap();
            storage
                .add_unlabeled(vec![10.0 + jitter_x, 10.0 + jitter_y])
                .unwrap();
        }
        DatasetView::from_storage(Arc::new(storage))
    }

    #[test]
    fn splits_between_clusters() {
        let view = two_blob_view();
        let tree = DensityTreeLearner::new().learn(&view).unwrap();
        assert!(tree.num_nodes() > 1);
        // Points in either cluster must look far more likely than the gap.
        let near = tree.log_density(&[0.3, 0.2]).unwrap();
        let far = tree.log_density(&[5.0, 5.0]).unwrap();
        assert!(near > far, "near {near} vs gap {far}");
        let other = tree.log_density(&[10.3, 10.2]).unwrap();
        assert!(other > far, "other {other} vs gap {far}");
    }

    #[test]
    fn leaf_weights_partition_the_mass() {
        let view = two_blob_view();
        let tree = DensityTreeLearner::new().learn(&view).unwrap();
        let total: f32 = tree
            .leaf_indices()
            .map(|leaf| tree.data(leaf).weight())
            .sum();
        assert!((total - 1.0).abs() < 1e-4, "weights sum to {total}");
    }

    #[test]
    fn small_dataset_stays_a_single_leaf() {
        let mut storage = DataStorage::new();
        for i in 0..3 {
            storage.add_unlabeled(vec![i as f32]).unwrap();
        }
        let view = DatasetView::from_storage(Arc::new(storage));
        let tree = DensityTreeLearner::new().learn(&view).unwrap();
        assert_eq!(tree.num_nodes(), 1);
        assert!(tree.log_density(&[1.0]).unwrap().is_finite());
    }

    #[test]
    fn dimensionality_is_checked() {
        let view = two_blob_view();
        let tree = DensityTreeLearner::new().learn(&view).unwrap();
        let err = tree.log_density(&[0.0]).unwrap_err();
        assert!(matches!(
            err,
            ForestError::PredictionFeatureMismatch { expected: 2, got: 1 }
        ));
    }

    #[test]
    fn empty_dataset_error() {
        let view = DatasetView::from_storage(Arc::new(DataStorage::new()));
        let err = DensityTreeLearner::new().learn(&view).unwrap_err();
        assert!(matches!(err, ForestError::EmptyDataset));
    }

    #[test]
    fn same_seed_same_tree() {
        let view = two_blob_view();
        let learner = DensityTreeLearner::new().with_num_features(Some(1)).with_seed(9);
        let a = learner.learn(&view).unwrap();
        let b = learner.learn(&view).unwrap();
        assert_eq!(a.num_nodes(), b.num_nodes());
        for point in [[0.0f32, 0.0], [10.0, 10.0], [5.0, 5.0]] {
            assert_eq!(
                a.log_density(&point).unwrap(),
                b.log_density(&point).unwrap()
            );
        }
    }
}
