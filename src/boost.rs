//! Boosted forest training (multi-class AdaBoost, SAMME variant).

use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, instrument};

use crate::{
    ForestError,
    classifier::Classifier,
    dataset::DatasetView,
    offline::{DecisionTreeLearner, collect_labels},
    progress::{Action, CallbackSet, LearnerState},
    tree::DecisionTree,
};

/// Weighted training error is clamped into this band before the log so a
/// perfect or hopeless weak tree gets a large finite weight.
const ERROR_CLAMP: f64 = 1e-10;

/// One member of a boosted ensemble.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WeakTree {
    /// The tree itself.
    pub tree: DecisionTree,
    /// Its vote weight, `ln((1-err)/err) + ln(class_count - 1)`.
    pub weight: f32,
}

/// A boosted ensemble aggregating by weighted vote.
///
/// Unlike [`Forest`](crate::forest::Forest), which sums member
/// log-posteriors, each member casts its full weight for its single
/// predicted class.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct BoostedForest {
    trees: Vec<WeakTree>,
    class_count: usize,
}

impl BoostedForest {
    /// Create an empty ensemble over `class_count` classes.
    #[must_use]
    pub fn new(class_count: usize) -> Self {
        Self {
            trees: Vec::new(),
            class_count,
        }
    }

    /// Append a weak tree.
    pub fn add_tree(&mut self, tree: WeakTree) {
        self.trees.push(tree);
    }

    /// Return the number of weak trees.
    #[must_use]
    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    /// Return `true` when the ensemble has no trees.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    /// Return the number of classes votes are cast over.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.class_count
    }

    /// Return all weak trees.
    #[must_use]
    pub fn trees(&self) -> &[WeakTree] {
        &self.trees
    }
}

impl Classifier for BoostedForest {
    /// Per-class weighted vote mass, not a log-probability. The argmax in
    /// [`Classifier::classify`] is unaffected by the different scale.
    fn class_log_posterior(&self, point: &[f32]) -> Result<Vec<f32>, ForestError> {
        if self.trees.is_empty() {
            return Err(ForestError::EmptyForest);
        }
        let mut votes = vec![0.0f32; self.class_count];
        for weak in &self.trees {
            let class = weak.tree.classify(point)?;
            votes[class] += weak.weight;
        }
        Ok(votes)
    }
}

/// Sequential SAMME boosting over offline decision trees.
///
/// Each round resamples the training view by the current sample weights,
/// trains one tree, measures its weighted error on the full view, and
/// scales up the weights of the samples it got wrong. Rounds cannot
/// overlap because every round's distribution depends on the last, so
/// there is no worker pool here.
///
/// # Defaults
///
/// | Parameter   | Default |
/// |-------------|---------|
/// | `num_trees` | 8       |
/// | `seed`      | 42      |
#[derive(Debug)]
pub struct BoostedRandomForestLearner {
    tree_learner: DecisionTreeLearner,
    num_trees: usize,
    seed: u64,
    callbacks: CallbackSet,
}

impl BoostedRandomForestLearner {
    /// Create a boosting learner around `tree_learner`.
    #[must_use]
    pub fn new(tree_learner: DecisionTreeLearner) -> Self {
        Self {
            tree_learner,
            num_trees: 8,
            seed: 42,
            callbacks: CallbackSet::new(),
        }
    }

    /// Set the number of boosting rounds.
    #[must_use]
    pub fn with_num_trees(mut self, num_trees: usize) -> Self {
        self.num_trees = num_trees;
        self
    }

    /// Set the master seed from which per-round seeds are derived.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Register a progress callback fired at round milestones.
    pub fn register_callback<F>(&mut self, callback: F)
    where
        F: Fn(Action, &LearnerState) -> i32 + Send + Sync + 'static,
    {
        self.callbacks.register(callback);
    }

    /// Return the wrapped tree learner.
    #[must_use]
    pub fn tree_learner(&self) -> &DecisionTreeLearner {
        &self.tree_learner
    }

    /// Return the number of boosting rounds.
    #[must_use]
    pub fn num_trees(&self) -> usize {
        self.num_trees
    }

    /// Return the master seed.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Train a boosted ensemble on `view`.
    ///
    /// # Errors
    ///
    /// | Variant                                     | When                               |
    /// |---------------------------------------------|------------------------------------|
    /// | [`ForestError::InvalidTreeCount`]           | `num_trees` is 0                   |
    /// | [`ForestError::EmptyDataset`]               | `view` has no samples              |
    /// | [`ForestError::UnlabeledSample`]            | any sample in `view` has no label  |
    /// | [`ForestError::DegenerateSampleWeights`]    | the weight distribution collapses  |
    ///
    /// plus whatever the wrapped tree learner returns.
    #[instrument(skip(self, view), fields(num_trees = self.num_trees, n_samples = view.len()))]
    pub fn learn(&self, view: &DatasetView) -> Result<BoostedForest, ForestError> {
        if self.num_trees == 0 {
            return Err(ForestError::InvalidTreeCount { num_trees: 0 });
        }
        if view.is_empty() {
            return Err(ForestError::EmptyDataset);
        }
        let labels = collect_labels(view)?;
        let n = view.len();
        let class_count = view.class_count();
        // ln(class_count - 1) is the SAMME correction; for binary data it
        // vanishes and the update reduces to classic AdaBoost.
        let samme_term = f64::from((class_count.saturating_sub(1)).max(1) as u32).ln();

        info!(num_trees = self.num_trees, n_samples = n, class_count, "boosting");

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut weights = vec![1.0f64 / n as f64; n];
        let mut forest = BoostedForest::new(class_count);
        let mut state = LearnerState::new(self.num_trees);
        self.callbacks.emit(Action::StartForest, &state);

        for _ in 0..self.num_trees {
            self.callbacks.emit(Action::StartTree, &state);

            // Weight-resample a training set of the full size.
            let distribution = WeightedIndex::new(&weights)
                .map_err(|_| ForestError::DegenerateSampleWeights)?;
            let positions: Vec<usize> =
                (0..n).map(|_| distribution.sample(&mut rng)).collect();
            let resampled = view.subset(&positions);
            let tree = self.tree_learner.learn_with_seed(&resampled, rng.r#gen())?;

            // Weighted error over the full view, not the resample.
            let mut misclassified = vec![false; n];
            let mut error = 0.0f64;
            for i in 0..n {
                if tree.classify(view.point(i))? != labels[i] {
                    misclassified[i] = true;
                    error += weights[i];
                }
            }
            let clamped = error.clamp(ERROR_CLAMP, 1.0 - ERROR_CLAMP);
            let alpha = ((1.0 - clamped) / clamped).ln() + samme_term;

            // Upweight the mistakes, then renormalize.
            let scale = alpha.exp();
            let mut total = 0.0f64;
            for i in 0..n {
                if misclassified[i] {
                    weights[i] *= scale;
                }
                total += weights[i];
            }
            if total <= 0.0 || !total.is_finite() {
                return Err(ForestError::DegenerateSampleWeights);
            }
            for w in &mut weights {
                *w /= total;
            }

            state.processed += 1;
            state.error = error as f32;
            state.weight = alpha as f32;
            debug!(round = state.processed, error, alpha, "boosting round finished");
            self.callbacks.emit(Action::FinishTree, &state);

            forest.add_tree(WeakTree {
                tree,
                weight: alpha as f32,
            });
        }

        self.callbacks.emit(Action::FinishForest, &state);
        Ok(forest)
    }
}
