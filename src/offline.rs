use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, instrument};

use crate::{
    ForestError,
    dataset::DatasetView,
    progress::{Action, CallbackSet, LearnerState},
    split::find_best_split,
    stats::{EntropyHistogram, SplitStatistic},
    tree::{DecisionTree, LeafData},
};

/// Offline decision-tree learner with exhaustive threshold search.
///
/// Construct via [`DecisionTreeLearner::new`], then chain `with_*` methods.
///
/// # Defaults
///
/// | Parameter                  | Default               |
/// |----------------------------|-----------------------|
/// | `num_features`             | `None` (all features) |
/// | `max_depth`                | 100                   |
/// | `min_split_examples`       | 3                     |
/// | `min_child_split_examples` | 1                     |
/// | `smoothing`                | 1.0                   |
/// | `use_bootstrap`            | `false`               |
/// | `num_bootstrap_examples`   | `None` (dataset size) |
/// | `seed`                     | 42                    |
#[derive(Debug)]
pub struct DecisionTreeLearner {
    num_features: Option<usize>,
    max_depth: u32,
    min_split_examples: usize,
    min_child_split_examples: usize,
    smoothing: f32,
    use_bootstrap: bool,
    num_bootstrap_examples: Option<usize>,
    seed: u64,
    callbacks: CallbackSet,
}

impl DecisionTreeLearner {
    /// Create a learner with default parameters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            num_features: None,
            max_depth: 100,
            min_split_examples: 3,
            min_child_split_examples: 1,
            smoothing: 1.0,
            use_bootstrap: false,
            num_bootstrap_examples: None,
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

    /// Set the additive smoothing applied to leaf histograms.
    #[must_use]
    pub fn with_smoothing(mut self, smoothing: f32) -> Self {
        self.smoothing = smoothing;
        self
    }

    /// Enable or disable per-tree bootstrap resampling.
    #[must_use]
    pub fn with_bootstrap(mut self, use_bootstrap: bool) -> Self {
        self.use_bootstrap = use_bootstrap;
        self
    }

    /// Set the bootstrap sample size (`None` = the dataset size).
    #[must_use]
    pub fn with_num_bootstrap_examples(mut self, num_bootstrap_examples: Option<usize>) -> Self {
        self.num_bootstrap_examples = num_bootstrap_examples;
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

    // --- Getters ---

    /// Return the number of features sampled per split, if set.
    #[must_use]
    pub fn num_features(&self) -> Option<usize> {
        self.num_features
    }

    /// Return the maximum node depth.
    #[must_use]
    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Return the minimum node mass required to attempt a split.
    #[must_use]
    pub fn min_split_examples(&self) -> usize {
        self.min_split_examples
    }

    /// Return the minimum mass each child must receive.
    #[must_use]
    pub fn min_child_split_examples(&self) -> usize {
        self.min_child_split_examples
    }

    /// Return the leaf-histogram smoothing.
    #[must_use]
    pub fn smoothing(&self) -> f32 {
        self.smoothing
    }

    /// Return whether per-tree bootstrap resampling is enabled.
    #[must_use]
    pub fn use_bootstrap(&self) -> bool {
        self.use_bootstrap
    }

    /// Return the bootstrap sample size, if set.
    #[must_use]
    pub fn num_bootstrap_examples(&self) -> Option<usize> {
        self.num_bootstrap_examples
    }

    /// Return the random seed.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Train a tree on `view` using the configured seed.
    ///
    /// # Errors
    ///
    /// | Variant                                | When                                     |
    /// |----------------------------------------|------------------------------------------|
    /// | [`ForestError::EmptyDataset`]          | `view` has no samples                    |
    /// | [`ForestError::UnlabeledSample`]       | any sample in `view` has no label        |
    /// | [`ForestError::InvalidNumFeatures`]    | `num_features` is 0 or exceeds the dimensionality |
    pub fn learn(&self, view: &DatasetView) -> Result<DecisionTree, ForestError> {
        self.learn_with_seed(view, self.seed)
    }

    /// Train a tree on `view` with an explicit seed, leaving the
    /// configured seed untouched. Forest training derives one seed per
    /// tree through this entry point.
    ///
    /// # Errors
    ///
    /// Same as [`DecisionTreeLearner::learn`].
    #[instrument(skip(self, view), fields(n_samples = view.len()))]
    pub fn learn_with_seed(&self, view: &DatasetView, seed: u64) -> Result<DecisionTree, ForestError> {
        if view.is_empty() {
            return Err(ForestError::EmptyDataset);
        }
        let num_features = self.resolve_num_features(view)?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        // Resample when requested; the tree is grown on the resample but
        // its leaf histograms are refit on the full view afterwards, so
        // posterior estimates use every labeled point.
        let train_view = if self.use_bootstrap {
            let n = self.num_bootstrap_examples.unwrap_or(view.len());
            view.bootstrap(n, &mut rng).0
        } else {
            view.clone()
        };
        let labels = collect_labels(&train_view)?;
        let class_count = train_view.class_count();

        debug!(
            n_samples = train_view.len(),
            dimensionality = train_view.dimensionality(),
            class_count,
            num_features,
            "growing decision tree"
        );

        let mut tree = DecisionTree::new();
        tree.set_dimensionality(train_view.dimensionality());
        let mut state = LearnerState::new(train_view.len());

        // Depth-first growth over an explicit stack of pending nodes.
        let mut pending: Vec<(usize, Vec<usize>)> = vec![(0, (0..train_view.len()).collect())];
        while let Some((node, positions)) = pending.pop() {
            let mut hist = EntropyHistogram::new(class_count);
            for &p in &positions {
                hist.add(&labels[p]);
            }
            let depth = tree.config(node).depth();
            state.depth = depth;
            state.num_nodes = tree.num_nodes();
            state.processed += 1;

            let stop = (hist.mass() as usize) < self.min_split_examples
                || hist.is_pure()
                || depth >= self.max_depth;
            let candidate = if stop {
                None
            } else {
                let parent_impurity = hist.impurity();
                find_best_split(
                    &train_view,
                    &positions,
                    &EntropyHistogram::new(class_count),
                    &hist,
                    parent_impurity,
                    num_features,
                    self.min_child_split_examples,
                    &mut rng,
                    |p| &labels[p],
                )
            };

            match candidate {
                Some(split) => {
                    let left = tree.split(node, split.feature, split.threshold);
                    let (left_positions, right_positions): (Vec<usize>, Vec<usize>) = positions
                        .into_iter()
                        .partition(|&p| train_view.point(p)[split.feature] < split.threshold);
                    state.objective = split.objective;
                    state.num_nodes = tree.num_nodes();
                    self.callbacks.emit(Action::SplitNode, &state);
                    pending.push((left + 1, right_positions));
                    pending.push((left, left_positions));
                }
                None => {
                    *tree.data_mut(node) = LeafData {
                        histogram: hist.to_log_histogram(self.smoothing),
                    };
                    self.callbacks.emit(Action::LeafReached, &state);
                }
            }
        }

        if self.use_bootstrap {
            let labels = collect_labels(view)?;
            refit_leaf_histograms(&mut tree, view, &labels, class_count, self.smoothing);
        }

        debug!(
            num_nodes = tree.num_nodes(),
            max_depth = tree.max_depth(),
            "decision tree grown"
        );
        Ok(tree)
    }

    fn resolve_num_features(&self, view: &DatasetView) -> Result<usize, ForestError> {
        let dimensionality = view.dimensionality();
        let num_features = self.num_features.unwrap_or(dimensionality);
        if num_features == 0 || num_features > dimensionality {
            return Err(ForestError::InvalidNumFeatures {
                num_features,
                dimensionality,
            });
        }
        Ok(num_features)
    }
}

impl Default for DecisionTreeLearner {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the label of every view position, failing on unlabeled points.
pub(crate) fn collect_labels(view: &DatasetView) -> Result<Vec<usize>, ForestError> {
    (0..view.len())
        .map(|i| view.label(i).ok_or(ForestError::UnlabeledSample { index: i }))
        .collect()
}

/// Recompute every leaf histogram of `tree` from scratch over `view`.
///
/// Routes each point to its leaf, accumulates per-leaf class histograms,
/// and overwrites the stored log-posteriors. Used after bootstrap
/// training so posteriors reflect the full dataset rather than the
/// resample.
pub(crate) fn refit_leaf_histograms(
    tree: &mut DecisionTree,
    view: &DatasetView,
    labels: &[usize],
    class_count: usize,
    smoothing: f32,
) {
    let mut histograms: Vec<EntropyHistogram> = (0..tree.num_nodes())
        .map(|_| EntropyHistogram::new(class_count))
        .collect();
    for i in 0..view.len() {
        let leaf = tree.route(view.point(i));
        histograms[leaf].add(&labels[i]);
    }
    for leaf in tree.leaf_indices().collect::<Vec<_>>() {
        tree.data_mut(leaf).histogram = histograms[leaf].to_log_histogram(smoothing);
    }
}
