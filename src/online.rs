use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Poisson};
use tracing::{debug, instrument};

use crate::{
    ForestError,
    dataset::DatasetView,
    progress::{Action, CallbackSet, LearnerState},
    split::sample_features,
    stats::{EntropyHistogram, SplitStatistic},
    tree::{LeafData, LeafModel, Tree},
};

/// How many redraws a threshold slot gets before a near-duplicate value
/// is accepted anyway.
const THRESHOLD_RETRIES: usize = 10;

/// Samples split thresholds uniformly from per-feature value ranges.
#[derive(Debug, Clone)]
pub struct RandomThresholdGenerator {
    min: Vec<f32>,
    max: Vec<f32>,
}

impl RandomThresholdGenerator {
    /// Create a generator with explicit per-feature ranges.
    ///
    /// # Panics
    ///
    /// Panics when `min` and `max` differ in length.
    #[must_use]
    pub fn new(min: Vec<f32>, max: Vec<f32>) -> Self {
        assert_eq!(min.len(), max.len(), "range bounds differ in length");
        Self { min, max }
    }

    /// Derive per-feature ranges from the values present in `view`.
    #[must_use]
    pub fn from_view(view: &DatasetView) -> Self {
        let d = view.dimensionality();
        let mut min = vec![f32::INFINITY; d];
        let mut max = vec![f32::NEG_INFINITY; d];
        for i in 0..view.len() {
            let point = view.point(i);
            for f in 0..d {
                min[f] = min[f].min(point[f]);
                max[f] = max[f].max(point[f]);
            }
        }
        Self { min, max }
    }

    /// Draw one threshold for `feature` uniformly from its range.
    pub fn sample<R: Rng>(&self, feature: usize, rng: &mut R) -> f32 {
        let (lo, hi) = (self.min[feature], self.max[feature]);
        if lo >= hi {
            return lo;
        }
        rng.gen_range(lo..hi)
    }
}

/// The split candidates a leaf accumulates until it splits.
///
/// `left` and `right` are indexed `feature_slot * num_thresholds +
/// threshold_slot`, matching `thresholds`.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    features: Vec<usize>,
    thresholds: Vec<f32>,
    num_thresholds: usize,
    left: Vec<EntropyHistogram>,
    right: Vec<EntropyHistogram>,
}

/// Per-node payload of an online-trained tree.
///
/// The candidate statistics exist only at growing leaves and are
/// discarded on split; they are also skipped during serialization, so a
/// reloaded tree re-initializes candidates lazily when training resumes.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct OnlineNodeData {
    /// Smoothed per-class log-posterior, kept current on every update.
    pub leaf: LeafData,
    /// Class histogram of every sample that reached this node while it
    /// was a leaf.
    pub stat: EntropyHistogram,
    #[serde(skip)]
    candidates: Option<CandidateSet>,
}

impl LeafModel for OnlineNodeData {
    fn log_histogram(&self) -> &[f32] {
        self.leaf.log_histogram()
    }
}

/// A classification tree grown one sample at a time.
pub type OnlineDecisionTree = Tree<OnlineNodeData>;

/// Streaming decision-tree learner with randomized threshold candidates.
///
/// Construct via [`OnlineDecisionTreeLearner::new`], then chain `with_*`
/// methods.
///
/// # Defaults
///
/// | Parameter                  | Default                     |
/// |----------------------------|-----------------------------|
/// | `num_features`             | `None` (all features)       |
/// | `num_thresholds`           | `None` (2 x sampled features) |
/// | `max_depth`                | 100                         |
/// | `min_split_examples`       | 30                          |
/// | `min_child_split_examples` | 15                          |
/// | `min_split_objective`      | 1.0                         |
/// | `use_bootstrap`            | `true`                      |
/// | `bootstrap_lambda`         | 1.0                         |
/// | `smoothing`                | 1.0                         |
/// | `ranges`                   | `None` (derived from data)  |
/// | `seed`                     | 42                          |
#[derive(Debug)]
pub struct OnlineDecisionTreeLearner {
    num_features: Option<usize>,
    num_thresholds: Option<usize>,
    max_depth: u32,
    min_split_examples: usize,
    min_child_split_examples: usize,
    min_split_objective: f32,
    use_bootstrap: bool,
    bootstrap_lambda: f32,
    smoothing: f32,
    ranges: Option<RandomThresholdGenerator>,
    seed: u64,
    callbacks: CallbackSet,
}

impl OnlineDecisionTreeLearner {
    /// Create a learner with default parameters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            num_features: None,
            num_thresholds: None,
            max_depth: 100,
            min_split_examples: 30,
            min_child_split_examples: 15,
            min_split_objective: 1.0,
            use_bootstrap: true,
            bootstrap_lambda: 1.0,
            smoothing: 1.0,
            ranges: None,
            seed: 42,
            callbacks: CallbackSet::new(),
        }
    }

    /// Set the number of candidate features per leaf (`None` = all).
    #[must_use]
    pub fn with_num_features(mut self, num_features: Option<usize>) -> Self {
        self.num_features = num_features;
        self
    }

    /// Set the number of candidate thresholds per feature
    /// (`None` = twice the sampled feature count).
    #[must_use]
    pub fn with_num_thresholds(mut self, num_thresholds: Option<usize>) -> Self {
        self.num_thresholds = num_thresholds;
        self
    }

    /// Set the maximum node depth.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Set the minimum leaf mass required before a split is considered.
    #[must_use]
    pub fn with_min_split_examples(mut self, min_split_examples: usize) -> Self {
        self.min_split_examples = min_split_examples;
        self
    }

    /// Set the minimum mass each child candidate must have accumulated.
    #[must_use]
    pub fn with_min_child_split_examples(mut self, min_child_split_examples: usize) -> Self {
        self.min_child_split_examples = min_child_split_examples;
        self
    }

    /// Set the entropy reduction a candidate must reach to trigger a split.
    #[must_use]
    pub fn with_min_split_objective(mut self, min_split_objective: f32) -> Self {
        self.min_split_objective = min_split_objective;
        self
    }

    /// Enable or disable the Poisson streaming bootstrap.
    #[must_use]
    pub fn with_bootstrap(mut self, use_bootstrap: bool) -> Self {
        self.use_bootstrap = use_bootstrap;
        self
    }

    /// Set the Poisson rate of the streaming bootstrap.
    #[must_use]
    pub fn with_bootstrap_lambda(mut self, bootstrap_lambda: f32) -> Self {
        self.bootstrap_lambda = bootstrap_lambda;
        self
    }

    /// Set the additive smoothing applied to leaf histograms.
    #[must_use]
    pub fn with_smoothing(mut self, smoothing: f32) -> Self {
        self.smoothing = smoothing;
        self
    }

    /// Supply explicit per-feature threshold ranges instead of deriving
    /// them from the first training view.
    #[must_use]
    pub fn with_ranges(mut self, ranges: Option<RandomThresholdGenerator>) -> Self {
        self.ranges = ranges;
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

    /// Return the number of candidate features per leaf, if set.
    #[must_use]
    pub fn num_features(&self) -> Option<usize> {
        self.num_features
    }

    /// Return the number of candidate thresholds per feature, if set.
    #[must_use]
    pub fn num_thresholds(&self) -> Option<usize> {
        self.num_thresholds
    }

    /// Return the maximum node depth.
    #[must_use]
    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Return the minimum leaf mass required before a split is considered.
    #[must_use]
    pub fn min_split_examples(&self) -> usize {
        self.min_split_examples
    }

    /// Return the minimum mass each child candidate must have accumulated.
    #[must_use]
    pub fn min_child_split_examples(&self) -> usize {
        self.min_child_split_examples
    }

    /// Return the split objective threshold.
    #[must_use]
    pub fn min_split_objective(&self) -> f32 {
        self.min_split_objective
    }

    /// Return whether the Poisson streaming bootstrap is enabled.
    #[must_use]
    pub fn use_bootstrap(&self) -> bool {
        self.use_bootstrap
    }

    /// Return the Poisson rate of the streaming bootstrap.
    #[must_use]
    pub fn bootstrap_lambda(&self) -> f32 {
        self.bootstrap_lambda
    }

    /// Return the leaf-histogram smoothing.
    #[must_use]
    pub fn smoothing(&self) -> f32 {
        self.smoothing
    }

    /// Return the random seed.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Train a fresh tree on `view` using the configured seed.
    ///
    /// # Errors
    ///
    /// Same as [`OnlineDecisionTreeLearner::learn_into`].
    pub fn learn(&self, view: &DatasetView) -> Result<OnlineDecisionTree, ForestError> {
        self.learn_with_seed(view, self.seed)
    }

    /// Train a fresh tree on `view` with an explicit seed.
    ///
    /// # Errors
    ///
    /// Same as [`OnlineDecisionTreeLearner::learn_into`].
    pub fn learn_with_seed(
        &self,
        view: &DatasetView,
        seed: u64,
    ) -> Result<OnlineDecisionTree, ForestError> {
        let mut tree = OnlineDecisionTree::new();
        self.learn_into_with_seed(view, &mut tree, seed)?;
        Ok(tree)
    }

    /// Continue training `tree` on the samples of `view`, in order.
    ///
    /// The tree keeps its structure and accumulated statistics; only
    /// leaves grow. A freshly constructed tree starts from scratch.
    ///
    /// # Errors
    ///
    /// | Variant                                  | When                                      |
    /// |------------------------------------------|-------------------------------------------|
    /// | [`ForestError::EmptyDataset`]            | `view` has no samples                     |
    /// | [`ForestError::UnlabeledSample`]         | any sample in `view` has no label         |
    /// | [`ForestError::InvalidNumFeatures`]      | `num_features` is 0 or exceeds the dimensionality |
    /// | [`ForestError::DimensionalityMismatch`]  | `tree` was trained on other dimensions    |
    /// | [`ForestError::InvalidBootstrapLambda`]  | bootstrap enabled with a bad lambda       |
    pub fn learn_into(
        &self,
        view: &DatasetView,
        tree: &mut OnlineDecisionTree,
    ) -> Result<(), ForestError> {
        self.learn_into_with_seed(view, tree, self.seed)
    }

    /// [`OnlineDecisionTreeLearner::learn_into`] with an explicit seed.
    ///
    /// # Errors
    ///
    /// Same as [`OnlineDecisionTreeLearner::learn_into`].
    #[instrument(skip(self, view, tree), fields(n_samples = view.len()))]
    pub fn learn_into_with_seed(
        &self,
        view: &DatasetView,
        tree: &mut OnlineDecisionTree,
        seed: u64,
    ) -> Result<(), ForestError> {
        if view.is_empty() {
            return Err(ForestError::EmptyDataset);
        }
        let dimensionality = view.dimensionality();
        if tree.dimensionality() == 0 {
            tree.set_dimensionality(dimensionality);
        } else if tree.dimensionality() != dimensionality {
            return Err(ForestError::DimensionalityMismatch {
                expected: tree.dimensionality(),
                got: dimensionality,
            });
        }

        let num_features = {
            let resolved = self.num_features.unwrap_or(dimensionality);
            if resolved == 0 || resolved > dimensionality {
                return Err(ForestError::InvalidNumFeatures {
                    num_features: resolved,
                    dimensionality,
                });
            }
            resolved
        };
        let num_thresholds = self.num_thresholds.unwrap_or(2 * num_features);
        let class_count = view.class_count();

        let poisson = if self.use_bootstrap {
            let lambda = f64::from(self.bootstrap_lambda);
            match Poisson::new(lambda) {
                Ok(poisson) => Some(poisson),
                Err(_) => {
                    return Err(ForestError::InvalidBootstrapLambda {
                        lambda: self.bootstrap_lambda,
                    });
                }
            }
        } else {
            None
        };

        let generator = match &self.ranges {
            Some(ranges) => ranges.clone(),
            None => RandomThresholdGenerator::from_view(view),
        };
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut state = LearnerState::new(view.len());

        debug!(
            n_samples = view.len(),
            dimensionality,
            num_features,
            num_thresholds,
            "streaming samples into online tree"
        );

        for i in 0..view.len() {
            let label = view
                .label(i)
                .ok_or(ForestError::UnlabeledSample { index: i })?;
            let copies = match &poisson {
                Some(poisson) => poisson.sample(&mut rng) as usize,
                None => 1,
            };
            for _ in 0..copies {
                state.processed += 1;
                self.process_sample(
                    tree,
                    view.point(i),
                    label,
                    class_count,
                    num_features,
                    num_thresholds,
                    &generator,
                    &mut rng,
                    &mut state,
                );
            }
        }

        debug!(
            num_nodes = tree.num_nodes(),
            max_depth = tree.max_depth(),
            "online pass finished"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_sample(
        &self,
        tree: &mut OnlineDecisionTree,
        point: &[f32],
        label: usize,
        class_count: usize,
        num_features: usize,
        num_thresholds: usize,
        generator: &RandomThresholdGenerator,
        rng: &mut ChaCha8Rng,
        state: &mut LearnerState,
    ) {
        let leaf = tree.route(point);
        let depth = tree.config(leaf).depth();
        state.depth = depth;
        state.num_nodes = tree.num_nodes();

        let data = tree.data_mut(leaf);
        // A continuation view may carry labels beyond the classes seen so
        // far; widen the node statistic and any live candidate histograms
        // without losing accumulated counts.
        if data.stat.class_count() < class_count {
            data.stat.grow_classes(class_count);
            if let Some(candidates) = data.candidates.as_mut() {
                for hist in candidates.left.iter_mut().chain(candidates.right.iter_mut()) {
                    hist.grow_classes(class_count);
                }
            }
        }
        data.stat.add(&label);
        data.leaf.histogram = data.stat.to_log_histogram(self.smoothing);

        if data.candidates.is_none() {
            self.callbacks.emit(Action::InitNode, state);
        }
        let candidates = data.candidates.get_or_insert_with(|| {
            init_candidates(
                point.len(),
                class_count,
                num_features,
                num_thresholds,
                generator,
                rng,
            )
        });
        for slot in 0..candidates.left.len() {
            let feature = candidates.features[slot / candidates.num_thresholds];
            let threshold = candidates.thresholds[slot];
            if point[feature] < threshold {
                candidates.left[slot].add(&label);
            } else {
                candidates.right[slot].add(&label);
            }
        }

        if (data.stat.mass() as usize) < self.min_split_examples
            || data.stat.is_pure()
            || depth >= self.max_depth
        {
            return;
        }

        // Pick the candidate with the largest entropy reduction among
        // those whose children both carry enough mass.
        let node_entropy = data.stat.entropy();
        let mut best: Option<(usize, f32)> = None;
        for slot in 0..candidates.left.len() {
            let left = &candidates.left[slot];
            let right = &candidates.right[slot];
            if (left.mass() as usize) < self.min_child_split_examples
                || (right.mass() as usize) < self.min_child_split_examples
            {
                continue;
            }
            let objective = node_entropy - left.entropy() - right.entropy();
            if best.is_none_or(|(_, b)| objective > b) {
                best = Some((slot, objective));
            }
        }

        let Some((slot, objective)) = best else {
            return;
        };
        state.objective = objective;
        if objective < self.min_split_objective {
            self.callbacks.emit(Action::ObjectiveTooLow, state);
            return;
        }

        // Seed the children from the winning candidate's accumulated
        // statistics, then drop the candidate arrays.
        let feature = candidates.features[slot / candidates.num_thresholds];
        let threshold = candidates.thresholds[slot];
        let left_stat = candidates.left[slot].clone();
        let right_stat = candidates.right[slot].clone();
        data.candidates = None;

        let left = tree.split(leaf, feature, threshold);
        *tree.data_mut(left) = OnlineNodeData {
            leaf: LeafData {
                histogram: left_stat.to_log_histogram(self.smoothing),
            },
            stat: left_stat,
            candidates: None,
        };
        *tree.data_mut(left + 1) = OnlineNodeData {
            leaf: LeafData {
                histogram: right_stat.to_log_histogram(self.smoothing),
            },
            stat: right_stat,
            candidates: None,
        };
        state.num_nodes = tree.num_nodes();
        self.callbacks.emit(Action::SplitNode, state);
    }
}

impl Default for OnlineDecisionTreeLearner {
    fn default() -> Self {
        Self::new()
    }
}

fn init_candidates<R: Rng>(
    dimensionality: usize,
    class_count: usize,
    num_features: usize,
    num_thresholds: usize,
    generator: &RandomThresholdGenerator,
    rng: &mut R,
) -> CandidateSet {
    let features = sample_features(dimensionality, num_features, rng);
    let mut thresholds = Vec::with_capacity(features.len() * num_thresholds);
    for &feature in &features {
        let start = thresholds.len();
        for _ in 0..num_thresholds {
            let mut value = generator.sample(feature, rng);
            // Redraw near-duplicates so the slots cover distinct cuts.
            for _ in 0..THRESHOLD_RETRIES {
                let duplicate = thresholds[start..]
                    .iter()
                    .any(|&t: &f32| (t - value).abs() < 1e-6);
                if !duplicate {
                    break;
                }
                value = generator.sample(feature, rng);
            }
            thresholds.push(value);
        }
    }
    let slots = features.len() * num_thresholds;
    CandidateSet {
        features,
        thresholds,
        num_thresholds,
        left: vec![EntropyHistogram::new(class_count); slots],
        right: vec![EntropyHistogram::new(class_count); slots],
    }
}
