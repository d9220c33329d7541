//! Forest ensembles and parallel forest training.

use std::sync::{Mutex, PoisonError};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use tracing::{debug, info, instrument};

use crate::{
    ForestError,
    classifier::Classifier,
    dataset::DatasetView,
    offline::DecisionTreeLearner,
    online::{OnlineDecisionTree, OnlineDecisionTreeLearner},
    progress::{Action, CallbackSet, LearnerState},
    tree::DecisionTree,
};

/// An append-only ensemble of trees.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Forest<T> {
    trees: Vec<T>,
}

impl<T> Forest<T> {
    /// Create an empty forest.
    #[must_use]
    pub fn new() -> Self {
        Self { trees: Vec::new() }
    }

    /// Append a tree.
    pub fn add_tree(&mut self, tree: T) {
        self.trees.push(tree);
    }

    /// Return the number of trees.
    #[must_use]
    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    /// Return `true` when the forest has no trees.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    /// Return the tree at `index`.
    #[must_use]
    pub fn tree(&self, index: usize) -> &T {
        &self.trees[index]
    }

    /// Return all trees.
    #[must_use]
    pub fn trees(&self) -> &[T] {
        &self.trees
    }

    pub(crate) fn trees_mut(&mut self) -> &mut Vec<T> {
        &mut self.trees
    }
}

impl<T: Classifier> Classifier for Forest<T> {
    /// Sum of the member trees' log-posteriors. The sum is monotone in the
    /// ensemble posterior, so `classify` needs no normalization.
    fn class_log_posterior(&self, point: &[f32]) -> Result<Vec<f32>, ForestError> {
        let mut trees = self.trees.iter();
        let first = trees.next().ok_or(ForestError::EmptyForest)?;
        let mut combined = first.class_log_posterior(point)?;
        for tree in trees {
            let posterior = tree.class_log_posterior(point)?;
            for (total, value) in combined.iter_mut().zip(posterior) {
                *total += value;
            }
        }
        Ok(combined)
    }
}

/// Trains one tree from a view and a seed; the unit of work a forest
/// learner fans out.
pub trait TreeLearner: Sync {
    /// The tree type this learner produces.
    type Tree: Send;

    /// Train a single tree on `view`, seeded with `seed`.
    ///
    /// # Errors
    ///
    /// Implementations surface their own validation failures.
    fn learn_tree(&self, view: &DatasetView, seed: u64) -> Result<Self::Tree, ForestError>;
}

impl TreeLearner for DecisionTreeLearner {
    type Tree = DecisionTree;

    fn learn_tree(&self, view: &DatasetView, seed: u64) -> Result<DecisionTree, ForestError> {
        self.learn_with_seed(view, seed)
    }
}

impl TreeLearner for OnlineDecisionTreeLearner {
    type Tree = OnlineDecisionTree;

    fn learn_tree(&self, view: &DatasetView, seed: u64) -> Result<OnlineDecisionTree, ForestError> {
        self.learn_with_seed(view, seed)
    }
}

fn lock_state(state: &Mutex<LearnerState>) -> std::sync::MutexGuard<'_, LearnerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Derive one seed per tree from a master seed, by tree index.
fn tree_seeds(master_seed: u64, num_trees: usize) -> Vec<u64> {
    let mut master_rng = ChaCha8Rng::seed_from_u64(master_seed);
    (0..num_trees).map(|_| master_rng.r#gen()).collect()
}

/// Trains a forest by fanning a [`TreeLearner`] out over a worker pool.
///
/// Each tree gets a seed derived from the master seed by tree index and a
/// slot in the output forest fixed by that index, so the trained forest
/// is identical for any `num_threads`. Finished trees enter one shared
/// critical section to bump the progress counter and fire callbacks.
///
/// # Defaults
///
/// | Parameter     | Default |
/// |---------------|---------|
/// | `num_trees`   | 8       |
/// | `num_threads` | 1       |
/// | `seed`        | 42      |
#[derive(Debug)]
pub struct RandomForestLearner<L> {
    tree_learner: L,
    num_trees: usize,
    num_threads: usize,
    seed: u64,
    callbacks: CallbackSet,
}

impl<L: TreeLearner> RandomForestLearner<L> {
    /// Create a forest learner around `tree_learner`.
    #[must_use]
    pub fn new(tree_learner: L) -> Self {
        Self {
            tree_learner,
            num_trees: 8,
            num_threads: 1,
            seed: 42,
            callbacks: CallbackSet::new(),
        }
    }

    /// Set the number of trees to train.
    #[must_use]
    pub fn with_num_trees(mut self, num_trees: usize) -> Self {
        self.num_trees = num_trees;
        self
    }

    /// Set the worker pool size.
    #[must_use]
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Set the master seed from which per-tree seeds are derived.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Register a progress callback fired at forest milestones.
    pub fn register_callback<F>(&mut self, callback: F)
    where
        F: Fn(Action, &LearnerState) -> i32 + Send + Sync + 'static,
    {
        self.callbacks.register(callback);
    }

    /// Return the wrapped tree learner.
    #[must_use]
    pub fn tree_learner(&self) -> &L {
        &self.tree_learner
    }

    /// Return the number of trees to train.
    #[must_use]
    pub fn num_trees(&self) -> usize {
        self.num_trees
    }

    /// Return the worker pool size.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Return the master seed.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Train `num_trees` trees on `view` in parallel.
    ///
    /// # Errors
    ///
    /// | Variant                                | When                         |
    /// |----------------------------------------|------------------------------|
    /// | [`ForestError::InvalidTreeCount`]      | `num_trees` is 0             |
    /// | [`ForestError::InvalidThreadCount`]    | `num_threads` is 0           |
    /// | [`ForestError::ThreadPool`]            | the worker pool fails to build |
    ///
    /// plus whatever the wrapped tree learner returns.
    #[instrument(skip(self, view), fields(num_trees = self.num_trees, n_samples = view.len()))]
    pub fn learn(&self, view: &DatasetView) -> Result<Forest<L::Tree>, ForestError> {
        self.validate()?;
        let pool = self.build_pool()?;
        let seeds = tree_seeds(self.seed, self.num_trees);

        info!(
            num_trees = self.num_trees,
            num_threads = self.num_threads,
            n_samples = view.len(),
            "training forest"
        );

        let state = Mutex::new(LearnerState::new(self.num_trees));
        self.callbacks.emit(Action::StartForest, &lock_state(&state));

        // collect() preserves the index order of the seeds, so the forest
        // layout never depends on which worker finishes first.
        let results: Vec<Result<L::Tree, ForestError>> = pool.install(|| {
            seeds
                .into_par_iter()
                .map(|seed| {
                    self.callbacks.emit(Action::StartTree, &lock_state(&state));
                    let tree = self.tree_learner.learn_tree(view, seed);
                    let mut state = lock_state(&state);
                    state.processed += 1;
                    self.callbacks.emit(Action::FinishTree, &state);
                    tree
                })
                .collect()
        });

        let mut forest = Forest::new();
        for tree in results {
            forest.add_tree(tree?);
        }
        self.callbacks.emit(Action::FinishForest, &lock_state(&state));
        debug!(num_trees = forest.num_trees(), "forest training complete");
        Ok(forest)
    }

    fn validate(&self) -> Result<(), ForestError> {
        if self.num_trees == 0 {
            return Err(ForestError::InvalidTreeCount { num_trees: 0 });
        }
        if self.num_threads == 0 {
            return Err(ForestError::InvalidThreadCount { num_threads: 0 });
        }
        Ok(())
    }

    fn build_pool(&self) -> Result<rayon::ThreadPool, ForestError> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads)
            .build()
            .map_err(|source| ForestError::ThreadPool { source })
    }
}

/// Trains an online forest, either from scratch or by continuing an
/// existing ensemble on new data.
///
/// Shares the dispatch of [`RandomForestLearner`]: per-tree seeds come
/// from the master seed by index and trees keep their slots, so results
/// do not depend on the worker count.
#[derive(Debug)]
pub struct OnlineRandomForestLearner {
    tree_learner: OnlineDecisionTreeLearner,
    num_trees: usize,
    num_threads: usize,
    seed: u64,
    callbacks: CallbackSet,
}

impl OnlineRandomForestLearner {
    /// Create an online forest learner around `tree_learner`.
    #[must_use]
    pub fn new(tree_learner: OnlineDecisionTreeLearner) -> Self {
        Self {
            tree_learner,
            num_trees: 8,
            num_threads: 1,
            seed: 42,
            callbacks: CallbackSet::new(),
        }
    }

    /// Set the number of trees the forest is padded to.
    #[must_use]
    pub fn with_num_trees(mut self, num_trees: usize) -> Self {
        self.num_trees = num_trees;
        self
    }

    /// Set the worker pool size.
    #[must_use]
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Set the master seed from which per-tree seeds are derived.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Register a progress callback fired at forest milestones.
    pub fn register_callback<F>(&mut self, callback: F)
    where
        F: Fn(Action, &LearnerState) -> i32 + Send + Sync + 'static,
    {
        self.callbacks.register(callback);
    }

    /// Return the wrapped tree learner.
    #[must_use]
    pub fn tree_learner(&self) -> &OnlineDecisionTreeLearner {
        &self.tree_learner
    }

    /// Return the number of trees the forest is padded to.
    #[must_use]
    pub fn num_trees(&self) -> usize {
        self.num_trees
    }

    /// Return the worker pool size.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Return the master seed.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Train a fresh forest of `num_trees` trees on `view`.
    ///
    /// # Errors
    ///
    /// Same as [`OnlineRandomForestLearner::learn_into`].
    pub fn learn(&self, view: &DatasetView) -> Result<Forest<OnlineDecisionTree>, ForestError> {
        let mut forest = Forest::new();
        self.learn_into(view, &mut forest)?;
        Ok(forest)
    }

    /// Stream `view` into every tree of `forest`, padding the forest with
    /// fresh root-only trees up to `num_trees` first.
    ///
    /// # Errors
    ///
    /// Same validation as [`RandomForestLearner::learn`], plus whatever
    /// [`OnlineDecisionTreeLearner::learn_into`] returns per tree.
    #[instrument(skip(self, view, forest), fields(num_trees = self.num_trees, n_samples = view.len()))]
    pub fn learn_into(
        &self,
        view: &DatasetView,
        forest: &mut Forest<OnlineDecisionTree>,
    ) -> Result<(), ForestError> {
        if self.num_trees == 0 {
            return Err(ForestError::InvalidTreeCount { num_trees: 0 });
        }
        if self.num_threads == 0 {
            return Err(ForestError::InvalidThreadCount { num_threads: 0 });
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads)
            .build()
            .map_err(|source| ForestError::ThreadPool { source })?;

        while forest.num_trees() < self.num_trees {
            forest.add_tree(OnlineDecisionTree::new());
        }
        let seeds = tree_seeds(self.seed, forest.num_trees());

        info!(
            num_trees = forest.num_trees(),
            num_threads = self.num_threads,
            n_samples = view.len(),
            "streaming into online forest"
        );

        let state = Mutex::new(LearnerState::new(forest.num_trees()));
        self.callbacks.emit(Action::StartForest, &lock_state(&state));

        let results: Vec<Result<(), ForestError>> = pool.install(|| {
            use rayon::iter::IntoParallelRefMutIterator;
            forest
                .trees_mut()
                .par_iter_mut()
                .zip(seeds)
                .map(|(tree, seed)| {
                    self.callbacks.emit(Action::StartTree, &lock_state(&state));
                    let outcome = self.tree_learner.learn_into_with_seed(view, tree, seed);
                    let mut state = lock_state(&state);
                    state.processed += 1;
                    self.callbacks.emit(Action::FinishTree, &state);
                    outcome
                })
                .collect()
        });
        for outcome in results {
            outcome?;
        }
        self.callbacks.emit(Action::FinishForest, &lock_state(&state));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DataStorage;
    use std::sync::Arc;

    /// Three well separated 1-d clusters, 20 points each.
    fn three_cluster_view() -> DatasetView {
        let mut storage = DataStorage::new();
        for i in 0..20 {
            storage
                .add_labeled(vec![i as f32 * 0.15, 0.5], 0)
                .unwrap();
            storage
                .add_labeled(vec![10.0 + i as f32 * 0.15, 0.5], 1)
                .unwrap();
            storage
                .add_labeled(vec![20.0 + i as f32 * 0.15, 0.5], 2)
                .unwrap();
        }
        DatasetView::from_storage(Arc::new(storage))
    }

    fn offline_forest_learner(seed: u64, threads: usize) -> RandomForestLearner<DecisionTreeLearner> {
        RandomForestLearner::new(DecisionTreeLearner::new().with_bootstrap(true))
            .with_num_trees(5)
            .with_num_threads(threads)
            .with_seed(seed)
    }

    #[test]
    fn forest_classifies_separable_clusters() {
        let view = three_cluster_view();
        let forest = offline_forest_learner(42, 1).learn(&view).unwrap();
        assert_eq!(forest.num_trees(), 5);
        let correct = (0..view.len())
            .filter(|&i| forest.classify(view.point(i)).unwrap() == view.label(i).unwrap())
            .count();
        assert!(correct as f32 / view.len() as f32 > 0.9);
    }

    #[test]
    fn thread_count_does_not_change_the_forest() {
        let view = three_cluster_view();
        let single = offline_forest_learner(7, 1).learn(&view).unwrap();
        let multi = offline_forest_learner(7, 4).learn(&view).unwrap();
        assert_eq!(single.num_trees(), multi.num_trees());
        for i in 0..view.len() {
            assert_eq!(
                single.class_log_posterior(view.point(i)).unwrap(),
                multi.class_log_posterior(view.point(i)).unwrap()
            );
        }
    }

    #[test]
    fn empty_forest_cannot_predict() {
        let forest: Forest<DecisionTree> = Forest::new();
        let err = forest.classify(&[0.0]).unwrap_err();
        assert!(matches!(err, ForestError::EmptyForest));
    }

    #[test]
    fn invalid_tree_count_error() {
        let view = three_cluster_view();
        let err = offline_forest_learner(1, 1)
            .with_num_trees(0)
            .learn(&view)
            .unwrap_err();
        assert!(matches!(err, ForestError::InvalidTreeCount { num_trees: 0 }));
    }

    #[test]
    fn finish_tree_callback_fires_once_per_tree() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let view = three_cluster_view();
        let finished = Arc::new(AtomicUsize::new(0));
        let mut learner = offline_forest_learner(42, 2);
        {
            let finished = Arc::clone(&finished);
            learner.register_callback(move |action, _| {
                if action == Action::FinishTree {
                    finished.fetch_add(1, Ordering::SeqCst);
                }
                0
            });
        }
        learner.learn(&view).unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn online_forest_learns_and_continues() {
        let view = three_cluster_view();
        let tree_learner = OnlineDecisionTreeLearner::new()
            .with_bootstrap(false)
            .with_num_thresholds(Some(30))
            .with_min_split_examples(8)
            .with_min_child_split_examples(2)
            .with_min_split_objective(0.1);
        let learner = OnlineRandomForestLearner::new(tree_learner)
            .with_num_trees(4)
            .with_num_threads(2)
            .with_seed(19);
        let mut forest = learner.learn(&view).unwrap();
        assert_eq!(forest.num_trees(), 4);
        let nodes_before: usize = forest.trees().iter().map(|t| t.num_nodes()).sum();
        learner.learn_into(&view, &mut forest).unwrap();
        let nodes_after: usize = forest.trees().iter().map(|t| t.num_nodes()).sum();
        assert!(nodes_after >= nodes_before);
        assert_eq!(forest.classify(&[0.5, 0.5]).unwrap(), 0);
        assert_eq!(forest.classify(&[22.0, 0.5]).unwrap(), 2);
    }
}
