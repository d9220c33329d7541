//! End-to-end learning tests for canopy.
//!
//! These tests train forests on a deterministic synthetic dataset and verify
//! classification accuracy, seed reproducibility, thread-count independence,
//! online continuation, boosting, and model persistence.

use std::sync::Arc;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

use canopy::{
    BoostedRandomForestLearner, Classifier, DataStorage, DatasetView, DecisionTree,
    DecisionTreeLearner, Forest, OnlineDecisionTreeLearner, OnlineRandomForestLearner,
    RandomForestLearner,
};

// ---------------------------------------------------------------------------
// Helper: deterministic synthetic classification dataset
// ---------------------------------------------------------------------------

/// Generate a 300-sample, 6-feature, 3-class classification dataset.
///
/// Features 0-1 are informative (class * 3.0 + noise in [0, 0.5]).
/// Features 2-5 are pure noise in [0, 0.5].
/// Samples are assigned round-robin across classes.
fn make_classification() -> DatasetView {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let n_samples = 300;
    let n_features = 6;
    let n_classes = 3;

    let mut storage = DataStorage::new();
    for i in 0..n_samples {
        let class = i % n_classes;
        let point: Vec<f32> = (0..n_features)
            .map(|f| {
                let base = if f < 2 { class as f32 * 3.0 } else { 0.0 };
                base + rng.r#gen::<f32>() * 0.5
            })
            .collect();
        storage.add_labeled(point, class).unwrap();
    }
    DatasetView::from_storage(Arc::new(storage))
}

fn training_accuracy(classifier: &impl Classifier, view: &DatasetView) -> f64 {
    let correct = (0..view.len())
        .filter(|&i| classifier.classify(view.point(i)).unwrap() == view.label(i).unwrap())
        .count();
    correct as f64 / view.len() as f64
}

// ---------------------------------------------------------------------------
// a) forest_accuracy_above_threshold
// ---------------------------------------------------------------------------

/// A 20-tree bootstrapped forest must exceed 0.95 training accuracy.
///
/// Reference: observed accuracy = 1.0 with seed=42 on the synthetic dataset.
#[test]
fn forest_accuracy_above_threshold() {
    let view = make_classification();
    let learner = RandomForestLearner::new(
        DecisionTreeLearner::new()
            .with_bootstrap(true)
            .with_num_features(Some(3)),
    )
    .with_num_trees(20)
    .with_seed(42);

    let forest = learner.learn(&view).unwrap();
    let accuracy = training_accuracy(&forest, &view);
    assert!(accuracy > 0.95, "training accuracy {accuracy} <= 0.95");
}

// ---------------------------------------------------------------------------
// b) deterministic_forests
// ---------------------------------------------------------------------------

/// Same learner configuration and seed must produce identical posteriors
/// across two independent runs.
#[test]
fn deterministic_forests() {
    let view = make_classification();
    let learner = RandomForestLearner::new(DecisionTreeLearner::new().with_bootstrap(true))
        .with_num_trees(5)
        .with_seed(7);

    let first = learner.learn(&view).unwrap();
    let second = learner.learn(&view).unwrap();

    for i in 0..view.len() {
        assert_eq!(
            first.class_log_posterior(view.point(i)).unwrap(),
            second.class_log_posterior(view.point(i)).unwrap(),
            "posteriors differ across runs with the same seed"
        );
    }
}

// ---------------------------------------------------------------------------
// c) thread_count_does_not_change_forest
// ---------------------------------------------------------------------------

/// Training with 1 thread and 4 threads must produce identical forests
/// because per-tree seeds are derived from the tree index.
#[test]
fn thread_count_does_not_change_forest() {
    let view = make_classification();
    let base = || {
        RandomForestLearner::new(DecisionTreeLearner::new().with_bootstrap(true))
            .with_num_trees(8)
            .with_seed(42)
    };

    let serial = base().with_num_threads(1).learn(&view).unwrap();
    let parallel = base().with_num_threads(4).learn(&view).unwrap();

    for i in 0..view.len() {
        assert_eq!(
            serial.class_log_posterior(view.point(i)).unwrap(),
            parallel.class_log_posterior(view.point(i)).unwrap(),
            "posteriors differ between thread counts"
        );
    }
}

// ---------------------------------------------------------------------------
// d) online_forest_learns_and_continues
// ---------------------------------------------------------------------------

/// An online forest trained over two passes of the same data must classify
/// the cluster centers correctly.
#[test]
fn online_forest_learns_and_continues() {
    let view = make_classification();
    let learner = OnlineRandomForestLearner::new(
        OnlineDecisionTreeLearner::new()
            .with_num_thresholds(Some(25))
            .with_min_split_examples(20)
            .with_min_child_split_examples(3)
            .with_min_split_objective(0.1),
    )
    .with_num_trees(5)
    .with_seed(42);

    let mut forest = learner.learn(&view).unwrap();
    learner.learn_into(&view, &mut forest).unwrap();

    for class in 0..3usize {
        let center = [
            class as f32 * 3.0 + 0.25,
            class as f32 * 3.0 + 0.25,
            0.25,
            0.25,
            0.25,
            0.25,
        ];
        assert_eq!(
            forest.classify(&center).unwrap(),
            class,
            "cluster center for class {class} misclassified"
        );
    }
}

// ---------------------------------------------------------------------------
// e) boosting_accuracy_above_threshold
// ---------------------------------------------------------------------------

/// A 30-round boosted ensemble of depth-2 trees must exceed 0.9 training
/// accuracy on the synthetic dataset.
#[test]
fn boosting_accuracy_above_threshold() {
    let view = make_classification();
    let learner = BoostedRandomForestLearner::new(
        DecisionTreeLearner::new()
            .with_max_depth(2)
            .with_smoothing(0.0),
    )
    .with_num_trees(30)
    .with_seed(42);

    let ensemble = learner.learn(&view).unwrap();
    let accuracy = training_accuracy(&ensemble, &view);
    assert!(accuracy > 0.9, "boosted training accuracy {accuracy} <= 0.9");
}

// ---------------------------------------------------------------------------
// f) saved_model_predicts_like_original
// ---------------------------------------------------------------------------

/// A forest saved to disk and loaded back must produce the exact posteriors
/// of the original on every training point.
#[test]
fn saved_model_predicts_like_original() {
    let view = make_classification();
    let forest = RandomForestLearner::new(DecisionTreeLearner::new().with_bootstrap(true))
        .with_num_trees(5)
        .with_seed(42)
        .learn(&view)
        .unwrap();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("model.bin");
    forest.save(&path).unwrap();
    let loaded: Forest<DecisionTree> = Forest::load(&path).unwrap();

    for i in 0..view.len() {
        assert_eq!(
            forest.class_log_posterior(view.point(i)).unwrap(),
            loaded.class_log_posterior(view.point(i)).unwrap(),
            "loaded model diverges from original"
        );
    }
}

// ---------------------------------------------------------------------------
// g) streaming_learner_matches_batch_on_separable_data
// ---------------------------------------------------------------------------

/// With the objective gate disabled, one streaming pass over four trivially
/// separable points must settle on the same two-leaf structure the batch
/// learner finds, with the cut landing inside the class gap.
#[test]
fn streaming_learner_matches_batch_on_separable_data() {
    let mut storage = DataStorage::new();
    storage.add_labeled(vec![0.0], 0).unwrap();
    storage.add_labeled(vec![1.0], 0).unwrap();
    storage.add_labeled(vec![2.0], 1).unwrap();
    storage.add_labeled(vec![3.0], 1).unwrap();
    let view = DatasetView::from_storage(Arc::new(storage));

    let batch_tree = DecisionTreeLearner::new()
        .with_min_split_examples(2)
        .learn(&view)
        .unwrap();

    let stream_tree = OnlineDecisionTreeLearner::new()
        .with_bootstrap(false)
        .with_num_thresholds(Some(50))
        .with_min_split_examples(2)
        .with_min_child_split_examples(1)
        .with_min_split_objective(0.0)
        .learn(&view)
        .unwrap();

    assert_eq!(batch_tree.num_nodes(), 3);
    assert_eq!(stream_tree.num_nodes(), 3);

    let threshold = stream_tree.config(0).threshold();
    assert!(
        threshold > 1.0 && threshold < 2.0,
        "streaming root cut {threshold} outside the class gap"
    );

    for i in 0..view.len() {
        let label = view.label(i).unwrap();
        assert_eq!(batch_tree.classify(view.point(i)).unwrap(), label);
        assert_eq!(stream_tree.classify(view.point(i)).unwrap(), label);
    }
}
