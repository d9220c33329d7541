//! Decision tree and forest learning with incremental split statistics.
//!
//! Provides offline and online decision tree learners over arena-allocated
//! trees, random forest and online forest orchestration parallelized via
//! rayon, SAMME boosting, progress callbacks, and bincode model persistence.

mod boost;
mod classifier;
mod dataset;
mod density;
mod error;
mod forest;
mod offline;
mod online;
mod progress;
mod serialize;
mod split;
mod stats;
mod tree;

pub use boost::{BoostedForest, BoostedRandomForestLearner, WeakTree};
pub use classifier::Classifier;
pub use dataset::{DataStorage, DatasetView};
pub use density::{DensityTree, DensityTreeLearner, GaussianLeaf};
pub use error::ForestError;
pub use forest::{Forest, OnlineRandomForestLearner, RandomForestLearner, TreeLearner};
pub use offline::DecisionTreeLearner;
pub use online::{
    OnlineDecisionTree, OnlineDecisionTreeLearner, OnlineNodeData, RandomThresholdGenerator,
};
pub use progress::{Action, Callback, CallbackSet, LearnerState};
pub use stats::{EntropyHistogram, GaussianStats, SplitStatistic};
pub use tree::{DecisionTree, LeafData, LeafModel, NodeConfig, Tree};
