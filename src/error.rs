use std::path::PathBuf;

/// Errors from dataset handling, learner configuration, and model I/O.
#[derive(Debug, thiserror::Error)]
pub enum ForestError {
    /// Returned when a learner is given a dataset with zero samples.
    #[error("training dataset has zero samples")]
    EmptyDataset,

    /// Returned when a point has a different dimensionality than the storage.
    #[error("point has {got} features, expected {expected}")]
    DimensionalityMismatch {
        /// The dimensionality of the storage.
        expected: usize,
        /// The dimensionality of the offending point.
        got: usize,
    },

    /// Returned when a classification learner encounters an unlabeled sample.
    #[error("sample {index} has no label")]
    UnlabeledSample {
        /// The zero-based index of the unlabeled sample within the view.
        index: usize,
    },

    /// Returned when `num_features` exceeds the dataset dimensionality.
    #[error("num_features is {num_features}, but the dataset has {dimensionality} features")]
    InvalidNumFeatures {
        /// The requested number of features per split.
        num_features: usize,
        /// The dimensionality of the dataset.
        dimensionality: usize,
    },

    /// Returned when the streaming bootstrap rate is not a positive finite number.
    #[error("bootstrap_lambda must be positive and finite, got {lambda}")]
    InvalidBootstrapLambda {
        /// The invalid bootstrap_lambda value provided.
        lambda: f32,
    },

    /// Returned when `num_trees` is zero.
    #[error("num_trees must be at least 1, got {num_trees}")]
    InvalidTreeCount {
        /// The invalid num_trees value provided.
        num_trees: usize,
    },

    /// Returned when `num_threads` is zero.
    #[error("num_threads must be at least 1, got {num_threads}")]
    InvalidThreadCount {
        /// The invalid num_threads value provided.
        num_threads: usize,
    },

    /// Returned when the rayon worker pool could not be built.
    #[error("failed to build worker pool")]
    ThreadPool {
        /// The underlying pool-construction error.
        source: rayon::ThreadPoolBuildError,
    },

    /// Returned when a prediction input does not match the model dimensionality.
    #[error("prediction input has {got} features, expected {expected}")]
    PredictionFeatureMismatch {
        /// The dimensionality the model was trained on.
        expected: usize,
        /// The dimensionality of the prediction input.
        got: usize,
    },

    /// Returned when predicting with a forest that contains no trees.
    #[error("forest contains no trees")]
    EmptyForest,

    /// Returned when a permutation does not cover the view exactly once.
    #[error("permutation of length {got} is not a permutation of {expected} indices")]
    InvalidPermutation {
        /// The length of the view being permuted.
        expected: usize,
        /// The length of the supplied permutation.
        got: usize,
    },

    /// Returned when an excerpt range falls outside the view.
    #[error("excerpt {begin}..{end} is out of bounds for a view of length {len}")]
    ExcerptOutOfBounds {
        /// Inclusive start of the requested range.
        begin: usize,
        /// Exclusive end of the requested range.
        end: usize,
        /// The length of the view.
        len: usize,
    },

    /// Returned when boosting sample weights collapse to an unusable state.
    #[error("boosting sample weights are no longer a valid distribution")]
    DegenerateSampleWeights,

    /// Returned when model serialization fails.
    #[error("failed to serialize model")]
    SerializeModel {
        /// The underlying bincode error.
        source: Box<bincode::ErrorKind>,
    },

    /// Returned when model deserialization fails.
    #[error("failed to deserialize model from {path}")]
    DeserializeModel {
        /// Path to the model file that could not be deserialized.
        path: PathBuf,
        /// The underlying bincode error.
        source: Box<bincode::ErrorKind>,
    },

    /// Returned when writing the model file fails.
    #[error("failed to write model to {path}")]
    WriteModel {
        /// Path to the file that could not be written.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Returned when reading the model file fails.
    #[error("failed to read model from {path}")]
    ReadModel {
        /// Path to the file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Returned when loading a model with an incompatible format version.
    #[error("incompatible model version in {path}: expected {expected}, found {found}")]
    IncompatibleModelVersion {
        /// The model format version this build expects.
        expected: u32,
        /// The model format version found in the file.
        found: u32,
        /// Path to the model file with the incompatible version.
        path: PathBuf,
    },
}
