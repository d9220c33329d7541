use crate::{
    ForestError,
    tree::{LeafModel, Tree},
};

/// A model that assigns class log-posteriors to feature vectors.
pub trait Classifier {
    /// Return the unnormalized per-class log-posterior for `point`.
    ///
    /// # Errors
    ///
    /// Returns [`ForestError::PredictionFeatureMismatch`] when `point` does
    /// not match the dimensionality the model was trained on, and
    /// [`ForestError::EmptyForest`] for an ensemble with no members.
    fn class_log_posterior(&self, point: &[f32]) -> Result<Vec<f32>, ForestError>;

    /// Return the most probable class for `point`.
    ///
    /// # Errors
    ///
    /// Propagates the errors of [`Classifier::class_log_posterior`].
    fn classify(&self, point: &[f32]) -> Result<usize, ForestError> {
        let posterior = self.class_log_posterior(point)?;
        Ok(argmax(&posterior))
    }
}

/// Index of the largest value, first on ties, 0 for an empty slice.
pub(crate) fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

impl<D: LeafModel> Classifier for Tree<D> {
    fn class_log_posterior(&self, point: &[f32]) -> Result<Vec<f32>, ForestError> {
        if point.len() != self.dimensionality() {
            return Err(ForestError::PredictionFeatureMismatch {
                expected: self.dimensionality(),
                got: point.len(),
            });
        }
        let leaf = self.route(point);
        Ok(self.data(leaf).log_histogram().to_vec())
    }
}
