//! Model persistence via bincode.

use std::path::Path;

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info, instrument};

use crate::{boost::BoostedForest, error::ForestError, forest::Forest};

/// Current binary format version.
const FORMAT_VERSION: u32 = 1;

/// Versioned envelope around a serialized model.
#[derive(serde::Serialize, serde::Deserialize)]
struct ModelEnvelope<M> {
    /// Format version for compatibility checking.
    format_version: u32,
    /// The serialized model.
    model: M,
}

fn save_model<M: Serialize>(model: &M, path: &Path) -> Result<(), ForestError> {
    let envelope = ModelEnvelope {
        format_version: FORMAT_VERSION,
        model,
    };
    let bytes =
        bincode::serialize(&envelope).map_err(|source| ForestError::SerializeModel { source })?;
    std::fs::write(path, &bytes).map_err(|source| ForestError::WriteModel {
        path: path.to_path_buf(),
        source,
    })?;
    info!(size_bytes = bytes.len(), "model saved");
    Ok(())
}

fn load_model<M: DeserializeOwned>(path: &Path) -> Result<M, ForestError> {
    let bytes = std::fs::read(path).map_err(|source| ForestError::ReadModel {
        path: path.to_path_buf(),
        source,
    })?;
    let envelope: ModelEnvelope<M> =
        bincode::deserialize(&bytes).map_err(|source| ForestError::DeserializeModel {
            path: path.to_path_buf(),
            source,
        })?;
    if envelope.format_version != FORMAT_VERSION {
        return Err(ForestError::IncompatibleModelVersion {
            expected: FORMAT_VERSION,
            found: envelope.format_version,
            path: path.to_path_buf(),
        });
    }
    debug!("model loaded");
    Ok(envelope.model)
}

impl<T: Serialize + DeserializeOwned> Forest<T> {
    /// Save the forest to a binary file.
    ///
    /// The trees are written as a count-prefixed sequence of node arrays
    /// inside a versioned envelope. Transient training state (online
    /// split candidates) is not written.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`ForestError::SerializeModel`] | bincode encoding failed |
    /// | [`ForestError::WriteModel`] | file write failed |
    #[instrument(skip(self), fields(path = %path.as_ref().display(), num_trees = self.num_trees()))]
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ForestError> {
        save_model(self, path.as_ref())
    }

    /// Load a forest from a binary file, checking the format version.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`ForestError::ReadModel`] | file read failed |
    /// | [`ForestError::DeserializeModel`] | bincode decoding failed |
    /// | [`ForestError::IncompatibleModelVersion`] | format version mismatch |
    #[instrument(fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ForestError> {
        load_model(path.as_ref())
    }
}

impl BoostedForest {
    /// Save the ensemble to a binary file.
    ///
    /// # Errors
    ///
    /// Same as [`Forest::save`].
    #[instrument(skip(self), fields(path = %path.as_ref().display(), num_trees = self.num_trees()))]
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ForestError> {
        save_model(self, path.as_ref())
    }

    /// Load an ensemble from a binary file, checking the format version.
    ///
    /// # Errors
    ///
    /// Same as [`Forest::load`].
    #[instrument(fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ForestError> {
        load_model(path.as_ref())
    }
}
