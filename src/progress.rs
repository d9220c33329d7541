use std::time::Instant;

/// Training milestones reported to registered callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Forest training is about to start.
    StartForest,
    /// One tree is about to be trained.
    StartTree,
    /// One tree finished training.
    FinishTree,
    /// Forest training finished.
    FinishForest,
    /// A node's split candidates were initialized.
    InitNode,
    /// A node was split.
    SplitNode,
    /// A node was finalized as a leaf.
    LeafReached,
    /// The best candidate objective fell below the split threshold.
    ObjectiveTooLow,
}

/// A snapshot of learner progress passed to callbacks.
///
/// Purely observational: nothing in training reads it back.
#[derive(Debug, Clone)]
pub struct LearnerState {
    /// When training started.
    pub start_time: Instant,
    /// Total units of work (trees for a forest, samples for a tree).
    pub total: usize,
    /// Units of work completed so far.
    pub processed: usize,
    /// Depth of the node the learner is currently working on.
    pub depth: u32,
    /// Number of nodes in the tree under construction.
    pub num_nodes: usize,
    /// The most recent split objective.
    pub objective: f32,
    /// Weighted training error of the latest weak classifier (boosting).
    pub error: f32,
    /// Weight assigned to the latest weak classifier (boosting).
    pub weight: f32,
}

impl LearnerState {
    /// Create a fresh state with the clock started now.
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self {
            start_time: Instant::now(),
            total,
            processed: 0,
            depth: 0,
            num_nodes: 0,
            objective: 0.0,
            error: 0.0,
            weight: 0.0,
        }
    }
}

/// The signature of a progress callback.
pub type Callback = dyn Fn(Action, &LearnerState) -> i32 + Send + Sync;

/// An ordered collection of progress callbacks.
///
/// [`CallbackSet::emit`] invokes every callback and combines the returned
/// values with bitwise OR. The combined value is informational only and
/// never influences training.
#[derive(Default)]
pub struct CallbackSet {
    callbacks: Vec<Box<Callback>>,
}

impl CallbackSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. Callbacks fire in registration order.
    pub fn register<F>(&mut self, callback: F)
    where
        F: Fn(Action, &LearnerState) -> i32 + Send + Sync + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    /// Return the number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Return `true` when no callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Invoke every callback with `action` and `state`; OR the results.
    pub fn emit(&self, action: Action, state: &LearnerState) -> i32 {
        let mut combined = 0;
        for callback in &self.callbacks {
            combined |= callback(action, state);
        }
        combined
    }
}

impl std::fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSet")
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_ors_return_values() {
        let mut callbacks = CallbackSet::new();
        callbacks.register(|_, _| 0b01);
        callbacks.register(|_, _| 0b10);
        let state = LearnerState::new(1);
        assert_eq!(callbacks.emit(Action::StartForest, &state), 0b11);
    }

    #[test]
    fn every_callback_fires() {
        let hits = std::sync::Arc::new(AtomicUsize::new(0));
        let mut callbacks = CallbackSet::new();
        for _ in 0..3 {
            let hits = std::sync::Arc::clone(&hits);
            callbacks.register(move |_, _| {
                hits.fetch_add(1, Ordering::SeqCst);
                0
            });
        }
        callbacks.emit(Action::FinishTree, &LearnerState::new(0));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn empty_set_emits_zero() {
        let callbacks = CallbackSet::new();
        assert_eq!(callbacks.emit(Action::FinishForest, &LearnerState::new(0)), 0);
        assert!(callbacks.is_empty());
    }
}
