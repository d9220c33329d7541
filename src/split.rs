use rand::Rng;

use crate::{dataset::DatasetView, stats::SplitStatistic};

/// Relative tolerance below which two adjacent feature values are treated
/// as equal during the threshold sweep.
const VALUE_EPSILON: f32 = 1e-6;

/// The winning axis-aligned threshold of an exhaustive split search.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SplitCandidate {
    pub feature: usize,
    pub threshold: f32,
    pub objective: f32,
}

/// Draw `count` distinct feature indices from `0..dimensionality`.
///
/// Partial Fisher-Yates: only the first `count` slots are shuffled.
pub(crate) fn sample_features<R: Rng>(
    dimensionality: usize,
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    let mut pool: Vec<usize> = (0..dimensionality).collect();
    for i in 0..count.min(dimensionality) {
        let j = rng.gen_range(i..dimensionality);
        pool.swap(i, j);
    }
    pool.truncate(count);
    pool
}

/// Exhaustively search the sampled features for the threshold minimizing
/// the summed impurity of the two children.
///
/// Generic over the accumulated statistic: classification passes an
/// entropy histogram with a label lookup, density estimation a Gaussian
/// statistic with the points themselves. `positions` are view positions
/// of the node's samples and `item` maps a position to the observation
/// the statistic accumulates. For each sampled feature the positions are
/// sorted by value (ties broken by position so equal seeds give equal
/// trees) and swept once, moving one observation at a time from the
/// right statistic to the left. `empty` is the template the left
/// statistic starts from; `right` starts as a clone of `parent`. Cut
/// points between near-equal values are skipped, as are cuts leaving
/// either child below `min_child_split_examples`. Returns `None` when no
/// cut improves on `parent_impurity`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn find_best_split<'a, S, R>(
    view: &DatasetView,
    positions: &[usize],
    empty: &S,
    parent: &S,
    parent_impurity: f32,
    num_features: usize,
    min_child_split_examples: usize,
    rng: &mut R,
    item: impl Fn(usize) -> &'a S::Item,
) -> Option<SplitCandidate>
where
    S: SplitStatistic + Clone,
    S::Item: 'a,
    R: Rng,
{
    if positions.len() < 2 {
        return None;
    }

    let mut best: Option<SplitCandidate> = None;

    for feature in sample_features(view.dimensionality(), num_features, rng) {
        let mut sorted = positions.to_vec();
        sorted.sort_unstable_by(|&a, &b| {
            view.point(a)[feature]
                .partial_cmp(&view.point(b)[feature])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });

        let mut left = empty.clone();
        let mut right = parent.clone();

        for m in 0..sorted.len() - 1 {
            let observation = item(sorted[m]);
            left.add(observation);
            right.remove(observation);

            let low = view.point(sorted[m])[feature];
            let high = view.point(sorted[m + 1])[feature];
            // No representable cut point between near-equal values.
            if high - low
                < VALUE_EPSILON * (high.abs() + VALUE_EPSILON).max(low.abs() + VALUE_EPSILON)
            {
                continue;
            }
            if (left.mass() as usize) < min_child_split_examples
                || (right.mass() as usize) < min_child_split_examples
            {
                continue;
            }

            let objective = left.impurity() + right.impurity();
            let improves = match best {
                Some(candidate) => objective < candidate.objective,
                None => objective < parent_impurity,
            };
            if improves {
                best = Some(SplitCandidate {
                    feature,
                    threshold: (low + high) / 2.0,
                    objective,
                });
            }
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DataStorage;
    use crate::stats::{EntropyHistogram, GaussianStats};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::sync::Arc;

    fn view_of(points: Vec<(Vec<f32>, usize)>) -> (DatasetView, Vec<usize>) {
        let mut storage = DataStorage::new();
        let mut labels = Vec::new();
        for (point, label) in points {
            labels.push(label);
            storage.add_labeled(point, label).unwrap();
        }
        (DatasetView::from_storage(Arc::new(storage)), labels)
    }

    fn histogram_of(labels: &[usize], class_count: usize) -> EntropyHistogram {
        let mut hist = EntropyHistogram::new(class_count);
        for label in labels {
            hist.add(label);
        }
        hist
    }

    fn best_entropy_split<R: rand::Rng>(
        view: &DatasetView,
        positions: &[usize],
        labels: &[usize],
        parent: &EntropyHistogram,
        num_features: usize,
        min_child: usize,
        rng: &mut R,
    ) -> Option<SplitCandidate> {
        find_best_split(
            view,
            positions,
            &EntropyHistogram::new(parent.class_count()),
            parent,
            parent.entropy(),
            num_features,
            min_child,
            rng,
            |p| &labels[p],
        )
    }

    #[test]
    fn separable_data_yields_midpoint_threshold() {
        let (view, labels) = view_of(vec![
            (vec![0.0], 0),
            (vec![1.0], 0),
            (vec![2.0], 1),
            (vec![3.0], 1),
        ]);
        let positions = vec![0, 1, 2, 3];
        let parent = histogram_of(&labels, 2);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let split =
            best_entropy_split(&view, &positions, &labels, &parent, 1, 1, &mut rng).unwrap();
        assert_eq!(split.feature, 0);
        assert!(split.threshold > 1.0 && split.threshold < 2.0);
        // Perfect split leaves both children pure.
        assert!(split.objective.abs() < 1e-4);
    }

    #[test]
    fn pure_node_has_no_split() {
        let (view, labels) = view_of(vec![(vec![0.0], 0), (vec![1.0], 0), (vec![2.0], 0)]);
        let parent = histogram_of(&labels, 1);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(best_entropy_split(&view, &[0, 1, 2], &labels, &parent, 1, 1, &mut rng).is_none());
    }

    #[test]
    fn identical_values_have_no_cut_point() {
        let (view, labels) = view_of(vec![(vec![5.0], 0), (vec![5.0], 1), (vec![5.0], 0)]);
        let parent = histogram_of(&labels, 2);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(best_entropy_split(&view, &[0, 1, 2], &labels, &parent, 1, 1, &mut rng).is_none());
    }

    #[test]
    fn min_child_mass_is_respected() {
        let (view, labels) = view_of(vec![
            (vec![0.0], 0),
            (vec![1.0], 1),
            (vec![2.0], 1),
            (vec![3.0], 1),
        ]);
        let parent = histogram_of(&labels, 2);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        // The ideal cut isolates sample 0, but each child needs two samples.
        let split = best_entropy_split(&view, &[0, 1, 2, 3], &labels, &parent, 1, 2, &mut rng);
        if let Some(split) = split {
            assert!(split.threshold > 1.0);
        }
    }

    #[test]
    fn gaussian_statistic_splits_between_spatial_clusters() {
        // Two tight 1-d clusters; cutting between them shrinks both
        // children's covariance determinants.
        let mut points = Vec::new();
        for i in 0..10 {
            points.push((vec![i as f32 * 0.1, i as f32 * 0.07], 0));
            points.push((vec![10.0 + i as f32 * 0.1, 10.0 + i as f32 * 0.07], 0));
        }
        let (view, _) = view_of(points);
        let positions: Vec<usize> = (0..view.len()).collect();
        let mut parent = GaussianStats::new(2);
        for &p in &positions {
            parent.add(view.point(p));
        }
        let parent_impurity = parent.impurity();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let split = find_best_split(
            &view,
            &positions,
            &GaussianStats::new(2),
            &parent,
            parent_impurity,
            2,
            2,
            &mut rng,
            |p| view.point(p),
        )
        .unwrap();
        assert!(split.threshold > 1.0 && split.threshold < 10.0);
        assert!(split.objective < parent_impurity);
    }

    #[test]
    fn sampled_features_are_distinct_and_in_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let features = sample_features(10, 4, &mut rng);
        assert_eq!(features.len(), 4);
        let mut unique = features.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 4);
        assert!(features.iter().all(|&f| f < 10));
    }

    #[test]
    fn picks_the_informative_feature() {
        // Feature 1 separates the classes, feature 0 is constant.
        let (view, labels) = view_of(vec![
            (vec![1.0, 0.0], 0),
            (vec![1.0, 1.0], 0),
            (vec![1.0, 8.0], 1),
            (vec![1.0, 9.0], 1),
        ]);
        let parent = histogram_of(&labels, 2);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let split =
            best_entropy_split(&view, &[0, 1, 2, 3], &labels, &parent, 2, 1, &mut rng).unwrap();
        assert_eq!(split.feature, 1);
    }
}
