use nalgebra::{DMatrix, DVector};

/// A statistic over a set of training points that supports constant-time
/// membership updates and cheap impurity retrieval.
///
/// Split searches move points between a left and a right statistic one at
/// a time; both `add` and `remove` must therefore cost O(1) in the number
/// of points already accumulated.
pub trait SplitStatistic {
    /// The per-point observation the statistic accumulates.
    type Item: ?Sized;

    /// Account for one observation.
    fn add(&mut self, item: &Self::Item);

    /// Remove one previously added observation.
    fn remove(&mut self, item: &Self::Item);

    /// Return the number of accumulated observations.
    fn mass(&self) -> u32;

    /// Return the mass-weighted impurity of the accumulated observations.
    ///
    /// Takes `&mut self` so implementations may materialize cached
    /// intermediates lazily.
    fn impurity(&mut self) -> f32;

    /// Return `true` when no split of the accumulated observations can
    /// reduce impurity further.
    fn is_pure(&self) -> bool;
}

/// `-n * log2(n)`, with the zero-count term defined as 0.
#[inline]
fn neg_n_log2_n(n: u32) -> f32 {
    if n == 0 {
        0.0
    } else {
        let n = n as f32;
        -n * n.log2()
    }
}

/// A class histogram maintaining its mass-weighted entropy incrementally.
///
/// The entropy of a histogram with bin counts `c_1..c_k` and mass
/// `m = sum c_i`, scaled by `m`, equals `m*log2(m) - sum c_i*log2(c_i)`.
/// Each update touches one bin, so only that bin's term and the mass term
/// change; [`SplitStatistic::impurity`] is a field read.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct EntropyHistogram {
    counts: Vec<u32>,
    /// Per-bin `-c_i * log2(c_i)` terms.
    entropies: Vec<f32>,
    /// `m*log2(m) + sum entropies`, kept current on every update.
    total_entropy: f32,
    mass: u32,
}

impl EntropyHistogram {
    /// Create an empty histogram with `class_count` bins.
    #[must_use]
    pub fn new(class_count: usize) -> Self {
        Self {
            counts: vec![0; class_count],
            entropies: vec![0.0; class_count],
            total_entropy: 0.0,
            mass: 0,
        }
    }

    /// Return the number of bins.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.counts.len()
    }

    /// Return the count in bin `label`.
    #[must_use]
    pub fn count(&self, label: usize) -> u32 {
        self.counts[label]
    }

    /// Return the current mass-weighted entropy without going through the
    /// trait (which takes `&mut self` for the sake of lazy implementors).
    #[must_use]
    pub fn entropy(&self) -> f32 {
        self.total_entropy
    }

    /// Widen the histogram to at least `class_count` bins, keeping every
    /// accumulated count. Empty bins contribute nothing to the entropy,
    /// so the total is unaffected.
    pub fn grow_classes(&mut self, class_count: usize) {
        if class_count > self.counts.len() {
            self.counts.resize(class_count, 0);
            self.entropies.resize(class_count, 0.0);
        }
    }

    /// Produce the smoothed log-posterior vector stored at a leaf:
    /// `log((c_i + smoothing) / (m + k*smoothing))` per class.
    #[must_use]
    pub fn to_log_histogram(&self, smoothing: f32) -> Vec<f32> {
        let k = self.counts.len() as f32;
        let denom = self.mass as f32 + k * smoothing;
        self.counts
            .iter()
            .map(|&c| ((c as f32 + smoothing) / denom).ln())
            .collect()
    }
}

impl SplitStatistic for EntropyHistogram {
    type Item = usize;

    /// Add one observation of class `label`.
    ///
    /// # Panics
    ///
    /// Panics when `label` is not a valid bin index.
    fn add(&mut self, label: &usize) {
        let label = *label;
        assert!(label < self.counts.len(), "label {label} out of range");
        self.mass += 1;
        let new_count = self.counts[label] + 1;
        // The mass term contributes +m*log2(m), so its delta is the old
        // neg-term minus the new one.
        self.total_entropy += neg_n_log2_n(self.mass - 1) - neg_n_log2_n(self.mass);
        let term = neg_n_log2_n(new_count);
        self.counts[label] = new_count;
        self.total_entropy += term - self.entropies[label];
        self.entropies[label] = term;
    }

    /// Remove one observation of class `label`.
    ///
    /// # Panics
    ///
    /// Panics when bin `label` is empty or `label` is out of range.
    fn remove(&mut self, label: &usize) {
        let label = *label;
        assert!(label < self.counts.len(), "label {label} out of range");
        assert!(self.counts[label] > 0, "removing from empty bin {label}");
        self.mass -= 1;
        let new_count = self.counts[label] - 1;
        self.total_entropy += neg_n_log2_n(self.mass + 1) - neg_n_log2_n(self.mass);
        let term = neg_n_log2_n(new_count);
        self.counts[label] = new_count;
        self.total_entropy += term - self.entropies[label];
        self.entropies[label] = term;
    }

    fn mass(&self) -> u32 {
        self.mass
    }

    fn impurity(&mut self) -> f32 {
        self.total_entropy
    }

    fn is_pure(&self) -> bool {
        self.counts.iter().filter(|&&c| c > 0).count() <= 1
    }
}

/// A Gaussian sufficient statistic built from a running vector sum and a
/// running sum of outer products.
///
/// The mean, covariance, and covariance determinant are materialized on
/// first request after an update and cached until the next update, so a
/// sweep that alternates updates with impurity reads pays one
/// factorization per read while bulk loading stays cheap.
#[derive(Debug, Clone)]
pub struct GaussianStats {
    sum: DVector<f32>,
    sq_sum: DMatrix<f32>,
    mass: u32,
    cached_mean: Option<DVector<f32>>,
    cached_covariance: Option<DMatrix<f32>>,
    cached_determinant: Option<f32>,
}

impl GaussianStats {
    /// Create an empty statistic over `dimensionality`-dimensional points.
    #[must_use]
    pub fn new(dimensionality: usize) -> Self {
        Self {
            sum: DVector::zeros(dimensionality),
            sq_sum: DMatrix::zeros(dimensionality, dimensionality),
            mass: 0,
            cached_mean: None,
            cached_covariance: None,
            cached_determinant: None,
        }
    }

    fn invalidate(&mut self) {
        self.cached_mean = None;
        self.cached_covariance = None;
        self.cached_determinant = None;
    }

    /// Return the sample mean, materializing it if needed.
    ///
    /// # Panics
    ///
    /// Panics when the statistic is empty.
    pub fn mean(&mut self) -> &DVector<f32> {
        assert!(self.mass > 0, "mean of an empty statistic");
        self.cached_mean
            .get_or_insert_with(|| &self.sum / self.mass as f32)
    }

    /// Return the sample covariance, materializing it if needed.
    ///
    /// # Panics
    ///
    /// Panics when fewer than two observations have been accumulated.
    pub fn covariance(&mut self) -> &DMatrix<f32> {
        assert!(self.mass >= 2, "covariance needs at least two observations");
        self.cached_covariance.get_or_insert_with(|| {
            let m = self.mass as f32;
            let outer = &self.sum * self.sum.transpose();
            &self.sq_sum / (m - 1.0) - outer / (m * m)
        })
    }

    /// Return the determinant of the covariance, materializing it if needed.
    pub fn determinant(&mut self) -> f32 {
        if let Some(det) = self.cached_determinant {
            return det;
        }
        let det = self.covariance().determinant();
        self.cached_determinant = Some(det);
        det
    }
}

impl SplitStatistic for GaussianStats {
    type Item = [f32];

    fn add(&mut self, point: &[f32]) {
        let x = DVector::from_column_slice(point);
        self.sum += &x;
        self.sq_sum += &x * x.transpose();
        self.mass += 1;
        self.invalidate();
    }

    fn remove(&mut self, point: &[f32]) {
        assert!(self.mass > 0, "removing from an empty statistic");
        let x = DVector::from_column_slice(point);
        self.sum -= &x;
        self.sq_sum -= &x * x.transpose();
        self.mass -= 1;
        self.invalidate();
    }

    fn mass(&self) -> u32 {
        self.mass
    }

    /// Mass-weighted differential-entropy surrogate `m * log2(det(cov))`.
    ///
    /// Degenerate covariances (fewer than two points, or a singular
    /// matrix) yield 0, so they never look like an attractive split side.
    fn impurity(&mut self) -> f32 {
        if self.mass < 2 {
            return 0.0;
        }
        let det = self.determinant();
        if det <= 0.0 {
            return 0.0;
        }
        self.mass as f32 * det.log2()
    }

    fn is_pure(&self) -> bool {
        self.mass < 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Entropy recomputed from the bin counts alone.
    fn scratch_entropy(counts: &[u32]) -> f32 {
        let mass: u32 = counts.iter().sum();
        let mut total = neg_n_log2_n(mass);
        // The mass term enters with the opposite sign of the bin terms.
        total = -total;
        for &c in counts {
            total += neg_n_log2_n(c);
        }
        total
    }

    #[test]
    fn incremental_entropy_matches_scratch() {
        let mut hist = EntropyHistogram::new(4);
        let labels = [0usize, 1, 1, 2, 2, 2, 3, 0, 1, 2];
        for label in &labels {
            hist.add(label);
        }
        for label in &labels[..4] {
            hist.remove(label);
        }
        let mut counts = vec![0u32; 4];
        for label in &labels[4..] {
            counts[*label] += 1;
        }
        let expected = scratch_entropy(&counts);
        assert!(
            (hist.impurity() - expected).abs() <= 1e-4 * expected.abs().max(1.0),
            "incremental {} vs scratch {}",
            hist.impurity(),
            expected
        );
    }

    #[test]
    fn empty_and_single_bin_have_zero_entropy() {
        let mut hist = EntropyHistogram::new(3);
        assert_eq!(hist.impurity(), 0.0);
        for _ in 0..5 {
            hist.add(&1);
        }
        assert!(hist.impurity().abs() < 1e-5);
        assert!(hist.is_pure());
    }

    #[test]
    fn add_then_remove_restores_empty() {
        let mut hist = EntropyHistogram::new(2);
        hist.add(&0);
        hist.add(&1);
        hist.remove(&0);
        hist.remove(&1);
        assert_eq!(hist.mass(), 0);
        assert_eq!(hist.count(0), 0);
        assert!(hist.impurity().abs() < 1e-6);
    }

    #[test]
    fn grow_classes_keeps_counts_and_entropy() {
        let mut hist = EntropyHistogram::new(2);
        for label in [0usize, 0, 1] {
            hist.add(&label);
        }
        let before = hist.impurity();
        hist.grow_classes(4);
        assert_eq!(hist.class_count(), 4);
        assert_eq!(hist.mass(), 3);
        assert_eq!(hist.impurity(), before);
        hist.add(&3);
        assert_eq!(hist.count(3), 1);
        // Widening never shrinks.
        hist.grow_classes(2);
        assert_eq!(hist.class_count(), 4);
    }

    #[test]
    #[should_panic(expected = "removing from empty bin")]
    fn remove_from_empty_bin_panics() {
        let mut hist = EntropyHistogram::new(2);
        hist.add(&0);
        hist.remove(&1);
    }

    #[test]
    fn log_histogram_exponentiates_to_unit_sum() {
        let mut hist = EntropyHistogram::new(3);
        for label in [0usize, 0, 1, 2, 2, 2] {
            hist.add(&label);
        }
        let log_hist = hist.to_log_histogram(1.0);
        let sum: f32 = log_hist.iter().map(|&v| v.exp()).sum();
        assert!((sum - 1.0).abs() < 1e-5, "sum = {sum}");
    }

    #[test]
    fn log_histogram_without_smoothing_is_exact() {
        let mut hist = EntropyHistogram::new(2);
        for label in [0usize, 0, 0, 1] {
            hist.add(&label);
        }
        let log_hist = hist.to_log_histogram(0.0);
        assert!((log_hist[0].exp() - 0.75).abs() < 1e-6);
        assert!((log_hist[1].exp() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn gaussian_incremental_matches_scratch() {
        let points: Vec<Vec<f32>> = vec![
            vec![1.0, 2.0],
            vec![2.0, 1.0],
            vec![3.0, 5.0],
            vec![4.0, 3.0],
            vec![0.0, 1.0],
        ];
        // Build one statistic with adds and removes, another fresh from the
        // surviving points; both must agree.
        let mut incremental = GaussianStats::new(2);
        for p in &points {
            incremental.add(p);
        }
        incremental.remove(&points[4]);
        let mut scratch = GaussianStats::new(2);
        for p in &points[..4] {
            scratch.add(p);
        }
        let got_mean = incremental.mean().clone();
        let want_mean = scratch.mean().clone();
        for d in 0..2 {
            assert!((got_mean[d] - want_mean[d]).abs() < 1e-4);
        }
        let got_cov = incremental.covariance().clone();
        let want_cov = scratch.covariance().clone();
        for i in 0..2 {
            for j in 0..2 {
                assert!(
                    (got_cov[(i, j)] - want_cov[(i, j)]).abs() < 1e-3,
                    "cov[{i}][{j}]: {} vs {}",
                    got_cov[(i, j)],
                    want_cov[(i, j)]
                );
            }
        }
        let rel = (incremental.impurity() - scratch.impurity()).abs()
            / scratch.impurity().abs().max(1.0);
        assert!(rel < 1e-4);
    }

    #[test]
    fn gaussian_caches_invalidate_on_update() {
        let mut stats = GaussianStats::new(1);
        stats.add(&[0.0]);
        stats.add(&[2.0]);
        let first = stats.impurity();
        stats.add(&[10.0]);
        let second = stats.impurity();
        assert_ne!(first, second);
    }

    #[test]
    fn gaussian_degenerate_impurity_is_zero() {
        let mut stats = GaussianStats::new(2);
        assert_eq!(stats.impurity(), 0.0);
        stats.add(&[1.0, 1.0]);
        assert_eq!(stats.impurity(), 0.0);
        assert!(stats.is_pure());
    }
}
