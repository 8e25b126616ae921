use log::debug;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};

use super::kernel::{Decomposer, Eigenmodes, SymmetricEigenKernel};
use super::modes::{AnalysisKind, ModeRange, ModeSelection, ModeSet};
use crate::error::{Result, SpanError};

/// An MSSA coefficient is undetermined when fewer than this fraction of
/// its lagged entries are valid.
const MSSA_MIN_VALID_FRACTION: f64 = 0.5;

// ---------------------------------------------------------------------------
// ModalEngine
// ---------------------------------------------------------------------------

/// PCA, MSSA and SVD decompositions of `(channels, time)` matrices, and
/// reconstructions from selected modes.
///
/// The numeric factorisation is delegated to a [`Decomposer`]. Inputs are
/// decomposed as given: callers remove means beforehand.
#[derive(Debug, Clone, Default)]
pub struct ModalEngine<K = SymmetricEigenKernel> {
    kernel: K,
}

impl<K: Decomposer> ModalEngine<K> {
    pub fn new(kernel: K) -> Self {
        ModalEngine { kernel }
    }

    /// Weighted principal component analysis.
    pub fn pca(
        &self,
        matrix: ArrayView2<f64>,
        n_modes: usize,
        weights: Option<ArrayView1<f64>>,
    ) -> Result<ModeSet> {
        check_mode_count(n_modes)?;
        let (channels, n_times) = matrix.dim();
        let modes = self.kernel.decompose(matrix, weights, n_modes)?;
        let weights = weights
            .map(|w| w.to_owned())
            .unwrap_or_else(|| Array1::ones(channels));
        debug!(
            "PCA of {channels}x{n_times}: {} modes, {:.1}% of variance",
            modes.values.len(),
            explained(&modes)
        );
        Ok(mode_set(AnalysisKind::Pca, modes, weights, channels, 1, n_times))
    }

    /// Multichannel singular spectrum analysis with a lag window.
    pub fn mssa(&self, matrix: ArrayView2<f64>, window: usize, n_modes: usize) -> Result<ModeSet> {
        check_mode_count(n_modes)?;
        let (channels, n_times) = matrix.dim();
        if window < 2 || window >= n_times {
            return Err(SpanError::Config(format!(
                "MSSA window must satisfy 1 < window < {n_times}, got {window}"
            )));
        }
        if n_modes > channels * window {
            return Err(SpanError::Config(format!(
                "{n_modes} MSSA modes requested but only {} lagged channels exist",
                channels * window
            )));
        }
        let traj = trajectory(matrix, window);
        let modes = self.kernel.decompose(traj.view(), None, n_modes)?;
        debug!(
            "MSSA of {channels}x{n_times} (window {window}): {} modes, {:.1}% of variance",
            modes.values.len(),
            explained(&modes)
        );
        let weights = Array1::ones(channels * window);
        Ok(mode_set(AnalysisKind::Mssa, modes, weights, channels, window, n_times))
    }

    /// Joint decomposition of the cross-covariance of the first two inputs.
    pub fn svd(
        &self,
        inputs: &[(ArrayView2<f64>, Option<ArrayView1<f64>>)],
        n_modes: usize,
    ) -> Result<(ModeSet, ModeSet)> {
        check_mode_count(n_modes)?;
        let [(left, lw), (right, rw), rest @ ..] = inputs else {
            return Err(SpanError::InsufficientFields {
                operation: "SVD",
                needed: 2,
                got: inputs.len(),
            });
        };
        if !rest.is_empty() {
            debug!("SVD uses the first two of {} inputs", inputs.len());
        }
        let cross = self.kernel.cross(*left, *right, (*lw, *rw), n_modes)?;
        let n_times = left.ncols();
        let make = |modes: Eigenmodes, view: &ArrayView2<f64>, w: &Option<ArrayView1<f64>>| {
            let weights = w
                .map(|w| w.to_owned())
                .unwrap_or_else(|| Array1::ones(view.nrows()));
            mode_set(AnalysisKind::Svd, modes, weights, view.nrows(), 1, n_times)
        };
        Ok((make(cross.left, left, lw), make(cross.right, right, rw)))
    }

    /// Sum of the part reconstructions of each range.
    ///
    /// The output has the shape of the decomposed matrix. Coefficients that
    /// are NaN make the corresponding reconstructed values NaN (PCA, SVD),
    /// or are left out of the diagonal average (MSSA).
    pub fn reconstruct(&self, modes: &ModeSet, ranges: &[ModeRange]) -> Result<Array2<f64>> {
        let mut total = Array2::zeros((modes.channels, modes.n_times));
        for &range in ranges {
            let range = range.validate(modes.len())?;
            total += &match modes.kind {
                AnalysisKind::Pca | AnalysisKind::Svd => linear_part(modes, range),
                AnalysisKind::Mssa => lagged_part(modes, range),
            };
        }
        Ok(total)
    }

    pub fn reconstruct_selection(
        &self,
        modes: &ModeSet,
        selection: &ModeSelection,
    ) -> Result<Array2<f64>> {
        let ranges = selection.ranges(modes.len())?;
        self.reconstruct(modes, &ranges)
    }

    /// Re-estimate PCA coefficients of `data` on fixed EOFs.
    ///
    /// Missing channels are left out and the projection rescaled by the
    /// missing weight; a time step without any valid channel gets NaN.
    pub fn pca_ec(&self, modes: &ModeSet, data: ArrayView2<f64>) -> Result<Array2<f64>> {
        check_shape(modes, data, modes.n_times)?;
        let total_w = modes.weights.sum();
        let mut pcs = Array2::from_elem((modes.len(), data.ncols()), f64::NAN);
        for (t, column) in data.columns().into_iter().enumerate() {
            let valid_w: f64 = column
                .iter()
                .zip(modes.weights.iter())
                .filter(|(v, _)| v.is_finite())
                .map(|(_, w)| w)
                .sum();
            if valid_w <= 0.0 {
                continue;
            }
            let factor = total_w / valid_w;
            for k in 0..modes.len() {
                let proj: f64 = column
                    .iter()
                    .zip(modes.eofs.row(k).iter().zip(modes.weights.iter()))
                    .filter(|(v, _)| v.is_finite())
                    .map(|(v, (e, w))| v * e * w)
                    .sum();
                pcs[[k, t]] = proj * factor;
            }
        }
        Ok(pcs)
    }

    /// Re-estimate MSSA coefficients of `data` on fixed ST-EOFs.
    pub fn mssa_ec(&self, modes: &ModeSet, data: ArrayView2<f64>) -> Result<Array2<f64>> {
        check_shape(modes, data, modes.n_times)?;
        let traj = trajectory(data, modes.window);
        let dim = traj.nrows() as f64;
        let mut pcs = Array2::from_elem((modes.len(), traj.ncols()), f64::NAN);
        for (s, column) in traj.columns().into_iter().enumerate() {
            let valid = column.iter().filter(|v| v.is_finite()).count() as f64;
            if valid < MSSA_MIN_VALID_FRACTION * dim || valid == 0.0 {
                continue;
            }
            let factor = dim / valid;
            for k in 0..modes.len() {
                let proj: f64 = column
                    .iter()
                    .zip(modes.eofs.row(k).iter())
                    .filter(|(v, _)| v.is_finite())
                    .map(|(v, e)| v * e)
                    .sum();
                pcs[[k, s]] = proj * factor;
            }
        }
        Ok(pcs)
    }

    /// Coefficient refit dispatched on the kind of `modes`.
    pub fn refit(&self, modes: &ModeSet, data: ArrayView2<f64>) -> Result<Array2<f64>> {
        match modes.kind {
            AnalysisKind::Mssa => self.mssa_ec(modes, data),
            AnalysisKind::Pca | AnalysisKind::Svd => self.pca_ec(modes, data),
        }
    }
}

/// Lag embedding: row `d * window + j`, column `t` holds `matrix[d, t + j]`.
pub fn trajectory(matrix: ArrayView2<f64>, window: usize) -> Array2<f64> {
    let (channels, n_times) = matrix.dim();
    let k = n_times + 1 - window;
    let mut traj = Array2::zeros((channels * window, k));
    for d in 0..channels {
        for j in 0..window {
            traj.row_mut(d * window + j)
                .assign(&matrix.slice(s![d, j..j + k]));
        }
    }
    traj
}

// -- helpers --

fn check_mode_count(n_modes: usize) -> Result<()> {
    if n_modes == 0 {
        return Err(SpanError::Config("at least one mode must be requested".into()));
    }
    Ok(())
}

fn check_shape(modes: &ModeSet, data: ArrayView2<f64>, n_times: usize) -> Result<()> {
    if data.dim() != (modes.channels, n_times) {
        return Err(SpanError::Shape(format!(
            "{} modes expect a {}x{} matrix, got {:?}",
            modes.kind,
            modes.channels,
            n_times,
            data.dim()
        )));
    }
    Ok(())
}

fn explained(modes: &Eigenmodes) -> f64 {
    if modes.total > 0.0 {
        100.0 * modes.values.sum() / modes.total
    } else {
        0.0
    }
}

fn mode_set(
    kind: AnalysisKind,
    modes: Eigenmodes,
    weights: Array1<f64>,
    channels: usize,
    window: usize,
    n_times: usize,
) -> ModeSet {
    ModeSet {
        kind,
        eofs: modes.vectors,
        pcs: modes.coefficients,
        eigenvalues: modes.values,
        total_variance: modes.total,
        weights,
        channels,
        window,
        n_times,
        time_domain: modes.time_domain,
    }
}

fn linear_part(modes: &ModeSet, range: ModeRange) -> Array2<f64> {
    let idx = range.indices();
    let eofs = modes.eofs.slice(s![idx.clone(), ..]);
    let pcs = modes.pcs.slice(s![idx, ..]);
    eofs.t().dot(&pcs)
}

fn lagged_part(modes: &ModeSet, range: ModeRange) -> Array2<f64> {
    let (channels, window) = (modes.channels, modes.window);
    let idx = range.indices();
    let n_windows = modes.pcs.ncols();
    let mut sum = Array2::<f64>::zeros((channels, modes.n_times));
    let mut count = Array1::<f64>::zeros(modes.n_times);

    for s in 0..n_windows {
        let amps: Vec<f64> = idx.clone().map(|k| modes.pcs[[k, s]]).collect();
        if amps.iter().any(|a| !a.is_finite()) {
            continue;
        }
        for j in 0..window {
            count[s + j] += 1.0;
        }
        for (a, k) in amps.iter().zip(idx.clone()) {
            let eof = modes.eofs.row(k);
            for d in 0..channels {
                for j in 0..window {
                    sum[[d, s + j]] += a * eof[d * window + j];
                }
            }
        }
    }

    for (mut col, &n) in sum.columns_mut().into_iter().zip(count.iter()) {
        if n > 0.0 {
            col.mapv_inplace(|v| v / n);
        } else {
            col.fill(f64::NAN);
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn engine() -> ModalEngine {
        ModalEngine::default()
    }

    fn waves(channels: usize, n_times: usize) -> Array2<f64> {
        Array2::from_shape_fn((channels, n_times), |(c, t)| {
            let t = t as f64;
            (0.3 * t + c as f64).sin() + 0.5 * (0.05 * t * (c + 1) as f64).cos()
        })
    }

    #[test]
    fn trajectory_embeds_lags() {
        let m = array![[1.0, 2.0, 3.0, 4.0], [10.0, 20.0, 30.0, 40.0]];
        let traj = trajectory(m.view(), 2);
        assert_eq!(traj.dim(), (4, 3));
        assert_eq!(traj.row(1).to_vec(), vec![2.0, 3.0, 4.0]);
        assert_eq!(traj.row(2).to_vec(), vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn pca_full_reconstruction_is_identity() {
        let data = waves(5, 40);
        let modes = engine().pca(data.view(), 5, None).unwrap();
        let rec = engine().reconstruct_selection(&modes, &ModeSelection::All).unwrap();
        for (a, b) in rec.iter().zip(data.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }

    #[test]
    fn mssa_full_reconstruction_is_identity() {
        let data = waves(2, 30);
        let modes = engine().mssa(data.view(), 5, 10).unwrap();
        let rec = engine().reconstruct_selection(&modes, &ModeSelection::All).unwrap();
        for (a, b) in rec.iter().zip(data.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }

    #[test]
    fn split_ranges_sum_to_contiguous_range() {
        let data = waves(4, 25);
        let modes = engine().pca(data.view(), 4, None).unwrap();
        let whole = engine().reconstruct(&modes, &[ModeRange::new(1, 3)]).unwrap();
        let split = engine()
            .reconstruct(&modes, &[ModeRange::new(1, 1), ModeRange::new(2, 3)])
            .unwrap();
        for (a, b) in whole.iter().zip(split.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn out_of_range_modes_fail() {
        let data = waves(3, 20);
        let modes = engine().pca(data.view(), 2, None).unwrap();
        assert!(matches!(
            engine().reconstruct(&modes, &[ModeRange::new(3, 3)]),
            Err(SpanError::ModeRange { .. })
        ));
    }

    #[test]
    fn mssa_window_is_validated() {
        let data = waves(2, 10);
        assert!(matches!(engine().mssa(data.view(), 1, 1), Err(SpanError::Config(_))));
        assert!(matches!(engine().mssa(data.view(), 10, 1), Err(SpanError::Config(_))));
        assert!(matches!(engine().mssa(data.view(), 3, 7), Err(SpanError::Config(_))));
    }

    #[test]
    fn svd_needs_two_inputs() {
        let data = waves(3, 20);
        let err = engine().svd(&[(data.view(), None)], 2).unwrap_err();
        assert!(matches!(err, SpanError::InsufficientFields { needed: 2, got: 1, .. }));
    }

    #[test]
    fn svd_reconstructs_each_field() {
        let a = waves(3, 50);
        let b = a.mapv(|v| 2.0 * v) + 0.1;
        let (left, right) = engine().svd(&[(a.view(), None), (b.view(), None)], 3).unwrap();
        assert_eq!(left.len(), right.len());
        assert_eq!(left.eofs.ncols(), 3);
        let rec = engine().reconstruct_selection(&left, &ModeSelection::All).unwrap();
        for (x, y) in rec.iter().zip(a.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-6);
        }
    }

    #[test]
    fn pca_refit_matches_decomposition_coefficients() {
        let data = waves(4, 30);
        let modes = engine().pca(data.view(), 3, None).unwrap();
        let pcs = engine().pca_ec(&modes, data.view()).unwrap();
        for (a, b) in pcs.iter().zip(modes.pcs.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn refit_marks_empty_time_steps_missing() {
        let data = waves(3, 20);
        let modes = engine().pca(data.view(), 2, None).unwrap();
        let mut gappy = data.clone();
        gappy.column_mut(4).fill(f64::NAN);
        gappy[[0, 7]] = f64::NAN;
        let pcs = engine().pca_ec(&modes, gappy.view()).unwrap();
        assert!(pcs[[0, 4]].is_nan());
        assert!(pcs[[0, 7]].is_finite());
        let rec = engine().reconstruct_selection(&modes, &ModeSelection::All).unwrap();
        assert!(rec.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn mssa_refit_leaves_gaps_to_the_average() {
        let data = waves(1, 40);
        let modes = engine().mssa(data.view(), 6, 4).unwrap();
        let mut gappy = data.clone();
        for t in 18..26 {
            gappy[[0, t]] = f64::NAN;
        }
        let mut refit = modes.clone();
        refit.pcs = engine().mssa_ec(&modes, gappy.view()).unwrap();
        assert!(refit.missing_coefficients() > 0);
        let rec = engine().reconstruct_selection(&refit, &ModeSelection::All).unwrap();
        // windows reaching past the gap edges still cover its borders
        assert!(rec[[0, 18]].is_finite());
        assert!(rec[[0, 25]].is_finite());
    }
}
