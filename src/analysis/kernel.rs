use nalgebra::{DMatrix, DVector, SymmetricEigen, SVD};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::error::{Result, SpanError};

// ---------------------------------------------------------------------------
// Kernel contract
// ---------------------------------------------------------------------------

/// Leading modes of a `(variables, samples)` matrix.
#[derive(Debug, Clone)]
pub struct Eigenmodes {
    /// `(modes, variables)`, orthonormal under the weight metric.
    pub vectors: Array2<f64>,
    /// `(modes, samples)` projections of the data on `vectors`.
    pub coefficients: Array2<f64>,
    /// Descending, non-negative.
    pub values: Array1<f64>,
    /// Trace of the second-moment matrix.
    pub total: f64,
    /// The problem was solved in sample space.
    pub time_domain: bool,
}

/// Paired modes of the cross-covariance of two matrices.
#[derive(Debug, Clone)]
pub struct CrossModes {
    pub left: Eigenmodes,
    pub right: Eigenmodes,
}

/// Dense decomposition routine used by [`super::engine::ModalEngine`].
///
/// Implementations must be deterministic for a fixed input and order modes
/// by decreasing eigenvalue. Fewer than `n_modes` may be returned when the
/// matrix is rank deficient.
pub trait Decomposer {
    /// Eigen-decomposition of `diag(w) X Xᵀ / samples`.
    fn decompose(
        &self,
        data: ArrayView2<f64>,
        weights: Option<ArrayView1<f64>>,
        n_modes: usize,
    ) -> Result<Eigenmodes>;

    /// Singular value decomposition of `A Bᵀ / samples`.
    fn cross(
        &self,
        left: ArrayView2<f64>,
        right: ArrayView2<f64>,
        weights: (Option<ArrayView1<f64>>, Option<ArrayView1<f64>>),
        n_modes: usize,
    ) -> Result<CrossModes>;
}

// ---------------------------------------------------------------------------
// nalgebra implementation
// ---------------------------------------------------------------------------

/// [`Decomposer`] backed by nalgebra's `SymmetricEigen` and `SVD`.
///
/// The covariance is formed in whichever of variable or sample space is
/// smaller.
#[derive(Debug, Clone, Copy)]
pub struct SymmetricEigenKernel {
    /// Modes with an eigenvalue below `rank_tolerance * largest` are dropped.
    pub rank_tolerance: f64,
}

impl Default for SymmetricEigenKernel {
    fn default() -> Self {
        Self {
            rank_tolerance: 1e-12,
        }
    }
}

impl Decomposer for SymmetricEigenKernel {
    fn decompose(
        &self,
        data: ArrayView2<f64>,
        weights: Option<ArrayView1<f64>>,
        n_modes: usize,
    ) -> Result<Eigenmodes> {
        let (nv, ns) = data.dim();
        let sqrt_w = sqrt_weights(weights, nv)?;
        let scaled = to_dmatrix(data, &sqrt_w)?;
        let norm = ns.max(1) as f64;
        let total = scaled.norm_squared() / norm;

        let time_domain = nv > ns;
        let cov = if time_domain {
            scaled.transpose() * &scaled / norm
        } else {
            &scaled * scaled.transpose() / norm
        };
        let eigen = SymmetricEigen::new(cov);
        let order = descending(eigen.eigenvalues.as_slice());
        let floor = order
            .first()
            .map(|&i| eigen.eigenvalues[i].max(0.0) * self.rank_tolerance)
            .unwrap_or(0.0);

        let mut vectors: Vec<DVector<f64>> = Vec::new();
        let mut coefficients: Vec<DVector<f64>> = Vec::new();
        let mut values = Vec::new();
        for &idx in order.iter().take(n_modes) {
            let lambda = eigen.eigenvalues[idx];
            if !(lambda > floor) || lambda <= 0.0 {
                break;
            }
            let u = eigen.eigenvectors.column(idx).into_owned();
            let (mut v, mut pc) = if time_domain {
                let amp = (norm * lambda).sqrt();
                (&scaled * &u / amp, u * amp)
            } else {
                let pc = scaled.transpose() * &u;
                (u, pc)
            };
            if dominant_is_negative(&v) {
                v.neg_mut();
                pc.neg_mut();
            }
            vectors.push(v);
            coefficients.push(pc);
            values.push(lambda);
        }

        Ok(Eigenmodes {
            vectors: unweight_rows(&vectors, &sqrt_w, nv),
            coefficients: rows(&coefficients, ns),
            values: Array1::from(values),
            total,
            time_domain,
        })
    }

    fn cross(
        &self,
        left: ArrayView2<f64>,
        right: ArrayView2<f64>,
        weights: (Option<ArrayView1<f64>>, Option<ArrayView1<f64>>),
        n_modes: usize,
    ) -> Result<CrossModes> {
        let (nl, ns) = left.dim();
        let (nr, ns_right) = right.dim();
        if ns != ns_right {
            return Err(SpanError::Shape(format!(
                "SVD inputs have {ns} and {ns_right} time steps"
            )));
        }
        let sw_left = sqrt_weights(weights.0, nl)?;
        let sw_right = sqrt_weights(weights.1, nr)?;
        let a = to_dmatrix(left, &sw_left)?;
        let b = to_dmatrix(right, &sw_right)?;
        let norm = ns.max(1) as f64;

        let cov = &a * b.transpose() / norm;
        let svd = SVD::new(cov, true, true);
        let (u, v_t) = match (svd.u, svd.v_t) {
            (Some(u), Some(v_t)) => (u, v_t),
            _ => return Err(SpanError::Shape("SVD did not return singular vectors".into())),
        };
        let order = descending(svd.singular_values.as_slice());
        let floor = order
            .first()
            .map(|&i| svd.singular_values[i] * self.rank_tolerance)
            .unwrap_or(0.0);

        let mut lv = Vec::new();
        let mut rv = Vec::new();
        let mut lpc = Vec::new();
        let mut rpc = Vec::new();
        let mut values = Vec::new();
        for &idx in order.iter().take(n_modes) {
            let sigma = svd.singular_values[idx];
            if !(sigma > floor) {
                break;
            }
            let mut l = u.column(idx).into_owned();
            let mut r = v_t.row(idx).transpose();
            if dominant_is_negative(&l) {
                l.neg_mut();
                r.neg_mut();
            }
            lpc.push(a.transpose() * &l);
            rpc.push(b.transpose() * &r);
            lv.push(l);
            rv.push(r);
            values.push(sigma);
        }

        let total: f64 = svd.singular_values.iter().sum();
        let values = Array1::from(values);
        Ok(CrossModes {
            left: Eigenmodes {
                vectors: unweight_rows(&lv, &sw_left, nl),
                coefficients: rows(&lpc, ns),
                values: values.clone(),
                total,
                time_domain: false,
            },
            right: Eigenmodes {
                vectors: unweight_rows(&rv, &sw_right, nr),
                coefficients: rows(&rpc, ns),
                values,
                total,
                time_domain: false,
            },
        })
    }
}

// -- helpers --

fn sqrt_weights(weights: Option<ArrayView1<f64>>, n: usize) -> Result<Array1<f64>> {
    match weights {
        Some(w) if w.len() != n => Err(SpanError::Shape(format!(
            "{} weights for {n} channels",
            w.len()
        ))),
        Some(w) => Ok(w.mapv(|v| v.max(0.0).sqrt())),
        None => Ok(Array1::ones(n)),
    }
}

fn to_dmatrix(data: ArrayView2<f64>, sqrt_w: &Array1<f64>) -> Result<DMatrix<f64>> {
    if data.iter().any(|v| !v.is_finite()) {
        return Err(SpanError::Shape(
            "decomposition input contains missing values".into(),
        ));
    }
    let (nr, nc) = data.dim();
    Ok(DMatrix::from_fn(nr, nc, |i, j| data[[i, j]] * sqrt_w[i]))
}

fn descending(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    order
}

/// Sign convention: the largest-magnitude component is positive.
fn dominant_is_negative(v: &DVector<f64>) -> bool {
    v.iter()
        .copied()
        .fold(0.0_f64, |best, x| if x.abs() > best.abs() { x } else { best })
        < 0.0
}

fn unweight_rows(vectors: &[DVector<f64>], sqrt_w: &Array1<f64>, n: usize) -> Array2<f64> {
    Array2::from_shape_fn((vectors.len(), n), |(k, i)| {
        if sqrt_w[i] > 0.0 {
            vectors[k][i] / sqrt_w[i]
        } else {
            0.0
        }
    })
}

fn rows(vectors: &[DVector<f64>], n: usize) -> Array2<f64> {
    Array2::from_shape_fn((vectors.len(), n), |(k, j)| vectors[k][j])
}
