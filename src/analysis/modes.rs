use std::fmt;

use log::debug;
use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpanError};

// ---------------------------------------------------------------------------
// AnalysisKind
// ---------------------------------------------------------------------------

/// Decomposition that produced a [`ModeSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    Pca,
    Mssa,
    Svd,
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisKind::Pca => write!(f, "PCA"),
            AnalysisKind::Mssa => write!(f, "MSSA"),
            AnalysisKind::Svd => write!(f, "SVD"),
        }
    }
}

// ---------------------------------------------------------------------------
// ModeSet – eigenvectors, coefficients and eigenvalues of a decomposition
// ---------------------------------------------------------------------------

/// Result of one decomposition, modes ordered by decreasing eigenvalue.
///
/// Row `k` of `eofs` and of `pcs` belongs to mode `k + 1`.
#[derive(Debug, Clone)]
pub struct ModeSet {
    pub kind: AnalysisKind,
    /// `(modes, basis)`; the basis is channels, or `channels * window`
    /// lagged channels for MSSA (channel-major, lag-minor).
    pub eofs: Array2<f64>,
    /// `(modes, samples)` expansion coefficients; NaN where undetermined.
    pub pcs: Array2<f64>,
    /// Non-negative, descending.
    pub eigenvalues: Array1<f64>,
    /// Sum of all eigenvalues, including modes not returned.
    pub total_variance: f64,
    /// Per-basis-element weights the EOFs are orthonormal under.
    pub weights: Array1<f64>,
    /// Number of channels of the decomposed matrix.
    pub channels: usize,
    /// Embedding window (1 for PCA and SVD).
    pub window: usize,
    /// Number of time steps of the decomposed matrix.
    pub n_times: usize,
    /// The kernel solved the time-domain problem (more channels than
    /// samples); coefficients then come straight from the decomposition.
    pub time_domain: bool,
}

impl ModeSet {
    /// Number of modes.
    pub fn len(&self) -> usize {
        self.eigenvalues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.eigenvalues.is_empty()
    }

    /// Eigenvalues as a percentage of the total variance.
    pub fn explained_variance(&self) -> Array1<f64> {
        if self.total_variance > 0.0 {
            self.eigenvalues.mapv(|ev| 100.0 * ev / self.total_variance)
        } else {
            Array1::zeros(self.len())
        }
    }

    /// Keep only the leading `n` modes.
    pub fn truncated(&self, n: usize) -> ModeSet {
        let n = n.min(self.len());
        ModeSet {
            eofs: self.eofs.slice(s![..n, ..]).to_owned(),
            pcs: self.pcs.slice(s![..n, ..]).to_owned(),
            eigenvalues: self.eigenvalues.slice(s![..n]).to_owned(),
            ..self.clone()
        }
    }

    /// Number of coefficients of the first mode that are missing.
    pub fn missing_coefficients(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        self.pcs.row(0).iter().filter(|v| !v.is_finite()).count()
    }
}

// ---------------------------------------------------------------------------
// Mode ranges
// ---------------------------------------------------------------------------

/// Inclusive, 1-based range of modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeRange {
    pub first: usize,
    pub last: usize,
}

impl ModeRange {
    pub fn new(first: usize, last: usize) -> Self {
        ModeRange { first, last }
    }

    /// Modes `1..=n`.
    pub fn leading(n: usize) -> Self {
        ModeRange { first: 1, last: n }
    }

    /// Check against `available` modes, clamping an overlong `last`.
    pub fn validate(self, available: usize) -> Result<ModeRange> {
        if self.first == 0 || self.first > self.last || self.first > available {
            return Err(SpanError::ModeRange {
                first: self.first,
                last: self.last,
                available,
            });
        }
        if self.last > available {
            debug!(
                "Mode range {}..={} clamped to {available} available modes",
                self.first, self.last
            );
        }
        Ok(ModeRange {
            first: self.first,
            last: self.last.min(available),
        })
    }

    /// Zero-based half-open index range.
    pub fn indices(self) -> std::ops::Range<usize> {
        self.first - 1..self.last
    }
}

impl From<(usize, usize)> for ModeRange {
    fn from((first, last): (usize, usize)) -> Self {
        ModeRange { first, last }
    }
}

/// Collapse a set of mode indices into maximal runs of consecutive indices.
///
/// `[1, 2, 3, 7, 8]` becomes `[(1, 3), (7, 8)]`; duplicates are ignored.
pub fn normalize_modes(modes: &[usize]) -> Vec<ModeRange> {
    let mut sorted = modes.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<ModeRange> = Vec::new();
    for m in sorted {
        match ranges.last_mut() {
            Some(r) if m == r.last + 1 => r.last = m,
            _ => ranges.push(ModeRange::new(m, m)),
        }
    }
    ranges
}

// ---------------------------------------------------------------------------
// ModeSelection
// ---------------------------------------------------------------------------

/// Which modes a reconstruction uses.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeSelection {
    /// Every available mode.
    #[default]
    All,
    /// Modes `1..=n`.
    Leading(usize),
    /// A single 1-based mode.
    Single(usize),
    /// Arbitrary 1-based modes, merged into contiguous ranges.
    List(Vec<usize>),
}

impl ModeSelection {
    /// Contiguous ranges for a decomposition with `available` modes.
    pub fn ranges(&self, available: usize) -> Result<Vec<ModeRange>> {
        let raw = match self {
            ModeSelection::All => vec![ModeRange::leading(available)],
            ModeSelection::Leading(n) => vec![ModeRange::leading(*n)],
            ModeSelection::Single(m) => vec![ModeRange::new(*m, *m)],
            ModeSelection::List(modes) => normalize_modes(modes),
        };
        if raw.is_empty() {
            return Err(SpanError::ModeRange {
                first: 0,
                last: 0,
                available,
            });
        }
        raw.into_iter().map(|r| r.validate(available)).collect()
    }
}
