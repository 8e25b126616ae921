use std::fmt;

use ndarray::{Array2, ArrayD, Axis, IxDyn};

use crate::error::{Result, SpanError};

// ---------------------------------------------------------------------------
// Field – a time-leading gridded array with a missing-value mask
// ---------------------------------------------------------------------------

/// A gridded time series: axis 0 is time, trailing axes are spatial.
///
/// `mask` has the same shape as `values` and is `true` where the value is
/// missing or invalid. Masked entries of `values` carry no meaning.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Variable name, used for logging and output file naming.
    pub name: String,
    values: ArrayD<f64>,
    mask: ArrayD<bool>,
}

impl Field {
    /// Build a field from raw values; non-finite values become missing.
    pub fn new(name: impl Into<String>, values: ArrayD<f64>) -> Result<Self> {
        let mask = values.mapv(|v| !v.is_finite());
        Self::with_mask(name, values, mask)
    }

    /// Build a field from values and an explicit mask (`true` = missing).
    ///
    /// Non-finite values are masked as well, whatever the mask says.
    pub fn with_mask(
        name: impl Into<String>,
        values: ArrayD<f64>,
        mask: ArrayD<bool>,
    ) -> Result<Self> {
        let name = name.into();
        if values.ndim() < 2 {
            return Err(SpanError::Shape(format!(
                "field '{name}' has rank {}, expected time plus at least one spatial axis",
                values.ndim()
            )));
        }
        if values.shape() != mask.shape() {
            return Err(SpanError::Shape(format!(
                "field '{name}': mask shape {:?} differs from values shape {:?}",
                mask.shape(),
                values.shape()
            )));
        }
        let mut mask = mask;
        ndarray::Zip::from(&mut mask)
            .and(&values)
            .for_each(|m, v| *m |= !v.is_finite());
        Ok(Field { name, values, mask })
    }

    /// Convenience constructor for a `(time, channel)` series matrix.
    pub fn from_series(name: impl Into<String>, series: Array2<f64>) -> Result<Self> {
        Self::new(name, series.into_dyn())
    }

    /// Full shape, time first.
    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }

    /// Length of the time axis.
    pub fn n_times(&self) -> usize {
        self.values.shape()[0]
    }

    /// Number of points on the flattened spatial axes.
    pub fn spatial_len(&self) -> usize {
        self.values.shape()[1..].iter().product()
    }

    pub fn values(&self) -> &ArrayD<f64> {
        &self.values
    }

    pub fn mask(&self) -> &ArrayD<bool> {
        &self.mask
    }

    /// Number of missing entries.
    pub fn missing_count(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    /// Whether any entry is missing.
    pub fn has_gaps(&self) -> bool {
        self.mask.iter().any(|&m| m)
    }

    /// Whether the entry at `index` (time first) is missing.
    pub fn is_missing(&self, index: &[usize]) -> bool {
        self.mask[IxDyn(index)]
    }

    /// Values with missing entries replaced by `fill_value`.
    pub fn filled(&self, fill_value: f64) -> ArrayD<f64> {
        let mut out = self.values.clone();
        ndarray::Zip::from(&mut out)
            .and(&self.mask)
            .for_each(|v, &m| {
                if m {
                    *v = fill_value;
                }
            });
        out
    }

    /// `(time, space)` view of the data with NaN at missing entries.
    pub fn to_matrix(&self) -> Array2<f64> {
        let (nt, ns) = (self.n_times(), self.spatial_len());
        let flat = self.filled(f64::NAN);
        let mut out = Array2::from_elem((nt, ns), f64::NAN);
        for (t, slab) in flat.axis_iter(Axis(0)).enumerate() {
            for (s, v) in slab.iter().enumerate() {
                out[[t, s]] = *v;
            }
        }
        out
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} ({} missing)",
            self.name,
            self.shape(),
            self.missing_count()
        )
    }
}
