use log::debug;
use ndarray::{s, Array1, Array2, ArrayD, ArrayView1, ArrayView2, Axis, IxDyn};

use super::model::Field;
use crate::error::{Result, SpanError};

// ---------------------------------------------------------------------------
// Packing options
// ---------------------------------------------------------------------------

/// How spatial points are selected when packing a field into channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackOptions {
    /// Keep channels that have gaps, storing NaN at missing time steps.
    /// When `false` a point is retained only if it is valid at every time.
    pub keep_invalids: bool,
    /// Minimum number of valid time steps for a channel kept with gaps.
    pub min_valid: usize,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            keep_invalids: false,
            min_valid: 1,
        }
    }
}

impl PackOptions {
    /// Options used by the gap filler: channels with gaps are kept.
    pub fn keep_gaps(min_valid: usize) -> Self {
        Self {
            keep_invalids: true,
            min_valid: min_valid.max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// PackedField – dense channel × time matrix
// ---------------------------------------------------------------------------

/// A field compressed to its retained channels.
#[derive(Debug, Clone)]
pub struct PackedField {
    pub name: String,
    /// `(channels, time)`; NaN marks missing entries of kept channels.
    pub data: Array2<f64>,
    /// One non-negative weight per retained channel.
    pub weights: Array1<f64>,
    /// Over the flattened spatial axis: `true` where the point is retained.
    pub mask: Array1<bool>,
    /// Shape of the original field, time first.
    pub shape: Vec<usize>,
}

impl PackedField {
    pub fn n_channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_times(&self) -> usize {
        self.data.ncols()
    }

    /// Unpack a `(channels, time)` matrix laid out like this field.
    pub fn unpack(&self, matrix: ArrayView2<f64>, fill_value: f64) -> Result<Field> {
        let mut field = unpack(matrix, self.mask.view(), &self.shape, fill_value)?;
        field.name = self.name.clone();
        Ok(field)
    }
}

/// Pack a field, retaining only points valid at every time step.
pub fn pack(field: &Field, weights: Option<ArrayView1<f64>>) -> Result<PackedField> {
    pack_with(field, weights, PackOptions::default())
}

/// Pack a field into a `(channels, time)` matrix.
///
/// Weights default to 1 per spatial point. A point with zero weight is
/// never retained.
pub fn pack_with(
    field: &Field,
    weights: Option<ArrayView1<f64>>,
    options: PackOptions,
) -> Result<PackedField> {
    let nt = field.n_times();
    let ns = field.spatial_len();

    let weights = match weights {
        Some(w) if w.len() != ns => {
            return Err(SpanError::Shape(format!(
                "field '{}' has {ns} spatial points but {} weights were given",
                field.name,
                w.len()
            )));
        }
        Some(w) if w.iter().any(|&v| !(v >= 0.0)) => {
            return Err(SpanError::Config(format!(
                "weights of field '{}' must be finite and non-negative",
                field.name
            )));
        }
        Some(w) => w.to_owned(),
        None => Array1::ones(ns),
    };

    let matrix = field.to_matrix();
    let min_valid = if options.keep_invalids {
        options.min_valid.max(1)
    } else {
        nt
    };
    let mask: Array1<bool> = matrix
        .axis_iter(Axis(1))
        .zip(weights.iter())
        .map(|(series, &w)| {
            let valid = series.iter().filter(|v| v.is_finite()).count();
            w != 0.0 && valid >= min_valid
        })
        .collect();

    let kept: Vec<usize> = (0..ns).filter(|&s| mask[s]).collect();
    if kept.is_empty() {
        return Err(SpanError::EmptyPack {
            field: field.name.clone(),
        });
    }

    let mut data = Array2::from_elem((kept.len(), nt), f64::NAN);
    for (c, &s) in kept.iter().enumerate() {
        data.row_mut(c).assign(&matrix.column(s));
    }
    let packed_weights: Array1<f64> = kept.iter().map(|&s| weights[s]).collect();

    debug!(
        "Packed '{}': {} of {ns} points retained over {nt} time steps",
        field.name,
        kept.len()
    );

    Ok(PackedField {
        name: field.name.clone(),
        data,
        weights: packed_weights,
        mask,
        shape: field.shape().to_vec(),
    })
}

/// Inverse of [`pack`]: points outside `mask` are set to `fill_value` and
/// marked missing, as are NaN entries of `matrix`.
pub fn unpack(
    matrix: ArrayView2<f64>,
    mask: ArrayView1<bool>,
    shape: &[usize],
    fill_value: f64,
) -> Result<Field> {
    if shape.len() < 2 {
        return Err(SpanError::Shape(format!(
            "cannot unpack into shape {shape:?}: need time plus a spatial axis"
        )));
    }
    let nt = shape[0];
    let ns: usize = shape[1..].iter().product();
    let retained = mask.iter().filter(|&&m| m).count();
    if mask.len() != ns || retained != matrix.nrows() || matrix.ncols() != nt {
        return Err(SpanError::Shape(format!(
            "matrix {:?} with {retained} retained points does not fit shape {shape:?}",
            matrix.dim()
        )));
    }

    let mut values = Array2::from_elem((nt, ns), fill_value);
    let mut missing = Array2::from_elem((nt, ns), true);
    let mut channel = 0;
    for s in 0..ns {
        if !mask[s] {
            continue;
        }
        for t in 0..nt {
            let v = matrix[[channel, t]];
            if v.is_finite() {
                values[[t, s]] = v;
                missing[[t, s]] = false;
            }
        }
        channel += 1;
    }

    let values = reshape(values, shape)?;
    let missing = reshape(missing, shape)?;
    Field::with_mask("", values, missing)
}

fn reshape<T: Clone>(matrix: Array2<T>, shape: &[usize]) -> Result<ArrayD<T>> {
    matrix
        .into_shape_with_order(IxDyn(shape))
        .map_err(|e| SpanError::Shape(e.to_string()))
}

// ---------------------------------------------------------------------------
// FieldStack – several fields sharing a time axis
// ---------------------------------------------------------------------------

/// Packed fields concatenated along the channel axis.
///
/// With more than one field each block is divided by its anomaly standard
/// deviation so that variables with different units weigh alike.
#[derive(Debug, Clone)]
pub struct FieldStack {
    packed: Vec<PackedField>,
    scales: Vec<f64>,
    n_times: usize,
}

impl FieldStack {
    pub fn new(fields: &[Field], options: PackOptions) -> Result<Self> {
        let weights = vec![None; fields.len()];
        Self::with_weights(fields, &weights, options)
    }

    pub fn with_weights(
        fields: &[Field],
        weights: &[Option<Array1<f64>>],
        options: PackOptions,
    ) -> Result<Self> {
        let first = fields.first().ok_or(SpanError::InsufficientFields {
            operation: "stacking",
            needed: 1,
            got: 0,
        })?;
        let n_times = first.n_times();
        if let Some(f) = fields.iter().find(|f| f.n_times() != n_times) {
            return Err(SpanError::Shape(format!(
                "field '{}' has {} time steps, '{}' has {n_times}",
                f.name,
                f.n_times(),
                first.name
            )));
        }

        let packed = fields
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let w = weights.get(i).and_then(|w| w.as_ref()).map(|w| w.view());
                pack_with(f, w, options)
            })
            .collect::<Result<Vec<_>>>()?;

        let scales = if packed.len() > 1 {
            packed.iter().map(|p| anomaly_scale(&p.data)).collect()
        } else {
            vec![1.0]
        };

        Ok(FieldStack {
            packed,
            scales,
            n_times,
        })
    }

    /// Number of stacked fields.
    pub fn len(&self) -> usize {
        self.packed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packed.is_empty()
    }

    pub fn n_times(&self) -> usize {
        self.n_times
    }

    pub fn n_channels(&self) -> usize {
        self.packed.iter().map(|p| p.n_channels()).sum()
    }

    pub fn packed(&self) -> &[PackedField] {
        &self.packed
    }

    /// Concatenated, scaled `(channels, time)` matrix.
    pub fn matrix(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.n_channels(), self.n_times));
        let mut start = 0;
        for (p, &scale) in self.packed.iter().zip(&self.scales) {
            let end = start + p.n_channels();
            out.slice_mut(s![start..end, ..])
                .assign(&p.data.mapv(|v| v / scale));
            start = end;
        }
        out
    }

    /// Scaled matrix of a single field.
    pub fn block(&self, index: usize) -> Array2<f64> {
        let p = &self.packed[index];
        p.data.mapv(|v| v / self.scales[index])
    }

    pub fn weights(&self) -> Array1<f64> {
        let parts: Vec<ArrayView1<f64>> = self.packed.iter().map(|p| p.weights.view()).collect();
        ndarray::concatenate(Axis(0), &parts).unwrap_or_else(|_| Array1::zeros(0))
    }

    /// Split a stacked matrix back into per-field blocks, undoing the scaling.
    pub fn split(&self, matrix: ArrayView2<f64>) -> Result<Vec<Array2<f64>>> {
        if matrix.nrows() != self.n_channels() {
            return Err(SpanError::Shape(format!(
                "stacked matrix has {} channels, expected {}",
                matrix.nrows(),
                self.n_channels()
            )));
        }
        let mut start = 0;
        Ok(self
            .packed
            .iter()
            .zip(&self.scales)
            .map(|(p, &scale)| {
                let end = start + p.n_channels();
                let block = matrix.slice(s![start..end, ..]).mapv(|v| v * scale);
                start = end;
                block
            })
            .collect())
    }

    /// Split and unpack a stacked matrix into fields.
    pub fn unstack(&self, matrix: ArrayView2<f64>, fill_value: f64) -> Result<Vec<Field>> {
        self.split(matrix)?
            .iter()
            .zip(&self.packed)
            .map(|(block, p)| p.unpack(block.view(), fill_value))
            .collect()
    }

    /// Unscaled matrix block of one field in an already scaled stack.
    pub fn unscale_block(&self, index: usize, block: ArrayView2<f64>) -> Array2<f64> {
        block.mapv(|v| v * self.scales[index])
    }
}

// ---------------------------------------------------------------------------
// NaN-aware helpers
// ---------------------------------------------------------------------------

/// Mean of the finite entries of each row; 0 for a row without any.
pub fn row_means(matrix: ArrayView2<f64>) -> Array1<f64> {
    matrix
        .axis_iter(Axis(0))
        .map(|row| {
            let (sum, n) = row
                .iter()
                .filter(|v| v.is_finite())
                .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
            if n > 0 {
                sum / n as f64
            } else {
                0.0
            }
        })
        .collect()
}

/// Remove row means; missing entries become 0 when `zero_fill` is set and
/// stay NaN otherwise.
pub fn anomalies(matrix: ArrayView2<f64>, means: ArrayView1<f64>, zero_fill: bool) -> Array2<f64> {
    let mut out = matrix.to_owned();
    for (mut row, &m) in out.axis_iter_mut(Axis(0)).zip(means.iter()) {
        row.mapv_inplace(|v| {
            if v.is_finite() {
                v - m
            } else if zero_fill {
                0.0
            } else {
                f64::NAN
            }
        });
    }
    out
}

/// Whether any entry is missing.
pub fn has_missing(matrix: ArrayView2<f64>) -> bool {
    matrix.iter().any(|v| !v.is_finite())
}

/// `base` where finite, otherwise `fill`.
pub fn fill_missing(base: ArrayView2<f64>, fill: ArrayView2<f64>) -> Array2<f64> {
    let mut out = base.to_owned();
    ndarray::Zip::from(&mut out).and(&fill).for_each(|o, &f| {
        if !o.is_finite() {
            *o = f;
        }
    });
    out
}

fn anomaly_scale(data: &Array2<f64>) -> f64 {
    let means = row_means(data.view());
    let anom = anomalies(data.view(), means.view(), false);
    let (sum2, n) = anom
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), v| (s + v * v, n + 1));
    let std = if n > 0 { (sum2 / n as f64).sqrt() } else { 0.0 };
    if std > 0.0 && std.is_finite() {
        std
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    fn grid_with_gaps() -> Field {
        let values = Array3::from_shape_fn((5, 2, 3), |(t, y, x)| t as f64 + 10.0 * y as f64 + x as f64);
        let mut mask = ArrayD::from_elem(IxDyn(&[5, 2, 3]), false);
        mask[IxDyn(&[2, 0, 1])] = true; // gap in one time step
        for t in 0..5 {
            mask[IxDyn(&[t, 1, 2])] = true; // land point
        }
        Field::with_mask("grid", values.into_dyn(), mask).unwrap()
    }

    #[test]
    fn strict_pack_drops_points_with_any_gap() {
        let packed = pack(&grid_with_gaps(), None).unwrap();
        assert_eq!(packed.n_channels(), 4);
        assert_eq!(packed.mask.iter().filter(|&&m| m).count(), packed.n_channels());
        assert!(!packed.mask[1] && !packed.mask[5]);
        assert!(packed.data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn keep_gaps_pack_stores_nan() {
        let packed = pack_with(&grid_with_gaps(), None, PackOptions::keep_gaps(1)).unwrap();
        assert_eq!(packed.n_channels(), 5);
        assert!(packed.data[[1, 2]].is_nan());
        assert_eq!(packed.weights.len(), 5);
    }

    #[test]
    fn zero_weight_points_are_excluded() {
        let w = array![1.0, 0.0, 1.0, 1.0, 1.0, 1.0];
        let packed = pack_with(&grid_with_gaps(), Some(w.view()), PackOptions::keep_gaps(1)).unwrap();
        assert_eq!(packed.n_channels(), 4);
        assert!(!packed.mask[1]);
    }

    #[test]
    fn empty_pack_is_an_error() {
        let f = Field::from_series("void", Array2::from_elem((3, 2), f64::NAN)).unwrap();
        assert!(matches!(pack(&f, None), Err(SpanError::EmptyPack { .. })));
    }

    #[test]
    fn unpack_restores_layout_and_mask() {
        let field = grid_with_gaps();
        let packed = pack_with(&field, None, PackOptions::keep_gaps(1)).unwrap();
        let back = packed.unpack(packed.data.view(), -999.0).unwrap();
        assert_eq!(back.shape(), field.shape());
        assert_eq!(back.mask(), field.mask());
        assert_eq!(back.values()[IxDyn(&[3, 1, 1])], field.values()[IxDyn(&[3, 1, 1])]);
        assert_eq!(back.values()[IxDyn(&[0, 1, 2])], -999.0);
    }

    #[test]
    fn stack_rejects_mismatched_time_axes() {
        let a = Field::from_series("a", Array2::ones((4, 2))).unwrap();
        let b = Field::from_series("b", Array2::ones((5, 2))).unwrap();
        assert!(matches!(
            FieldStack::new(&[a, b], PackOptions::default()),
            Err(SpanError::Shape(_))
        ));
    }

    #[test]
    fn stack_split_undoes_scaling() {
        let a = Field::from_series("a", Array2::from_shape_fn((6, 2), |(t, c)| (t + c) as f64)).unwrap();
        let b = Field::from_series("b", Array2::from_shape_fn((6, 3), |(t, c)| 100.0 * (t * c) as f64)).unwrap();
        let stack = FieldStack::new(&[a.clone(), b.clone()], PackOptions::default()).unwrap();
        assert_eq!(stack.n_channels(), 5);
        let parts = stack.unstack(stack.matrix().view(), f64::NAN).unwrap();
        for (orig, back) in [a, b].iter().zip(&parts) {
            for (x, y) in orig.values().iter().zip(back.values().iter()) {
                assert!((x - y).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn anomalies_zero_fill_gaps() {
        let m = array![[1.0, f64::NAN, 3.0]];
        let means = row_means(m.view());
        assert_eq!(means[0], 2.0);
        let a = anomalies(m.view(), means.view(), true);
        assert_eq!(a, array![[-1.0, 0.0, 1.0]]);
    }
}
