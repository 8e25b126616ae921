use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView2, ArrayViewMut1, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::state::FillKind;
use crate::config::CrossValidationConfig;
use crate::error::{Result, SpanError};

// ---------------------------------------------------------------------------
// Withheld-point masks
// ---------------------------------------------------------------------------

/// Draws and caches the points withheld in the cross-validation regime.
///
/// The mask is `true` at withheld points. It is drawn from a seeded random
/// field, optionally smoothed, and only ever covers valid reference points.
/// A mask is reused for the same decomposition type unless `regen` is set;
/// a pinned mask is always used for its type.
#[derive(Debug, Clone)]
pub struct CrossValidator {
    config: CrossValidationConfig,
    rng: ChaCha8Rng,
    cached: Option<(FillKind, Array2<bool>)>,
    pinned: Vec<(FillKind, Array2<bool>)>,
}

impl CrossValidator {
    pub fn new(config: CrossValidationConfig) -> Self {
        CrossValidator {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            cached: None,
            pinned: Vec::new(),
        }
    }

    /// Always withhold `mask` for `kind`.
    pub fn pin(&mut self, kind: FillKind, mask: Array2<bool>) {
        self.pinned.retain(|(k, _)| *k != kind);
        self.pinned.push((kind, mask));
    }

    /// Withheld points for `reference`, generating them when needed.
    pub fn mask_for(&mut self, kind: FillKind, reference: ArrayView2<f64>) -> Result<Array2<bool>> {
        if let Some((_, mask)) = self.pinned.iter().find(|(k, _)| *k == kind) {
            if mask.dim() != reference.dim() {
                return Err(SpanError::Shape(format!(
                    "pinned {kind} cross-validation mask is {:?}, reference is {:?}",
                    mask.dim(),
                    reference.dim()
                )));
            }
            return Ok(only_valid(mask.clone(), reference));
        }
        if !self.config.regen {
            if let Some((k, mask)) = &self.cached {
                if *k == kind && mask.dim() == reference.dim() {
                    debug!("  reusing {kind} cross-validation mask");
                    return Ok(mask.clone());
                }
            }
        }
        let mask = self.generate(reference);
        self.cached = Some((kind, mask.clone()));
        Ok(mask)
    }

    /// Draw a new mask withholding `level` percent of the valid points.
    pub fn generate(&mut self, reference: ArrayView2<f64>) -> Array2<bool> {
        let (channels, n_times) = reference.dim();
        let smoothing = self.config.smoothing;
        let spatial = smoothing.spatial.width(channels, smoothing.max_relative);
        let temporal = smoothing.temporal.width(n_times, smoothing.max_relative);

        let mut noise = Array2::from_shape_fn((channels, n_times), |_| self.rng.gen::<f64>());
        if spatial > 1 {
            for lane in noise.lanes_mut(Axis(0)) {
                moving_average(lane, spatial);
            }
        }
        if temporal > 1 {
            for lane in noise.lanes_mut(Axis(1)) {
                moving_average(lane, temporal);
            }
        }

        let mut valid: Vec<((usize, usize), f64)> = noise
            .indexed_iter()
            .filter(|(idx, _)| reference[*idx].is_finite())
            .map(|(idx, &v)| (idx, v))
            .collect();
        let target = (valid.len() as f64 * self.config.level / 100.0).round() as usize;
        let target = if valid.len() > 1 { target.clamp(1, valid.len() - 1) } else { 0 };
        if target == 0 {
            warn!("Not enough valid points to withhold any for cross-validation");
        }
        valid.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut mask = Array2::from_elem((channels, n_times), false);
        for &(idx, _) in valid.iter().take(target) {
            mask[idx] = true;
        }
        debug!(
            "  withheld {target} of {} valid points (smoothing {spatial}x{temporal})",
            valid.len()
        );
        mask
    }
}

/// Reference with the withheld points set missing.
pub fn withhold(reference: ArrayView2<f64>, mask: &Array2<bool>) -> Array2<f64> {
    let mut out = reference.to_owned();
    ndarray::Zip::from(&mut out).and(mask).for_each(|v, &m| {
        if m {
            *v = f64::NAN;
        }
    });
    out
}

fn only_valid(mut mask: Array2<bool>, reference: ArrayView2<f64>) -> Array2<bool> {
    ndarray::Zip::from(&mut mask)
        .and(&reference)
        .for_each(|m, v| *m &= v.is_finite());
    mask
}

/// Centered moving average of odd `width`, normalised by the number of
/// points inside the lane.
fn moving_average(mut lane: ArrayViewMut1<f64>, width: usize) {
    let n = lane.len();
    let half = width / 2;
    let src: Array1<f64> = lane.to_owned();
    for i in 0..n {
        let lo = i.saturating_sub(half);
        let hi = (i + half + 1).min(n);
        let window = src.slice(ndarray::s![lo..hi]);
        lane[i] = window.sum() / window.len() as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SmoothingConfig, SmoothingScale};

    fn gappy(channels: usize, n_times: usize) -> Array2<f64> {
        Array2::from_shape_fn((channels, n_times), |(c, t)| {
            if (c + t) % 7 == 0 {
                f64::NAN
            } else {
                (c * t) as f64
            }
        })
    }

    #[test]
    fn withheld_points_are_never_true_gaps() {
        let reference = gappy(6, 40);
        for seed in 0..20 {
            let mut cv = CrossValidator::new(CrossValidationConfig {
                seed,
                level: 20.0,
                ..CrossValidationConfig::default()
            });
            let mask = cv.generate(reference.view());
            for (m, v) in mask.iter().zip(reference.iter()) {
                assert!(!(*m && v.is_nan()));
            }
        }
    }

    #[test]
    fn level_sets_the_withheld_count() {
        let reference = gappy(5, 40);
        let valid = reference.iter().filter(|v| v.is_finite()).count();
        let mut cv = CrossValidator::new(CrossValidationConfig {
            level: 10.0,
            smoothing: SmoothingConfig {
                spatial: SmoothingScale::Points(3),
                temporal: SmoothingScale::Percent(10.0),
                max_relative: 0.7,
            },
            ..CrossValidationConfig::default()
        });
        let mask = cv.generate(reference.view());
        let withheld = mask.iter().filter(|&&m| m).count();
        assert_eq!(withheld, (valid as f64 * 0.1).round() as usize);
    }

    #[test]
    fn mask_is_cached_per_kind_unless_regenerated() {
        let reference = gappy(4, 30);
        let mut cv = CrossValidator::new(CrossValidationConfig::default());
        let first = cv.mask_for(FillKind::Pca, reference.view()).unwrap();
        assert_eq!(cv.mask_for(FillKind::Pca, reference.view()).unwrap(), first);
        assert_ne!(cv.mask_for(FillKind::Mssa, reference.view()).unwrap(), first);

        let mut fresh = CrossValidator::new(CrossValidationConfig {
            regen: true,
            ..CrossValidationConfig::default()
        });
        let a = fresh.mask_for(FillKind::Pca, reference.view()).unwrap();
        let b = fresh.mask_for(FillKind::Pca, reference.view()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn pinned_mask_drops_missing_points() {
        let reference = gappy(3, 10);
        let mut cv = CrossValidator::new(CrossValidationConfig::default());
        cv.pin(FillKind::Pca, Array2::from_elem((3, 10), true));
        let mask = cv.mask_for(FillKind::Pca, reference.view()).unwrap();
        assert!(!mask[[0, 0]]);
        assert!(mask[[0, 1]]);
        assert!(cv.mask_for(FillKind::Pca, gappy(2, 10).view()).is_err());
    }

    #[test]
    fn withhold_blanks_masked_points() {
        let reference = gappy(2, 5);
        let mut mask = Array2::from_elem((2, 5), false);
        mask[[1, 2]] = true;
        let out = withhold(reference.view(), &mask);
        assert!(out[[1, 2]].is_nan());
        assert_eq!(out[[1, 3]], 3.0);
    }
}
