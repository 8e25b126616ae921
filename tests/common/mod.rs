#![allow(dead_code)]

use std::f64::consts::PI;

use ndarray::{Array2, ArrayD, IxDyn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use spanfill::Field;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `(time, channel)` sum of two sinusoids whose periods divide `n_times`.
pub fn two_waves(n_times: usize, amplitudes: &[(f64, f64, f64)]) -> Array2<f64> {
    Array2::from_shape_fn((n_times, amplitudes.len()), |(t, c)| {
        let (a, b, offset) = amplitudes[c];
        let t = t as f64;
        a * (2.0 * PI * t / 10.0).sin() + b * (2.0 * PI * t / 5.0 + 0.3).sin() + offset
    })
}

pub fn six_channels() -> Vec<(f64, f64, f64)> {
    vec![
        (1.0, 0.4, 1.0),
        (0.8, -0.6, 2.0),
        (-0.5, 0.7, 3.0),
        (1.2, 0.2, -1.0),
        (0.3, -0.3, 0.0),
        (-0.9, 0.5, 5.0),
    ]
}

/// Copy of `series` with `channel` missing over `times`.
pub fn with_gap(series: &Array2<f64>, channel: usize, times: std::ops::Range<usize>) -> Array2<f64> {
    let mut out = series.clone();
    for t in times {
        out[[t, channel]] = f64::NAN;
    }
    out
}

pub fn series_field(name: &str, series: Array2<f64>) -> Field {
    Field::from_series(name, series).unwrap()
}

/// Smooth random field with a fraction of its points missing.
pub fn random_masked_field(seed: u64, shape: &[usize], missing: f64) -> Field {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let values = ArrayD::from_shape_fn(IxDyn(shape), |_| {
        if rng.gen::<f64>() < missing {
            f64::NAN
        } else {
            rng.gen_range(-10.0..10.0)
        }
    });
    Field::new(format!("random{seed}"), values).unwrap()
}

/// Deterministic small perturbation, so decompositions are full rank.
pub fn jitter(series: &mut Array2<f64>, seed: u64, amplitude: f64) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    series.mapv_inplace(|v| v + amplitude * (rng.gen::<f64>() - 0.5));
}
