use log::debug;
use ndarray::{s, Array1, ArrayView1, ArrayView2};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Oscillatory pair detection
// ---------------------------------------------------------------------------

/// Two modes whose coefficient series are in quadrature.
///
/// Mode numbers are 1-based, like [`super::modes::ModeRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModePair {
    pub first: usize,
    pub second: usize,
}

/// Search parameters for [`find_pairs`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairCriteria {
    /// Required average correlation between one series and the other's
    /// derivative, clamped to `[0, 1]`.
    pub min_correlation: f64,
    /// How many modes ahead a partner is looked for.
    pub max_distance: usize,
}

impl Default for PairCriteria {
    fn default() -> Self {
        Self {
            min_correlation: 0.95,
            max_distance: 3,
        }
    }
}

/// Find quadrature pairs among the rows of `pcs` (`(modes, samples)`).
///
/// Mode `i` pairs with the nearest unclaimed `j` in `i+1..=i+max_distance`
/// for which `|corr(pc_i, d pc_j)| + |corr(pc_j, d pc_i)|` reaches twice the
/// minimum correlation, `d` being the centered first difference evaluated
/// on the interior samples. Claimed modes are not considered again.
///
/// The correlations are summed in absolute value, not with their signs: in
/// a quadrature pair one of them is positive and the other negative, so the
/// signed sum is near zero whichever way the partner's sign comes out.
pub fn find_pairs(pcs: ArrayView2<f64>, criteria: PairCriteria) -> Vec<ModePair> {
    let (n_modes, n_samples) = pcs.dim();
    if n_modes < 2 || n_samples < 3 {
        return Vec::new();
    }
    let min_corr = criteria.min_correlation.clamp(0.0, 1.0);
    let max_distance = criteria.max_distance.clamp(1, n_modes - 1);

    let interior: Vec<Array1<f64>> = (0..n_modes)
        .map(|k| pcs.slice(s![k, 1..n_samples - 1]).to_owned())
        .collect();
    let derivative: Vec<Array1<f64>> = (0..n_modes)
        .map(|k| centered_difference(pcs.row(k)))
        .collect();

    let mut claimed = vec![false; n_modes];
    let mut pairs = Vec::new();
    for i in 0..n_modes - 1 {
        if claimed[i] {
            continue;
        }
        let last = (i + max_distance).min(n_modes - 1);
        for j in i + 1..=last {
            if claimed[j] {
                continue;
            }
            let score = correlation(interior[i].view(), derivative[j].view()).abs()
                + correlation(interior[j].view(), derivative[i].view()).abs();
            if score >= 2.0 * min_corr {
                debug!("Modes {} and {} form a pair (score {score:.3})", i + 1, j + 1);
                claimed[i] = true;
                claimed[j] = true;
                pairs.push(ModePair {
                    first: i + 1,
                    second: j + 1,
                });
                break;
            }
        }
    }
    pairs
}

fn centered_difference(series: ArrayView1<f64>) -> Array1<f64> {
    let n = series.len();
    &series.slice(s![2..]) - &series.slice(s![..n - 2])
}

/// Pearson correlation over the samples where both series are finite.
fn correlation(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let pairs: Vec<(f64, f64)> = a
        .iter()
        .zip(b.iter())
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .map(|(&x, &y)| (x, y))
        .collect();
    if pairs.len() < 2 {
        return 0.0;
    }
    let n = pairs.len() as f64;
    let ma = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mb = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut cov, mut va, mut vb) = (0.0, 0.0, 0.0);
    for (x, y) in &pairs {
        cov += (x - ma) * (y - mb);
        va += (x - ma).powi(2);
        vb += (y - mb).powi(2);
    }
    if va <= 0.0 || vb <= 0.0 {
        0.0
    } else {
        cov / (va * vb).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use std::f64::consts::PI;

    fn quadrature(n_samples: usize) -> Array2<f64> {
        // modes 1/2 are a sin/cos pair, mode 3 is a slow trend
        Array2::from_shape_fn((3, n_samples), |(k, t)| {
            let phase = 2.0 * PI * t as f64 / 12.0;
            match k {
                0 => phase.sin(),
                1 => phase.cos(),
                _ => (t as f64 / n_samples as f64).powi(2),
            }
        })
    }

    #[test]
    fn partner_sign_does_not_matter() {
        let mut pcs = quadrature(120);
        pcs.row_mut(1).mapv_inplace(|v| -v);
        let pairs = find_pairs(pcs.view(), PairCriteria::default());
        assert_eq!(pairs, vec![ModePair { first: 1, second: 2 }]);

        // the two correlations cancel when their signs are kept
        let interior = |k: usize| pcs.slice(s![k, 1..119]).to_owned();
        let signed = correlation(interior(0).view(), centered_difference(pcs.row(1)).view())
            + correlation(interior(1).view(), centered_difference(pcs.row(0)).view());
        assert!(signed.abs() < 1e-6);
    }

    #[test]
    fn sine_and_cosine_pair_up() {
        let pairs = find_pairs(quadrature(120).view(), PairCriteria::default());
        assert_eq!(pairs, vec![ModePair { first: 1, second: 2 }]);
    }

    #[test]
    fn unrelated_modes_stay_unpaired() {
        let pcs = Array2::from_shape_fn((2, 50), |(k, t)| if k == 0 { t as f64 } else { (t % 7) as f64 });
        assert!(find_pairs(pcs.view(), PairCriteria::default()).is_empty());
    }

    #[test]
    fn distance_limits_the_search() {
        let mut pcs = quadrature(120);
        // move the cosine out of reach of the sine
        let cosine = pcs.row(1).to_owned();
        let trend = pcs.row(2).to_owned();
        pcs.row_mut(1).assign(&trend);
        pcs.row_mut(2).assign(&cosine);
        let near = PairCriteria {
            max_distance: 1,
            ..PairCriteria::default()
        };
        assert!(find_pairs(pcs.view(), near).is_empty());
        assert_eq!(
            find_pairs(pcs.view(), PairCriteria::default()),
            vec![ModePair { first: 1, second: 3 }]
        );
    }

    #[test]
    fn short_series_yield_nothing() {
        let pcs = Array2::<f64>::zeros((3, 2));
        assert!(find_pairs(pcs.view(), PairCriteria::default()).is_empty());
    }
}
