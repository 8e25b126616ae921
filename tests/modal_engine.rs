mod common;

use std::f64::consts::PI;

use approx::assert_abs_diff_eq;
use ndarray::Array2;

use common::*;
use spanfill::analysis::engine::ModalEngine;
use spanfill::analysis::modes::normalize_modes;
use spanfill::analysis::pairs::{ModePair, PairCriteria};
use spanfill::{AnalysisKind, Analyzer, AnalyzerConfig, ModeRange, ModeSelection};

fn noisy(channels: usize, n_times: usize, seed: u64) -> Array2<f64> {
    let mut m = Array2::from_shape_fn((channels, n_times), |(c, t)| {
        ((t as f64) * 0.21 * (c + 1) as f64).sin()
    });
    jitter(&mut m, seed, 0.5);
    m
}

#[test]
fn normalization_merges_exact_runs() {
    assert_eq!(
        normalize_modes(&[1, 2, 3, 7, 8]),
        vec![ModeRange::new(1, 3), ModeRange::new(7, 8)]
    );
    assert_eq!(normalize_modes(&[5]), vec![ModeRange::new(5, 5)]);
}

#[test]
fn full_budget_reconstructions_are_identities() {
    let engine: ModalEngine = ModalEngine::default();
    for seed in 0..4 {
        let data = noisy(5, 60, seed);
        let pca = engine.pca(data.view(), 5, None).unwrap();
        let rec = engine.reconstruct_selection(&pca, &ModeSelection::All).unwrap();
        for (a, b) in rec.iter().zip(data.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }

        let mssa = engine.mssa(data.view(), 6, 30).unwrap();
        let rec = engine.reconstruct_selection(&mssa, &ModeSelection::All).unwrap();
        for (a, b) in rec.iter().zip(data.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }
}

#[test]
fn wide_matrices_use_the_time_domain() {
    let engine: ModalEngine = ModalEngine::default();
    let data = noisy(40, 12, 9);
    let pca = engine.pca(data.view(), 12, None).unwrap();
    assert!(pca.time_domain);
    let rec = engine.reconstruct_selection(&pca, &ModeSelection::All).unwrap();
    for (a, b) in rec.iter().zip(data.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-8);
    }
}

#[test]
fn arbitrary_selection_is_the_sum_of_single_modes() {
    let engine: ModalEngine = ModalEngine::default();
    let data = noisy(4, 40, 2);
    let mssa = engine.mssa(data.view(), 5, 8).unwrap();
    let listed = engine
        .reconstruct_selection(&mssa, &ModeSelection::List(vec![1, 2, 3, 6]))
        .unwrap();
    let mut summed = Array2::zeros(listed.dim());
    for m in [1, 2, 3, 6] {
        summed += &engine.reconstruct_selection(&mssa, &ModeSelection::Single(m)).unwrap();
    }
    for (a, b) in listed.iter().zip(summed.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-10);
    }
}

#[test]
fn explained_variance_sums_to_at_most_hundred() {
    let engine: ModalEngine = ModalEngine::default();
    let pca = engine.pca(noisy(6, 50, 4).view(), 3, None).unwrap();
    let ev = pca.explained_variance();
    assert_eq!(ev.len(), 3);
    assert!(ev.sum() <= 100.0 + 1e-9);
    assert!(ev[0] >= ev[1] && ev[1] >= ev[2]);
}

#[test]
fn analyzer_finds_the_oscillation_pair() {
    let series = Array2::from_shape_fn((120, 1), |(t, _)| (2.0 * PI * t as f64 / 12.0).sin() + 3.0);
    let field = series_field("osc", series);
    let mut analyzer = Analyzer::new(
        &[field],
        AnalyzerConfig {
            nmssa: 4,
            window: Some(24),
            ..AnalyzerConfig::default()
        },
    )
    .unwrap();
    analyzer.mssa(false).unwrap();
    let pairs = analyzer.pairs(PairCriteria::default()).unwrap();
    assert_eq!(pairs, vec![ModePair { first: 1, second: 2 }]);

    let rec = analyzer.reconstruct(AnalysisKind::Mssa, &ModeSelection::Leading(2)).unwrap();
    let expected = (2.0 * PI * 30.0 / 12.0).sin() + 3.0;
    assert_abs_diff_eq!(rec[0].values()[[30, 0].as_slice()], expected, epsilon = 1e-6);
}
