use log::{debug, info};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};

use super::engine::ModalEngine;
use super::kernel::{Decomposer, SymmetricEigenKernel};
use super::modes::{AnalysisKind, ModeSelection, ModeSet};
use super::pairs::{find_pairs, ModePair, PairCriteria};
use crate::config::AnalyzerConfig;
use crate::data::model::Field;
use crate::data::pack::{anomalies, row_means, FieldStack};
use crate::error::{Result, SpanError};

// ---------------------------------------------------------------------------
// Analyzer – pack, decompose, reconstruct, unpack
// ---------------------------------------------------------------------------

/// One-shot spectral analysis of one or more fields sharing a time axis.
///
/// Fields are packed and stacked once; each decomposition is computed on
/// demand and kept for later reconstructions.
pub struct Analyzer<K = SymmetricEigenKernel> {
    config: AnalyzerConfig,
    engine: ModalEngine<K>,
    stack: FieldStack,
    means: Array1<f64>,
    anomalies: Array2<f64>,
    pca: Option<ModeSet>,
    mssa: Option<ModeSet>,
    /// Number of PCA modes the MSSA was computed on, if any.
    prepca: Option<usize>,
    svd: Option<(ModeSet, ModeSet)>,
}

impl Analyzer {
    pub fn new(fields: &[Field], config: AnalyzerConfig) -> Result<Self> {
        Self::with_engine(fields, config, ModalEngine::default())
    }
}

impl<K: Decomposer> Analyzer<K> {
    pub fn with_engine(fields: &[Field], config: AnalyzerConfig, engine: ModalEngine<K>) -> Result<Self> {
        let stack = FieldStack::new(fields, config.pack_options())?;
        let matrix = stack.matrix();
        let means = row_means(matrix.view());
        let anomalies = anomalies(matrix.view(), means.view(), true);
        debug!(
            "Analyzer on {} field(s): {} channels x {} time steps",
            stack.len(),
            stack.n_channels(),
            stack.n_times()
        );
        Ok(Analyzer {
            config,
            engine,
            stack,
            means,
            anomalies,
            pca: None,
            mssa: None,
            prepca: None,
            svd: None,
        })
    }

    pub fn stack(&self) -> &FieldStack {
        &self.stack
    }

    pub fn pca_modes(&self) -> Option<&ModeSet> {
        self.pca.as_ref()
    }

    pub fn mssa_modes(&self) -> Option<&ModeSet> {
        self.mssa.as_ref()
    }

    pub fn svd_modes(&self) -> Option<(&ModeSet, &ModeSet)> {
        self.svd.as_ref().map(|(l, r)| (l, r))
    }

    /// Weighted PCA of the stacked anomalies.
    pub fn pca(&mut self) -> Result<&ModeSet> {
        let weights = self.stack.weights();
        let modes = self
            .engine
            .pca(self.anomalies.view(), self.config.npca, Some(weights.view()))?;
        info!("PCA: {} modes", modes.len());
        Ok(self.pca.insert(modes))
    }

    /// MSSA of the anomalies, or of the PCA coefficients when `prepca` is set.
    pub fn mssa(&mut self, prepca: bool) -> Result<&ModeSet> {
        let input = if prepca {
            if self.pca.is_none() {
                self.pca()?;
            }
            let pca = self.pca.as_ref().ok_or(SpanError::NotDecomposed(AnalysisKind::Pca))?;
            pca.pcs.clone()
        } else {
            self.anomalies.clone()
        };
        let window = self.config.window.unwrap_or(self.stack.n_times() / 3);
        let n_modes = self.config.nmssa.min(input.nrows() * window.max(1));
        let modes = self.engine.mssa(input.view(), window, n_modes)?;
        info!("MSSA (window {window}): {} modes", modes.len());
        self.prepca = prepca.then_some(input.nrows());
        Ok(self.mssa.insert(modes))
    }

    /// SVD of the first two stacked fields.
    pub fn svd(&mut self) -> Result<(&ModeSet, &ModeSet)> {
        if self.stack.len() < 2 {
            return Err(SpanError::InsufficientFields {
                operation: "SVD",
                needed: 2,
                got: self.stack.len(),
            });
        }
        let blocks: Vec<ArrayView2<f64>> = (0..2).map(|i| self.block(i)).collect();
        let weights: Vec<Array1<f64>> =
            self.stack.packed()[..2].iter().map(|p| p.weights.clone()).collect();
        let (left, right) = self.engine.svd(
            &[
                (blocks[0], Some(weights[0].view())),
                (blocks[1], Some(weights[1].view())),
            ],
            self.config.nsvd,
        )?;
        info!("SVD: {} coupled modes", left.len());
        let (l, r) = self.svd.insert((left, right));
        Ok((&*l, &*r))
    }

    /// Reconstruct fields from the selected modes of one decomposition.
    ///
    /// PCA and MSSA give one field per stacked input, SVD gives the first
    /// two. Points that were not packed come back missing.
    pub fn reconstruct(&self, kind: AnalysisKind, selection: &ModeSelection) -> Result<Vec<Field>> {
        match kind {
            AnalysisKind::Pca => {
                let pca = self.pca.as_ref().ok_or(SpanError::NotDecomposed(kind))?;
                let rec = self.engine.reconstruct_selection(pca, selection)?;
                self.stack.unstack(self.with_means(rec).view(), f64::NAN)
            }
            AnalysisKind::Mssa => {
                let mssa = self.mssa.as_ref().ok_or(SpanError::NotDecomposed(kind))?;
                let mut rec = self.engine.reconstruct_selection(mssa, selection)?;
                if let Some(n) = self.prepca {
                    let pca = self
                        .pca
                        .as_ref()
                        .ok_or(SpanError::NotDecomposed(AnalysisKind::Pca))?;
                    rec = pca.eofs.slice(s![..n, ..]).t().dot(&rec);
                }
                self.stack.unstack(self.with_means(rec).view(), f64::NAN)
            }
            AnalysisKind::Svd => {
                let (left, right) = self.svd.as_ref().ok_or(SpanError::NotDecomposed(kind))?;
                [left, right]
                    .iter()
                    .enumerate()
                    .map(|(i, modes)| {
                        let rec = self.engine.reconstruct_selection(modes, selection)?;
                        let rec = rec + &self.block_means(i).insert_axis(Axis(1));
                        let rec = self.stack.unscale_block(i, rec.view());
                        self.stack.packed()[i].unpack(rec.view(), f64::NAN)
                    })
                    .collect()
            }
        }
    }

    /// Oscillatory pairs among the MSSA modes.
    pub fn pairs(&self, criteria: PairCriteria) -> Result<Vec<ModePair>> {
        let mssa = self
            .mssa
            .as_ref()
            .ok_or(SpanError::NotDecomposed(AnalysisKind::Mssa))?;
        Ok(find_pairs(mssa.pcs.view(), criteria))
    }

    fn channel_offset(&self, index: usize) -> usize {
        self.stack.packed()[..index].iter().map(|p| p.n_channels()).sum()
    }

    fn block(&self, index: usize) -> ArrayView2<f64> {
        let start = self.channel_offset(index);
        let end = start + self.stack.packed()[index].n_channels();
        self.anomalies.slice(s![start..end, ..])
    }

    fn block_means(&self, index: usize) -> Array1<f64> {
        let start = self.channel_offset(index);
        let end = start + self.stack.packed()[index].n_channels();
        self.means.slice(s![start..end]).to_owned()
    }

    fn with_means(&self, rec: Array2<f64>) -> Array2<f64> {
        rec + &self.means.view().insert_axis(Axis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn series(n_times: usize, channels: usize, offset: f64) -> Field {
        let values = Array2::from_shape_fn((n_times, channels), |(t, c)| {
            let t = t as f64;
            offset + (0.4 * t + c as f64).sin() + 0.3 * (0.11 * t).cos() * c as f64
        });
        Field::from_series("s", values).unwrap()
    }

    #[test]
    fn reconstruct_before_decomposition_fails() {
        let an = Analyzer::new(&[series(30, 3, 0.0)], AnalyzerConfig::default()).unwrap();
        assert!(matches!(
            an.reconstruct(AnalysisKind::Pca, &ModeSelection::All),
            Err(SpanError::NotDecomposed(AnalysisKind::Pca))
        ));
        assert!(matches!(
            an.pairs(PairCriteria::default()),
            Err(SpanError::NotDecomposed(AnalysisKind::Mssa))
        ));
    }

    #[test]
    fn full_pca_reconstruction_restores_fields() {
        let field = series(30, 3, 5.0);
        let mut an = Analyzer::new(&[field.clone()], AnalyzerConfig::default()).unwrap();
        an.pca().unwrap();
        let rec = an.reconstruct(AnalysisKind::Pca, &ModeSelection::All).unwrap();
        assert_eq!(rec.len(), 1);
        for (a, b) in rec[0].values().iter().zip(field.values().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }

    #[test]
    fn mssa_on_pca_coefficients_goes_back_through_eofs() {
        let field = series(40, 3, -1.0);
        let mut an = Analyzer::new(&[field.clone()], AnalyzerConfig {
            nmssa: 39,
            window: Some(13),
            ..AnalyzerConfig::default()
        })
        .unwrap();
        an.mssa(true).unwrap();
        assert!(an.pca_modes().is_some());
        let rec = an.reconstruct(AnalysisKind::Mssa, &ModeSelection::All).unwrap();
        for (a, b) in rec[0].values().iter().zip(field.values().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn svd_needs_two_fields() {
        let mut an = Analyzer::new(&[series(20, 2, 0.0)], AnalyzerConfig::default()).unwrap();
        assert!(matches!(an.svd(), Err(SpanError::InsufficientFields { .. })));
    }

    #[test]
    fn svd_reconstructs_both_fields() {
        let a = series(40, 3, 1.0);
        let b = series(40, 2, 10.0);
        let mut an = Analyzer::new(&[a.clone(), b.clone()], AnalyzerConfig::default()).unwrap();
        let (left, right) = an.svd().unwrap();
        assert_eq!(left.len(), right.len());
        let rec = an.reconstruct(AnalysisKind::Svd, &ModeSelection::All).unwrap();
        assert_eq!(rec.len(), 2);
        assert_eq!(rec[1].shape(), b.shape());
    }
}
