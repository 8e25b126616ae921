use std::time::Instant;

use log::{debug, info, warn};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};

use super::crossval::{withhold, CrossValidator};
use super::state::{
    ConvergenceScope, Diagnostic, EcLoop, EcState, ErrorRecord, FillKind, FillReport, FillState,
    KindTable, ModeDecision, ModeSearch, ModeTrial, Regime, Selection,
};
use crate::analysis::engine::ModalEngine;
use crate::analysis::kernel::{Decomposer, SymmetricEigenKernel};
use crate::analysis::modes::{ModeRange, ModeSet};
use crate::config::FillConfig;
use crate::data::model::Field;
use crate::data::pack::{anomalies, fill_missing, has_missing, row_means, FieldStack};
use crate::error::{Result, SpanError};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Filtered fields of one decomposition stage.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub kind: FillKind,
    pub modes: usize,
    pub filtered: Vec<Field>,
}

/// Result of [`Filler::run`], one field per input in each list.
#[derive(Debug, Clone)]
pub struct FillOutcome {
    /// Inputs with their gaps replaced by the final reconstruction.
    pub filled: Vec<Field>,
    /// The final mode-truncated reconstruction.
    pub filtered: Vec<Field>,
    pub stages: Vec<StageOutput>,
    pub report: FillReport,
}

/// Final state of one stage in one regime.
#[derive(Debug, Clone)]
struct StageResult {
    modes: ModeSet,
    /// Reconstruction with `mean` restored.
    rec: Array2<f64>,
    mean: Array1<f64>,
    selected: usize,
}

/// Matrices one stage fills and scores against.
struct StageData<'a> {
    regime: Regime,
    kind: FillKind,
    reanalysis: usize,
    reference: ArrayView2<'a, f64>,
    current: ArrayView2<'a, f64>,
    mean: &'a Array1<f64>,
    /// Withheld points scored in cross-validation.
    scored: Option<&'a Array2<bool>>,
}

// ---------------------------------------------------------------------------
// Filler
// ---------------------------------------------------------------------------

/// Iterative gap filler driven by PCA and MSSA reconstructions.
///
/// Loops, outermost first: regime, decomposition type, reanalysis, mode
/// count, expansion-coefficient step. The filler consumes itself; all
/// mutable state lives in one [`FillState`] per run.
pub struct Filler<K = SymmetricEigenKernel> {
    config: FillConfig,
    engine: ModalEngine<K>,
    stack: FieldStack,
    original: Array2<f64>,
    crossval: CrossValidator,
    deadline: Option<Instant>,
}

impl Filler {
    pub fn new(fields: &[Field], config: FillConfig) -> Result<Self> {
        Self::with_engine(fields, config, ModalEngine::default())
    }
}

impl<K: Decomposer> Filler<K> {
    pub fn with_engine(fields: &[Field], config: FillConfig, engine: ModalEngine<K>) -> Result<Self> {
        let stack = FieldStack::new(fields, config.pack_options())?;
        config.validate(stack.n_times())?;
        let original = stack.matrix();
        debug!(
            "Filler on {} field(s): {} channels x {} time steps, {} missing",
            stack.len(),
            stack.n_channels(),
            stack.n_times(),
            original.iter().filter(|v| !v.is_finite()).count()
        );
        Ok(Filler {
            crossval: CrossValidator::new(config.cross_validation),
            config,
            engine,
            stack,
            original,
            deadline: None,
        })
    }

    /// Stop starting new reanalyses and mode counts once `deadline` passes.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Withhold these points instead of random ones when cross-validating
    /// `kind`.
    pub fn with_crossval_mask(mut self, kind: FillKind, mask: Array2<bool>) -> Self {
        self.crossval.pin(kind, mask);
        self
    }

    pub fn run(mut self) -> Result<FillOutcome> {
        let mut state = FillState::new();
        let kinds: Vec<FillKind> = FillKind::ALL
            .into_iter()
            .filter(|&k| k == FillKind::Pca || self.config.mssa)
            .collect();

        let mut results: KindTable<Option<StageResult>> = KindTable::default();
        for &regime in Regime::sequence(self.config.testmode) {
            debug!("Analysis regime: {regime}");
            results[FillKind::Mssa] = None;
            for &kind in &kinds {
                debug!(" Running {kind}");
                let reference = match kind {
                    FillKind::Pca => self.original.clone(),
                    FillKind::Mssa => {
                        let pca = results[FillKind::Pca]
                            .as_ref()
                            .ok_or(SpanError::NotDecomposed(FillKind::Pca.analysis_kind()))?;
                        self.mssa_reference(pca)
                    }
                };

                if !has_missing(reference.view()) {
                    warn!(" No gap to fill in {kind} reference, analysing with all modes");
                    state.diagnose(Diagnostic::NothingToFill { regime, kind });
                    let result = self.analyse_complete(kind, reference.view())?;
                    state.default_budget(kind, result.selected);
                    results[kind] = Some(result);
                    break;
                }

                let result = self.run_stage(regime, kind, reference.view(), &mut state)?;
                results[kind] = Some(result);
            }
        }

        self.outcome(results, state.report)
    }

    // -- stages --

    fn run_stage(
        &mut self,
        regime: Regime,
        kind: FillKind,
        reference: ArrayView2<f64>,
        state: &mut FillState,
    ) -> Result<StageResult> {
        let scored = match regime {
            Regime::CrossValidation => Some(self.crossval.mask_for(kind, reference)?),
            _ => None,
        };
        let current = match &scored {
            Some(mask) => withhold(reference, mask),
            None => reference.to_owned(),
        };
        let mean = row_means(current.view());
        let mut raw = current.clone();
        let mut result = None;

        for irf in 0..self.config.reanalyses {
            if irf > 0 && self.deadline_passed(state, regime, kind, irf) {
                break;
            }
            debug!("  Analysis ({}/{})", irf + 1, self.config.reanalyses);
            let modes = self.decompose(kind, anomalies(raw.view(), mean.view(), true).view())?;
            if modes.is_empty() {
                return Err(SpanError::Shape(format!("{kind} returned no mode")));
            }
            let ecloop = kind == FillKind::Mssa || !modes.time_domain;
            let budget = state.budget(kind, irf, modes.len());
            let data = StageData {
                regime,
                kind,
                reanalysis: irf,
                reference: reference.view(),
                current: current.view(),
                mean: &mean,
                scored: scored.as_ref(),
            };

            let mut search = ModeSearch::new(self.config.errchmax, regime.selects_modes());
            for (pos, &m) in budget.iter().enumerate() {
                if pos > 0 && self.deadline_passed(state, regime, kind, irf) {
                    break;
                }
                let verb = if regime.selects_modes() { "Trying" } else { "Reconstructing" };
                debug!("   {verb} with {m} mode(s)");
                let (trial, ec) = self.try_modes(&data, &modes, m, ecloop)?;
                if ec.state() == EcState::Exhausted {
                    warn!("   {kind} expansion coefficients did not converge with {m} mode(s)");
                    state.diagnose(Diagnostic::ConvergenceExhausted {
                        regime,
                        kind,
                        reanalysis: irf,
                        modes: m,
                        scope: ConvergenceScope::ExpansionCoefficients,
                    });
                }
                let mut errors = ec.errors().to_vec();
                let decision = search.consider(trial);
                if let ModeDecision::Truncate { selected } = decision {
                    if let Some(last) = errors.last_mut().filter(|e| **e > 0.0) {
                        *last = -*last;
                    }
                    info!("   Best number of {kind} modes: {selected}");
                }
                state.log_errors(ErrorRecord {
                    regime,
                    kind,
                    reanalysis: irf,
                    modes: m,
                    errors,
                });
                if decision != ModeDecision::Continue {
                    break;
                }
            }

            let truncated = search.truncated();
            let best = search
                .into_best()
                .ok_or_else(|| SpanError::Config(format!("no {kind} mode count was tried")))?;
            if !truncated && regime.selects_modes() && best.modes == modes.len() {
                info!("   Reached max number of {kind} modes ({})", best.modes);
                state.diagnose(Diagnostic::ConvergenceExhausted {
                    regime,
                    kind,
                    reanalysis: irf,
                    modes: best.modes,
                    scope: ConvergenceScope::ModeCount,
                });
            }
            state.report.selections.push(Selection {
                regime,
                kind,
                reanalysis: irf,
                modes: best.modes,
                error: best.error,
            });

            raw = fill_missing(current.view(), best.rec.view());
            if regime == Regime::CrossValidation {
                state.pin_budget(kind, irf, best.modes);
            }
            let ModeTrial { modes: selected, pcs, rec, .. } = best;
            result = Some(StageResult {
                modes: ModeSet { pcs, ..modes },
                rec,
                mean: mean.clone(),
                selected,
            });
        }

        result.ok_or_else(|| SpanError::Config("reanalyses must be at least 1".into()))
    }

    /// Settle the expansion coefficients for `m` modes.
    fn try_modes(
        &self,
        data: &StageData<'_>,
        modes: &ModeSet,
        m: usize,
        ecloop: bool,
    ) -> Result<(ModeTrial, EcLoop)> {
        let n_steps = if ecloop { self.config.nitermax } else { 1 };
        let range = [ModeRange::leading(m)];
        let mut work = modes.clone();
        let mut ec = EcLoop::new(n_steps, self.config.errchmax);
        let start = EcStep {
            pcs: modes.pcs.clone(),
            rec: Array2::from_elem(data.current.dim(), f64::NAN),
            error: f64::NAN,
            missing: 0,
        };

        let advance = |previous: &EcStep| -> Result<EcStep> {
            if ecloop {
                let filled = fill_missing(data.current, previous.rec.view());
                let anom = anomalies(filled.view(), data.mean.view(), false);
                let mut pcs = self.engine.refit(&work, anom.view())?;
                if data.kind == FillKind::Pca {
                    keep_undetermined(&mut pcs, previous.pcs.view());
                }
                work.pcs = pcs;
            }
            let rec = self.engine.reconstruct(&work, &range)? + &data.mean.view().insert_axis(Axis(1));
            Ok(EcStep {
                error: relative_error(data.reference, rec.view(), data.scored),
                missing: work.missing_coefficients(),
                pcs: work.pcs.clone(),
                rec,
            })
        };
        let full_fill = data.kind == FillKind::Mssa && self.config.full;
        let settled = settle(&mut ec, ecloop, full_fill, start, advance)?;

        debug!(
            "   {} {} in {}, {m} mode(s): error {:.3}% after {} step(s)",
            data.regime,
            data.kind,
            data.reanalysis + 1,
            ec.final_error(),
            ec.steps()
        );
        let trial = ModeTrial {
            modes: m,
            error: ec.final_error(),
            pcs: settled.pcs,
            rec: settled.rec,
        };
        Ok((trial, ec))
    }

    /// Analyse a reference without gaps once, with every mode.
    fn analyse_complete(&self, kind: FillKind, reference: ArrayView2<f64>) -> Result<StageResult> {
        let mean = row_means(reference);
        let modes = self.decompose(kind, anomalies(reference, mean.view(), true).view())?;
        let rec = self
            .engine
            .reconstruct(&modes, &[ModeRange::leading(modes.len().max(1))])?
            + &mean.view().insert_axis(Axis(1));
        Ok(StageResult {
            selected: modes.len(),
            modes,
            rec,
            mean,
        })
    }

    fn decompose(&self, kind: FillKind, anomalies: ArrayView2<f64>) -> Result<ModeSet> {
        match kind {
            FillKind::Pca => {
                let weights = self.stack.weights();
                self.engine.pca(anomalies, self.config.npca, Some(weights.view()))
            }
            FillKind::Mssa => {
                let window = self.config.window_for(anomalies.ncols());
                let n_modes = self.config.nmssa.min(anomalies.nrows() * window);
                self.engine.mssa(anomalies, window, n_modes)
            }
        }
    }

    /// Leading PCA coefficients the MSSA stage fills: the selected count
    /// plus one, missing wherever the data has no valid channel.
    fn mssa_reference(&self, pca: &StageResult) -> Array2<f64> {
        let n = (pca.selected + 1).min(pca.modes.len());
        let mut pcs = pca.modes.pcs.slice(s![..n, ..]).to_owned();
        for (t, column) in self.original.columns().into_iter().enumerate() {
            if !column.iter().any(|v| v.is_finite()) {
                pcs.column_mut(t).fill(f64::NAN);
            }
        }
        debug!(" MSSA on {n} PCA coefficient series");
        pcs
    }

    fn deadline_passed(&self, state: &mut FillState, regime: Regime, kind: FillKind, reanalysis: usize) -> bool {
        let passed = self.deadline.is_some_and(|d| Instant::now() >= d);
        if passed && !state.deadline_hit {
            warn!("Deadline reached during {regime} {kind}, keeping the current state");
            state.deadline_hit = true;
            state.diagnose(Diagnostic::DeadlineReached {
                regime,
                kind,
                reanalysis,
            });
        }
        passed
    }

    // -- outputs --

    fn outcome(&self, results: KindTable<Option<StageResult>>, report: FillReport) -> Result<FillOutcome> {
        let pca = results[FillKind::Pca]
            .as_ref()
            .ok_or(SpanError::NotDecomposed(FillKind::Pca.analysis_kind()))?;

        let mut stages = vec![StageOutput {
            kind: FillKind::Pca,
            modes: pca.selected,
            filtered: self.stack.unstack(pca.rec.view(), f64::NAN)?,
        }];
        let mut filtered = pca.rec.clone();

        if let Some(mssa) = results[FillKind::Mssa].as_ref() {
            let n = mssa.rec.nrows();
            let back = pca.modes.eofs.slice(s![..n, ..]).t().dot(&mssa.rec)
                + &pca.mean.view().insert_axis(Axis(1));
            stages.push(StageOutput {
                kind: FillKind::Mssa,
                modes: mssa.selected,
                filtered: self.stack.unstack(back.view(), f64::NAN)?,
            });
            filtered = fill_missing(back.view(), pca.rec.view());
        }

        let filled = fill_missing(self.original.view(), filtered.view());
        let missing = self.original.iter().filter(|v| !v.is_finite()).count();
        let remaining = filled.iter().filter(|v| !v.is_finite()).count();
        if remaining > 0 {
            warn!("{remaining} values could not be filled");
        }
        info!("Filled {} of {missing} missing values", missing - remaining);

        Ok(FillOutcome {
            filled: self.stack.unstack(filled.view(), f64::NAN)?,
            filtered: self.stack.unstack(filtered.view(), f64::NAN)?,
            stages,
            report,
        })
    }
}

/// `100 * std(reference - rec) / std(reference)` over the points where both
/// are defined, restricted to `scored` when given; NaN when undefined.
pub fn relative_error(
    reference: ArrayView2<f64>,
    rec: ArrayView2<f64>,
    scored: Option<&Array2<bool>>,
) -> f64 {
    let mut diffs = Vec::new();
    let mut refs = Vec::new();
    for ((idx, &r), &x) in reference.indexed_iter().zip(rec.iter()) {
        if !r.is_finite() || !x.is_finite() || scored.is_some_and(|m| !m[idx]) {
            continue;
        }
        diffs.push(r - x);
        refs.push(r);
    }
    let denom = std(&refs);
    if refs.len() < 2 || !(denom > 0.0) {
        return f64::NAN;
    }
    100.0 * std(&diffs) / denom
}

/// Coefficients and reconstruction after one EC step.
#[derive(Debug, Clone)]
struct EcStep {
    pcs: Array2<f64>,
    rec: Array2<f64>,
    error: f64,
    /// Coefficients still undetermined.
    missing: usize,
}

/// Drive `ec` with successive `advance` steps from `start`.
///
/// A rejected step is rolled back: the returned state is the one before it.
/// With `full_fill`, the stopping rule is deferred while coefficients are
/// missing and their count keeps changing.
fn settle<F>(
    ec: &mut EcLoop,
    ecloop: bool,
    full_fill: bool,
    start: EcStep,
    mut advance: F,
) -> Result<EcStep>
where
    F: FnMut(&EcStep) -> Result<EcStep>,
{
    let mut current = start;
    let mut missing_before: Option<usize> = None;
    loop {
        let next = advance(&current)?;
        if !ecloop {
            debug!("    Error: {:.3}%", next.error);
            ec.accept(next.error);
            return Ok(next);
        }
        debug!("    EC convergence step: {}", ec.steps());
        let snapshot = std::mem::replace(&mut current, next);
        let (error, missing) = (current.error, current.missing);

        if full_fill {
            let changed = missing_before.map_or(true, |before| before != missing);
            missing_before = Some(missing);
            if missing > 0 && changed {
                debug!("    Still {missing} missing coefficient(s)");
                if ec.defer(error) == EcState::Exhausted {
                    return Ok(current);
                }
                continue;
            }
        }
        match ec.step(error) {
            EcState::Iterating => {}
            EcState::Rejected => {
                debug!("    Error increased: step skipped, coefficients recovered");
                return Ok(snapshot);
            }
            EcState::Converged | EcState::Exhausted => return Ok(current),
        }
    }
}

/// Where a PCA refit is undetermined (no valid channel), keep the previous
/// coefficient, starting from the decomposition of the zero-filled data.
fn keep_undetermined(pcs: &mut Array2<f64>, previous: ArrayView2<f64>) {
    pcs.zip_mut_with(&previous, |p, &q| {
        if !p.is_finite() {
            *p = q;
        }
    });
}

fn std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestMode;
    use ndarray::array;

    #[test]
    fn relative_error_scores_only_withheld_points() {
        let reference = array![[1.0, 2.0, 3.0, 4.0]];
        let rec = array![[1.0, 2.0, 3.0, 100.0]];
        let scored = array![[true, true, true, false]];
        assert_eq!(relative_error(reference.view(), rec.view(), Some(&scored)), 0.0);
        assert!(relative_error(reference.view(), rec.view(), None) > 0.0);
    }

    #[test]
    fn relative_error_is_nan_without_points() {
        let reference = array![[1.0, f64::NAN]];
        let rec = array![[1.0, 2.0]];
        assert!(relative_error(reference.view(), rec.view(), None).is_nan());
    }

    fn ec_step(value: f64, error: f64, missing: usize) -> EcStep {
        EcStep {
            pcs: Array2::from_elem((2, 3), value),
            rec: Array2::from_elem((1, 3), 10.0 * value),
            error,
            missing,
        }
    }

    #[test]
    fn rejected_step_restores_previous_coefficients() {
        let errors = [10.0, 9.0, 9.5, 1.0];
        let mut calls = 0;
        let mut ec = EcLoop::new(20, -0.01);
        let settled = settle(&mut ec, true, false, ec_step(0.0, f64::NAN, 0), |previous| {
            assert_eq!(previous.pcs[[0, 0]], calls as f64);
            calls += 1;
            Ok(ec_step(calls as f64, errors[calls - 1], 0))
        })
        .unwrap();

        assert_eq!(calls, 3);
        assert_eq!(settled.pcs, Array2::from_elem((2, 3), 2.0));
        assert_eq!(settled.rec, Array2::from_elem((1, 3), 20.0));
        assert_eq!(ec.state(), EcState::Rejected);
        assert_eq!(ec.errors(), &[10.0, 9.0, -9.0]);
        assert_eq!(ec.final_error(), 9.0);
    }

    #[test]
    fn full_fill_defers_until_coefficients_are_complete() {
        // a worsening error is not judged while coefficients are missing
        let script = [(5.0, 4), (6.0, 2), (4.0, 0), (4.0, 0)];
        let mut calls = 0;
        let mut ec = EcLoop::new(20, -0.01);
        let settled = settle(&mut ec, true, true, ec_step(0.0, f64::NAN, 9), |_| {
            let (error, missing) = script[calls];
            calls += 1;
            Ok(ec_step(calls as f64, error, missing))
        })
        .unwrap();

        assert_eq!(calls, 4);
        assert_eq!(ec.state(), EcState::Converged);
        assert_eq!(ec.errors(), &[5.0, 6.0, 4.0, 4.0]);
        assert_eq!(settled.pcs[[0, 0]], 4.0);
    }

    #[test]
    fn single_evaluation_without_ec_loop() {
        let mut ec = EcLoop::new(1, -0.01);
        let settled =
            settle(&mut ec, false, false, ec_step(0.0, f64::NAN, 0), |_| Ok(ec_step(3.0, 2.5, 0))).unwrap();
        assert_eq!(settled.pcs[[1, 2]], 3.0);
        assert_eq!(ec.steps(), 1);
        assert_eq!(ec.final_error(), 2.5);
    }

    #[test]
    fn undetermined_pca_coefficients_keep_previous_values() {
        let mut pcs = array![[1.0, f64::NAN, 3.0], [f64::NAN, 5.0, 6.0]];
        let previous = array![[0.0, -2.0, 0.0], [-4.0, 0.0, 0.0]];
        keep_undetermined(&mut pcs, previous.view());
        assert_eq!(pcs, array![[1.0, -2.0, 3.0], [-4.0, 5.0, 6.0]]);
    }

    #[test]
    fn invalid_config_fails_fast() {
        let field = Field::from_series("x", Array2::from_elem((10, 2), 1.0)).unwrap();
        let config = FillConfig {
            nitermax: 0,
            ..FillConfig::default()
        };
        assert!(matches!(Filler::new(&[field], config), Err(SpanError::Config(_))));
    }

    #[test]
    fn complete_input_is_returned_unchanged() {
        let values = Array2::from_shape_fn((24, 3), |(t, c)| (t as f64 * 0.5 + c as f64).sin());
        let field = Field::from_series("x", values).unwrap();
        let config = FillConfig {
            testmode: TestMode::SelfValidation,
            ..FillConfig::default()
        };
        let outcome = Filler::new(&[field.clone()], config).unwrap().run().unwrap();
        assert_eq!(outcome.filled[0].values(), field.values());
        assert!(outcome
            .report
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::NothingToFill { .. })));
    }
}
