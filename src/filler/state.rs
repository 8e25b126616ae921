use std::fmt;
use std::ops::{Index, IndexMut};

use log::debug;
use ndarray::Array2;
use serde::Serialize;

use crate::analysis::modes::AnalysisKind;
use crate::config::TestMode;

// ---------------------------------------------------------------------------
// Decomposition types and regimes
// ---------------------------------------------------------------------------

/// Decomposition driving one stage of the filler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FillKind {
    Pca,
    Mssa,
}

impl FillKind {
    pub const ALL: [FillKind; 2] = [FillKind::Pca, FillKind::Mssa];

    fn index(self) -> usize {
        match self {
            FillKind::Pca => 0,
            FillKind::Mssa => 1,
        }
    }

    pub fn analysis_kind(self) -> AnalysisKind {
        match self {
            FillKind::Pca => AnalysisKind::Pca,
            FillKind::Mssa => AnalysisKind::Mssa,
        }
    }
}

impl fmt::Display for FillKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.analysis_kind().fmt(f)
    }
}

/// One value per [`FillKind`].
#[derive(Debug, Clone, Default)]
pub struct KindTable<T>([T; 2]);

impl<T> Index<FillKind> for KindTable<T> {
    type Output = T;

    fn index(&self, kind: FillKind) -> &T {
        &self.0[kind.index()]
    }
}

impl<T> IndexMut<FillKind> for KindTable<T> {
    fn index_mut(&mut self, kind: FillKind) -> &mut T {
        &mut self.0[kind.index()]
    }
}

/// Analysis regime of the outer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Regime {
    Normal,
    SelfValidation,
    CrossValidation,
}

impl Regime {
    /// Regimes run, in order, for a test mode.
    pub fn sequence(mode: TestMode) -> &'static [Regime] {
        match mode {
            TestMode::CrossValidation => &[Regime::CrossValidation, Regime::Normal],
            TestMode::SelfValidation => &[Regime::SelfValidation],
            TestMode::Normal => &[Regime::Normal],
        }
    }

    /// Whether the mode count is chosen by the truncation check.
    pub fn selects_modes(self) -> bool {
        self != Regime::Normal
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Regime::Normal => "NORMAL",
            Regime::SelfValidation => "SELF-VALIDATION",
            Regime::CrossValidation => "CROSS-VALIDATION",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Expansion-coefficient convergence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EcState {
    Iterating,
    /// The error stopped improving by more than the threshold.
    Converged,
    /// The last step made the error worse and must be undone.
    Rejected,
    /// The step cap was hit.
    Exhausted,
}

/// Convergence tracker for one mode count.
///
/// Errors are fed in step order. A step is compared with the previous one
/// once at least two are recorded: a change of at least `errchmax` stops the
/// loop, and a strictly positive change also rejects the step. The rejected
/// step is logged as the negated error of the step before it.
#[derive(Debug, Clone)]
pub struct EcLoop {
    errchmax: f64,
    max_steps: usize,
    errors: Vec<f64>,
    state: EcState,
    final_error: f64,
}

impl EcLoop {
    pub fn new(max_steps: usize, errchmax: f64) -> Self {
        EcLoop {
            errchmax,
            max_steps: max_steps.max(1),
            errors: Vec::new(),
            state: EcState::Iterating,
            final_error: f64::NAN,
        }
    }

    pub fn state(&self) -> EcState {
        self.state
    }

    pub fn steps(&self) -> usize {
        self.errors.len()
    }

    /// Error log, rejected steps negated.
    pub fn errors(&self) -> &[f64] {
        &self.errors
    }

    /// Error of the retained state.
    pub fn final_error(&self) -> f64 {
        self.final_error
    }

    /// Record an error and evaluate the stopping rule.
    pub fn step(&mut self, err: f64) -> EcState {
        self.errors.push(err);
        self.final_error = err;
        let n = self.errors.len();
        if n >= 2 {
            let prev = self.errors[n - 2].abs();
            let change = err - prev;
            debug!("    error {err:.4}%, change {change:+.4}%");
            if change >= self.errchmax {
                if change > 0.0 {
                    self.errors[n - 1] = -prev;
                    self.final_error = prev;
                    self.state = EcState::Rejected;
                } else {
                    self.state = EcState::Converged;
                }
                return self.state;
            }
        }
        self.state = self.after_record();
        self.state
    }

    /// Record an error without evaluating the stopping rule.
    pub fn defer(&mut self, err: f64) -> EcState {
        self.errors.push(err);
        self.final_error = err;
        self.state = self.after_record();
        self.state
    }

    /// Record the only error of a loop-free evaluation.
    pub fn accept(&mut self, err: f64) -> EcState {
        self.errors.push(err);
        self.final_error = err;
        self.state = EcState::Converged;
        self.state
    }

    fn after_record(&self) -> EcState {
        if self.errors.len() >= self.max_steps {
            EcState::Exhausted
        } else {
            EcState::Iterating
        }
    }
}

// ---------------------------------------------------------------------------
// Mode-count search
// ---------------------------------------------------------------------------

/// Settled state of one candidate mode count.
#[derive(Debug, Clone)]
pub struct ModeTrial {
    pub modes: usize,
    pub error: f64,
    pub pcs: Array2<f64>,
    /// Reconstruction with the mean restored.
    pub rec: Array2<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeDecision {
    /// Keep adding modes.
    Continue,
    /// The last mode did not pay off: the previous count is final.
    Truncate { selected: usize },
}

/// Ascending search for the number of modes.
#[derive(Debug, Clone)]
pub struct ModeSearch {
    errchmax: f64,
    truncate: bool,
    best: Option<ModeTrial>,
    truncated: bool,
}

impl ModeSearch {
    pub fn new(errchmax: f64, truncate: bool) -> Self {
        ModeSearch {
            errchmax,
            truncate,
            best: None,
            truncated: false,
        }
    }

    /// Compare a trial with the previous mode count and keep the better.
    pub fn consider(&mut self, trial: ModeTrial) -> ModeDecision {
        if self.truncate {
            if let Some(prev) = &self.best {
                let change = trial.error - prev.error;
                debug!(
                    "   error change between {} and {} modes: {change:+.4}%",
                    prev.modes, trial.modes
                );
                if change > self.errchmax {
                    self.truncated = true;
                    return ModeDecision::Truncate {
                        selected: prev.modes,
                    };
                }
            }
        }
        self.best = Some(trial);
        ModeDecision::Continue
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn best(&self) -> Option<&ModeTrial> {
        self.best.as_ref()
    }

    pub fn into_best(self) -> Option<ModeTrial> {
        self.best
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Which loop hit its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConvergenceScope {
    ExpansionCoefficients,
    ModeCount,
}

/// Non-fatal conditions met while filling.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Diagnostic {
    /// A loop stopped at its cap; the last computed state was kept.
    ConvergenceExhausted {
        regime: Regime,
        kind: FillKind,
        reanalysis: usize,
        modes: usize,
        scope: ConvergenceScope,
    },
    /// The reference had no gap; it was analysed once with every mode.
    NothingToFill { regime: Regime, kind: FillKind },
    /// The deadline passed; later iterations were skipped.
    DeadlineReached {
        regime: Regime,
        kind: FillKind,
        reanalysis: usize,
    },
}

/// Errors of every expansion-coefficient step of one mode count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub regime: Regime,
    pub kind: FillKind,
    pub reanalysis: usize,
    pub modes: usize,
    pub errors: Vec<f64>,
}

/// Mode count retained at the end of one reanalysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub regime: Regime,
    pub kind: FillKind,
    pub reanalysis: usize,
    pub modes: usize,
    pub error: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FillReport {
    pub errors: Vec<ErrorRecord>,
    pub selections: Vec<Selection>,
    pub diagnostics: Vec<Diagnostic>,
}

impl FillReport {
    /// Last mode count retained for a decomposition type.
    pub fn selected(&self, kind: FillKind) -> Option<usize> {
        self.selections
            .iter()
            .rev()
            .find(|s| s.kind == kind)
            .map(|s| s.modes)
    }
}

// ---------------------------------------------------------------------------
// FillState – everything one fill operation mutates
// ---------------------------------------------------------------------------

/// Mode budgets and report of one fill operation.
#[derive(Debug, Clone, Default)]
pub struct FillState {
    budgets: KindTable<Vec<Vec<usize>>>,
    pub report: FillReport,
    pub deadline_hit: bool,
}

impl FillState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mode counts to try for a reanalysis; every count up to `available`
    /// unless an earlier regime pinned them.
    pub fn budget(&mut self, kind: FillKind, reanalysis: usize, available: usize) -> Vec<usize> {
        let budgets = &mut self.budgets[kind];
        while budgets.len() <= reanalysis {
            budgets.push((1..=available).collect());
        }
        let mut budget: Vec<usize> = budgets[reanalysis]
            .iter()
            .map(|&m| m.clamp(1, available.max(1)))
            .collect();
        budget.dedup();
        budget
    }

    /// Reuse `modes` for this reanalysis in later regimes.
    pub fn pin_budget(&mut self, kind: FillKind, reanalysis: usize, modes: usize) {
        let budgets = &mut self.budgets[kind];
        while budgets.len() <= reanalysis {
            budgets.push(Vec::new());
        }
        budgets[reanalysis] = vec![modes];
    }

    /// Budget of a type that had nothing to fill, unless already set.
    pub fn default_budget(&mut self, kind: FillKind, modes: usize) {
        if self.budgets[kind].is_empty() {
            self.budgets[kind].push(vec![modes]);
        }
    }

    pub fn log_errors(&mut self, record: ErrorRecord) {
        self.report.errors.push(record);
    }

    pub fn diagnose(&mut self, diagnostic: Diagnostic) {
        self.report.diagnostics.push(diagnostic);
    }
}
