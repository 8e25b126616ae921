/// Gap filling: convergence control around the analysis layer.
///
/// ```text
///  for each regime (cross-validation → normal, or self-validation)
///    for PCA, then MSSA on the leading PCA coefficients
///      for each reanalysis         decompose the current best estimate
///        for each mode count       ModeSearch: stop when a mode stops paying
///          for each EC step        EcLoop: refit, reconstruct, score, maybe roll back
///        refill the gaps with the selected reconstruction
/// ```

pub mod controller;
pub mod crossval;
pub mod state;

pub use controller::{FillOutcome, Filler, StageOutput};
pub use state::{Diagnostic, FillKind, FillReport, Regime};
