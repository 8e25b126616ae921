use thiserror::Error;

use crate::analysis::modes::AnalysisKind;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Result type used by the packing, decomposition and filling layers.
pub type Result<T> = std::result::Result<T, SpanError>;

/// Failures raised at component boundaries.
///
/// Convergence loops never fail: hitting an iteration ceiling is reported
/// through [`crate::filler::Diagnostic`] instead.
#[derive(Debug, Error)]
pub enum SpanError {
    /// No channel survived masking and weighting.
    #[error("no valid channel left after packing field '{field}'")]
    EmptyPack { field: String },

    /// A joint operation was asked for with too few fields.
    #[error("{operation} needs at least {needed} fields, got {got}")]
    InsufficientFields {
        operation: &'static str,
        needed: usize,
        got: usize,
    },

    /// Reconstruction requested modes outside the decomposition.
    #[error("mode range {first}..={last} is outside the {available} available modes")]
    ModeRange {
        first: usize,
        last: usize,
        available: usize,
    },

    /// Reconstruction or pairing requested before the decomposition ran.
    #[error("{0} has not been computed yet")]
    NotDecomposed(AnalysisKind),

    /// Array shapes do not agree.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// Invalid option value.
    #[error("invalid configuration: {0}")]
    Config(String),
}
