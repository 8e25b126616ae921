//! Spectral analysis (PCA, MSSA, SVD) of gridded time series with missing
//! values, and iterative gap filling driven by these decompositions.

pub mod analysis;
pub mod config;
pub mod data;
pub mod error;
pub mod filler;

pub use analysis::modes::{AnalysisKind, ModeRange, ModeSelection, ModeSet};
pub use analysis::Analyzer;
pub use config::{AnalyzerConfig, FillConfig, TestMode};
pub use data::model::Field;
pub use error::{Result, SpanError};
pub use filler::{FillOutcome, Filler};
