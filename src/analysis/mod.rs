/// Analysis layer: modal decompositions and reconstructions.
///
/// Architecture:
/// ```text
///   (channels, time) matrix
///        │
///        ▼
///   ┌─────────────┐
///   │ ModalEngine  │  pca / mssa (lag embedding) / svd, reconstruct, EC refit
///   └─────────────┘
///        │  delegates factorisation to
///        ▼
///   ┌─────────────┐
///   │ Decomposer   │  SymmetricEigenKernel (nalgebra)
///   └─────────────┘
///        │
///        ▼
///   ┌─────────────┐
///   │  ModeSet     │  EOFs, PCs, eigenvalues → ModeRange selections, pairs
///   └─────────────┘
/// ```
///
/// [`Analyzer`] wires packing, decomposition and unpacking together for
/// one-shot use.

pub mod analyzer;
pub mod engine;
pub mod kernel;
pub mod modes;
pub mod pairs;

pub use analyzer::Analyzer;
