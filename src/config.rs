use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::data::pack::PackOptions;
use crate::error::{Result, SpanError};

// ---------------------------------------------------------------------------
// Regimes
// ---------------------------------------------------------------------------

/// Which analysis regimes the filler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestMode {
    /// Pick mode counts on synthetically withheld points, then fill the
    /// true gaps with them.
    #[default]
    CrossValidation,
    /// Pick mode counts by fitting and scoring on the same data.
    SelfValidation,
    /// Fill with the full mode budget, no truncation.
    Normal,
}

// ---------------------------------------------------------------------------
// Cross-validation
// ---------------------------------------------------------------------------

/// Width of a smoothing kernel along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmoothingScale {
    /// A fixed number of grid points.
    Points(usize),
    /// A percentage of the axis length.
    Percent(f64),
}

impl Default for SmoothingScale {
    fn default() -> Self {
        SmoothingScale::Points(1)
    }
}

impl SmoothingScale {
    /// Odd kernel width for an axis of `len` points.
    ///
    /// A width above `max_relative * len` falls back to 1 (no smoothing).
    pub fn width(self, len: usize, max_relative: f64) -> usize {
        let raw = match self {
            SmoothingScale::Points(n) => n as f64,
            SmoothingScale::Percent(p) => (p / 100.0 * len as f64).round(),
        };
        if !(raw >= 1.0) || raw > max_relative * len as f64 {
            return 1;
        }
        let w = raw as usize;
        w / 2 * 2 + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SmoothingConfig {
    pub spatial: SmoothingScale,
    pub temporal: SmoothingScale,
    /// Largest kernel width, relative to the axis length, still honoured.
    pub max_relative: f64,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            spatial: SmoothingScale::default(),
            temporal: SmoothingScale::default(),
            max_relative: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CrossValidationConfig {
    /// Percentage of valid points withheld.
    pub level: f64,
    pub smoothing: SmoothingConfig,
    /// Draw a new mask for every decomposition type instead of reusing it.
    pub regen: bool,
    /// Seed of the random field the mask is drawn from.
    pub seed: u64,
}

impl Default for CrossValidationConfig {
    fn default() -> Self {
        Self {
            level: 5.0,
            smoothing: SmoothingConfig::default(),
            regen: false,
            seed: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// FillConfig
// ---------------------------------------------------------------------------

/// Options of the gap filler. Every key is optional in the JSON form.
///
/// ```json
/// { "npca": 8, "mssa": false, "testmode": "self-validation",
///   "cross-validation": { "level": 10, "smoothing": { "spatial": { "percent": 5 } } } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FillConfig {
    /// Maximum number of PCA modes.
    pub npca: usize,
    /// Maximum number of MSSA modes.
    pub nmssa: usize,
    /// MSSA embedding window; `None` means a third of the time length.
    pub window: Option<usize>,
    /// Cap on expansion-coefficient iterations per mode count.
    pub nitermax: usize,
    /// Error change threshold, in percent.
    pub errchmax: f64,
    pub testmode: TestMode,
    /// Run an MSSA stage on the PCA coefficients.
    pub mssa: bool,
    /// Keep iterating MSSA coefficients until none is missing.
    pub full: bool,
    /// Number of reanalyses per decomposition type.
    pub reanalyses: usize,
    /// A channel with gaps is kept when it has this many valid time steps.
    pub min_valid: usize,
    pub cross_validation: CrossValidationConfig,
}

impl Default for FillConfig {
    fn default() -> Self {
        Self {
            npca: 20,
            nmssa: 15,
            window: None,
            nitermax: 20,
            errchmax: -0.01,
            testmode: TestMode::default(),
            mssa: true,
            full: true,
            reanalyses: 3,
            min_valid: 1,
            cross_validation: CrossValidationConfig::default(),
        }
    }
}

impl FillConfig {
    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("parsing fill configuration")
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Embedding window for a series of `n_times` steps.
    pub fn window_for(&self, n_times: usize) -> usize {
        self.window.unwrap_or(n_times / 3)
    }

    pub fn pack_options(&self) -> PackOptions {
        PackOptions::keep_gaps(self.min_valid)
    }

    /// Check the options against a time axis of `n_times` steps.
    pub fn validate(&self, n_times: usize) -> Result<()> {
        let positive = [
            ("npca", self.npca),
            ("nmssa", self.nmssa),
            ("nitermax", self.nitermax),
            ("reanalyses", self.reanalyses),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(SpanError::Config(format!("{key} must be at least 1")));
        }
        if !self.errchmax.is_finite() {
            return Err(SpanError::Config("errchmax must be finite".into()));
        }
        let cv = &self.cross_validation;
        if !(cv.level > 0.0 && cv.level < 100.0) {
            return Err(SpanError::Config(format!(
                "cross-validation level must lie in (0, 100), got {}",
                cv.level
            )));
        }
        if !(cv.smoothing.max_relative > 0.0) {
            return Err(SpanError::Config(
                "cross-validation max-relative must be positive".into(),
            ));
        }
        if self.mssa {
            let window = self.window_for(n_times);
            if window < 2 || window >= n_times {
                return Err(SpanError::Config(format!(
                    "MSSA window {window} does not fit {n_times} time steps"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AnalyzerConfig
// ---------------------------------------------------------------------------

/// Options of the one-shot [`crate::analysis::Analyzer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AnalyzerConfig {
    pub npca: usize,
    pub nmssa: usize,
    pub nsvd: usize,
    pub window: Option<usize>,
    /// Keep channels with gaps; their missing anomalies count as zero.
    pub keep_invalids: bool,
    pub min_valid: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            npca: 10,
            nmssa: 4,
            nsvd: 10,
            window: None,
            keep_invalids: false,
            min_valid: 1,
        }
    }
}

impl AnalyzerConfig {
    pub fn pack_options(&self) -> PackOptions {
        if self.keep_invalids {
            PackOptions::keep_gaps(self.min_valid)
        } else {
            PackOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let cfg = FillConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, FillConfig::default());
        assert_eq!(cfg.testmode, TestMode::CrossValidation);
        assert_eq!(cfg.cross_validation.level, 5.0);
    }

    #[test]
    fn kebab_case_keys_are_read() {
        let cfg = FillConfig::from_json_str(
            r#"{"npca": 4, "testmode": "self-validation", "min-valid": 3,
                "cross-validation": {"level": 10, "smoothing": {"temporal": {"percent": 10}}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.npca, 4);
        assert_eq!(cfg.testmode, TestMode::SelfValidation);
        assert_eq!(cfg.min_valid, 3);
        assert_eq!(cfg.cross_validation.smoothing.temporal, SmoothingScale::Percent(10.0));
        assert_eq!(cfg.cross_validation.smoothing.spatial, SmoothingScale::Points(1));
    }

    #[test]
    fn smoothing_width_is_odd_and_capped() {
        assert_eq!(SmoothingScale::Points(4).width(100, 0.2), 5);
        assert_eq!(SmoothingScale::Points(3).width(100, 0.2), 3);
        assert_eq!(SmoothingScale::Percent(10.0).width(50, 0.2), 5);
        assert_eq!(SmoothingScale::Points(30).width(100, 0.2), 1);
        assert_eq!(SmoothingScale::Points(0).width(100, 0.2), 1);
    }

    #[test]
    fn validate_rejects_bad_window_and_level() {
        let mut cfg = FillConfig::default();
        assert!(cfg.validate(30).is_ok());
        assert!(cfg.validate(5).is_err());
        cfg.mssa = false;
        assert!(cfg.validate(5).is_ok());
        cfg.cross_validation.level = 0.0;
        assert!(matches!(cfg.validate(30), Err(SpanError::Config(_))));
    }
}
