use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::analysis::baseline::DEFAULT_POLY_ORDER;
use crate::data::filter::{exclude_labels, ExclusionState};
use crate::error::Result;

// ---------------------------------------------------------------------------
// Peak presets
// ---------------------------------------------------------------------------

/// Standard peak sets for the two excitation lasers in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeakPreset {
    #[serde(rename = "532")]
    Laser532,
    #[serde(rename = "785")]
    Laser785,
}

impl PeakPreset {
    pub fn peaks(self) -> Vec<f64> {
        match self {
            PeakPreset::Laser532 => vec![1231.0, 1327.0, 1342.0, 1358.0, 1450.0],
            PeakPreset::Laser785 => vec![412.0, 444.0, 471.0, 547.0, 1561.0],
        }
    }
}

impl FromStr for PeakPreset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().trim_end_matches("nm").trim() {
            "532" => Ok(PeakPreset::Laser532),
            "785" => Ok(PeakPreset::Laser785),
            other => Err(format!("unknown peak preset '{other}' (expected 532 or 785)")),
        }
    }
}

impl fmt::Display for PeakPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeakPreset::Laser532 => write!(f, "532 nm"),
            PeakPreset::Laser785 => write!(f, "785 nm"),
        }
    }
}

// ---------------------------------------------------------------------------
// Solver settings
// ---------------------------------------------------------------------------

/// Stopping criteria of the sigmoid solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitSettings {
    /// Evaluation budget: the solver gives up after `patience * 3` model
    /// evaluations (two nonlinear parameters plus one).
    pub patience: usize,
    /// Relative cost reduction considered negligible.
    pub ftol: f64,
    /// Relative step size considered negligible.
    pub xtol: f64,
    /// Gradient magnitude considered zero.
    pub gtol: f64,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            patience: 100,
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-12,
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis configuration
// ---------------------------------------------------------------------------

/// Everything the pipeline needs besides its input files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Baseline polynomial order.
    pub poly_order: usize,
    /// Half-width of the peak window (cm⁻¹).
    pub tolerance: f64,
    /// Explicit peak positions; take precedence over `preset` when non-empty.
    pub peaks: Vec<f64>,
    pub preset: Option<PeakPreset>,
    /// Sample labels dropped after the metadata join.
    pub exclude_labels: Vec<String>,
    /// Metadata column joined against the spectrum name.
    pub key_column: String,
    /// Metadata column holding the sample label.
    pub label_column: String,
    /// Metadata column holding the titrant amount.
    pub titrant_column: String,
    pub fit: FitSettings,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            poly_order: DEFAULT_POLY_ORDER,
            tolerance: 2.0,
            peaks: Vec::new(),
            preset: Some(PeakPreset::Laser532),
            exclude_labels: vec!["Cuvette BRB".to_string()],
            key_column: "Spectrum name".to_string(),
            label_column: "Sample description".to_string(),
            titrant_column: "n(titrant) (mol)".to_string(),
            fit: FitSettings::default(),
        }
    }
}

impl AnalysisConfig {
    /// Read a JSON configuration; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Peak positions to analyse.
    pub fn peak_positions(&self) -> Vec<f64> {
        if !self.peaks.is_empty() {
            self.peaks.clone()
        } else {
            self.preset.map(PeakPreset::peaks).unwrap_or_default()
        }
    }

    pub fn exclusions(&self) -> ExclusionState {
        exclude_labels(&self.label_column, self.exclude_labels.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: AnalysisConfig =
            serde_json::from_str(r#"{"tolerance": 3.5, "preset": "785", "fit": {"patience": 50}}"#)
                .unwrap();
        assert_eq!(cfg.tolerance, 3.5);
        assert_eq!(cfg.poly_order, DEFAULT_POLY_ORDER);
        assert_eq!(cfg.peak_positions(), PeakPreset::Laser785.peaks());
        assert_eq!(cfg.fit.patience, 50);
        assert_eq!(cfg.fit.ftol, FitSettings::default().ftol);
        assert_eq!(cfg.exclude_labels, vec!["Cuvette BRB"]);
    }

    #[test]
    fn explicit_peaks_win_over_preset() {
        let cfg = AnalysisConfig {
            peaks: vec![100.0, 200.0],
            ..AnalysisConfig::default()
        };
        assert_eq!(cfg.peak_positions(), vec![100.0, 200.0]);

        let none = AnalysisConfig {
            preset: None,
            ..AnalysisConfig::default()
        };
        assert!(none.peak_positions().is_empty());
    }

    #[test]
    fn preset_from_str() {
        assert_eq!("532".parse::<PeakPreset>(), Ok(PeakPreset::Laser532));
        assert_eq!("785 nm".parse::<PeakPreset>(), Ok(PeakPreset::Laser785));
        assert!("633".parse::<PeakPreset>().is_err());
    }
}
