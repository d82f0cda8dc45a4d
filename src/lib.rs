//! Raman titration analysis: instrument spectra in, equivalence points out.
//!
//! The pipeline is loader → baseline → assemble (metadata join, exclusion)
//! → peak ratios → sigmoid fit, with writers for every intermediate table.

pub mod analysis;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod synthetic;

pub use analysis::peaks::{PeakIntensityTable, RatioSeries};
pub use analysis::sigmoid::{EquivalenceFitter, SigmoidFit};
pub use config::{AnalysisConfig, FitSettings, PeakPreset};
pub use data::assemble::{assemble, AssembleOptions, Assembly};
pub use data::model::{CombinedTable, MetadataTable, MetadataValue};
pub use error::{Error, ParseError, Result};
