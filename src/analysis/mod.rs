//! Numerical stages applied to assembled spectra.
//!
//! ```text
//!   CombinedTable
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  peaks    │  window maxima → PeakIntensityTable, pairwise ratios → RatioSeries
//!   └──────────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │ sigmoid   │  separable logistic fit per ratio → SigmoidFit, x_eq ± σ
//!   └──────────┘
//! ```
//! `baseline` runs earlier, once per file, inside the data layer's assembler.

pub mod baseline;
pub mod peaks;
pub mod sigmoid;
