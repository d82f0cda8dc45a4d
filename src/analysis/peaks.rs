use std::collections::BTreeMap;

use log::info;
use serde::Serialize;

use crate::data::model::{CombinedTable, MetadataValue};

/// Column name of a peak intensity, e.g. `I_1231`.
pub fn intensity_column(peak: f64) -> String {
    format!("I_{peak}")
}

/// Column name of a peak ratio, e.g. `ratio_I_1231_I_1450`.
pub fn ratio_column(a: f64, b: f64) -> String {
    format!("ratio_{}_{}", intensity_column(a), intensity_column(b))
}

/// Every unordered pair `(i, j)`, `i < j`, in input order.
pub fn peak_pairs(n: usize) -> Vec<(usize, usize)> {
    (0..n)
        .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
        .collect()
}

/// Largest finite value with `shift ∈ [peak - tolerance, peak + tolerance]`;
/// NaN when the window holds no point. `shift` must be sorted ascending.
pub fn window_max(shift: &[f64], intensity: &[f64], peak: f64, tolerance: f64) -> f64 {
    let lo = peak - tolerance;
    let hi = peak + tolerance;
    let start = shift.partition_point(|&x| x < lo);
    let end = shift.partition_point(|&x| x <= hi);
    if start >= end {
        return f64::NAN;
    }
    intensity[start..end]
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(f64::NAN, f64::max)
}

// ---------------------------------------------------------------------------
// PeakIntensityTable – one row per spectrum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PeakIntensityRow {
    pub file: String,
    pub spectrum_name: String,
    pub sample_label: Option<String>,
    pub titrant_amount: Option<f64>,
    /// Parallel to [`PeakIntensityTable::peaks`].
    pub intensities: Vec<f64>,
    /// Parallel to [`PeakIntensityTable::pairs`].
    pub ratios: Vec<f64>,
    pub metadata: BTreeMap<String, MetadataValue>,
}

#[derive(Debug, Clone, Default)]
pub struct PeakIntensityTable {
    pub peaks: Vec<f64>,
    pub pairs: Vec<(usize, usize)>,
    pub rows: Vec<PeakIntensityRow>,
    pub metadata_columns: Vec<String>,
}

impl PeakIntensityTable {
    pub fn intensity_columns(&self) -> Vec<String> {
        self.peaks.iter().map(|&p| intensity_column(p)).collect()
    }

    pub fn ratio_columns(&self) -> Vec<String> {
        self.pairs
            .iter()
            .map(|&(a, b)| ratio_column(self.peaks[a], self.peaks[b]))
            .collect()
    }

    /// Intensity of `peak` for every row, if the peak was requested.
    pub fn intensity(&self, peak: f64) -> Option<Vec<f64>> {
        let idx = self.peaks.iter().position(|&p| p == peak)?;
        Some(self.rows.iter().map(|r| r.intensities[idx]).collect())
    }

    /// Values of one ratio column, by name.
    pub fn ratio(&self, column: &str) -> Option<Vec<f64>> {
        let idx = self.ratio_columns().iter().position(|c| c == column)?;
        Some(self.rows.iter().map(|r| r.ratios[idx]).collect())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ---------------------------------------------------------------------------
// RatioSeries – ratio columns melted into long form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RatioPoint {
    pub file: String,
    pub spectrum_name: String,
    pub sample_label: Option<String>,
    /// NaN when the spectrum has no usable titrant amount.
    pub titrant_amount: f64,
    pub ratio: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RatioSeries {
    pub points: Vec<RatioPoint>,
}

impl RatioSeries {
    /// Ratio names in first-seen order.
    pub fn ratio_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for p in &self.points {
            if !names.contains(&p.ratio) {
                names.push(p.ratio.clone());
            }
        }
        names
    }

    /// `(titrant_amount, value)` columns of one ratio, NaN included.
    pub fn series(&self, ratio: &str) -> (Vec<f64>, Vec<f64>) {
        self.points
            .iter()
            .filter(|p| p.ratio == ratio)
            .map(|p| (p.titrant_amount, p.value))
            .unzip()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Peak-top intensities and all pairwise ratios for every spectrum.
///
/// Each peak's intensity is the maximum corrected intensity within
/// `peak ± tolerance`; an empty window yields NaN. Ratios are plain divisions
/// and propagate NaN/∞. No peaks gives rows without intensity or ratio
/// columns and an empty series.
pub fn analyze(
    table: &CombinedTable,
    peaks: &[f64],
    tolerance: f64,
) -> (PeakIntensityTable, RatioSeries) {
    let pairs = peak_pairs(peaks.len());

    let rows: Vec<PeakIntensityRow> = table
        .spectra
        .iter()
        .map(|cs| {
            let sp = &cs.spectrum;
            let intensities: Vec<f64> = peaks
                .iter()
                .map(|&p| window_max(&sp.shift, &sp.corrected, p, tolerance))
                .collect();
            let ratios = pairs
                .iter()
                .map(|&(a, b)| intensities[a] / intensities[b])
                .collect();
            PeakIntensityRow {
                file: sp.file.clone(),
                spectrum_name: cs.spectrum_name.clone(),
                sample_label: cs.sample_label.clone(),
                titrant_amount: cs.titrant_amount,
                intensities,
                ratios,
                metadata: cs.metadata.clone(),
            }
        })
        .collect();

    let intensity_table = PeakIntensityTable {
        peaks: peaks.to_vec(),
        pairs,
        rows,
        metadata_columns: table.metadata_columns.clone(),
    };
    let series = melt_ratios(&intensity_table);

    info!(
        "peak analysis: {} spectrum(s), {} peak(s), {} ratio(s), tolerance {tolerance}",
        intensity_table.len(),
        peaks.len(),
        intensity_table.pairs.len()
    );
    (intensity_table, series)
}

/// Long form of the ratio columns: all rows of the first ratio, then the next.
pub fn melt_ratios(table: &PeakIntensityTable) -> RatioSeries {
    let names = table.ratio_columns();
    let points = names
        .iter()
        .enumerate()
        .flat_map(|(k, name)| {
            table.rows.iter().map(move |row| RatioPoint {
                file: row.file.clone(),
                spectrum_name: row.spectrum_name.clone(),
                sample_label: row.sample_label.clone(),
                titrant_amount: row.titrant_amount.unwrap_or(f64::NAN),
                ratio: name.clone(),
                value: row.ratios[k],
            })
        })
        .collect();
    RatioSeries { points }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::{CombinedSpectrum, CorrectedSpectrum};

    fn combined(name: &str, shift: Vec<f64>, corrected: Vec<f64>, n: Option<f64>) -> CombinedSpectrum {
        let len = shift.len();
        CombinedSpectrum {
            spectrum_name: name.to_string(),
            spectrum: CorrectedSpectrum {
                file: format!("{name}.txt"),
                intensity: corrected.clone(),
                baseline: vec![0.0; len],
                corrected,
                shift,
                baseline_fallback: false,
            },
            metadata: BTreeMap::new(),
            sample_label: None,
            titrant_amount: n,
        }
    }

    #[test]
    fn single_maximum_and_empty_windows() {
        let shift: Vec<f64> = (150..=250).map(|x| x as f64).collect();
        let corrected: Vec<f64> = shift.iter().map(|&x| if x == 201.0 { 10.0 } else { 1.0 }).collect();
        let table = CombinedTable {
            spectra: vec![combined("S_00", shift, corrected, Some(1e-10))],
            metadata_columns: Vec::new(),
        };

        let (peaks, series) = analyze(&table, &[100.0, 200.0, 300.0], 5.0);
        let row = &peaks.rows[0];
        assert_eq!(row.intensities[1], 10.0);
        assert!(row.intensities[0].is_nan());
        assert!(row.intensities[2].is_nan());
        assert_eq!(
            peaks.ratio_columns(),
            vec!["ratio_I_100_I_200", "ratio_I_100_I_300", "ratio_I_200_I_300"]
        );
        assert!(row.ratios.iter().all(|r| r.is_nan()));
        assert_eq!(series.len(), 3);
        assert_eq!(series.ratio_names().len(), 3);
    }

    #[test]
    fn ratios_divide_peak_tops() {
        let shift = vec![99.0, 100.0, 101.0, 199.0, 200.0, 201.0];
        let corrected = vec![1.0, 6.0, 2.0, 1.0, 3.0, 2.5];
        let table = CombinedTable {
            spectra: vec![combined("S_00", shift, corrected, None)],
            metadata_columns: Vec::new(),
        };
        let (peaks, series) = analyze(&table, &[100.0, 200.0], 1.0);
        assert_eq!(peaks.intensity(100.0), Some(vec![6.0]));
        assert_eq!(peaks.ratio("ratio_I_100_I_200"), Some(vec![2.0]));

        let (x, y) = series.series("ratio_I_100_I_200");
        assert!(x[0].is_nan());
        assert_eq!(y, vec![2.0]);
    }

    #[test]
    fn zero_divisor_propagates_infinity() {
        let table = CombinedTable {
            spectra: vec![combined("S_00", vec![10.0, 20.0], vec![4.0, 0.0], None)],
            metadata_columns: Vec::new(),
        };
        let (peaks, _) = analyze(&table, &[10.0, 20.0], 0.5);
        assert_eq!(peaks.rows[0].ratios[0], f64::INFINITY);
    }

    #[test]
    fn no_peaks_and_degenerate_tolerance() {
        let table = CombinedTable {
            spectra: vec![combined("S_00", vec![10.0, 20.0], vec![4.0, 5.0], None)],
            metadata_columns: Vec::new(),
        };
        let (peaks, series) = analyze(&table, &[], 2.0);
        assert_eq!(peaks.len(), 1);
        assert!(peaks.ratio_columns().is_empty());
        assert!(series.is_empty());

        let (point, _) = analyze(&table, &[10.0, 15.0], 0.0);
        assert_eq!(point.rows[0].intensities[0], 4.0);
        assert!(point.rows[0].intensities[1].is_nan());

        let (negative, _) = analyze(&table, &[10.0], -1.0);
        assert!(negative.rows[0].intensities[0].is_nan());
    }

    #[test]
    fn melt_orders_by_ratio_then_row() {
        let table = CombinedTable {
            spectra: vec![
                combined("S_00", vec![1.0, 2.0, 3.0], vec![1.0, 2.0, 4.0], Some(0.0)),
                combined("S_01", vec![1.0, 2.0, 3.0], vec![2.0, 2.0, 1.0], Some(1.0)),
            ],
            metadata_columns: Vec::new(),
        };
        let (_, series) = analyze(&table, &[1.0, 2.0, 3.0], 0.1);
        let order: Vec<(&str, &str)> = series
            .points
            .iter()
            .map(|p| (p.ratio.as_str(), p.spectrum_name.as_str()))
            .collect();
        assert_eq!(order[0], ("ratio_I_1_I_2", "S_00"));
        assert_eq!(order[1], ("ratio_I_1_I_2", "S_01"));
        assert_eq!(order[2], ("ratio_I_1_I_3", "S_00"));
        assert_eq!(series.series("ratio_I_2_I_3").1, vec![0.5, 2.0]);
    }

    #[test]
    fn column_names_format_fractional_peaks() {
        assert_eq!(intensity_column(1231.0), "I_1231");
        assert_eq!(intensity_column(1231.5), "I_1231.5");
        assert_eq!(peak_pairs(4).len(), 6);
    }
}
