use std::collections::BTreeMap;
use std::path::Path;

use log::{info, warn};

use super::filter::{retain_included, ExclusionState};
use super::loader::load_spectrum;
use super::model::{
    CombinedSpectrum, CombinedTable, CorrectedSpectrum, MetadataTable, MetadataValue,
};
use crate::analysis::baseline;
use crate::config::AnalysisConfig;
use crate::error::{Error, ParseError, Result};

/// How spectra are corrected and joined to metadata.
#[derive(Debug, Clone)]
pub struct AssembleOptions {
    pub poly_order: usize,
    pub key_column: String,
    pub label_column: String,
    pub titrant_column: String,
    pub exclusions: ExclusionState,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self::from(&AnalysisConfig::default())
    }
}

impl From<&AnalysisConfig> for AssembleOptions {
    fn from(cfg: &AnalysisConfig) -> Self {
        Self {
            poly_order: cfg.poly_order,
            key_column: cfg.key_column.clone(),
            label_column: cfg.label_column.clone(),
            titrant_column: cfg.titrant_column.clone(),
            exclusions: cfg.exclusions(),
        }
    }
}

/// Result of a batch: the combined table plus what was lost on the way.
#[derive(Debug)]
pub struct Assembly {
    pub table: CombinedTable,
    /// Files that could not be parsed, in input order.
    pub failures: Vec<ParseError>,
    /// Spectrum names with no metadata row.
    pub unmatched: Vec<String>,
    /// Spectra dropped by the exclusion filter.
    pub excluded: usize,
}

/// Load one file and remove its baseline.
pub fn load_corrected(
    path: &Path,
    poly_order: usize,
) -> std::result::Result<CorrectedSpectrum, ParseError> {
    let raw = load_spectrum(path)?;
    let b = baseline::correct(&raw.shift, &raw.intensity, poly_order);
    if b.fallback {
        warn!("{}: baseline correction skipped", raw.file);
    }
    Ok(CorrectedSpectrum {
        file: raw.file,
        shift: raw.shift,
        intensity: raw.intensity,
        baseline: b.values,
        corrected: b.corrected,
        baseline_fallback: b.fallback,
    })
}

/// File name without its extension.
pub fn spectrum_name(file: &str) -> String {
    Path::new(file)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.to_string())
}

/// Load, baseline-correct and join a batch of spectrum files to `metadata`.
///
/// Unreadable files are skipped and reported in [`Assembly::failures`]; the
/// batch fails only when no file at all could be loaded. The join is a left
/// join on the spectrum name: spectra without metadata are kept with `Null`
/// metadata cells. When several metadata rows share a spectrum name the first
/// one is used.
pub fn assemble<P: AsRef<Path>>(
    paths: &[P],
    metadata: &MetadataTable,
    options: &AssembleOptions,
) -> Result<Assembly> {
    let mut corrected = Vec::new();
    let mut failures = Vec::new();
    for path in paths {
        match load_corrected(path.as_ref(), options.poly_order) {
            Ok(sp) => corrected.push(sp),
            Err(err) => {
                warn!("skipping {}: {err}", path.as_ref().display());
                failures.push(err);
            }
        }
    }
    if corrected.is_empty() {
        return Err(Error::EmptyBatch {
            attempted: paths.len(),
        });
    }

    let (index, duplicates) = metadata.index_by(&options.key_column);
    for dup in &duplicates {
        warn!("metadata has several rows for '{dup}', using the first");
    }

    let mut metadata_columns = metadata.columns.clone();
    if !metadata.has_column(&options.key_column) {
        metadata_columns.insert(0, options.key_column.clone());
    }

    let mut unmatched = Vec::new();
    let mut spectra: Vec<CombinedSpectrum> = corrected
        .into_iter()
        .map(|sp| {
            let name = spectrum_name(&sp.file);
            let mut meta: BTreeMap<String, MetadataValue> = match index.get(&name) {
                Some(&row) => metadata.rows[row].clone(),
                None => {
                    unmatched.push(name.clone());
                    BTreeMap::new()
                }
            };
            for col in &metadata_columns {
                meta.entry(col.clone()).or_insert(MetadataValue::Null);
            }
            meta.insert(options.key_column.clone(), MetadataValue::String(name.clone()));

            let sample_label = meta
                .get(&options.label_column)
                .and_then(MetadataValue::as_key);
            let titrant_amount = meta
                .get(&options.titrant_column)
                .and_then(MetadataValue::as_f64);

            CombinedSpectrum {
                spectrum_name: name,
                spectrum: sp,
                metadata: meta,
                sample_label,
                titrant_amount,
            }
        })
        .collect();

    if !unmatched.is_empty() {
        warn!("{} spectrum(s) without metadata: {unmatched:?}", unmatched.len());
    }
    let excluded = retain_included(&mut spectra, &options.exclusions);

    let table = CombinedTable {
        spectra,
        metadata_columns,
    };
    info!(
        "assembled {} spectrum(s), {} row(s); {} failed, {} excluded",
        table.n_spectra(),
        table.len(),
        failures.len(),
        excluded
    );

    Ok(Assembly {
        table,
        failures,
        unmatched,
        excluded,
    })
}
