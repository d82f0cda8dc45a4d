//! Writers for every output table.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use log::info;
use parquet::arrow::ArrowWriter;
use serde::Serialize;

use crate::analysis::peaks::{PeakIntensityTable, RatioSeries};
use crate::analysis::sigmoid::SigmoidFit;
use crate::data::model::{CombinedTable, MetadataTable, MetadataValue};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ExportFormat {
    #[default]
    Csv,
    Parquet,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Parquet => "parquet",
        }
    }
}

fn num(v: f64) -> String {
    if v.is_nan() {
        String::new()
    } else {
        v.to_string()
    }
}

fn opt_num(v: Option<f64>) -> String {
    v.map(num).unwrap_or_default()
}

fn meta_cells<'a>(
    columns: &'a [String],
    metadata: &'a std::collections::BTreeMap<String, MetadataValue>,
) -> impl Iterator<Item = String> + 'a {
    columns
        .iter()
        .map(|c| metadata.get(c).map(MetadataValue::to_cell).unwrap_or_default())
}

/// Metadata columns that do not clash with a fixed output column.
fn extra_columns(columns: &[String], fixed: &[&str]) -> Vec<String> {
    columns
        .iter()
        .filter(|c| !fixed.contains(&c.as_str()))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

const COMBINED_FIXED: &[&str] = &[
    "shift",
    "intensity",
    "baseline",
    "corrected_intensity",
    "spectrum_name",
    "file",
    "sample_label",
    "titrant_amount",
];

/// The tidy combined table, one line per (spectrum, shift).
pub fn write_combined_csv(table: &CombinedTable, path: &Path) -> Result<()> {
    let extra = extra_columns(&table.metadata_columns, COMBINED_FIXED);
    let mut w = csv::Writer::from_path(path)?;
    w.write_record(COMBINED_FIXED.iter().copied().map(String::from).chain(extra.iter().cloned()))?;
    for row in table.rows() {
        let fixed = [
            num(row.shift),
            num(row.intensity),
            num(row.baseline),
            num(row.corrected_intensity),
            row.spectrum_name.to_string(),
            row.file.to_string(),
            row.sample_label.unwrap_or_default().to_string(),
            opt_num(row.titrant_amount),
        ];
        w.write_record(fixed.into_iter().chain(meta_cells(&extra, row.metadata)))?;
    }
    w.flush()?;
    info!("wrote {} row(s) to {}", table.len(), path.display());
    Ok(())
}

const INTENSITY_FIXED: &[&str] = &["file", "spectrum_name", "sample_label", "titrant_amount"];

/// One line per spectrum: peak intensities, ratios and metadata.
pub fn write_intensities_csv(table: &PeakIntensityTable, path: &Path) -> Result<()> {
    let extra = extra_columns(&table.metadata_columns, INTENSITY_FIXED);
    let mut w = csv::Writer::from_path(path)?;
    let header: Vec<String> = INTENSITY_FIXED
        .iter()
        .copied()
        .map(String::from)
        .chain(table.intensity_columns())
        .chain(table.ratio_columns())
        .chain(extra.iter().cloned())
        .collect();
    w.write_record(&header)?;
    for row in &table.rows {
        let record: Vec<String> = [
            row.file.clone(),
            row.spectrum_name.clone(),
            row.sample_label.clone().unwrap_or_default(),
            opt_num(row.titrant_amount),
        ]
        .into_iter()
        .chain(row.intensities.iter().map(|&v| num(v)))
        .chain(row.ratios.iter().map(|&v| num(v)))
        .chain(meta_cells(&extra, &row.metadata))
        .collect();
        w.write_record(&record)?;
    }
    w.flush()?;
    info!("wrote {} spectrum row(s) to {}", table.len(), path.display());
    Ok(())
}

pub fn write_ratios_csv(series: &RatioSeries, path: &Path) -> Result<()> {
    let mut w = csv::Writer::from_path(path)?;
    w.write_record(["file", "spectrum_name", "sample_label", "titrant_amount", "ratio", "value"])?;
    for p in &series.points {
        w.write_record([
            p.file.as_str(),
            p.spectrum_name.as_str(),
            p.sample_label.as_deref().unwrap_or(""),
            num(p.titrant_amount).as_str(),
            p.ratio.as_str(),
            num(p.value).as_str(),
        ])?;
    }
    w.flush()?;
    info!("wrote {} ratio point(s) to {}", series.len(), path.display());
    Ok(())
}

pub fn write_metadata_csv(table: &MetadataTable, path: &Path) -> Result<()> {
    let mut w = csv::Writer::from_path(path)?;
    w.write_record(&table.columns)?;
    for row in &table.rows {
        w.write_record(meta_cells(&table.columns, row))?;
    }
    w.flush()?;
    info!("wrote {} metadata row(s) to {}", table.len(), path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Parquet
// ---------------------------------------------------------------------------

fn float_field(name: &str) -> Field {
    Field::new(name, DataType::Float64, true)
}

fn string_field(name: &str) -> Field {
    Field::new(name, DataType::Utf8, true)
}

fn nan_to_null(values: impl Iterator<Item = f64>) -> ArrayRef {
    Arc::new(Float64Array::from(
        values.map(|v| (!v.is_nan()).then_some(v)).collect::<Vec<_>>(),
    ))
}

/// Numeric metadata columns become Float64, anything else Utf8.
fn metadata_column<'a>(
    name: &str,
    cells: impl Iterator<Item = &'a MetadataValue> + Clone,
) -> (Field, ArrayRef) {
    let numeric = cells.clone().all(|v| {
        v.is_null() || matches!(v, MetadataValue::Float(_) | MetadataValue::Integer(_))
    });
    if numeric {
        let values: Vec<Option<f64>> = cells.map(MetadataValue::as_f64).collect();
        let array: ArrayRef = Arc::new(Float64Array::from(values));
        (float_field(name), array)
    } else {
        let values: Vec<Option<String>> = cells
            .map(|v| (!v.is_null()).then(|| v.to_cell()))
            .collect();
        let array: ArrayRef = Arc::new(StringArray::from(values));
        (string_field(name), array)
    }
}

fn build_batch(fields: Vec<Field>, columns: Vec<ArrayRef>) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(fields));
    Ok(RecordBatch::try_new(schema, columns)?)
}

fn write_batch(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

/// The peak-intensity table as a single Arrow batch.
pub fn intensities_batch(table: &PeakIntensityTable) -> Result<RecordBatch> {
    let rows = &table.rows;
    let mut fields = vec![
        string_field("file"),
        string_field("spectrum_name"),
        string_field("sample_label"),
        float_field("titrant_amount"),
    ];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.file.as_str()))),
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.spectrum_name.as_str()))),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.sample_label.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.titrant_amount).collect::<Vec<_>>(),
        )),
    ];
    for (k, name) in table.intensity_columns().iter().enumerate() {
        fields.push(float_field(name));
        columns.push(nan_to_null(rows.iter().map(|r| r.intensities[k])));
    }
    // Ratios keep ±∞ but map NaN to null.
    for (k, name) in table.ratio_columns().iter().enumerate() {
        fields.push(float_field(name));
        columns.push(nan_to_null(rows.iter().map(|r| r.ratios[k])));
    }
    static NULL: MetadataValue = MetadataValue::Null;
    for name in extra_columns(&table.metadata_columns, INTENSITY_FIXED) {
        let (field, array) =
            metadata_column(&name, rows.iter().map(|r| r.metadata.get(&name).unwrap_or(&NULL)));
        fields.push(field);
        columns.push(array);
    }
    build_batch(fields, columns)
}

pub fn write_intensities_parquet(table: &PeakIntensityTable, path: &Path) -> Result<()> {
    write_batch(path, &intensities_batch(table)?)?;
    info!("wrote {} spectrum row(s) to {}", table.len(), path.display());
    Ok(())
}

pub fn ratios_batch(series: &RatioSeries) -> Result<RecordBatch> {
    let pts = &series.points;
    let fields = vec![
        string_field("file"),
        string_field("spectrum_name"),
        string_field("sample_label"),
        float_field("titrant_amount"),
        string_field("ratio"),
        float_field("value"),
    ];
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(pts.iter().map(|p| p.file.as_str()))),
        Arc::new(StringArray::from_iter_values(pts.iter().map(|p| p.spectrum_name.as_str()))),
        Arc::new(StringArray::from(
            pts.iter().map(|p| p.sample_label.as_deref()).collect::<Vec<_>>(),
        )),
        nan_to_null(pts.iter().map(|p| p.titrant_amount)),
        Arc::new(StringArray::from_iter_values(pts.iter().map(|p| p.ratio.as_str()))),
        nan_to_null(pts.iter().map(|p| p.value)),
    ];
    build_batch(fields, columns)
}

pub fn write_ratios_parquet(series: &RatioSeries, path: &Path) -> Result<()> {
    write_batch(path, &ratios_batch(series)?)?;
    info!("wrote {} ratio point(s) to {}", series.len(), path.display());
    Ok(())
}

/// Text table of the first `limit` rows, for terminal output.
pub fn preview(batch: &RecordBatch, limit: usize) -> Result<String> {
    let head = batch.slice(0, limit.min(batch.num_rows()));
    Ok(pretty_format_batches(&[head])?.to_string())
}

pub fn write_intensities(table: &PeakIntensityTable, path: &Path, format: ExportFormat) -> Result<()> {
    match format {
        ExportFormat::Csv => write_intensities_csv(table, path),
        ExportFormat::Parquet => write_intensities_parquet(table, path),
    }
}

pub fn write_ratios(series: &RatioSeries, path: &Path, format: ExportFormat) -> Result<()> {
    match format {
        ExportFormat::Csv => write_ratios_csv(series, path),
        ExportFormat::Parquet => write_ratios_parquet(series, path),
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// One entry of `fits.json`: either the fit or the reason it failed.
#[derive(Debug, Serialize)]
pub struct FitRecord<'a> {
    pub ratio: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fit: Option<&'a SigmoidFit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_eq_uncertainty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn write_fits_json(fits: &[(String, Result<SigmoidFit>)], path: &Path) -> Result<()> {
    let records: Vec<FitRecord<'_>> = fits
        .iter()
        .map(|(ratio, res)| match res {
            Ok(fit) => FitRecord {
                ratio,
                fit: Some(fit),
                x_eq_uncertainty: fit.x_eq_uncertainty(),
                error: None,
            },
            Err(err) => FitRecord {
                ratio,
                fit: None,
                x_eq_uncertainty: None,
                error: Some(err.to_string()),
            },
        })
        .collect();
    let mut w = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut w, &records)?;
    w.flush()?;
    info!("wrote {} fit record(s) to {}", records.len(), path.display());
    Ok(())
}
