use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, AsArray, BooleanArray, Float32Array, Float64Array, Int32Array, Int64Array,
    StringArray,
};
use arrow::datatypes::DataType;
use log::{debug, warn};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value as JsonValue;

use super::model::{parse_decimal, MetadataTable, MetadataValue, RawSpectrum};
use crate::error::{Error, ParseError, Result};

// ---------------------------------------------------------------------------
// Instrument spectrum files
// ---------------------------------------------------------------------------

/// First field of the header line that ends the instrument preamble.
pub const HEADER_SENTINEL: &str = "Pixel";

const SHIFT_COLUMN: &str = "Raman Shift";
const INTENSITY_COLUMN: &str = "Dark Subtracted #1";

/// Lower-case header names accepted when the canonical name is absent.
const SHIFT_ALIASES: &[&str] = &[
    "raman shift",
    "raman shift (cm-1)",
    "raman shift (cm⁻¹)",
    "raman_shift",
    "shift",
    "wavenumber",
    "wavenumbers",
];
const INTENSITY_ALIASES: &[&str] = &[
    "dark subtracted #1",
    "dark subtracted",
    "intensity",
    "counts",
    "raw data #1",
];

/// Load one semicolon-delimited instrument file.
///
/// Layout:
/// ```text
///   <preamble lines ...>
///   Pixel;Wavelength;Raman Shift;Dark;Dark Subtracted #1;
///   0;532,1;-12,5;1000;15,2;
///   ...
/// ```
/// Numbers use a comma as decimal separator. Rows where either the shift or
/// the intensity is not numeric are dropped; the result is sorted by shift.
pub fn load_spectrum(path: &Path) -> std::result::Result<RawSpectrum, ParseError> {
    let bytes = std::fs::read(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8_lossy(&bytes);
    parse_spectrum(&text, path)
}

/// Parse the text of an instrument file. `path` is used for the file name and errors.
pub fn parse_spectrum(text: &str, path: &Path) -> std::result::Result<RawSpectrum, ParseError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let body = &text[header_offset(text)..];

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let csv_err = |source| ParseError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut headers: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(clean_header)
        .collect();
    // Trailing delimiter leaves an unnamed last column.
    if headers.last().is_some_and(|h| h.is_empty()) {
        headers.pop();
    }

    let shift_idx = resolve_column(&headers, SHIFT_COLUMN, SHIFT_ALIASES).ok_or_else(|| {
        ParseError::MissingColumn {
            path: path.to_path_buf(),
            column: "shift",
            headers: headers.clone(),
        }
    })?;
    let intensity_idx = resolve_column(&headers, INTENSITY_COLUMN, INTENSITY_ALIASES)
        .ok_or_else(|| ParseError::MissingColumn {
            path: path.to_path_buf(),
            column: "intensity",
            headers: headers.clone(),
        })?;

    let mut points: Vec<(f64, f64)> = Vec::new();
    for result in reader.records() {
        let record = result.map_err(csv_err)?;
        let x = record.get(shift_idx).and_then(parse_decimal);
        let y = record.get(intensity_idx).and_then(parse_decimal);
        if let (Some(x), Some(y)) = (x, y) {
            points.push((x, y));
        }
    }

    if points.is_empty() {
        return Err(ParseError::NoData {
            path: path.to_path_buf(),
        });
    }

    points.sort_by(|a, b| a.0.total_cmp(&b.0));
    let (shift, intensity) = points.into_iter().unzip();

    Ok(RawSpectrum {
        file: file_name(path),
        shift,
        intensity,
    })
}

/// Byte offset of the sentinel header line, or 0 when there is none.
fn header_offset(text: &str) -> usize {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let first = line.split(';').next().unwrap_or("").trim();
        if first == HEADER_SENTINEL && line.contains(';') {
            return offset;
        }
        offset += line.len();
    }
    0
}

fn clean_header(h: &str) -> String {
    h.trim().replace('\u{a0}', " ")
}

/// Exact name first, then case-insensitive aliases.
fn resolve_column(headers: &[String], canonical: &str, aliases: &[&str]) -> Option<usize> {
    headers.iter().position(|h| h == canonical).or_else(|| {
        headers.iter().position(|h| {
            let lower = h.to_lowercase();
            aliases.iter().any(|a| *a == lower)
        })
    })
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Expand directories into their `.txt` files (non-recursive, sorted);
/// plain file paths are kept as given.
pub fn collect_spectrum_paths(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = std::fs::read_dir(input)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| {
                    p.is_file()
                        && p.extension()
                            .and_then(|e| e.to_str())
                            .is_some_and(|e| e.eq_ignore_ascii_case("txt"))
                })
                .collect();
            found.sort();
            debug!("{}: {} spectrum file(s)", input.display(), found.len());
            paths.extend(found);
        } else {
            paths.push(input.clone());
        }
    }
    Ok(paths)
}

// ---------------------------------------------------------------------------
// Metadata tables
// ---------------------------------------------------------------------------

/// Load a metadata table from a file.  Dispatch by extension.
///
/// Supported formats:
/// * `.csv` / `.txt` – header row; delimiter auto-detected (`;`, `,` or tab)
/// * `.json`         – `[{ "Spectrum name": "...", ... }, ...]`
/// * `.parquet`      – flat columns (strings, ints, floats, bools)
pub fn load_metadata(path: &Path) -> Result<MetadataTable> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "csv" | "txt" | "tsv" => load_metadata_csv(path),
        "json" => load_metadata_json(path),
        "parquet" | "pq" => load_metadata_parquet(path),
        other => Err(Error::Metadata(format!("unsupported file extension: .{other}"))),
    }
}

/// Pick the delimiter that occurs most on the first non-empty line.
pub(crate) fn sniff_delimiter(text: &str) -> u8 {
    let first = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    [b';', b'\t', b',']
        .into_iter()
        .max_by_key(|d| first.bytes().filter(|b| b == d).count())
        .filter(|d| first.as_bytes().contains(d))
        .unwrap_or(b',')
}

/// Read a delimited text table into header names and raw string records.
pub(crate) fn read_delimited(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(sniff_delimiter(text))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader.headers()?.iter().map(clean_header).collect();
    let mut records = Vec::new();
    for result in reader.records() {
        let record = result?;
        records.push(record.iter().map(str::to_string).collect());
    }
    Ok((headers, records))
}

fn load_metadata_csv(path: &Path) -> Result<MetadataTable> {
    let (headers, records) = read_delimited(path)?;
    let columns: Vec<String> = headers.iter().filter(|h| !h.is_empty()).cloned().collect();
    let mut table = MetadataTable::new(columns);

    for record in records {
        let row: BTreeMap<String, MetadataValue> = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| !h.is_empty())
            .map(|(i, h)| {
                let cell = record.get(i).map(String::as_str).unwrap_or("");
                (h.clone(), MetadataValue::guess(cell))
            })
            .collect();
        if row.values().all(MetadataValue::is_null) {
            continue;
        }
        table.push_row(row);
    }
    Ok(table)
}

fn load_metadata_json(path: &Path) -> Result<MetadataTable> {
    let text = std::fs::read_to_string(path)?;
    let root: JsonValue = serde_json::from_str(&text)?;

    let records = root
        .as_array()
        .ok_or_else(|| Error::Metadata("expected top-level JSON array".into()))?;

    let mut table = MetadataTable::default();
    for (i, rec) in records.iter().enumerate() {
        let obj = rec
            .as_object()
            .ok_or_else(|| Error::Metadata(format!("row {i} is not a JSON object")))?;
        let row = obj
            .iter()
            .map(|(key, val)| (key.clone(), json_to_metadata(val)))
            .collect();
        table.push_row(row);
    }
    Ok(table)
}

fn json_to_metadata(val: &JsonValue) -> MetadataValue {
    match val {
        JsonValue::String(s) => MetadataValue::String(s.clone()),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                MetadataValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                MetadataValue::Float(f)
            } else {
                MetadataValue::String(n.to_string())
            }
        }
        JsonValue::Bool(b) => MetadataValue::Bool(*b),
        JsonValue::Null => MetadataValue::Null,
        other => MetadataValue::String(other.to_string()),
    }
}

/// Works with files written by both **Pandas** (`df.to_parquet()`) and
/// **Polars** (`df.write_parquet()`).
fn load_metadata_parquet(path: &Path) -> Result<MetadataTable> {
    let file = std::fs::File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut table = MetadataTable::default();
    for batch_result in reader {
        let batch = batch_result?;
        let schema = batch.schema();
        for field in schema.fields() {
            if !table.has_column(field.name()) {
                table.columns.push(field.name().clone());
            }
        }
        for row in 0..batch.num_rows() {
            let values = schema
                .fields()
                .iter()
                .enumerate()
                .map(|(col_idx, field)| {
                    (field.name().clone(), extract_metadata_value(batch.column(col_idx), row))
                })
                .collect();
            table.push_row(values);
        }
    }
    Ok(table)
}

/// Extract a single metadata value from an Arrow column at a given row.
fn extract_metadata_value(col: &Arc<dyn Array>, row: usize) -> MetadataValue {
    if col.is_null(row) {
        return MetadataValue::Null;
    }
    let any = col.as_any();
    match col.data_type() {
        DataType::Utf8 => any
            .downcast_ref::<StringArray>()
            .map(|s| MetadataValue::String(s.value(row).to_string()))
            .unwrap_or(MetadataValue::Null),
        DataType::LargeUtf8 => MetadataValue::String(col.as_string::<i64>().value(row).to_string()),
        DataType::Int32 => any
            .downcast_ref::<Int32Array>()
            .map(|a| MetadataValue::Integer(a.value(row) as i64))
            .unwrap_or(MetadataValue::Null),
        DataType::Int64 => any
            .downcast_ref::<Int64Array>()
            .map(|a| MetadataValue::Integer(a.value(row)))
            .unwrap_or(MetadataValue::Null),
        DataType::Float32 => any
            .downcast_ref::<Float32Array>()
            .map(|a| MetadataValue::Float(a.value(row) as f64))
            .unwrap_or(MetadataValue::Null),
        DataType::Float64 => any
            .downcast_ref::<Float64Array>()
            .map(|a| MetadataValue::Float(a.value(row)))
            .unwrap_or(MetadataValue::Null),
        DataType::Boolean => any
            .downcast_ref::<BooleanArray>()
            .map(|a| MetadataValue::Bool(a.value(row)))
            .unwrap_or(MetadataValue::Null),
        other => {
            warn!("unsupported metadata column type {other:?}, reading as null");
            MetadataValue::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const INSTRUMENT_FILE: &str = "\
File Version;BWSpec4.11_1
Date;2024-05-12 14:03:11
intigration times(ms);5000
Pixel;Wavelength;Raman Shift;Dark;Dark Subtracted #1;
2;533,1;303,5;998;12,5;
0;532,9;301,2;1000;10,0;
1;533,0;302,4;1001;11,25;
3;533,2;;1002;13,0;
4;533,3;304,7;1003;abc;
";

    #[test]
    fn parses_after_preamble_and_sorts_by_shift() {
        let sp = parse_spectrum(INSTRUMENT_FILE, Path::new("/data/run_00.txt")).unwrap();
        assert_eq!(sp.file, "run_00.txt");
        assert_eq!(sp.shift, vec![301.2, 302.4, 303.5]);
        assert_eq!(sp.intensity, vec![10.0, 11.25, 12.5]);
        assert!(sp.shift.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn falls_back_to_first_row_header_and_aliases() {
        let text = "Wavenumber;Intensity\n200,0;5\n100,0;7\n";
        let sp = parse_spectrum(text, Path::new("plain.txt")).unwrap();
        assert_eq!(sp.shift, vec![100.0, 200.0]);
        assert_eq!(sp.intensity, vec![7.0, 5.0]);
    }

    #[test]
    fn missing_intensity_column_is_an_error() {
        let text = "Pixel;Raman Shift;Dark\n0;100,0;3\n";
        let err = parse_spectrum(text, Path::new("bad.txt")).unwrap_err();
        assert!(matches!(
            err,
            ParseError::MissingColumn {
                column: "intensity",
                ..
            }
        ));
    }

    #[test]
    fn no_numeric_rows_is_an_error() {
        let text = "Pixel;Raman Shift;Dark Subtracted #1;\n0;x;y;\n";
        let err = parse_spectrum(text, Path::new("empty.txt")).unwrap_err();
        assert!(matches!(err, ParseError::NoData { .. }));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_spectrum(Path::new("/nonexistent/spectrum.txt")).unwrap_err();
        assert!(matches!(err, ParseError::Io { .. }));
    }

    #[test]
    fn sniffs_delimiters() {
        assert_eq!(sniff_delimiter("a;b;c\n1;2;3"), b';');
        assert_eq!(sniff_delimiter("a,b\n"), b',');
        assert_eq!(sniff_delimiter("a\tb\tc\n"), b'\t');
        assert_eq!(sniff_delimiter("single\n"), b',');
    }

    #[test]
    fn loads_semicolon_metadata_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "Spectrum name;Sample description;n(titrant) (mol)").unwrap();
        writeln!(f, "S_00;Tube 1;0").unwrap();
        writeln!(f, "S_01;Tube 2;1e-10").unwrap();
        writeln!(f, ";;").unwrap();
        drop(f);

        let table = load_metadata(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.columns,
            vec!["Spectrum name", "Sample description", "n(titrant) (mol)"]
        );
        assert_eq!(table.get(1, "n(titrant) (mol)").as_f64(), Some(1e-10));
    }

    #[test]
    fn loads_json_metadata_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        std::fs::write(
            &path,
            r#"[{"Spectrum name": "S_00", "Tube": "Tube 1", "n(titrant) (mol)": 2.5e-10}]"#,
        )
        .unwrap();
        let table = load_metadata(&path).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0, "Tube"), &MetadataValue::String("Tube 1".into()));
        assert_eq!(table.get(0, "n(titrant) (mol)").as_f64(), Some(2.5e-10));
    }

    #[test]
    fn loads_parquet_metadata_with_nulls() {
        use arrow::array::ArrayRef;
        use arrow::datatypes::{Field, Schema};
        use arrow::record_batch::RecordBatch;
        use parquet::arrow::ArrowWriter;

        let schema = Arc::new(Schema::new(vec![
            Field::new("Spectrum name", DataType::Utf8, false),
            Field::new("n(titrant) (mol)", DataType::Float64, true),
            Field::new("Tube", DataType::Int64, true),
        ]));
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(vec!["001", "S_01", "S_02"])),
            Arc::new(Float64Array::from(vec![Some(1e-10), None, Some(3e-10)])),
            Arc::new(Int64Array::from(vec![Some(1), Some(2), None])),
        ];
        let batch = RecordBatch::try_new(schema.clone(), columns).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.parquet");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let table = load_metadata(&path).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.columns, vec!["Spectrum name", "n(titrant) (mol)", "Tube"]);
        assert_eq!(table.get(0, "Spectrum name"), &MetadataValue::String("001".into()));
        assert_eq!(table.get(0, "n(titrant) (mol)"), &MetadataValue::Float(1e-10));
        assert!(table.get(1, "n(titrant) (mol)").is_null());
        assert_eq!(table.get(1, "Tube"), &MetadataValue::Integer(2));
        assert!(table.get(2, "Tube").is_null());
        assert_eq!(table.get(2, "n(titrant) (mol)").as_f64(), Some(3e-10));
    }

    #[test]
    fn collects_txt_files_from_directories() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.txt", "a.txt", "notes.md"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        let paths = collect_spectrum_paths(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<String> = paths.iter().map(|p| file_name(p)).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }
}
