use std::collections::{BTreeMap, HashMap};
use std::fmt;

// ---------------------------------------------------------------------------
// MetadataValue – a single cell in a metadata column
// ---------------------------------------------------------------------------

/// A dynamically-typed metadata value mirroring common Pandas dtypes.
/// Used as a `BTreeMap` value and compared against exclusion sets, so it is `Ord`.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl Eq for MetadataValue {}

impl PartialOrd for MetadataValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MetadataValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use MetadataValue::*;
        fn discriminant(v: &MetadataValue) -> u8 {
            match v {
                Null => 0,
                Bool(_) => 1,
                Integer(_) => 2,
                Float(_) => 3,
                String(_) => 4,
            }
        }
        let da = discriminant(self);
        let db = discriminant(other);
        if da != db {
            return da.cmp(&db);
        }
        match (self, other) {
            (Bool(a), Bool(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (String(a), String(b)) => a.cmp(b),
            _ => std::cmp::Ordering::Equal,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::String(s) => write!(f, "{s}"),
            MetadataValue::Integer(i) => write!(f, "{i}"),
            MetadataValue::Float(v) => write!(f, "{v}"),
            MetadataValue::Bool(b) => write!(f, "{b}"),
            MetadataValue::Null => write!(f, "<null>"),
        }
    }
}

impl MetadataValue {
    /// Interpret the value as an `f64`.
    ///
    /// Strings are parsed too, accepting a comma as decimal separator
    /// (`"0,5"` → 0.5), since spreadsheet exports often carry numbers as text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Float(v) if v.is_finite() => Some(*v),
            MetadataValue::Integer(i) => Some(*i as f64),
            MetadataValue::String(s) => parse_decimal(s),
            _ => None,
        }
    }

    /// Text used as a join key or label. `Null` has no key.
    pub fn as_key(&self) -> Option<String> {
        match self {
            MetadataValue::Null => None,
            MetadataValue::String(s) => Some(s.trim().to_string()),
            other => Some(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, MetadataValue::Null) || matches!(self, MetadataValue::Float(v) if v.is_nan())
    }

    /// Cell text for tabular export (`Null` is an empty cell).
    pub fn to_cell(&self) -> String {
        match self {
            MetadataValue::Null => String::new(),
            MetadataValue::Float(v) if v.is_nan() => String::new(),
            other => other.to_string(),
        }
    }

    /// Guess the type of a text cell.
    pub fn guess(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() {
            return MetadataValue::Null;
        }
        let digits = s.strip_prefix(|c: char| c == '+' || c == '-').unwrap_or(s);
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            // Zero-padded identifiers such as `001` keep their text.
            return match s.parse::<i64>() {
                Ok(i) if i.to_string() == s => MetadataValue::Integer(i),
                _ => MetadataValue::String(s.to_string()),
            };
        }
        if let Ok(f) = s.parse::<f64>() {
            return MetadataValue::Float(f);
        }
        if s == "true" || s == "false" {
            return MetadataValue::Bool(s == "true");
        }
        MetadataValue::String(s.to_string())
    }
}

/// Parse a number that may use a comma as decimal separator.
pub fn parse_decimal(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

// ---------------------------------------------------------------------------
// MetadataTable – rows keyed by spectrum name
// ---------------------------------------------------------------------------

/// Per-spectrum experiment metadata, in column order.
#[derive(Debug, Clone, Default)]
pub struct MetadataTable {
    pub columns: Vec<String>,
    pub rows: Vec<BTreeMap<String, MetadataValue>>,
}

impl MetadataTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row; columns unknown so far are added to the column list.
    pub fn push_row(&mut self, row: BTreeMap<String, MetadataValue>) {
        for col in row.keys() {
            if !self.columns.contains(col) {
                self.columns.push(col.clone());
            }
        }
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Cell lookup; a missing cell reads as `Null`.
    pub fn get(&self, row: usize, column: &str) -> &MetadataValue {
        static NULL: MetadataValue = MetadataValue::Null;
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .unwrap_or(&NULL)
    }

    /// Set a cell, registering the column if needed.
    pub fn set(&mut self, row: usize, column: &str, value: MetadataValue) {
        if !self.has_column(column) {
            self.columns.push(column.to_string());
        }
        if let Some(r) = self.rows.get_mut(row) {
            r.insert(column.to_string(), value);
        }
    }

    /// Map key → first row index carrying that key. Later duplicates are reported
    /// through `duplicates` but otherwise ignored.
    pub fn index_by(&self, key_column: &str) -> (HashMap<String, usize>, Vec<String>) {
        let mut index = HashMap::new();
        let mut duplicates = Vec::new();
        for (i, row) in self.rows.iter().enumerate() {
            let Some(key) = row.get(key_column).and_then(MetadataValue::as_key) else {
                continue;
            };
            if index.contains_key(&key) {
                duplicates.push(key);
            } else {
                index.insert(key, i);
            }
        }
        (index, duplicates)
    }
}

// ---------------------------------------------------------------------------
// Spectra
// ---------------------------------------------------------------------------

/// One instrument file, parsed. Shifts are sorted ascending.
#[derive(Debug, Clone)]
pub struct RawSpectrum {
    /// Source file name (no directory).
    pub file: String,
    /// Raman shift axis (cm⁻¹).
    pub shift: Vec<f64>,
    /// Intensity – same length as `shift`.
    pub intensity: Vec<f64>,
}

impl RawSpectrum {
    pub fn len(&self) -> usize {
        self.shift.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shift.is_empty()
    }
}

/// A spectrum with its estimated baseline removed.
#[derive(Debug, Clone)]
pub struct CorrectedSpectrum {
    pub file: String,
    pub shift: Vec<f64>,
    pub intensity: Vec<f64>,
    pub baseline: Vec<f64>,
    /// `intensity - baseline`, point by point.
    pub corrected: Vec<f64>,
    /// The baseline fit failed and a zero baseline was used instead.
    pub baseline_fallback: bool,
}

// ---------------------------------------------------------------------------
// CombinedTable – spectra joined with metadata
// ---------------------------------------------------------------------------

/// One corrected spectrum with its joined metadata.
#[derive(Debug, Clone)]
pub struct CombinedSpectrum {
    /// File name without extension; the metadata join key.
    pub spectrum_name: String,
    pub spectrum: CorrectedSpectrum,
    /// Every metadata column; unmatched spectra carry `Null` cells.
    pub metadata: BTreeMap<String, MetadataValue>,
    pub sample_label: Option<String>,
    pub titrant_amount: Option<f64>,
}

/// Tidy view of one (spectrum, shift) observation.
#[derive(Debug, Clone, Copy)]
pub struct CombinedRow<'a> {
    pub shift: f64,
    pub intensity: f64,
    pub baseline: f64,
    pub corrected_intensity: f64,
    pub spectrum_name: &'a str,
    pub file: &'a str,
    pub sample_label: Option<&'a str>,
    pub titrant_amount: Option<f64>,
    pub metadata: &'a BTreeMap<String, MetadataValue>,
}

/// All assembled spectra. Stored per spectrum, iterated as tidy rows.
#[derive(Debug, Clone, Default)]
pub struct CombinedTable {
    pub spectra: Vec<CombinedSpectrum>,
    /// Metadata column names, in metadata-table order.
    pub metadata_columns: Vec<String>,
}

impl CombinedTable {
    /// Number of tidy rows (sum of spectrum lengths).
    pub fn len(&self) -> usize {
        self.spectra.iter().map(|s| s.spectrum.shift.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_spectra(&self) -> usize {
        self.spectra.len()
    }

    pub fn spectrum(&self, name: &str) -> Option<&CombinedSpectrum> {
        self.spectra.iter().find(|s| s.spectrum_name == name)
    }

    /// One row per (spectrum, shift) pair.
    pub fn rows(&self) -> impl Iterator<Item = CombinedRow<'_>> + '_ {
        self.spectra.iter().flat_map(|cs| {
            let sp = &cs.spectrum;
            (0..sp.shift.len()).map(move |i| CombinedRow {
                shift: sp.shift[i],
                intensity: sp.intensity[i],
                baseline: sp.baseline[i],
                corrected_intensity: sp.corrected[i],
                spectrum_name: &cs.spectrum_name,
                file: &sp.file,
                sample_label: cs.sample_label.as_deref(),
                titrant_amount: cs.titrant_amount,
                metadata: &cs.metadata,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_f64_accepts_comma_decimals() {
        assert_eq!(MetadataValue::String("0,5".into()).as_f64(), Some(0.5));
        assert_eq!(MetadataValue::Integer(3).as_f64(), Some(3.0));
        assert_eq!(MetadataValue::String("n/a".into()).as_f64(), None);
        assert_eq!(MetadataValue::Float(f64::NAN).as_f64(), None);
        assert_eq!(MetadataValue::Null.as_f64(), None);
    }

    #[test]
    fn index_by_keeps_first_occurrence() {
        let mut table = MetadataTable::default();
        for (name, tube) in [("S_00", "Tube 1"), ("S_01", "Tube 2"), ("S_00", "Tube 9")] {
            let mut row = BTreeMap::new();
            row.insert("Spectrum name".to_string(), MetadataValue::String(name.into()));
            row.insert("Tube".to_string(), MetadataValue::String(tube.into()));
            table.push_row(row);
        }
        let (index, dups) = table.index_by("Spectrum name");
        assert_eq!(index["S_00"], 0);
        assert_eq!(index["S_01"], 1);
        assert_eq!(dups, vec!["S_00".to_string()]);
        assert_eq!(table.columns, vec!["Spectrum name", "Tube"]);
    }

    #[test]
    fn guess_metadata_type() {
        assert_eq!(MetadataValue::guess(""), MetadataValue::Null);
        assert_eq!(MetadataValue::guess("12"), MetadataValue::Integer(12));
        assert_eq!(MetadataValue::guess("1e-9"), MetadataValue::Float(1e-9));
        assert_eq!(MetadataValue::guess("0.5"), MetadataValue::Float(0.5));
        assert_eq!(MetadataValue::guess("-3"), MetadataValue::Integer(-3));
        assert_eq!(MetadataValue::guess("true"), MetadataValue::Bool(true));
        assert_eq!(
            MetadataValue::guess(" Cuvette BRB "),
            MetadataValue::String("Cuvette BRB".into())
        );
    }

    #[test]
    fn zero_padded_names_keep_their_text() {
        let v = MetadataValue::guess("001");
        assert_eq!(v, MetadataValue::String("001".into()));
        assert_eq!(v.as_key().as_deref(), Some("001"));
        assert_eq!(v.as_f64(), Some(1.0));
        assert_eq!(MetadataValue::guess("0"), MetadataValue::Integer(0));
        assert_eq!(MetadataValue::guess("+7"), MetadataValue::String("+7".into()));
    }
}
