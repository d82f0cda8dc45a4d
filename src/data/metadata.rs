//! Experiment metadata derived from the pipetting plan.
//!
//! A volume table lists, for every reagent, its stock concentration and the
//! volume (µL) pipetted into each tube. From it the final molar concentration
//! of every reagent in every tube is computed, and a tube map (spectrum name →
//! tube) turns those per-tube values into per-spectrum metadata, including the
//! titrant amount used as the abscissa of the equivalence fit.

use std::collections::BTreeMap;
use std::path::Path;

use log::{debug, warn};

use super::loader::read_delimited;
use super::model::{parse_decimal, MetadataTable, MetadataValue};
use crate::error::{Error, Result};

pub const SPECTRUM_NAME: &str = "Spectrum name";
pub const TUBE: &str = "Tube";
pub const SAMPLE_DESCRIPTION: &str = "Sample description";
pub const CUVETTE_VOLUME: &str = "V cuvette (µL)";
pub const TITRANT_MOLAR: &str = "[titrant] (M)";
pub const TITRANT_MILLIMOLAR: &str = "[titrant] (mM)";
pub const TITRANT_AMOUNT: &str = "n(titrant) (mol)";

/// Tubes never used for the titration series.
const EXCLUDED_TUBES: &[&str] = &["Tube BRB"];

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConcentrationUnit {
    Molar,
    Millimolar,
    Micromolar,
    Nanomolar,
    /// Mass fraction; not convertible without a molar mass.
    MassPercent,
    /// Unrecognised; values pass through unchanged.
    Other(String),
}

impl ConcentrationUnit {
    pub fn parse(unit: &str) -> Self {
        let u: String = unit
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| if c == 'μ' { 'µ' } else { c })
            .collect::<String>()
            .to_lowercase();
        match u.as_str() {
            "m" | "mol/l" | "mol.l-1" => Self::Molar,
            "mm" | "mmol/l" | "mmol.l-1" => Self::Millimolar,
            "µm" | "um" | "µmol/l" | "umol/l" | "µmol.l-1" => Self::Micromolar,
            "nm" | "nmol/l" | "nmol.l-1" => Self::Nanomolar,
            _ if u.contains('%') => Self::MassPercent,
            _ => Self::Other(unit.trim().to_string()),
        }
    }

    /// Multiplier to mol/L, `None` when the unit cannot be converted.
    pub fn to_molar_factor(&self) -> Option<f64> {
        match self {
            Self::Molar | Self::Other(_) => Some(1.0),
            Self::Millimolar => Some(1e-3),
            Self::Micromolar => Some(1e-6),
            Self::Nanomolar => Some(1e-9),
            Self::MassPercent => None,
        }
    }
}

/// Parse a stock concentration (`"0,5"`, `"µM"`) into mol/L.
pub fn to_molar(value: &str, unit: &str) -> Option<f64> {
    let v = parse_decimal(value)?;
    let unit = ConcentrationUnit::parse(unit);
    if let ConcentrationUnit::Other(name) = &unit {
        if !name.is_empty() {
            warn!("unknown concentration unit '{name}', using the value as is");
        }
    }
    unit.to_molar_factor().map(|f| v * f)
}

// ---------------------------------------------------------------------------
// Volume table → concentration table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Reagent {
    pub name: String,
    /// Stock concentration in mol/L, `None` when absent or unusable.
    pub stock_molar: Option<f64>,
    /// Pipetted volume per tube (µL); empty cells are 0.
    pub volumes_ul: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeTable {
    pub tubes: Vec<String>,
    pub reagents: Vec<Reagent>,
}

fn find_header(headers: &[String], names: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| names.iter().any(|n| h.eq_ignore_ascii_case(n)))
}

impl VolumeTable {
    /// Columns: reagent name (`Réactif` / `Reagent`, else the first column),
    /// `Concentration`, `Unité` / `Unit`, and one `Tube …` column per tube.
    pub fn from_records(headers: &[String], records: &[Vec<String>]) -> Result<Self> {
        let tube_cols: Vec<usize> = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.to_lowercase().starts_with("tube"))
            .map(|(i, _)| i)
            .collect();
        if tube_cols.is_empty() {
            return Err(Error::Metadata("volume table has no 'Tube …' column".into()));
        }
        let name_col = find_header(headers, &["Réactif", "Reagent", "Reactif"]).unwrap_or(0);
        let conc_col = find_header(headers, &["Concentration"]);
        let unit_col = find_header(headers, &["Unité", "Unit", "Unite"]);

        let cell = |record: &[String], col: Option<usize>| -> String {
            col.and_then(|c| record.get(c)).cloned().unwrap_or_default()
        };

        let reagents = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.iter().any(|c| !c.trim().is_empty()))
            .map(|(i, record)| {
                let name = cell(record, Some(name_col));
                let name = if name.trim().is_empty() {
                    format!("Row {i}")
                } else {
                    name.trim().to_string()
                };
                Reagent {
                    name,
                    stock_molar: to_molar(&cell(record, conc_col), &cell(record, unit_col)),
                    volumes_ul: tube_cols
                        .iter()
                        .map(|&c| record.get(c).and_then(|v| parse_decimal(v)).unwrap_or(0.0))
                        .collect(),
                }
            })
            .collect();

        Ok(Self {
            tubes: tube_cols.iter().map(|&c| headers[c].clone()).collect(),
            reagents,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let (headers, records) = read_delimited(path)?;
        Self::from_records(&headers, &records)
    }

    /// Total volume per tube (µL).
    pub fn total_volumes_ul(&self) -> Vec<f64> {
        (0..self.tubes.len())
            .map(|j| self.reagents.iter().map(|r| r.volumes_ul[j]).sum())
            .collect()
    }

    /// Final concentration of each reagent in each tube:
    /// `C_ij = C_stock_i * V_ij / V_tot_j`.
    ///
    /// A tube with zero total volume gets NaN; a reagent without a usable stock
    /// concentration gets 0 everywhere.
    pub fn concentrations(&self) -> ConcentrationTable {
        let totals: Vec<f64> = self
            .total_volumes_ul()
            .into_iter()
            .map(|v| if v == 0.0 { f64::NAN } else { v })
            .collect();

        let reagents = self
            .reagents
            .iter()
            .map(|r| {
                let values = match r.stock_molar {
                    None => vec![0.0; self.tubes.len()],
                    Some(c) => r
                        .volumes_ul
                        .iter()
                        .zip(&totals)
                        .map(|(v, tot)| c * v / tot)
                        .collect(),
                };
                (r.name.clone(), values)
            })
            .collect();

        ConcentrationTable {
            tubes: self.tubes.clone(),
            total_volume_ul: totals,
            reagents,
        }
    }
}

/// Exact (lower-case) reagent names that denote the titrating solution B.
const SOLUTION_B_NAMES: &[&str] = &["solution b", "solutionb", "sol b", "solb", "b"];

/// Final molar concentrations, reagents × tubes.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcentrationTable {
    pub tubes: Vec<String>,
    /// Total volume per tube (µL), NaN for empty tubes.
    pub total_volume_ul: Vec<f64>,
    pub reagents: Vec<(String, Vec<f64>)>,
}

impl ConcentrationTable {
    pub fn tube_index(&self, tube: &str) -> Option<usize> {
        let tube = tube.trim();
        self.tubes.iter().position(|t| t.trim().eq_ignore_ascii_case(tube))
    }

    pub fn reagent(&self, name: &str) -> Option<&[f64]> {
        self.reagents
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name.trim()))
            .map(|(_, v)| v.as_slice())
    }

    /// First reagent whose name mentions the titrant (or EGTA, the usual
    /// one), or that is called like the protocol's solution B.
    pub fn titrant_candidate(&self) -> Option<&str> {
        self.reagents
            .iter()
            .map(|(n, _)| n.as_str())
            .find(|n| {
                let low = n.trim().to_lowercase();
                low.contains("titrant")
                    || low.contains("egta")
                    || SOLUTION_B_NAMES.contains(&low.as_str())
            })
    }
}

// ---------------------------------------------------------------------------
// Tube map → metadata table
// ---------------------------------------------------------------------------

/// Which tube each spectrum was measured on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TubeMap {
    pub entries: Vec<(String, String)>,
}

impl TubeMap {
    /// Columns `Nom du spectre` / `Spectrum name` and `Tube`. Rows up to the
    /// last repeated header row are dropped, as are rows missing either field.
    pub fn from_records(headers: &[String], records: &[Vec<String>]) -> Result<Self> {
        let spec_names = ["Nom du spectre", SPECTRUM_NAME];
        let spec_col = find_header(headers, &spec_names)
            .ok_or_else(|| Error::Metadata("tube map has no spectrum name column".into()))?;
        let tube_col = find_header(headers, &[TUBE])
            .ok_or_else(|| Error::Metadata("tube map has no 'Tube' column".into()))?;

        let field = |r: &Vec<String>, c: usize| r.get(c).map(|s| s.trim().to_string()).unwrap_or_default();

        let start = records
            .iter()
            .rposition(|r| {
                let name = field(r, spec_col);
                spec_names.iter().any(|n| name.eq_ignore_ascii_case(n))
            })
            .map(|i| i + 1)
            .unwrap_or(0);

        let entries = records[start..]
            .iter()
            .map(|r| (field(r, spec_col), field(r, tube_col)))
            .filter(|(s, t)| !s.is_empty() && !t.is_empty())
            .collect();
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let (headers, records) = read_delimited(path)?;
        Self::from_records(&headers, &records)
    }
}

/// Per-spectrum metadata from a tube map and, optionally, the concentration table.
///
/// Columns: `Spectrum name`, `Tube`, `Sample description`, then one column per
/// reagent (mol/L) and `V cuvette (µL)`. When a titrant is known (named, or
/// detected through [`ConcentrationTable::titrant_candidate`]) the table also
/// gets `[titrant] (M)`, `[titrant] (mM)` and `n(titrant) (mol)`.
/// Rows on `Tube BRB` are left out.
pub fn build_metadata(
    map: &TubeMap,
    concentrations: Option<&ConcentrationTable>,
    titrant: Option<&str>,
) -> Result<MetadataTable> {
    let mut columns: Vec<String> = vec![SPECTRUM_NAME.into(), TUBE.into(), SAMPLE_DESCRIPTION.into()];

    let titrant = match (concentrations, titrant) {
        (Some(conc), Some(name)) => {
            if conc.reagent(name).is_none() {
                return Err(Error::Metadata(format!("titrant '{name}' is not a reagent")));
            }
            Some(name.to_string())
        }
        (Some(conc), None) => conc.titrant_candidate().map(str::to_string),
        (None, _) => None,
    };
    if let Some(conc) = concentrations {
        columns.extend(conc.reagents.iter().map(|(n, _)| n.clone()));
        columns.push(CUVETTE_VOLUME.into());
        if titrant.is_some() {
            columns.extend([TITRANT_MOLAR, TITRANT_MILLIMOLAR, TITRANT_AMOUNT].map(String::from));
        }
    }
    match &titrant {
        Some(t) => debug!("titrant reagent: {t}"),
        None if concentrations.is_some() => warn!("no titrant reagent identified"),
        None => {}
    }

    let mut table = MetadataTable::new(columns);
    for (spectrum, tube) in &map.entries {
        if EXCLUDED_TUBES.iter().any(|t| t.eq_ignore_ascii_case(tube)) {
            continue;
        }
        let mut row = BTreeMap::new();
        row.insert(SPECTRUM_NAME.to_string(), MetadataValue::String(spectrum.clone()));
        row.insert(TUBE.to_string(), MetadataValue::String(tube.clone()));
        row.insert(SAMPLE_DESCRIPTION.to_string(), MetadataValue::String(tube.clone()));

        if let Some(conc) = concentrations {
            let j = conc.tube_index(tube);
            if j.is_none() {
                warn!("tube '{tube}' of spectrum '{spectrum}' has no volumes");
            }
            let at = |values: &[f64]| j.map(|j| values[j]).unwrap_or(f64::NAN);
            for (name, values) in &conc.reagents {
                row.insert(name.clone(), float_cell(at(values)));
            }
            let volume = at(&conc.total_volume_ul);
            row.insert(CUVETTE_VOLUME.to_string(), float_cell(volume));

            if let Some(values) = titrant.as_deref().and_then(|t| conc.reagent(t)) {
                let c = at(values);
                row.insert(TITRANT_MOLAR.to_string(), float_cell(c));
                row.insert(TITRANT_MILLIMOLAR.to_string(), float_cell(c * 1e3));
                row.insert(TITRANT_AMOUNT.to_string(), float_cell(c * volume * 1e-6));
            }
        }
        table.push_row(row);
    }
    Ok(table)
}

fn float_cell(v: f64) -> MetadataValue {
    if v.is_nan() {
        MetadataValue::Null
    } else {
        MetadataValue::Float(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn strings(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|s| s.to_string()).collect()
    }

    fn volume_table() -> VolumeTable {
        let headers = strings(&["Réactif", "Concentration", "Unité", "Tube 1", "Tube 2", "Tube 3"]);
        let records = vec![
            strings(&["Echantillon", "0,5", "µM", "1000", "1000", "0"]),
            strings(&["Solution A", "4", "mM", "500", "250", "0"]),
            strings(&["EGTA", "2", "mM", "0", "250", ""]),
            strings(&["Tensioactif", "0,05", "% en masse", "500", "500", "0"]),
        ];
        VolumeTable::from_records(&headers, &records).unwrap()
    }

    #[test]
    fn units_normalise_to_molar() {
        assert_eq!(to_molar("2", "M"), Some(2.0));
        assert_relative_eq!(to_molar("4", "mM").unwrap(), 4e-3);
        assert_relative_eq!(to_molar("0,5", "µM").unwrap(), 5e-7);
        assert_relative_eq!(to_molar("0,5", "μM").unwrap(), 5e-7);
        assert_relative_eq!(to_molar("3", "nM").unwrap(), 3e-9);
        assert_eq!(to_molar("0,05", "% en masse"), None);
        assert_eq!(to_molar("7", "ppm"), Some(7.0));
        assert_eq!(to_molar("", "mM"), None);
    }

    #[test]
    fn concentrations_follow_dilution() {
        let conc = volume_table().concentrations();
        assert_eq!(conc.tubes, vec!["Tube 1", "Tube 2", "Tube 3"]);
        assert_eq!(conc.total_volume_ul[0], 2000.0);
        assert!(conc.total_volume_ul[2].is_nan());

        let egta = conc.reagent("egta").unwrap();
        assert_eq!(egta[0], 0.0);
        assert_relative_eq!(egta[1], 2e-3 * 250.0 / 2000.0);
        assert!(egta[2].is_nan());

        // Unusable stock: zero everywhere.
        assert_eq!(conc.reagent("Tensioactif").unwrap(), &[0.0, 0.0, 0.0]);
        assert_eq!(conc.titrant_candidate(), Some("EGTA"));
    }

    #[test]
    fn tube_map_skips_internal_headers_and_blanks() {
        let headers = strings(&["Nom du spectre", "Tube"]);
        let records = vec![
            strings(&["Manip", ""]),
            strings(&["Nom du spectre", "Tube"]),
            strings(&["Manip_00", "Tube 1"]),
            strings(&["", "Tube 2"]),
            strings(&["Manip_01", "Tube 2"]),
            strings(&["Manip_02", "Tube BRB"]),
        ];
        let map = TubeMap::from_records(&headers, &records).unwrap();
        assert_eq!(map.entries.len(), 3);
        assert_eq!(map.entries[0], ("Manip_00".to_string(), "Tube 1".to_string()));
    }

    #[test]
    fn metadata_carries_titrant_amount() {
        let conc = volume_table().concentrations();
        let map = TubeMap {
            entries: vec![
                ("Manip_00".into(), "Tube 1".into()),
                ("Manip_01".into(), "Tube 2".into()),
                ("Manip_02".into(), "Tube BRB".into()),
            ],
        };
        let meta = build_metadata(&map, Some(&conc), None).unwrap();
        assert_eq!(meta.len(), 2);
        assert!(meta.has_column(TITRANT_AMOUNT));
        assert_eq!(meta.get(1, SAMPLE_DESCRIPTION), &MetadataValue::String("Tube 2".into()));

        let c = 2e-3 * 250.0 / 2000.0;
        assert_relative_eq!(meta.get(1, TITRANT_MOLAR).as_f64().unwrap(), c);
        assert_relative_eq!(meta.get(1, TITRANT_MILLIMOLAR).as_f64().unwrap(), c * 1e3);
        assert_relative_eq!(meta.get(1, TITRANT_AMOUNT).as_f64().unwrap(), c * 2000.0 * 1e-6);
        assert_eq!(meta.get(0, TITRANT_AMOUNT).as_f64(), Some(0.0));
    }

    #[test]
    fn unknown_titrant_is_rejected() {
        let conc = volume_table().concentrations();
        let err = build_metadata(&TubeMap::default(), Some(&conc), Some("Tris")).unwrap_err();
        assert!(matches!(err, Error::Metadata(_)));
    }

    #[test]
    fn solution_b_counts_as_titrant() {
        fn table(names: &[&str]) -> ConcentrationTable {
            ConcentrationTable {
                tubes: strings(&["Tube 1"]),
                total_volume_ul: vec![1000.0],
                reagents: names.iter().map(|n| (n.to_string(), vec![0.0])).collect(),
            }
        }
        assert_eq!(table(&["Tris", "Solution B"]).titrant_candidate(), Some("Solution B"));
        assert_eq!(table(&["SolB"]).titrant_candidate(), Some("SolB"));
        assert_eq!(table(&["Tris", " b "]).titrant_candidate(), Some(" b "));
        // Only whole names match; "Tampon B" is not the titrant.
        assert_eq!(table(&["Tampon B", "CaCl2"]).titrant_candidate(), None);
    }
}
