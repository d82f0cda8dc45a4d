use std::collections::{BTreeMap, BTreeSet};

use super::model::{CombinedSpectrum, MetadataValue};

// ---------------------------------------------------------------------------
// Exclusion predicate: which metadata values drop a spectrum
// ---------------------------------------------------------------------------

/// Per-column exclusion sets: column_name → values whose spectra are dropped.
/// A column that is absent, or a spectrum without that column, excludes nothing.
pub type ExclusionState = BTreeMap<String, BTreeSet<MetadataValue>>;

/// Build an [`ExclusionState`] dropping the given sample labels.
pub fn exclude_labels<I, S>(label_column: &str, labels: I) -> ExclusionState
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let values: BTreeSet<MetadataValue> = labels
        .into_iter()
        .map(|l| MetadataValue::String(l.into()))
        .collect();
    let mut state = ExclusionState::new();
    if !values.is_empty() {
        state.insert(label_column.to_string(), values);
    }
    state
}

/// Whether a spectrum's metadata matches any exclusion.
///
/// String cells are compared after trimming, so `" Cuvette BRB"` matches
/// an exclusion of `"Cuvette BRB"`.
pub fn is_excluded(metadata: &BTreeMap<String, MetadataValue>, exclusions: &ExclusionState) -> bool {
    exclusions.iter().any(|(col, excluded)| match metadata.get(col) {
        Some(MetadataValue::String(s)) => {
            excluded.contains(&MetadataValue::String(s.trim().to_string()))
        }
        Some(val) => excluded.contains(val),
        None => false,
    })
}

/// Drop excluded spectra in place. Returns how many were removed.
pub fn retain_included(spectra: &mut Vec<CombinedSpectrum>, exclusions: &ExclusionState) -> usize {
    if exclusions.is_empty() {
        return 0;
    }
    let before = spectra.len();
    spectra.retain(|sp| !is_excluded(&sp.metadata, exclusions));
    before - spectra.len()
}
