//! Core domain model and HS-code matching rules for the trade statistics harvester.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tradestat-core";

/// Table header carrying the commodity code on the portal's result page.
pub const HS_CODE_HEADER: &str = "HSCode";
/// Table header carrying the commodity description.
pub const COMMODITY_HEADER: &str = "Commodity";
/// Country label used when the result page does not name one.
pub const UNKNOWN_COUNTRY: &str = "Unknown";

/// Digit granularity requested from the portal, kept verbatim as the caller sent it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HsLevel(String);

impl HsLevel {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric digit count, `None` when the level is not a number.
    pub fn digits(&self) -> Option<usize> {
        self.0.trim().parse().ok()
    }
}

impl std::fmt::Display for HsLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One harvest as submitted by a caller.
///
/// `requested_code` is never rewritten: it names the output artifact. Matching runs
/// against [`HarvestRequest::matching_code`], which is derived on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestRequest {
    pub country_code: String,
    pub requested_code: String,
    pub hs_level: HsLevel,
    pub operation_id: String,
}

impl HarvestRequest {
    pub fn new(
        country_code: impl Into<String>,
        requested_code: impl Into<String>,
        hs_level: impl Into<String>,
    ) -> Self {
        Self::at(country_code, requested_code, hs_level, Utc::now())
    }

    pub fn at(
        country_code: impl Into<String>,
        requested_code: impl Into<String>,
        hs_level: impl Into<String>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        let country_code = country_code.into();
        let requested_code = requested_code.into();
        let hs_level = HsLevel::new(hs_level);
        let operation_id = operation_id(&country_code, &requested_code, &hs_level, submitted_at);
        Self {
            country_code,
            requested_code,
            hs_level,
            operation_id,
        }
    }

    pub fn matching_code(&self) -> &str {
        matching_code(&self.requested_code)
    }
}

/// Operation identifiers embed the request and the submission time in milliseconds.
pub fn operation_id(
    country_code: &str,
    requested_code: &str,
    hs_level: &HsLevel,
    submitted_at: DateTime<Utc>,
) -> String {
    format!(
        "{country_code}-{requested_code}-{hs_level}-{}",
        submitted_at.timestamp_millis()
    )
}

/// A fiscal-year reporting period, e.g. `2020-2021`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearWindow {
    pub start_year: i32,
    /// Label of the partial-year column, only present on the final window.
    pub partial_label: Option<String>,
}

impl YearWindow {
    pub fn new(start_year: i32) -> Self {
        Self {
            start_year,
            partial_label: None,
        }
    }

    /// `count` consecutive windows from `base_year`; the last one carries `{label}{partial_suffix}`.
    /// The sequence stops early rather than wrap past `i32::MAX`.
    pub fn sequence(base_year: i32, count: usize, partial_suffix: &str) -> Vec<YearWindow> {
        let mut windows: Vec<YearWindow> = (0..count)
            .map_while(|offset| i32::try_from(offset).ok().and_then(|o| base_year.checked_add(o)))
            .map(YearWindow::new)
            .collect();
        if let Some(last) = windows.last_mut() {
            last.partial_label = Some(format!("{}{partial_suffix}", last.label()));
        }
        windows
    }

    pub fn label(&self) -> String {
        format!("{}-{}", self.start_year, i64::from(self.start_year) + 1)
    }

    /// Value submitted in the portal's year selector.
    pub fn form_value(&self) -> String {
        self.start_year.to_string()
    }
}

/// One relevant table row for one year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedRow {
    pub raw_hs_code: String,
    pub commodity: String,
    pub country_label: String,
    pub year_value: Option<String>,
    pub partial_year_value: Option<String>,
}

impl ExtractedRow {
    /// Builds a row from a table row keyed by header text. Empty cells are treated as absent.
    pub fn from_table_row(
        cells: &BTreeMap<String, String>,
        country_label: &str,
        window: &YearWindow,
    ) -> Self {
        let cell = |key: &str| {
            cells
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(ToString::to_string)
        };
        Self {
            raw_hs_code: normalize_hs_code(cells.get(HS_CODE_HEADER).map(String::as_str).unwrap_or("")),
            commodity: cells.get(COMMODITY_HEADER).cloned().unwrap_or_default(),
            country_label: country_label.to_string(),
            year_value: cell(&window.label()),
            partial_year_value: window.partial_label.as_deref().and_then(cell),
        }
    }
}

/// Strips punctuation and whitespace from a code cell (`"0302.11"` -> `"030211"`).
pub fn normalize_hs_code(raw: &str) -> String {
    raw.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// Odd-length codes lose their final character before matching.
pub fn matching_code(requested_code: &str) -> &str {
    if requested_code.chars().count() % 2 == 0 {
        return requested_code;
    }
    match requested_code.char_indices().last() {
        Some((idx, _)) => &requested_code[..idx],
        None => requested_code,
    }
}

/// Tiered prefix match: 2, 4 or 6 leading characters depending on the target's length,
/// exact equality beyond six.
pub fn matches(target_code: &str, row_code: &str) -> bool {
    let len = target_code.chars().count();
    let tier = match len {
        0..=2 => 2,
        3..=4 => 4,
        5..=6 => 6,
        _ => return row_code == target_code,
    };
    row_code.starts_with(char_prefix(target_code, tier))
}

fn char_prefix(code: &str, n: usize) -> &str {
    match code.char_indices().nth(n) {
        Some((idx, _)) => &code[..idx],
        None => code,
    }
}

/// Merged per-code result across all harvested years.
///
/// Serialises flat: `HSCode`, `Commodity`, `Country`, then one key per year label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidatedRecord {
    #[serde(rename = "HSCode")]
    pub hs_code: String,
    #[serde(rename = "Commodity")]
    pub commodity: String,
    #[serde(rename = "Country")]
    pub country: String,
    #[serde(flatten)]
    pub values: BTreeMap<String, String>,
}

impl ConsolidatedRecord {
    pub fn value_for(&self, label: &str) -> Option<&str> {
        self.values.get(label).map(String::as_str)
    }
}

/// Accumulates matching rows keyed by their normalised code.
#[derive(Debug, Clone, Default)]
pub struct Consolidator {
    records: BTreeMap<String, ConsolidatedRecord>,
}

impl Consolidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts a row. The first row seen for a code fixes its commodity and country;
    /// later rows only add year values.
    pub fn absorb(&mut self, window: &YearWindow, row: ExtractedRow) {
        let record = self
            .records
            .entry(row.raw_hs_code.clone())
            .or_insert_with(|| ConsolidatedRecord {
                hs_code: row.raw_hs_code.clone(),
                commodity: row.commodity.clone(),
                country: row.country_label.clone(),
                values: BTreeMap::new(),
            });

        if let Some(value) = row.year_value {
            record.values.insert(window.label(), value);
        }
        if let (Some(label), Some(value)) = (&window.partial_label, row.partial_year_value) {
            record.values.insert(label.clone(), value);
        }
    }

    /// Absorbs every row whose code matches `target_code`; returns how many matched.
    pub fn absorb_matching(
        &mut self,
        target_code: &str,
        window: &YearWindow,
        rows: impl IntoIterator<Item = ExtractedRow>,
    ) -> usize {
        let mut matched = 0;
        for row in rows {
            if matches(target_code, &row.raw_hs_code) {
                self.absorb(window, row);
                matched += 1;
            }
        }
        matched
    }

    pub fn get(&self, hs_code: &str) -> Option<&ConsolidatedRecord> {
        self.records.get(hs_code)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<ConsolidatedRecord> {
        self.records.into_values().collect()
    }
}
