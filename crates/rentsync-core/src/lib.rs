//! Core domain model for the rent + cost-of-living dataset sync.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "rentsync-core";

/// Field payload as exchanged with the remote store.
pub type FieldMap = serde_json::Map<String, JsonValue>;

pub const DATE_COLUMN: &str = "Date";
pub const ENTITY_COLUMN: &str = "City/Neighborhood";
pub const CONFIGURATION_COLUMN: &str = "Configuration";
pub const PRICE_COLUMN: &str = "Average Price (USD)";

/// Column order of the local dataset file.
pub const DATASET_HEADER: [&str; 11] = [
    DATE_COLUMN,
    ENTITY_COLUMN,
    CONFIGURATION_COLUMN,
    PRICE_COLUMN,
    "Utilities",
    "Groceries",
    "Internet",
    "Cell Phone",
    "Dining",
    "Entertainment",
    "Travel",
];

/// Input formats accepted for date cells, tried in order.
pub const ACCEPTED_DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];
pub const CANONICAL_DATE_FORMAT: &str = "%Y-%m-%d";

/// Record as returned by the remote store. Never mutated after fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    #[serde(default)]
    pub fields: FieldMap,
}

impl RemoteRecord {
    pub fn new(id: impl Into<String>, fields: FieldMap) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Field value with single-element lookup arrays unwrapped.
    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name).map(normalize_single)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
}

/// Closed set of cost categories carried by every merged row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    Utilities,
    Groceries,
    Internet,
    #[serde(rename = "Cell Phone")]
    CellPhone,
    Dining,
    Entertainment,
    Travel,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Utilities,
        Category::Groceries,
        Category::Internet,
        Category::CellPhone,
        Category::Dining,
        Category::Entertainment,
        Category::Travel,
    ];

    /// Dataset column header for this category.
    pub fn label(self) -> &'static str {
        match self {
            Category::Utilities => "Utilities",
            Category::Groceries => "Groceries",
            Category::Internet => "Internet",
            Category::CellPhone => "Cell Phone",
            Category::Dining => "Dining",
            Category::Entertainment => "Entertainment",
            Category::Travel => "Travel",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.label() == label)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One amount per fixed category, zero unless set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryAmounts(BTreeMap<Category, f64>);

impl Default for CategoryAmounts {
    fn default() -> Self {
        Self(Category::ALL.into_iter().map(|c| (c, 0.0)).collect())
    }
}

impl CategoryAmounts {
    pub fn get(&self, category: Category) -> f64 {
        self.0.get(&category).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, category: Category, amount: f64) {
        self.0.insert(category, amount);
    }

    pub fn any_nonzero(&self) -> bool {
        self.0.values().any(|v| *v != 0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, f64)> + '_ {
        self.0.iter().map(|(c, v)| (*c, *v))
    }
}

/// Baseline rent row, one per entity + configuration + date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineRow {
    pub date: String,
    pub entity: String,
    pub configuration: String,
    pub price: f64,
}

/// Baseline row joined with the override amounts for its entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRow {
    pub date: String,
    pub entity: String,
    pub configuration: String,
    pub price: f64,
    pub amounts: CategoryAmounts,
}

impl MergedRow {
    pub fn from_baseline(baseline: &BaselineRow, amounts: CategoryAmounts) -> Self {
        Self {
            date: baseline.date.clone(),
            entity: baseline.entity.clone(),
            configuration: baseline.configuration.clone(),
            price: baseline.price,
            amounts,
        }
    }

    /// Cells in `DATASET_HEADER` order.
    pub fn to_cells(&self) -> Vec<String> {
        let mut cells = vec![
            self.date.clone(),
            self.entity.clone(),
            self.configuration.clone(),
            format_amount(self.price),
        ];
        cells.extend(Category::ALL.iter().map(|c| format_amount(self.amounts.get(*c))));
        cells
    }

    pub fn to_columns(&self) -> BTreeMap<String, String> {
        DATASET_HEADER
            .iter()
            .map(|h| h.to_string())
            .zip(self.to_cells())
            .collect()
    }
}

/// Column-addressed rows loaded from a delimited file or built from merged rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalTable {
    pub columns: Vec<String>,
    pub rows: Vec<BTreeMap<String, String>>,
}

impl LocalTable {
    pub fn from_merged(rows: &[MergedRow]) -> Self {
        Self {
            columns: DATASET_HEADER.iter().map(|h| h.to_string()).collect(),
            rows: rows.iter().map(MergedRow::to_columns).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// How a local cell is coerced before it is sent to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Text,
    Date,
    Number,
}

/// Coerce a raw cell. Blank cells yield `None`; unparseable dates and
/// numbers pass through as text.
pub fn coerce_cell(raw: &str, kind: CellKind) -> Option<JsonValue> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let value = match kind {
        CellKind::Text => JsonValue::String(raw.to_string()),
        CellKind::Date => JsonValue::String(canonical_date(raw).unwrap_or_else(|| raw.to_string())),
        CellKind::Number => parse_number(raw)
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(raw.to_string())),
    };
    Some(value)
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    ACCEPTED_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

pub fn canonical_date(raw: &str) -> Option<String> {
    parse_date(raw).map(|d| d.format(CANONICAL_DATE_FORMAT).to_string())
}

/// Parse a number, tolerating thousands separators.
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Integral amounts render without a fractional part.
pub fn format_amount(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Unwrap a single-element lookup array to its element.
pub fn normalize_single(value: &JsonValue) -> &JsonValue {
    match value {
        JsonValue::Array(items) if items.len() == 1 => &items[0],
        other => other,
    }
}

/// Null, whitespace-only text, and empty arrays count as absent.
pub fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        _ => false,
    }
}

pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
    }
}

/// First candidate that is present and not blank.
pub fn first_present<'a, I>(candidates: I) -> Option<&'a JsonValue>
where
    I: IntoIterator<Item = Option<&'a JsonValue>>,
{
    candidates
        .into_iter()
        .flatten()
        .map(normalize_single)
        .find(|v| !is_blank(v))
}

pub fn value_text(value: &JsonValue) -> Option<String> {
    match normalize_single(value) {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn value_number(value: &JsonValue) -> Option<f64> {
    match normalize_single(value) {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_number(s),
        _ => None,
    }
}

/// Store record identifiers carry a `rec` prefix.
pub fn looks_like_record_id(text: &str) -> bool {
    text.starts_with("rec")
}

pub fn is_record_id_list(value: &JsonValue) -> bool {
    match value {
        JsonValue::Array(items) => {
            !items.is_empty()
                && items
                    .iter()
                    .all(|v| v.as_str().map(looks_like_record_id).unwrap_or(false))
        }
        _ => false,
    }
}
