//! Field-mapping schemas and detection of the one a destination table uses.

use std::collections::BTreeSet;
use std::fmt;

use rentsync_core::{
    CellKind, Category, CONFIGURATION_COLUMN, DATE_COLUMN, ENTITY_COLUMN, PRICE_COLUMN,
};
use rentsync_storage::{ListQuery, RecordPager, RecordStore, StoreError};
use serde::Serialize;
use tracing::{info, warn};

/// Records read from the destination to learn its field names.
pub const DEFAULT_PROBE_SAMPLE: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaMapping {
    pub name: &'static str,
    /// Local column -> remote field, in write order.
    pub columns: Vec<(String, String)>,
    /// Local columns whose values identify a remote record.
    pub merge_keys: Vec<String>,
    pub numeric_columns: Vec<String>,
    pub date_columns: Vec<String>,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl SchemaMapping {
    /// One remote column per dataset column, named identically.
    pub fn wide() -> Self {
        let mut columns: Vec<(String, String)> = [DATE_COLUMN, ENTITY_COLUMN, CONFIGURATION_COLUMN, PRICE_COLUMN]
            .iter()
            .map(|c| (c.to_string(), c.to_string()))
            .collect();
        columns.extend(Category::ALL.iter().map(|c| (c.label().to_string(), c.label().to_string())));

        let mut numeric_columns = owned(&[PRICE_COLUMN]);
        numeric_columns.extend(Category::ALL.iter().map(|c| c.label().to_string()));

        Self {
            name: "wide",
            columns,
            merge_keys: owned(&[DATE_COLUMN, ENTITY_COLUMN, CONFIGURATION_COLUMN]),
            numeric_columns,
            date_columns: owned(&[DATE_COLUMN]),
        }
    }

    /// Rent-only table keyed by a range label with a single value column.
    pub fn narrow() -> Self {
        Self {
            name: "narrow",
            columns: vec![
                (DATE_COLUMN.to_string(), "effective_date".to_string()),
                (ENTITY_COLUMN.to_string(), "city".to_string()),
                (CONFIGURATION_COLUMN.to_string(), "range_label".to_string()),
                (PRICE_COLUMN.to_string(), "value_usd".to_string()),
            ],
            merge_keys: owned(&[DATE_COLUMN, ENTITY_COLUMN, CONFIGURATION_COLUMN]),
            numeric_columns: owned(&[PRICE_COLUMN]),
            date_columns: owned(&[DATE_COLUMN]),
        }
    }

    /// Candidates in preference order.
    pub fn candidates() -> Vec<SchemaMapping> {
        vec![Self::wide(), Self::narrow()]
    }

    pub fn required_columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(local, _)| local.as_str())
    }

    pub fn remote_field(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(local, _)| local == column)
            .map(|(_, remote)| remote.as_str())
    }

    /// Remote names of the merge-key columns, as sent in `fieldsToMergeOn`.
    pub fn merge_fields(&self) -> Vec<String> {
        self.merge_keys
            .iter()
            .filter_map(|k| self.remote_field(k))
            .map(str::to_string)
            .collect()
    }

    pub fn cell_kind(&self, column: &str) -> CellKind {
        if self.date_columns.iter().any(|c| c == column) {
            CellKind::Date
        } else if self.numeric_columns.iter().any(|c| c == column) {
            CellKind::Number
        } else {
            CellKind::Text
        }
    }

    fn satisfied_locally(&self, local: &BTreeSet<&str>) -> bool {
        self.required_columns().all(|c| local.contains(c))
    }

    fn accepted_by(&self, destination: &BTreeSet<String>) -> bool {
        destination.is_empty() || self.merge_fields().iter().all(|f| destination.contains(f))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateRequirement {
    pub name: &'static str,
    pub required_columns: Vec<String>,
    pub merge_fields: Vec<String>,
}

impl fmt::Display for CandidateRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (columns: {}; merge fields: {})",
            self.name,
            self.required_columns.join(", "),
            self.merge_fields.join(", ")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaMismatch {
    pub local_columns: Vec<String>,
    pub destination_fields: Vec<String>,
    pub candidates: Vec<CandidateRequirement>,
}

impl fmt::Display for SchemaMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no schema fits: local columns [{}], destination fields [{}], candidates: {}",
            self.local_columns.join(", "),
            self.destination_fields.join(", "),
            self.candidates
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" | ")
        )
    }
}

impl std::error::Error for SchemaMismatch {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSelection {
    pub mapping: SchemaMapping,
    /// Preferred schema that fit locally but not the destination's merge keys.
    pub downgraded_from: Option<&'static str>,
}

/// Pick the first candidate whose columns exist locally and whose merge keys
/// exist in the destination (or the destination has no fields yet).
pub fn select_schema(
    local_columns: &[String],
    destination_fields: &BTreeSet<String>,
    candidates: &[SchemaMapping],
) -> Result<SchemaSelection, SchemaMismatch> {
    let local: BTreeSet<&str> = local_columns.iter().map(String::as_str).collect();

    let chosen = candidates
        .iter()
        .find(|c| c.satisfied_locally(&local) && c.accepted_by(destination_fields));

    let Some(chosen) = chosen else {
        return Err(SchemaMismatch {
            local_columns: local_columns.to_vec(),
            destination_fields: destination_fields.iter().cloned().collect(),
            candidates: candidates
                .iter()
                .map(|c| CandidateRequirement {
                    name: c.name,
                    required_columns: c.required_columns().map(str::to_string).collect(),
                    merge_fields: c.merge_fields(),
                })
                .collect(),
        });
    };

    let downgraded_from = candidates
        .first()
        .filter(|preferred| preferred.name != chosen.name && preferred.satisfied_locally(&local))
        .map(|preferred| preferred.name);

    match downgraded_from {
        Some(preferred) => warn!(
            chosen = chosen.name,
            preferred,
            "destination lacks the preferred schema's merge fields; downgrading"
        ),
        None => info!(chosen = chosen.name, "selected schema"),
    }

    Ok(SchemaSelection {
        mapping: chosen.clone(),
        downgraded_from,
    })
}

/// Union of field names seen in a small sample of the destination.
pub async fn probe_destination_fields(
    store: &dyn RecordStore,
    table: &str,
    sample: usize,
) -> Result<BTreeSet<String>, StoreError> {
    let mut pager = RecordPager::new(store, table, ListQuery::new().max_records(sample.max(1)));
    let mut fields = BTreeSet::new();
    while let Some(record) = pager.next().await? {
        fields.extend(record.fields.keys().cloned());
    }
    Ok(fields)
}
