//! Source adapters: decode baseline and override records into typed drafts.

pub mod canonical;

use async_trait::async_trait;
use rentsync_core::{
    first_present, is_record_id_list, is_truthy, looks_like_record_id, normalize_single,
    value_number, value_text, BaselineRow, Category, RemoteRecord,
};
use rentsync_storage::{ListQuery, RecordPager, RecordStore, StoreError};
use serde::Serialize;
use tracing::debug;

pub use canonical::{normalize_label, slug, Canonicalizer, Vocabulary, VocabularyError};

pub const CRATE_NAME: &str = "rentsync-adapters";

pub const BASELINE_FIELDS: [&str; 6] = [
    "effective_date",
    "city",
    "config_label",
    "bedrooms (from config_label)",
    "bathrooms (from config_label)",
    "average_price_usd",
];

/// The `category` field is a relation id, so the label comes from `key_city_category`.
pub const OVERRIDE_FIELDS: [&str; 8] = [
    "city",
    "city_link",
    "category",
    "key_city_category",
    "final_value_usd",
    "override_usd",
    "active",
    "effective_date",
];

/// Projection used when dumping raw override records for inspection.
pub const OVERRIDE_DIAGNOSTIC_FIELDS: [&str; 8] = [
    "city",
    "city_link",
    "category",
    "range_label (from category)",
    "final_value_usd",
    "override_usd",
    "active",
    "effective_date",
];

/// Override amount fields in precedence order: computed value, then manual entry.
pub const OVERRIDE_AMOUNT_FIELDS: [&str; 2] = ["final_value_usd", "override_usd"];

/// Why a source record did not make it into the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SkipReason {
    Inactive,
    MissingEntity,
    EntityIsRecordId,
    UnresolvedEntity,
    UnresolvedCategory,
    MissingLinkName,
    MissingDate,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::Inactive => "inactive",
            SkipReason::MissingEntity => "missing_entity",
            SkipReason::EntityIsRecordId => "entity_is_record_id",
            SkipReason::UnresolvedEntity => "unresolved_entity",
            SkipReason::UnresolvedCategory => "unresolved_category",
            SkipReason::MissingLinkName => "missing_link_name",
            SkipReason::MissingDate => "missing_date",
        }
    }
}

/// Override as read from the store, before canonicalization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverrideDraft {
    pub record_id: String,
    pub raw_entity: Option<String>,
    pub composite_key: String,
    pub amount: f64,
    pub active: bool,
}

/// Override keyed by canonical entity and category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalOverride {
    pub entity: String,
    pub category: Category,
    pub amount: f64,
}

impl OverrideDraft {
    pub fn canonicalize(&self, canonicalizer: &Canonicalizer) -> Result<CanonicalOverride, SkipReason> {
        if !self.active {
            return Err(SkipReason::Inactive);
        }
        let raw_entity = self.raw_entity.as_deref().ok_or(SkipReason::MissingEntity)?;
        if looks_like_record_id(raw_entity) {
            return Err(SkipReason::EntityIsRecordId);
        }
        let entity = canonicalizer
            .resolve_entity(raw_entity)
            .ok_or(SkipReason::UnresolvedEntity)?;
        let category = canonicalizer
            .parse_category(&self.composite_key)
            .ok_or(SkipReason::UnresolvedCategory)?;
        Ok(CanonicalOverride {
            entity: entity.to_string(),
            category,
            amount: self.amount,
        })
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    type Draft: Send;

    fn source_id(&self) -> &'static str;
    fn fields(&self) -> &'static [&'static str];
    fn decode(&self, record: &RemoteRecord) -> Self::Draft;

    /// Fetch every record of `table` in store order and decode it.
    async fn fetch(
        &self,
        store: &dyn RecordStore,
        table: &str,
        view: Option<String>,
    ) -> Result<Vec<Self::Draft>, StoreError> {
        let query = ListQuery::new()
            .view(view)
            .fields(self.fields().iter().copied());
        let mut pager = RecordPager::new(store, table, query);
        let mut drafts = Vec::new();
        while let Some(record) = pager.next().await? {
            drafts.push(self.decode(&record));
        }
        debug!(source = self.source_id(), table, records = drafts.len(), "decoded source");
        Ok(drafts)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BaselineAdapter;

impl SourceAdapter for BaselineAdapter {
    type Draft = BaselineRow;

    fn source_id(&self) -> &'static str {
        "baseline"
    }

    fn fields(&self) -> &'static [&'static str] {
        &BASELINE_FIELDS
    }

    fn decode(&self, record: &RemoteRecord) -> BaselineRow {
        BaselineRow {
            date: record.field("effective_date").and_then(value_text).unwrap_or_default(),
            entity: record.field("city").and_then(value_text).unwrap_or_default(),
            configuration: compute_configuration(record),
            price: record
                .field("average_price_usd")
                .and_then(value_number)
                .unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OverrideAdapter;

impl SourceAdapter for OverrideAdapter {
    type Draft = OverrideDraft;

    fn source_id(&self) -> &'static str {
        "overrides"
    }

    fn fields(&self) -> &'static [&'static str] {
        &OVERRIDE_FIELDS
    }

    fn decode(&self, record: &RemoteRecord) -> OverrideDraft {
        let raw_entity = first_present([record.field("city"), record.field("city_link")])
            .and_then(value_text)
            .filter(|s| !s.is_empty());
        OverrideDraft {
            record_id: record.id.clone(),
            raw_entity,
            composite_key: record
                .field("key_city_category")
                .and_then(value_text)
                .unwrap_or_default(),
            amount: override_amount(record),
            // Absent flag means active.
            active: record.field("active").map(is_truthy).unwrap_or(true),
        }
    }
}

/// First present amount field in `OVERRIDE_AMOUNT_FIELDS` order, else zero.
pub fn override_amount(record: &RemoteRecord) -> f64 {
    let Some(value) = first_present(OVERRIDE_AMOUNT_FIELDS.iter().map(|f| record.field(f))) else {
        return 0.0;
    };
    value_number(value).unwrap_or_else(|| {
        debug!(record = %record.id, ?value, "override amount is not numeric; using zero");
        0.0
    })
}

/// Configuration label; linked configurations are rebuilt from their lookups.
pub fn compute_configuration(record: &RemoteRecord) -> String {
    let Some(raw) = record.fields.get("config_label") else {
        return String::new();
    };
    if is_record_id_list(raw) {
        let beds = record.field("bedrooms (from config_label)").and_then(value_text);
        let baths = record.field("bathrooms (from config_label)").and_then(value_text);
        return match (beds, baths) {
            (Some(beds), Some(baths)) if !beds.is_empty() && !baths.is_empty() => {
                format!("{beds} BR / {baths} BA")
            }
            _ => String::new(),
        };
    }
    value_text(normalize_single(raw)).unwrap_or_default()
}
