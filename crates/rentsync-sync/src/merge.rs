//! Reconciliation of baseline rows with canonical overrides.

use std::collections::{BTreeMap, BTreeSet};

use rentsync_adapters::{Canonicalizer, OverrideDraft, SkipReason};
use rentsync_core::{BaselineRow, Category, CategoryAmounts, MergedRow};
use serde::Serialize;
use tracing::debug;

const KEY_SAMPLE_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, Serialize)]
pub struct OverrideStats {
    pub total: usize,
    pub skipped: usize,
    pub skipped_by_reason: BTreeMap<SkipReason, usize>,
    pub raw_entity_labels: BTreeSet<String>,
    pub canonical_entities: BTreeSet<String>,
    pub composite_key_samples: BTreeSet<String>,
}

impl OverrideStats {
    fn skip(&mut self, reason: SkipReason) {
        self.skipped += 1;
        *self.skipped_by_reason.entry(reason).or_default() += 1;
    }
}

/// Canonical entity -> category -> amount. Later overrides replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverridePivot {
    by_entity: BTreeMap<String, BTreeMap<Category, f64>>,
}

impl OverridePivot {
    /// Fold drafts in source order, so the last override per (entity, category) wins.
    pub fn build(drafts: &[OverrideDraft], canonicalizer: &Canonicalizer) -> (Self, OverrideStats) {
        let mut pivot = Self::default();
        let mut stats = OverrideStats::default();

        for draft in drafts {
            stats.total += 1;
            if let Some(raw) = draft.raw_entity.as_deref().filter(|_| draft.active) {
                stats.raw_entity_labels.insert(raw.to_string());
            }
            if draft.active
                && !draft.composite_key.is_empty()
                && stats.composite_key_samples.len() < KEY_SAMPLE_LIMIT
            {
                stats.composite_key_samples.insert(draft.composite_key.clone());
            }

            match draft.canonicalize(canonicalizer) {
                Ok(found) => {
                    stats.canonical_entities.insert(found.entity.clone());
                    pivot.insert(found.entity, found.category, found.amount);
                }
                Err(reason) => {
                    if reason == SkipReason::UnresolvedEntity {
                        let label = draft.raw_entity.as_deref().unwrap_or_default();
                        let nearest = canonicalizer.closest_entity(label);
                        debug!(record = %draft.record_id, label, ?nearest, "override entity unresolved");
                    } else {
                        debug!(record = %draft.record_id, reason = reason.as_str(), "override skipped");
                    }
                    stats.skip(reason);
                }
            }
        }

        (pivot, stats)
    }

    pub fn insert(&mut self, entity: String, category: Category, amount: f64) {
        self.by_entity.entry(entity).or_default().insert(category, amount);
    }

    pub fn get(&self, entity: &str) -> Option<&BTreeMap<Category, f64>> {
        self.by_entity.get(entity)
    }

    pub fn entities(&self) -> usize {
        self.by_entity.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub rows: Vec<MergedRow>,
    pub rows_with_overrides: usize,
}

impl MergeOutcome {
    pub fn first_with_overrides(&self) -> Option<&MergedRow> {
        self.rows.iter().find(|r| r.amounts.any_nonzero())
    }
}

/// One merged row per baseline row; categories without an override are zero.
pub fn merge_rows(baseline: &[BaselineRow], pivot: &OverridePivot) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    for row in baseline {
        let mut amounts = CategoryAmounts::default();
        if let Some(overrides) = pivot.get(row.entity.trim()) {
            for (category, amount) in overrides {
                amounts.set(*category, *amount);
            }
        }
        if amounts.any_nonzero() {
            outcome.rows_with_overrides += 1;
        }
        outcome.rows.push(MergedRow::from_baseline(row, amounts));
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use rentsync_adapters::Vocabulary;

    fn baseline(date: &str, entity: &str, configuration: &str, price: f64) -> BaselineRow {
        BaselineRow {
            date: date.into(),
            entity: entity.into(),
            configuration: configuration.into(),
            price,
        }
    }

    fn draft(id: &str, entity: &str, key: &str, amount: f64, active: bool) -> OverrideDraft {
        OverrideDraft {
            record_id: id.into(),
            raw_entity: Some(entity.into()),
            composite_key: key.into(),
            amount,
            active,
        }
    }

    fn canonicalizer(rows: &[BaselineRow]) -> Canonicalizer {
        Canonicalizer::from_baseline(Vocabulary::default(), rows)
    }

    #[test]
    fn end_to_end_row_carries_groceries_override() {
        let rows = vec![baseline("2025-05-01", "Panama City", "2 BR / 1 BA", 950.0)];
        let drafts = vec![draft("rec1", "Panama City", "Panama City | Groceries", 300.0, true)];
        let (pivot, stats) = OverridePivot::build(&drafts, &canonicalizer(&rows));
        let merged = merge_rows(&rows, &pivot);

        assert_eq!(stats.total, 1);
        assert_eq!(stats.skipped, 0);
        assert_eq!(merged.rows_with_overrides, 1);
        let row = &merged.rows[0];
        assert_eq!(row.date, "2025-05-01");
        assert_eq!(row.entity, "Panama City");
        assert_eq!(row.configuration, "2 BR / 1 BA");
        assert_eq!(row.price, 950.0);
        for category in Category::ALL {
            let expected = if category == Category::Groceries { 300.0 } else { 0.0 };
            assert_eq!(row.amounts.get(category), expected, "{category}");
        }
    }

    #[test]
    fn last_override_for_same_key_wins() {
        let rows = vec![baseline("2025-05-01", "Boquete", "1 BR / 1 BA", 700.0)];
        let drafts = vec![
            draft("rec1", "Boquete", "Boquete | Internet", 100.0, true),
            draft("rec2", "boquete", "Boquete | internet", 150.0, true),
        ];
        let (pivot, _) = OverridePivot::build(&drafts, &canonicalizer(&rows));
        let merged = merge_rows(&rows, &pivot);
        assert_eq!(merged.rows[0].amounts.get(Category::Internet), 150.0);
    }

    #[test]
    fn inactive_and_unresolved_overrides_never_reach_rows() {
        let rows = vec![
            baseline("2025-05-01", "Panama City", "2 BR / 1 BA", 950.0),
            baseline("2025-05-01", "Panama City", "Studio", 600.0),
        ];
        let drafts = vec![
            draft("rec1", "Panama City", "Panama City | Dining", 80.0, false),
            draft("rec2", "Coronado", "Coronado | Dining", 90.0, true),
            draft("rec3", "Avenida Balboa", "Avenida Balboa | Mystery", 10.0, true),
        ];
        let (pivot, stats) = OverridePivot::build(&drafts, &canonicalizer(&rows));
        let merged = merge_rows(&rows, &pivot);

        assert_eq!(stats.total, 3);
        assert_eq!(stats.skipped, 3);
        assert_eq!(stats.skipped_by_reason[&SkipReason::Inactive], 1);
        assert_eq!(stats.skipped_by_reason[&SkipReason::UnresolvedEntity], 1);
        assert_eq!(stats.skipped_by_reason[&SkipReason::UnresolvedCategory], 1);
        assert_eq!(pivot.entities(), 0);
        assert_eq!(merged.rows_with_overrides, 0);
        assert!(merged.rows.iter().all(|r| !r.amounts.any_nonzero()));
        assert_eq!(merged.rows.len(), 2);
    }

    #[test]
    fn alias_override_applies_to_every_configuration_of_parent() {
        let rows = vec![
            baseline("2025-05-01", "Panama City", "2 BR / 1 BA", 950.0),
            baseline("2025-05-01", "Panama City", "Studio", 600.0),
            baseline("2025-05-01", "David", "Studio", 400.0),
        ];
        let drafts = vec![draft("rec1", "Casco Viejo", "Casco Viejo | Utilities", 120.0, true)];
        let (pivot, stats) = OverridePivot::build(&drafts, &canonicalizer(&rows));
        let merged = merge_rows(&rows, &pivot);

        assert_eq!(merged.rows_with_overrides, 2);
        assert_eq!(merged.rows[2].amounts.get(Category::Utilities), 0.0);
        assert_eq!(
            stats.canonical_entities.iter().collect::<Vec<_>>(),
            vec!["Panama City"]
        );
        assert_eq!(merged.first_with_overrides().map(|r| r.configuration.as_str()), Some("2 BR / 1 BA"));
    }
}
