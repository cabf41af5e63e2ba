//! Batched upsert of local rows under a selected schema.

use std::collections::BTreeMap;

use rentsync_core::{coerce_cell, FieldMap, LocalTable};
use rentsync_storage::{RecordStore, StoreError, MAX_RECORDS_PER_REQUEST};
use serde::Serialize;
use tracing::{debug, info, info_span, Instrument};

use crate::schema::{SchemaMapping, SchemaSelection};
use crate::SyncError;

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpsertSummary {
    pub table: String,
    pub schema: String,
    pub downgraded_from: Option<String>,
    pub rows: usize,
    pub skipped_empty: usize,
    pub batches: usize,
    pub created: usize,
    pub updated: usize,
}

/// Destination fields for one row; blank cells and unmapped columns are left out.
pub fn build_upsert_record(row: &BTreeMap<String, String>, mapping: &SchemaMapping) -> FieldMap {
    let mut fields = FieldMap::new();
    for (column, remote) in &mapping.columns {
        let Some(raw) = row.get(column) else {
            continue;
        };
        if let Some(value) = coerce_cell(raw, mapping.cell_kind(column)) {
            fields.insert(remote.clone(), value);
        }
    }
    fields
}

pub struct UpsertSynchronizer<'a> {
    store: &'a dyn RecordStore,
    batch_size: usize,
}

impl<'a> UpsertSynchronizer<'a> {
    pub fn new(store: &'a dyn RecordStore) -> Self {
        Self {
            store,
            batch_size: MAX_RECORDS_PER_REQUEST,
        }
    }

    /// Smaller batches are allowed; larger ones are clamped to the store limit.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_RECORDS_PER_REQUEST);
        self
    }

    /// Upsert every row; the first rejected batch aborts the run.
    pub async fn sync(
        &self,
        table: &str,
        selection: &SchemaSelection,
        rows: &LocalTable,
    ) -> Result<UpsertSummary, SyncError> {
        let mapping = &selection.mapping;
        let merge_on = mapping.merge_fields();
        let mut summary = UpsertSummary {
            table: table.to_string(),
            schema: mapping.name.to_string(),
            downgraded_from: selection.downgraded_from.map(str::to_string),
            rows: rows.len(),
            ..Default::default()
        };

        let records: Vec<FieldMap> = rows
            .rows
            .iter()
            .map(|row| build_upsert_record(row, mapping))
            .filter(|fields| {
                let keep = !fields.is_empty();
                if !keep {
                    summary.skipped_empty += 1;
                }
                keep
            })
            .collect();

        for (batch_index, batch) in records.chunks(self.batch_size).enumerate() {
            let span = info_span!("upsert_batch", table, batch_index, records = batch.len());
            let result = self
                .store
                .upsert(table, &merge_on, batch)
                .instrument(span)
                .await
                .map_err(|err| batch_error(table, batch_index, batch, err))?;
            summary.batches += 1;
            summary.created += result.created_records.len();
            summary.updated += result.updated_records.len();
            debug!(
                batch_index,
                created = result.created_records.len(),
                updated = result.updated_records.len(),
                "batch applied"
            );
        }

        info!(
            table,
            schema = mapping.name,
            batches = summary.batches,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped_empty,
            "upsert complete"
        );
        Ok(summary)
    }
}

fn batch_error(table: &str, batch_index: usize, batch: &[FieldMap], err: StoreError) -> SyncError {
    match err {
        StoreError::Status { status, body, .. } => SyncError::BatchRejected {
            table: table.to_string(),
            batch_index,
            status,
            body,
            first_record: batch
                .first()
                .and_then(|r| serde_json::to_string(r).ok())
                .unwrap_or_default(),
        },
        other => SyncError::Transport(other),
    }
}
