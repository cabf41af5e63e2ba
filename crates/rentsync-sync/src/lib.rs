//! Sync pipeline: fetch, merge, write the dataset, and push it to the store.

pub mod linked;
pub mod merge;
pub mod schema;
pub mod upsert;
pub mod write_policy;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rentsync_adapters::{
    BaselineAdapter, Canonicalizer, OverrideAdapter, SourceAdapter, Vocabulary, VocabularyError,
    OVERRIDE_DIAGNOSTIC_FIELDS,
};
use rentsync_core::{LocalTable, MergedRow, RemoteRecord};
use rentsync_storage::{
    fetch_all, write_dataset_atomic, write_snapshot, HttpRecordStore, ListQuery, RecordStore,
    SnapshotOutcome, StoreConfig, StoreError, WrittenDataset, DEFAULT_API_ROOT,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use linked::{
    sync_linked, FactTableConfig, LinkedEntityResolver, LinkedSyncConfig, LinkedSyncSummary,
    LinkedTable, ResolveError, DEFAULT_LINK_CONCURRENCY,
};
pub use merge::{merge_rows, MergeOutcome, OverridePivot, OverrideStats};
pub use schema::{probe_destination_fields, select_schema, SchemaMapping, SchemaMismatch, SchemaSelection};
pub use upsert::{build_upsert_record, UpsertSummary, UpsertSynchronizer};
pub use write_policy::{WriteOutcome, WritePayload, WritePolicy, WriteTarget};

pub const CRATE_NAME: &str = "rentsync-sync";

pub const DEFAULT_DATASET_PATH: &str = "data/panama_rent_averages.csv";
pub const DEFAULT_HISTORY_DIR: &str = "data/history";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{path} path is not configured; missing {keys:?}")]
    Missing { path: &'static str, keys: Vec<&'static str> },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("fetching {table}: {source}")]
    Fetch { table: String, source: StoreError },
    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatch),
    #[error("batch {batch_index} for {table} rejected with status {status}: {body}; first record: {first_record}")]
    BatchRejected {
        table: String,
        batch_index: usize,
        status: u16,
        body: String,
        first_record: String,
    },
    #[error("store transport failure: {0}")]
    Transport(StoreError),
    #[error(transparent)]
    Resolve(ResolveError),
    #[error(transparent)]
    Vocabulary(#[from] VocabularyError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub token: Option<String>,
    pub base: Option<String>,
    pub rents_table: Option<String>,
    pub rents_view: Option<String>,
    pub overrides_table: Option<String>,
    pub overrides_view: Option<String>,
    pub dest_table: Option<String>,
    pub cities_table: Option<String>,
    pub cities_primary: String,
    pub configs_table: Option<String>,
    pub configs_primary: String,
    pub facts_table: Option<String>,
    pub api_root: String,
    pub http_timeout_secs: u64,
    pub dataset_path: PathBuf,
    pub history_dir: PathBuf,
    pub vocabulary_path: Option<PathBuf>,
    pub link_concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTables {
    pub rents: String,
    pub rents_view: Option<String>,
    pub overrides: String,
    pub overrides_view: Option<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            token: get("AIRTABLE_TOKEN"),
            base: get("AIRTABLE_BASE"),
            rents_table: get("AIRTABLE_RENTS_TABLE"),
            rents_view: get("AIRTABLE_RENTS_VIEW"),
            overrides_table: get("AIRTABLE_OVERRIDES_TABLE"),
            overrides_view: get("AIRTABLE_OVERRIDES_VIEW"),
            dest_table: get("AIRTABLE_DEST_TABLE"),
            cities_table: get("AIRTABLE_CITIES_TABLE"),
            cities_primary: get("AIRTABLE_CITIES_PRIMARY").unwrap_or_else(|| "name".to_string()),
            configs_table: get("AIRTABLE_CONFIGS_TABLE"),
            configs_primary: get("AIRTABLE_CONFIGS_PRIMARY").unwrap_or_else(|| "label".to_string()),
            facts_table: get("AIRTABLE_FACTS_TABLE"),
            api_root: get("AIRTABLE_API_URL").unwrap_or_else(|| DEFAULT_API_ROOT.to_string()),
            http_timeout_secs: get("RENTSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
            dataset_path: get("RENTSYNC_DATASET_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATASET_PATH)),
            history_dir: get("RENTSYNC_HISTORY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HISTORY_DIR)),
            vocabulary_path: get("RENTSYNC_VOCABULARY").map(PathBuf::from),
            link_concurrency: get("RENTSYNC_LINK_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_LINK_CONCURRENCY),
        }
    }

    pub fn store_config(&self) -> Result<StoreConfig, ConfigError> {
        require("store", &[("AIRTABLE_TOKEN", &self.token), ("AIRTABLE_BASE", &self.base)])?;
        let mut config = StoreConfig::new(
            self.base.clone().unwrap_or_default(),
            self.token.clone().unwrap_or_default(),
        );
        config.api_root = self.api_root.clone();
        config.timeout = Duration::from_secs(self.http_timeout_secs);
        Ok(config)
    }

    pub fn source_tables(&self) -> Result<SourceTables, ConfigError> {
        require(
            "fetch",
            &[
                ("AIRTABLE_RENTS_TABLE", &self.rents_table),
                ("AIRTABLE_OVERRIDES_TABLE", &self.overrides_table),
            ],
        )?;
        Ok(SourceTables {
            rents: self.rents_table.clone().unwrap_or_default(),
            rents_view: self.rents_view.clone(),
            overrides: self.overrides_table.clone().unwrap_or_default(),
            overrides_view: self.overrides_view.clone(),
        })
    }

    pub fn upsert_target(&self) -> Result<String, ConfigError> {
        require("upsert", &[("AIRTABLE_DEST_TABLE", &self.dest_table)])?;
        Ok(self.dest_table.clone().unwrap_or_default())
    }

    pub fn linked_target(&self) -> Result<LinkedSyncConfig, ConfigError> {
        require(
            "linked",
            &[
                ("AIRTABLE_CITIES_TABLE", &self.cities_table),
                ("AIRTABLE_CONFIGS_TABLE", &self.configs_table),
                ("AIRTABLE_FACTS_TABLE", &self.facts_table),
            ],
        )?;
        Ok(LinkedSyncConfig {
            entities: LinkedTable::new(self.cities_table.clone().unwrap_or_default(), &self.cities_primary),
            configurations: LinkedTable::new(
                self.configs_table.clone().unwrap_or_default(),
                &self.configs_primary,
            ),
            facts: FactTableConfig::new(self.facts_table.clone().unwrap_or_default()),
            concurrency: self.link_concurrency,
        })
    }

    pub fn vocabulary(&self) -> Result<Vocabulary, VocabularyError> {
        match &self.vocabulary_path {
            Some(path) => Vocabulary::from_path(path),
            None => Ok(Vocabulary::default()),
        }
    }
}

fn require(path: &'static str, keys: &[(&'static str, &Option<String>)]) -> Result<(), ConfigError> {
    let missing: Vec<&'static str> = keys
        .iter()
        .filter(|(_, value)| value.is_none())
        .map(|(key, _)| *key)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Missing { path, keys: missing })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    pub snapshot: bool,
    pub force_snapshot: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            snapshot: true,
            force_snapshot: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergedDataset {
    pub baseline_rows: usize,
    pub overrides: OverrideStats,
    pub merge: MergeOutcome,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub merged: MergedDataset,
    pub written: WrittenDataset,
    pub snapshot: Option<SnapshotOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub baseline_rows: usize,
    pub overrides: OverrideStats,
    pub rows_with_overrides: usize,
    pub first_with_overrides: Option<MergedRow>,
    pub dataset_path: String,
    pub dataset_rows: usize,
    pub dataset_unchanged: bool,
    pub snapshot_path: Option<String>,
    pub upsert: Option<UpsertSummary>,
    pub linked: Option<LinkedSyncSummary>,
    /// Push paths left out for lack of configuration.
    pub skipped_paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub fetched: usize,
    pub skipped: usize,
    pub updated: usize,
    pub created: usize,
    pub failed: usize,
}

impl SyncRunSummary {
    pub fn counters(&self) -> RunCounters {
        let mut counters = RunCounters {
            fetched: self.baseline_rows + self.overrides.total,
            skipped: self.overrides.skipped,
            ..Default::default()
        };
        if let Some(upsert) = &self.upsert {
            counters.skipped += upsert.skipped_empty;
            counters.updated += upsert.updated;
            counters.created += upsert.created;
        }
        if let Some(linked) = &self.linked {
            counters.skipped += linked.skipped;
            counters.updated += linked.updated;
            counters.created += linked.created;
            counters.failed += linked.failed;
        }
        counters
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn RecordStore>,
    vocabulary: Vocabulary,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let store_config = config.store_config()?;
        let store = HttpRecordStore::new(store_config).context("building store client")?;
        Self::with_store(config, Arc::new(store))
    }

    pub fn with_store(config: SyncConfig, store: Arc<dyn RecordStore>) -> Result<Self> {
        let vocabulary = config.vocabulary().map_err(SyncError::from)?;
        Ok(Self {
            config,
            store,
            vocabulary,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Fetch both sources and reconcile them in memory.
    pub async fn fetch_and_merge(&self) -> Result<MergedDataset> {
        let tables = self.config.source_tables().map_err(SyncError::from)?;

        let baseline = BaselineAdapter
            .fetch(self.store.as_ref(), &tables.rents, tables.rents_view.clone())
            .instrument(info_span!("fetch", table = %tables.rents))
            .await
            .map_err(|source| SyncError::Fetch {
                table: tables.rents.clone(),
                source,
            })?;
        let drafts = OverrideAdapter
            .fetch(self.store.as_ref(), &tables.overrides, tables.overrides_view.clone())
            .instrument(info_span!("fetch", table = %tables.overrides))
            .await
            .map_err(|source| SyncError::Fetch {
                table: tables.overrides.clone(),
                source,
            })?;

        let canonicalizer = Canonicalizer::from_baseline(self.vocabulary.clone(), &baseline);
        let (pivot, overrides) = OverridePivot::build(&drafts, &canonicalizer);
        let merge = merge_rows(&baseline, &pivot);
        info!(
            baseline = baseline.len(),
            overrides = overrides.total,
            skipped = overrides.skipped,
            entities = pivot.entities(),
            rows_with_overrides = merge.rows_with_overrides,
            "merged sources"
        );

        Ok(MergedDataset {
            baseline_rows: baseline.len(),
            overrides,
            merge,
        })
    }

    /// Fetch, merge, and write the dataset plus its monthly snapshot.
    pub async fn export(&self, options: ExportOptions) -> Result<ExportSummary> {
        let merged = self.fetch_and_merge().await?;
        let rows = &merged.merge.rows;
        let written = write_dataset_atomic(&self.config.dataset_path, rows).await?;

        let snapshot = if options.snapshot {
            let stem = self
                .config
                .dataset_path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("dataset");
            let today = Utc::now().date_naive();
            Some(write_snapshot(&self.config.history_dir, stem, rows, today, options.force_snapshot).await?)
        } else {
            None
        };

        Ok(ExportSummary {
            merged,
            written,
            snapshot,
        })
    }

    /// Probe the destination, pick a schema, and upsert `rows` in batches.
    pub async fn push_upsert(&self, rows: &LocalTable) -> Result<UpsertSummary> {
        let table = self.config.upsert_target().map_err(SyncError::from)?;
        Ok(self.upsert_into(&table, rows).await?)
    }

    async fn upsert_into(&self, table: &str, rows: &LocalTable) -> Result<UpsertSummary, SyncError> {
        let destination = probe_destination_fields(self.store.as_ref(), table, schema::DEFAULT_PROBE_SAMPLE)
            .await
            .map_err(|source| SyncError::Fetch {
                table: table.to_string(),
                source,
            })?;
        let selection = select_schema(&rows.columns, &destination, &SchemaMapping::candidates())?;
        UpsertSynchronizer::new(self.store.as_ref())
            .sync(table, &selection, rows)
            .instrument(info_span!("upsert", table))
            .await
    }

    pub async fn push_linked(&self, rows: &LocalTable) -> Result<LinkedSyncSummary> {
        let target = self.config.linked_target().map_err(SyncError::from)?;
        Ok(sync_linked(Arc::clone(&self.store), &target, rows).await?)
    }

    /// Raw override records under the diagnostic projection.
    pub async fn inspect_overrides(&self, limit: usize) -> Result<Vec<RemoteRecord>> {
        let tables = self.config.source_tables().map_err(SyncError::from)?;
        let query = ListQuery::new()
            .view(tables.overrides_view.clone())
            .fields(OVERRIDE_DIAGNOSTIC_FIELDS)
            .max_records(limit.max(1));
        let records = fetch_all(self.store.as_ref(), &tables.overrides, query)
            .await
            .map_err(|source| SyncError::Fetch {
                table: tables.overrides.clone(),
                source,
            })?;
        Ok(records)
    }

    /// Export, then run every configured push path over the merged rows.
    pub async fn run_once(&self, options: ExportOptions) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        async move {
            let export = self.export(options).await?;
            let table = LocalTable::from_merged(&export.merged.merge.rows);
            let mut skipped_paths = Vec::new();

            let upsert = match self.config.upsert_target() {
                Ok(dest) => Some(self.upsert_into(&dest, &table).await?),
                Err(err) => {
                    warn!(error = %err, "skipping upsert path");
                    skipped_paths.push(err.to_string());
                    None
                }
            };
            let linked = match self.config.linked_target() {
                Ok(target) => Some(sync_linked(Arc::clone(&self.store), &target, &table).await?),
                Err(err) => {
                    warn!(error = %err, "skipping linked path");
                    skipped_paths.push(err.to_string());
                    None
                }
            };

            let snapshot_path = export.snapshot.as_ref().map(|s| match s {
                SnapshotOutcome::Written(p) | SnapshotOutcome::Kept(p) => p.display().to_string(),
            });
            let merged = export.merged;
            Ok::<_, anyhow::Error>(SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                baseline_rows: merged.baseline_rows,
                rows_with_overrides: merged.merge.rows_with_overrides,
                first_with_overrides: merged.merge.first_with_overrides().cloned(),
                overrides: merged.overrides,
                dataset_path: export.written.path.display().to_string(),
                dataset_rows: export.written.rows,
                dataset_unchanged: export.written.unchanged,
                snapshot_path,
                upsert,
                linked,
                skipped_paths,
            })
        }
        .instrument(info_span!("sync_run", %run_id))
        .await
    }
}

pub async fn run_sync_once_from_env(options: ExportOptions) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once(options).await
}
