//! Parent-record resolution and fact sync for the relational destination.
//!
//! Parents (cities, configurations) are looked up by their primary field and
//! created on a miss. Each (table, name) pair is resolved at most once per
//! resolver; concurrent callers for the same pair share the same lookup.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rentsync_adapters::SkipReason;
use rentsync_core::{
    canonical_date, parse_number, Category, FieldMap, LocalTable, CONFIGURATION_COLUMN,
    DATE_COLUMN, ENTITY_COLUMN, PRICE_COLUMN,
};
use rentsync_storage::{fetch_all, Formula, ListQuery, RecordStore, StoreError};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::write_policy::{WriteOutcome, WritePayload, WritePolicy, WriteTarget};
use crate::SyncError;

pub const DEFAULT_LINK_CONCURRENCY: usize = 4;

/// A parent table keyed by the text of its primary field.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedTable {
    pub table: String,
    pub primary_field: String,
    /// Sent on create when the table accepts them.
    pub defaults: FieldMap,
}

impl LinkedTable {
    pub fn new(table: impl Into<String>, primary_field: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            primary_field: primary_field.into(),
            defaults: FieldMap::new(),
        }
    }

    pub fn with_defaults(mut self, defaults: FieldMap) -> Self {
        self.defaults = defaults;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactTableConfig {
    pub table: String,
    pub entity_field: String,
    pub configuration_field: String,
    pub date_field: String,
    pub price_field: String,
    pub defaults: FieldMap,
}

impl FactTableConfig {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            entity_field: "city".into(),
            configuration_field: "configuration".into(),
            date_field: "date".into(),
            price_field: "average_price_usd".into(),
            defaults: FieldMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkedSyncConfig {
    pub entities: LinkedTable,
    pub configurations: LinkedTable,
    pub facts: FactTableConfig,
    pub concurrency: usize,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("looking up {name:?} in {table}: {source}")]
    Lookup {
        table: String,
        name: String,
        source: StoreError,
    },
    #[error("creating {name:?} in {table} was rejected: {reason}")]
    CreateFailed {
        table: String,
        name: String,
        reason: String,
    },
    #[error("creating {name:?} in {table}: {source}")]
    Transport {
        table: String,
        name: String,
        source: StoreError,
    },
    #[error("resolver worker failed: {0}")]
    Worker(String),
}

impl ResolveError {
    /// A rejected create only costs the rows that reference it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ResolveError::CreateFailed { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStats {
    pub lookups: usize,
    pub created: usize,
    pub degraded: usize,
    pub failed: usize,
}

type CacheKey = (String, String);
/// `Err` holds the rejection reason of a create; it is cached like a success.
type CacheSlot = Arc<OnceCell<Result<String, String>>>;

pub struct LinkedEntityResolver {
    store: Arc<dyn RecordStore>,
    policy: WritePolicy,
    cache: Mutex<HashMap<CacheKey, CacheSlot>>,
    lookups: AtomicUsize,
    created: AtomicUsize,
    degraded: AtomicUsize,
    failed: AtomicUsize,
}

impl LinkedEntityResolver {
    pub fn new(store: Arc<dyn RecordStore>, policy: WritePolicy) -> Self {
        Self {
            store,
            policy,
            cache: Mutex::new(HashMap::new()),
            lookups: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            degraded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            lookups: self.lookups.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub async fn cached_keys(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Identifier of the record in `parent` whose primary field equals `name`,
    /// creating it when absent.
    pub async fn resolve_or_create(&self, parent: &LinkedTable, name: &str) -> Result<String, ResolveError> {
        let slot = {
            let mut cache = self.cache.lock().await;
            cache
                .entry((parent.table.clone(), name.to_string()))
                .or_default()
                .clone()
        };
        // Fatal errors leave the cell empty so a later call may retry.
        let resolved = slot.get_or_try_init(|| self.lookup_or_create(parent, name)).await?;
        resolved.clone().map_err(|reason| ResolveError::CreateFailed {
            table: parent.table.clone(),
            name: name.to_string(),
            reason,
        })
    }

    async fn lookup_or_create(
        &self,
        parent: &LinkedTable,
        name: &str,
    ) -> Result<Result<String, String>, ResolveError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let query = ListQuery::new()
            .filter(Formula::field_equals(&parent.primary_field, name))
            .max_records(1);
        let found = fetch_all(self.store.as_ref(), &parent.table, query)
            .await
            .map_err(|source| ResolveError::Lookup {
                table: parent.table.clone(),
                name: name.to_string(),
                source,
            })?;
        if let Some(record) = found.into_iter().next() {
            debug!(table = %parent.table, name, id = %record.id, "parent found");
            return Ok(Ok(record.id));
        }

        let mut mandatory = FieldMap::new();
        mandatory.insert(parent.primary_field.clone(), JsonValue::String(name.to_string()));
        let payload = WritePayload::new(mandatory).with_optional(parent.defaults.clone());
        let outcome = self
            .policy
            .write(self.store.as_ref(), &parent.table, WriteTarget::Create, &payload)
            .await
            .map_err(|source| ResolveError::Transport {
                table: parent.table.clone(),
                name: name.to_string(),
                source,
            })?;

        Ok(match outcome {
            WriteOutcome::Written(id) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                info!(table = %parent.table, name, %id, "parent created");
                Ok(id)
            }
            WriteOutcome::WrittenMinimal(id) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                self.degraded.fetch_add(1, Ordering::Relaxed);
                info!(table = %parent.table, name, %id, "parent created without defaults");
                Ok(id)
            }
            WriteOutcome::Failed(reason) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(table = %parent.table, name, %reason, "parent create rejected");
                Err(reason)
            }
        })
    }

    /// Resolve every distinct request on at most `concurrency` workers.
    /// Rejected creates stay cached for the rows to report; fatal errors abort.
    pub async fn resolve_all(
        self: &Arc<Self>,
        requests: Vec<(LinkedTable, String)>,
        concurrency: usize,
    ) -> Result<usize, ResolveError> {
        let mut seen = BTreeSet::new();
        let distinct: Vec<(LinkedTable, String)> = requests
            .into_iter()
            .filter(|(parent, name)| seen.insert((parent.table.clone(), name.clone())))
            .collect();
        let total = distinct.len();

        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut workers = JoinSet::new();
        for (parent, name) in distinct {
            let resolver = Arc::clone(self);
            let permits = Arc::clone(&permits);
            workers.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|err| ResolveError::Worker(err.to_string()))?;
                resolver.resolve_or_create(&parent, &name).await.map(|_| ())
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) if !err.is_fatal() => {}
                Ok(Err(err)) => {
                    workers.abort_all();
                    return Err(err);
                }
                Err(err) => {
                    workers.abort_all();
                    return Err(ResolveError::Worker(err.to_string()));
                }
            }
        }
        debug!(keys = total, "parents resolved");
        Ok(total)
    }
}

/// One dataset row prepared for the fact table.
#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub entity: String,
    pub configuration: String,
    /// `YYYY-MM-DD`
    pub date: String,
    pub price: Option<f64>,
    pub amounts: BTreeMap<Category, f64>,
}

impl FactRow {
    pub fn from_columns(row: &BTreeMap<String, String>) -> Result<Self, SkipReason> {
        let cell = |name: &str| row.get(name).map(|v| v.trim()).unwrap_or_default();
        let entity = cell(ENTITY_COLUMN);
        let configuration = cell(CONFIGURATION_COLUMN);
        if entity.is_empty() || configuration.is_empty() {
            return Err(SkipReason::MissingLinkName);
        }
        let date = canonical_date(cell(DATE_COLUMN)).ok_or(SkipReason::MissingDate)?;
        let amounts = Category::ALL
            .iter()
            .filter_map(|c| parse_number(cell(c.label())).map(|v| (*c, v)))
            .collect();
        Ok(Self {
            entity: entity.to_string(),
            configuration: configuration.to_string(),
            date,
            price: parse_number(cell(PRICE_COLUMN)),
            amounts,
        })
    }

    fn lookup_formula(&self, facts: &FactTableConfig) -> Formula {
        Formula::And(vec![
            Formula::LinkedTextEquals {
                field: facts.entity_field.clone(),
                value: self.entity.clone(),
            },
            Formula::LinkedTextEquals {
                field: facts.configuration_field.clone(),
                value: self.configuration.clone(),
            },
            Formula::DateEquals {
                field: facts.date_field.clone(),
                date: self.date.clone(),
            },
        ])
    }

    /// Links, date, and price are mandatory; category amounts and defaults are optional.
    fn payload(&self, facts: &FactTableConfig, entity_id: &str, configuration_id: &str) -> WritePayload {
        let mut mandatory = FieldMap::new();
        mandatory.insert(facts.entity_field.clone(), json!([entity_id]));
        mandatory.insert(facts.configuration_field.clone(), json!([configuration_id]));
        mandatory.insert(facts.date_field.clone(), JsonValue::String(self.date.clone()));
        if let Some(price) = self.price {
            mandatory.insert(facts.price_field.clone(), json!(price));
        }

        let mut optional = facts.defaults.clone();
        for (category, amount) in &self.amounts {
            optional.insert(category.label().to_string(), json!(amount));
        }
        WritePayload::new(mandatory).with_optional(optional)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkedSyncSummary {
    pub rows: usize,
    pub skipped: usize,
    pub skipped_by_reason: BTreeMap<SkipReason, usize>,
    pub parents: ResolverStats,
    pub created: usize,
    pub updated: usize,
    pub degraded: usize,
    pub failed: usize,
}

/// Resolve parents up front, then write facts one row at a time in row order.
/// Per-row rejections are counted; lookup and transport failures abort.
pub async fn sync_linked(
    store: Arc<dyn RecordStore>,
    config: &LinkedSyncConfig,
    rows: &LocalTable,
) -> Result<LinkedSyncSummary, SyncError> {
    let policy = WritePolicy::default();
    let resolver = Arc::new(LinkedEntityResolver::new(Arc::clone(&store), policy));
    let facts = &config.facts;
    let mut summary = LinkedSyncSummary {
        rows: rows.len(),
        ..Default::default()
    };

    let mut prepared = Vec::with_capacity(rows.len());
    for row in &rows.rows {
        match FactRow::from_columns(row) {
            Ok(fact) => prepared.push(fact),
            Err(reason) => {
                debug!(reason = reason.as_str(), "fact row skipped");
                summary.skipped += 1;
                *summary.skipped_by_reason.entry(reason).or_default() += 1;
            }
        }
    }

    let requests = prepared
        .iter()
        .flat_map(|fact| {
            [
                (config.entities.clone(), fact.entity.clone()),
                (config.configurations.clone(), fact.configuration.clone()),
            ]
        })
        .collect();
    resolver
        .resolve_all(requests, config.concurrency)
        .await
        .map_err(SyncError::Resolve)?;

    for fact in &prepared {
        let ids = match resolve_pair(&resolver, config, fact).await {
            Ok(ids) => ids,
            Err(err) if !err.is_fatal() => {
                warn!(entity = %fact.entity, configuration = %fact.configuration, error = %err, "fact skipped: parent unavailable");
                summary.failed += 1;
                continue;
            }
            Err(err) => return Err(SyncError::Resolve(err)),
        };

        let query = ListQuery::new().filter(fact.lookup_formula(facts)).max_records(1);
        let existing = fetch_all(store.as_ref(), &facts.table, query)
            .await
            .map_err(|source| SyncError::Fetch {
                table: facts.table.clone(),
                source,
            })?;
        let existing_id = existing.first().map(|r| r.id.clone());
        let target = match existing_id.as_deref() {
            Some(id) => WriteTarget::Update(id),
            None => WriteTarget::Create,
        };

        let payload = fact.payload(facts, &ids.0, &ids.1);
        let outcome = policy
            .write(store.as_ref(), &facts.table, target, &payload)
            .await
            .map_err(SyncError::Transport)?;
        match outcome {
            WriteOutcome::Failed(reason) => {
                warn!(entity = %fact.entity, date = %fact.date, %reason, "fact write rejected");
                summary.failed += 1;
                continue;
            }
            WriteOutcome::WrittenMinimal(_) => summary.degraded += 1,
            WriteOutcome::Written(_) => {}
        }
        match target {
            WriteTarget::Update(_) => summary.updated += 1,
            WriteTarget::Create => summary.created += 1,
        }
    }

    summary.parents = resolver.stats();
    info!(
        table = %facts.table,
        created = summary.created,
        updated = summary.updated,
        degraded = summary.degraded,
        failed = summary.failed,
        skipped = summary.skipped,
        "linked sync complete"
    );
    Ok(summary)
}

async fn resolve_pair(
    resolver: &LinkedEntityResolver,
    config: &LinkedSyncConfig,
    fact: &FactRow,
) -> Result<(String, String), ResolveError> {
    let entity = resolver.resolve_or_create(&config.entities, &fact.entity).await?;
    let configuration = resolver
        .resolve_or_create(&config.configurations, &fact.configuration)
        .await?;
    Ok((entity, configuration))
}
