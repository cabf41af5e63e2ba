//! In-memory `RecordStore` for exercising sync paths without a network.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rentsync_core::{canonical_date, FieldMap, RemoteRecord};
use rentsync_storage::{Formula, ListQuery, RecordPage, RecordStore, StoreError, UpsertResult};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    List { table: String, filtered: bool },
    Create { table: String, fields: Vec<String> },
    Update { table: String, id: String },
    Upsert { table: String, records: usize },
}

#[derive(Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<RemoteRecord>>,
    primary_fields: BTreeMap<String, String>,
    rejected_fields: BTreeSet<String>,
    rejected_upsert_tables: BTreeSet<String>,
    failing_list_tables: BTreeSet<String>,
    write_failure_status: Option<u16>,
    next_id: usize,
    calls: Vec<Call>,
}

pub(crate) struct MemoryStore {
    state: Mutex<MemoryState>,
    page_size: usize,
    latency: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_page_size(100)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            page_size,
            latency: Duration::ZERO,
        }
    }

    /// Every list and create call sleeps this long before touching state.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every write answers with `status` from now on.
    pub fn fail_writes_with(&self, status: u16) {
        self.state.lock().unwrap().write_failure_status = Some(status);
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    pub fn seed(&self, table: &str, fields: JsonValue) -> String {
        let fields: FieldMap = serde_json::from_value(fields).expect("seed fields are an object");
        let mut state = self.state.lock().unwrap();
        let id = next_record_id(&mut state);
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .push(RemoteRecord::new(id.clone(), fields));
        id
    }

    /// Field whose text stands in for records of `table` inside linked fields.
    pub fn set_primary_field(&self, table: &str, field: &str) {
        self.state
            .lock()
            .unwrap()
            .primary_fields
            .insert(table.to_string(), field.to_string());
    }

    pub fn reject_field(&self, field: &str) {
        self.state.lock().unwrap().rejected_fields.insert(field.to_string());
    }

    pub fn reject_upserts(&self, table: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected_upsert_tables
            .insert(table.to_string());
    }

    pub fn fail_lists(&self, table: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_list_tables
            .insert(table.to_string());
    }

    pub fn records(&self, table: &str) -> Vec<RemoteRecord> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn creates_in(&self, table: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Create { table: t, .. } if t == table))
            .count()
    }

    pub fn upsert_sizes(&self) -> Vec<usize> {
        self.calls()
            .iter()
            .filter_map(|c| match c {
                Call::Upsert { records, .. } => Some(*records),
                _ => None,
            })
            .collect()
    }
}

fn next_record_id(state: &mut MemoryState) -> String {
    state.next_id += 1;
    format!("recMem{:04}", state.next_id)
}

fn rejection(table: &str, body: String) -> StoreError {
    StoreError::Status {
        status: 422,
        url: format!("memory://{table}"),
        body,
    }
}

fn check_fields(state: &MemoryState, table: &str, fields: &FieldMap) -> Result<(), StoreError> {
    if let Some(status) = state.write_failure_status {
        return Err(StoreError::Status {
            status,
            url: format!("memory://{table}"),
            body: "SERVER_ERROR".into(),
        });
    }
    match fields.keys().find(|k| state.rejected_fields.contains(*k)) {
        Some(field) => Err(rejection(table, format!("UNKNOWN_FIELD_NAME: {field}"))),
        None => Ok(()),
    }
}

fn display_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        JsonValue::Array(items) => items.iter().map(display_text).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

fn linked_text(state: &MemoryState, value: &JsonValue) -> String {
    let ids: Vec<&JsonValue> = match value {
        JsonValue::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    ids.into_iter()
        .map(|id| {
            let id = display_text(id);
            state
                .tables
                .iter()
                .find_map(|(table, records)| {
                    let primary = state.primary_fields.get(table)?;
                    let rec = records.iter().find(|r| r.id == id)?;
                    rec.fields.get(primary).map(display_text)
                })
                .unwrap_or(id)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn matches(state: &MemoryState, record: &RemoteRecord, formula: &Formula) -> bool {
    let field_of = |name: &str| record.fields.get(name).cloned().unwrap_or(JsonValue::Null);
    match formula {
        Formula::FieldEquals { field, value } => display_text(&field_of(field)) == *value,
        Formula::LinkedTextEquals { field, value } => linked_text(state, &field_of(field)) == *value,
        Formula::DateEquals { field, date } => {
            canonical_date(&display_text(&field_of(field))).as_deref() == Some(date.as_str())
        }
        Formula::And(parts) => parts.iter().all(|p| matches(state, record, p)),
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list_page(
        &self,
        table: &str,
        query: &ListQuery,
        offset: Option<&str>,
    ) -> Result<RecordPage, StoreError> {
        self.pause().await;
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::List {
            table: table.to_string(),
            filtered: query.filter.is_some(),
        });
        if state.failing_list_tables.contains(table) {
            return Err(StoreError::Status {
                status: 403,
                url: format!("memory://{table}"),
                body: "NOT_AUTHORIZED".into(),
            });
        }
        let mut matching: Vec<RemoteRecord> = state
            .tables
            .get(table)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| query.filter.as_ref().map_or(true, |f| matches(&state, r, f)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if let Some(cap) = query.max_records {
            matching.truncate(cap);
        }
        let start = offset.map(|o| o.parse::<usize>().expect("numeric offset")).unwrap_or(0);
        let end = (start + self.page_size).min(matching.len());
        let records = matching.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        let offset = (end < matching.len()).then(|| end.to_string());
        Ok(RecordPage { records, offset })
    }

    async fn create(&self, table: &str, fields: &FieldMap) -> Result<RemoteRecord, StoreError> {
        self.pause().await;
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Create {
            table: table.to_string(),
            fields: fields.keys().cloned().collect(),
        });
        check_fields(&state, table, fields)?;
        let id = next_record_id(&mut state);
        let record = RemoteRecord::new(id, fields.clone());
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        table: &str,
        record_id: &str,
        fields: &FieldMap,
    ) -> Result<RemoteRecord, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Update {
            table: table.to_string(),
            id: record_id.to_string(),
        });
        check_fields(&state, table, fields)?;
        let record = state
            .tables
            .get_mut(table)
            .and_then(|records| records.iter_mut().find(|r| r.id == record_id))
            .ok_or_else(|| StoreError::Status {
                status: 404,
                url: format!("memory://{table}/{record_id}"),
                body: "NOT_FOUND".into(),
            })?;
        for (k, v) in fields {
            record.fields.insert(k.clone(), v.clone());
        }
        Ok(record.clone())
    }

    async fn upsert(
        &self,
        table: &str,
        merge_on: &[String],
        records: &[FieldMap],
    ) -> Result<UpsertResult, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Upsert {
            table: table.to_string(),
            records: records.len(),
        });
        if state.rejected_upsert_tables.contains(table) {
            return Err(rejection(table, "INVALID_RECORDS".into()));
        }
        for fields in records {
            check_fields(&state, table, fields)?;
        }

        let mut result = UpsertResult::default();
        for fields in records {
            let existing = state.tables.get(table).and_then(|rows| {
                rows.iter().position(|r| {
                    merge_on
                        .iter()
                        .all(|key| r.fields.get(key) == fields.get(key))
                })
            });
            match existing {
                Some(index) => {
                    let rows = state.tables.get_mut(table).expect("table exists");
                    for (k, v) in fields {
                        rows[index].fields.insert(k.clone(), v.clone());
                    }
                    result.updated_records.push(rows[index].id.clone());
                    result.records.push(rows[index].clone());
                }
                None => {
                    let id = next_record_id(&mut state);
                    let record = RemoteRecord::new(id.clone(), fields.clone());
                    state
                        .tables
                        .entry(table.to_string())
                        .or_default()
                        .push(record.clone());
                    result.created_records.push(id);
                    result.records.push(record);
                }
            }
        }
        Ok(result)
    }
}
