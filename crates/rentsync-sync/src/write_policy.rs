//! Single-record writes with one degraded retry on rejection.

use rentsync_core::FieldMap;
use rentsync_storage::{RecordStore, StoreError};
use serde::Serialize;
use tracing::warn;

/// Fields of one record write, split by whether the store must accept them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WritePayload {
    pub mandatory: FieldMap,
    pub optional: FieldMap,
}

impl WritePayload {
    pub fn new(mandatory: FieldMap) -> Self {
        Self {
            mandatory,
            optional: FieldMap::new(),
        }
    }

    pub fn with_optional(mut self, optional: FieldMap) -> Self {
        // Mandatory values win over defaults with the same name.
        self.optional = optional
            .into_iter()
            .filter(|(k, _)| !self.mandatory.contains_key(k))
            .collect();
        self
    }

    pub fn full(&self) -> FieldMap {
        let mut fields = self.mandatory.clone();
        fields.extend(self.optional.iter().map(|(k, v)| (k.clone(), v.clone())));
        fields
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget<'a> {
    Create,
    Update(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WriteOutcome {
    Written(String),
    /// Accepted only after dropping the optional fields.
    WrittenMinimal(String),
    Failed(String),
}

impl WriteOutcome {
    pub fn record_id(&self) -> Option<&str> {
        match self {
            WriteOutcome::Written(id) | WriteOutcome::WrittenMinimal(id) => Some(id.as_str()),
            WriteOutcome::Failed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WritePolicy {
    pub degrade_on_rejection: bool,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            degrade_on_rejection: true,
        }
    }
}

impl WritePolicy {
    /// Rejections become `WriteOutcome`s; transport failures are returned as errors.
    pub async fn write(
        &self,
        store: &dyn RecordStore,
        table: &str,
        target: WriteTarget<'_>,
        payload: &WritePayload,
    ) -> Result<WriteOutcome, StoreError> {
        let first = match send(store, table, target, &payload.full()).await {
            Ok(id) => return Ok(WriteOutcome::Written(id)),
            Err(err) if err.is_rejection() => err,
            Err(err) => return Err(err),
        };

        if !self.degrade_on_rejection || payload.optional.is_empty() {
            return Ok(WriteOutcome::Failed(first.to_string()));
        }

        warn!(table, ?target, error = %first, "full payload rejected; retrying with mandatory fields");
        match send(store, table, target, &payload.mandatory).await {
            Ok(id) => Ok(WriteOutcome::WrittenMinimal(id)),
            Err(err) if err.is_rejection() => Ok(WriteOutcome::Failed(format!(
                "{first}; mandatory-only retry: {err}"
            ))),
            Err(err) => Err(err),
        }
    }
}

async fn send(
    store: &dyn RecordStore,
    table: &str,
    target: WriteTarget<'_>,
    fields: &FieldMap,
) -> Result<String, StoreError> {
    let record = match target {
        WriteTarget::Create => store.create(table, fields).await?,
        WriteTarget::Update(id) => store.update(table, id, fields).await?,
    };
    Ok(record.id)
}
