//! Remote record store client + local dataset file utilities.

pub mod dataset;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rentsync_core::{FieldMap, RemoteRecord};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

pub use dataset::{read_dataset, snapshot_path, write_dataset_atomic, write_snapshot, SnapshotOutcome, WrittenDataset};

pub const CRATE_NAME: &str = "rentsync-storage";

pub const DEFAULT_API_ROOT: &str = "https://api.airtable.com/v0";

/// Store-side cap on records per create/update/upsert call.
pub const MAX_RECORDS_PER_REQUEST: usize = 10;

const MAX_ERROR_BODY_CHARS: usize = 600;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    Status { status: u16, url: String, body: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid store url {0}")]
    Url(String),
    #[error("retries exhausted for {0}")]
    RetriesExhausted(String),
}

impl StoreError {
    /// The store answered and refused the request (4xx). A 5xx left over after
    /// retries is a transport failure, not a refusal.
    pub fn is_rejection(&self) -> bool {
        matches!(self, StoreError::Status { status, .. } if (400..500).contains(status))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            StoreError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl Default for TokenBucketConfig {
    /// Five requests per second per base.
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_every: Duration::from_millis(200),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Server-side predicate, rendered to the store's formula language.
#[derive(Debug, Clone, PartialEq)]
pub enum Formula {
    FieldEquals { field: String, value: String },
    /// Linked-record field compared by the display text of its parents.
    LinkedTextEquals { field: String, value: String },
    /// Date field compared at day granularity, `date` in `YYYY-MM-DD`.
    DateEquals { field: String, date: String },
    And(Vec<Formula>),
}

impl Formula {
    pub fn field_equals(field: impl Into<String>, value: impl Into<String>) -> Self {
        Formula::FieldEquals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn render(&self) -> String {
        match self {
            Formula::FieldEquals { field, value } => {
                format!("{{{field}}}='{}'", escape_formula_text(value))
            }
            Formula::LinkedTextEquals { field, value } => {
                format!("ARRAYJOIN({{{field}}})='{}'", escape_formula_text(value))
            }
            Formula::DateEquals { field, date } => format!(
                "DATETIME_FORMAT({{{field}}},'YYYY-MM-DD')='{}'",
                escape_formula_text(date)
            ),
            Formula::And(parts) => format!(
                "AND({})",
                parts.iter().map(Formula::render).collect::<Vec<_>>().join(",")
            ),
        }
    }
}

pub fn escape_formula_text(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    pub view: Option<String>,
    pub fields: Vec<String>,
    pub max_records: Option<usize>,
    pub filter: Option<Formula>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(mut self, view: Option<String>) -> Self {
        self.view = view.filter(|v| !v.trim().is_empty());
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_records(mut self, cap: usize) -> Self {
        self.max_records = Some(cap);
        self
    }

    pub fn filter(mut self, formula: Formula) -> Self {
        self.filter = Some(formula);
        self
    }

    pub fn to_params(&self, offset: Option<&str>) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(view) = &self.view {
            params.push(("view".to_string(), view.clone()));
        }
        for (i, field) in self.fields.iter().enumerate() {
            params.push((format!("fields[{i}]"), field.clone()));
        }
        if let Some(cap) = self.max_records {
            params.push(("maxRecords".to_string(), cap.to_string()));
        }
        if let Some(formula) = &self.filter {
            params.push(("filterByFormula".to_string(), formula.render()));
        }
        if let Some(offset) = offset {
            params.push(("offset".to_string(), offset.to_string()));
        }
        params
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RecordPage {
    #[serde(default)]
    pub records: Vec<RemoteRecord>,
    #[serde(default)]
    pub offset: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertResult {
    #[serde(default)]
    pub created_records: Vec<String>,
    #[serde(default)]
    pub updated_records: Vec<String>,
    #[serde(default)]
    pub records: Vec<RemoteRecord>,
}

/// Read/write surface of the remote tabular store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list_page(
        &self,
        table: &str,
        query: &ListQuery,
        offset: Option<&str>,
    ) -> Result<RecordPage, StoreError>;

    async fn create(&self, table: &str, fields: &FieldMap) -> Result<RemoteRecord, StoreError>;

    async fn update(
        &self,
        table: &str,
        record_id: &str,
        fields: &FieldMap,
    ) -> Result<RemoteRecord, StoreError>;

    /// Update-or-insert each record by exact match on `merge_on`.
    async fn upsert(
        &self,
        table: &str,
        merge_on: &[String],
        records: &[FieldMap],
    ) -> Result<UpsertResult, StoreError>;
}

/// Lazy, paginated read over one table in store order.
pub struct RecordPager<'a> {
    store: &'a dyn RecordStore,
    table: String,
    query: ListQuery,
    buffer: VecDeque<RemoteRecord>,
    next_offset: Option<String>,
    exhausted: bool,
    yielded: usize,
    pages: usize,
}

impl<'a> RecordPager<'a> {
    pub fn new(store: &'a dyn RecordStore, table: impl Into<String>, query: ListQuery) -> Self {
        Self {
            store,
            table: table.into(),
            query,
            buffer: VecDeque::new(),
            next_offset: None,
            exhausted: false,
            yielded: 0,
            pages: 0,
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    pub async fn next(&mut self) -> Result<Option<RemoteRecord>, StoreError> {
        if self.query.max_records.is_some_and(|cap| self.yielded >= cap) {
            return Ok(None);
        }
        while self.buffer.is_empty() {
            if self.exhausted {
                return Ok(None);
            }
            let page = self
                .store
                .list_page(&self.table, &self.query, self.next_offset.as_deref())
                .await?;
            self.pages += 1;
            debug!(
                table = %self.table,
                page = self.pages,
                records = page.records.len(),
                "fetched page"
            );
            self.buffer.extend(page.records);
            match page.offset.filter(|o| !o.is_empty()) {
                Some(offset) => self.next_offset = Some(offset),
                None => self.exhausted = true,
            }
        }
        self.yielded += 1;
        Ok(self.buffer.pop_front())
    }

    pub async fn collect_all(mut self) -> Result<Vec<RemoteRecord>, StoreError> {
        let mut out = Vec::new();
        while let Some(record) = self.next().await? {
            out.push(record);
        }
        Ok(out)
    }
}

pub async fn fetch_all(
    store: &dyn RecordStore,
    table: &str,
    query: ListQuery,
) -> Result<Vec<RemoteRecord>, StoreError> {
    RecordPager::new(store, table, query).collect_all().await
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub api_root: String,
    pub base: String,
    pub token: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<TokenBucketConfig>,
}

impl StoreConfig {
    pub fn new(base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_root: DEFAULT_API_ROOT.to_string(),
            base: base.into(),
            token: token.into(),
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            rate_limit: Some(TokenBucketConfig::default()),
        }
    }
}

/// `RecordStore` over the store's REST API with bearer auth.
#[derive(Debug)]
pub struct HttpRecordStore {
    client: reqwest::Client,
    api_root: Url,
    base: String,
    token: String,
    backoff: BackoffPolicy,
    limiter: Option<Arc<SimpleTokenBucket>>,
}

impl HttpRecordStore {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        let api_root = Url::parse(config.api_root.trim_end_matches('/'))
            .map_err(|err| StoreError::Url(format!("{}: {err}", config.api_root)))?;
        let limiter = config
            .rate_limit
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));
        Ok(Self {
            client,
            api_root,
            base: config.base,
            token: config.token,
            backoff: config.backoff,
            limiter,
        })
    }

    /// `{root}/{base}/{table}[/{record_id}]` with each segment percent-encoded.
    pub fn table_url(&self, table: &str, record_id: Option<&str>) -> Result<Url, StoreError> {
        let mut url = self.api_root.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| StoreError::Url(self.api_root.to_string()))?;
            segments.pop_if_empty().push(&self.base).push(table);
            if let Some(id) = record_id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    async fn execute<T, F>(&self, idempotent: bool, build: F) -> Result<T, StoreError>
    where
        T: DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            if let Some(bucket) = &self.limiter {
                bucket.take().await;
            }

            let request = build()
                .bearer_auth(&self.token)
                .header(reqwest::header::ACCEPT, "application/json");

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body)
                            .map_err(|source| StoreError::Decode { url, source });
                    }

                    // A throttled request was never applied, so even non-idempotent
                    // writes may be replayed.
                    let retryable = classify_status(status) == RetryDisposition::Retryable
                        && (idempotent || status == StatusCode::TOO_MANY_REQUESTS);
                    if retryable && attempt < self.backoff.max_retries {
                        warn!(status = status.as_u16(), attempt, %url, "retrying store request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(StoreError::Status {
                        status: status.as_u16(),
                        url,
                        body: truncate_body(&body),
                    });
                }
                Err(err) => {
                    if idempotent
                        && classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying store request after transport error");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(StoreError::Request(err)),
            None => Err(StoreError::RetriesExhausted(self.api_root.to_string())),
        }
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn list_page(
        &self,
        table: &str,
        query: &ListQuery,
        offset: Option<&str>,
    ) -> Result<RecordPage, StoreError> {
        let url = self.table_url(table, None)?;
        let params = query.to_params(offset);
        self.execute(true, || self.client.get(url.clone()).query(&params))
            .instrument(info_span!("store_list", table, offset))
            .await
    }

    async fn create(&self, table: &str, fields: &FieldMap) -> Result<RemoteRecord, StoreError> {
        let url = self.table_url(table, None)?;
        let body = json!({ "fields": fields, "typecast": true });
        self.execute(false, || self.client.post(url.clone()).json(&body))
            .instrument(info_span!("store_create", table))
            .await
    }

    async fn update(
        &self,
        table: &str,
        record_id: &str,
        fields: &FieldMap,
    ) -> Result<RemoteRecord, StoreError> {
        let url = self.table_url(table, Some(record_id))?;
        let body = json!({ "fields": fields, "typecast": true });
        self.execute(true, || self.client.patch(url.clone()).json(&body))
            .instrument(info_span!("store_update", table, record_id))
            .await
    }

    async fn upsert(
        &self,
        table: &str,
        merge_on: &[String],
        records: &[FieldMap],
    ) -> Result<UpsertResult, StoreError> {
        let url = self.table_url(table, None)?;
        let body = upsert_body(merge_on, records);
        self.execute(true, || {
            self.client
                .patch(url.clone())
                .query(&[("typecast", "true")])
                .json(&body)
        })
        .instrument(info_span!("store_upsert", table, records = records.len()))
        .await
    }
}

pub fn upsert_body(merge_on: &[String], records: &[FieldMap]) -> serde_json::Value {
    json!({
        "performUpsert": {
            "fieldsToMergeOn": merge_on,
        },
        "records": records.iter().map(|fields| json!({ "fields": fields })).collect::<Vec<_>>(),
    })
}

fn truncate_body(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct PagedStore {
        pages: Vec<RecordPage>,
        offsets_seen: StdMutex<Vec<Option<String>>>,
    }

    fn record(id: &str) -> RemoteRecord {
        RemoteRecord::new(id, FieldMap::new())
    }

    #[async_trait]
    impl RecordStore for PagedStore {
        async fn list_page(
            &self,
            _table: &str,
            _query: &ListQuery,
            offset: Option<&str>,
        ) -> Result<RecordPage, StoreError> {
            self.offsets_seen
                .lock()
                .unwrap()
                .push(offset.map(str::to_string));
            let index = offset.map(|o| o.parse::<usize>().unwrap()).unwrap_or(0);
            Ok(self.pages[index].clone())
        }

        async fn create(&self, _: &str, _: &FieldMap) -> Result<RemoteRecord, StoreError> {
            unimplemented!()
        }

        async fn update(&self, _: &str, _: &str, _: &FieldMap) -> Result<RemoteRecord, StoreError> {
            unimplemented!()
        }

        async fn upsert(&self, _: &str, _: &[String], _: &[FieldMap]) -> Result<UpsertResult, StoreError> {
            unimplemented!()
        }
    }

    fn three_pages() -> PagedStore {
        PagedStore {
            pages: vec![
                RecordPage {
                    records: vec![record("rec1"), record("rec2")],
                    offset: Some("1".into()),
                },
                RecordPage {
                    records: vec![],
                    offset: Some("2".into()),
                },
                RecordPage {
                    records: vec![record("rec3")],
                    offset: None,
                },
            ],
            offsets_seen: StdMutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn pager_follows_offsets_until_exhausted() {
        let store = three_pages();
        let mut pager = RecordPager::new(&store, "Rents", ListQuery::new());
        let mut ids = Vec::new();
        while let Some(rec) = pager.next().await.expect("page") {
            ids.push(rec.id);
        }
        assert_eq!(ids, vec!["rec1", "rec2", "rec3"]);
        assert_eq!(pager.pages_fetched(), 3);
        assert_eq!(
            *store.offsets_seen.lock().unwrap(),
            vec![None, Some("1".to_string()), Some("2".to_string())]
        );
    }

    #[tokio::test]
    async fn pager_stops_at_result_cap_without_extra_pages() {
        let store = three_pages();
        let records = fetch_all(&store, "Rents", ListQuery::new().max_records(2))
            .await
            .expect("fetch");
        assert_eq!(records.len(), 2);
        assert_eq!(store.offsets_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn list_params_follow_store_conventions() {
        let query = ListQuery::new()
            .view(Some("Grid view".into()))
            .fields(["city", "active"])
            .max_records(3);
        assert_eq!(
            query.to_params(Some("itr/abc")),
            vec![
                ("view".to_string(), "Grid view".to_string()),
                ("fields[0]".to_string(), "city".to_string()),
                ("fields[1]".to_string(), "active".to_string()),
                ("maxRecords".to_string(), "3".to_string()),
                ("offset".to_string(), "itr/abc".to_string()),
            ]
        );
        assert!(ListQuery::new().view(Some("  ".into())).to_params(None).is_empty());
    }

    #[test]
    fn formulas_escape_quotes_and_nest() {
        let formula = Formula::And(vec![
            Formula::LinkedTextEquals {
                field: "city".into(),
                value: "Boquete's Hill".into(),
            },
            Formula::DateEquals {
                field: "date".into(),
                date: "2025-05-01".into(),
            },
        ]);
        assert_eq!(
            formula.render(),
            "AND(ARRAYJOIN({city})='Boquete\\'s Hill',DATETIME_FORMAT({date},'YYYY-MM-DD')='2025-05-01')"
        );
        assert_eq!(Formula::field_equals("name", "a\\b").render(), "{name}='a\\\\b'");
    }

    #[test]
    fn table_urls_encode_segments() {
        let mut config = StoreConfig::new("appBase", "tok");
        config.api_root = "https://store.example/v0/".into();
        let store = HttpRecordStore::new(config).expect("client");
        assert_eq!(
            store.table_url("City Overrides", None).unwrap().as_str(),
            "https://store.example/v0/appBase/City%20Overrides"
        );
        assert_eq!(
            store.table_url("Rents", Some("rec123")).unwrap().as_str(),
            "https://store.example/v0/appBase/Rents/rec123"
        );
    }

    #[test]
    fn upsert_body_carries_merge_keys() {
        let mut fields = FieldMap::new();
        fields.insert("Date".into(), json!("2025-05-01"));
        let body = upsert_body(&["Date".to_string()], &[fields]);
        assert_eq!(body["performUpsert"]["fieldsToMergeOn"], json!(["Date"]));
        assert_eq!(body["records"][0]["fields"]["Date"], json!("2025-05-01"));
    }

    #[test]
    fn upsert_result_decodes_created_and_updated_ids() {
        let result: UpsertResult = serde_json::from_value(json!({
            "createdRecords": ["recA"],
            "updatedRecords": ["recB", "recC"],
            "records": [{"id": "recA", "fields": {}}]
        }))
        .unwrap();
        assert_eq!(result.created_records, vec!["recA"]);
        assert_eq!(result.updated_records.len(), 2);
    }

    #[test]
    fn retry_classification_targets_throttling_and_server_errors() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNPROCESSABLE_ENTITY), RetryDisposition::NonRetryable);
        let err = StoreError::Status {
            status: 422,
            url: "u".into(),
            body: "INVALID_VALUE_FOR_COLUMN".into(),
        };
        assert!(err.is_rejection());
        assert_eq!(err.status(), Some(422));
        let unavailable = StoreError::Status {
            status: 503,
            url: "u".into(),
            body: "service unavailable".into(),
        };
        assert!(!unavailable.is_rejection());
        assert!(!StoreError::RetriesExhausted("u".into()).is_rejection());

        let malformed = reqwest::Client::new().get("not a url").build().unwrap_err();
        assert_eq!(classify_reqwest_error(&malformed), RetryDisposition::NonRetryable);
        assert_eq!(truncate_body(&"x".repeat(700)).len(), MAX_ERROR_BODY_CHARS);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
