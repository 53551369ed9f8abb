use crate::errors::{AppError, AppResult};
use crate::models::{FieldFilter, Fields, Page, PageRequest, Query, Record, OWNER_FIELD, SCOPE_FIELD};
use crate::query::{execute, paginate};
use crate::retry::{with_backoff, RetryPolicy};
use crate::session::SessionContext;
use crate::store::{StoreAdapter, Subscription};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: &'static str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document<T> {
    pub id: String,
    #[serde(flatten)]
    pub data: T,
    pub scope: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<T: Entity> Document<T> {
    pub fn from_record(record: Record) -> AppResult<Self> {
        let scope = required_text(&record, SCOPE_FIELD)?;
        let owner_id = required_text(&record, OWNER_FIELD)?;
        let created_at = record.created_at_utc()?;
        let updated_at = record.updated_at_utc()?;
        let data = serde_json::from_value::<T>(Value::Object(record.fields)).map_err(|err| {
            AppError::Validation(format!("{} '{}' is malformed: {}", T::COLLECTION, record.id, err))
        })?;
        Ok(Self {
            id: record.id,
            data,
            scope,
            owner_id,
            created_at,
            updated_at,
        })
    }

    fn version(&self) -> (String, DateTime<Utc>) {
        (self.id.clone(), self.updated_at)
    }
}

fn required_text(record: &Record, field: &str) -> AppResult<String> {
    record
        .fields
        .get(field)
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| AppError::Validation(format!("record '{}' is missing '{}'", record.id, field)))
}

pub fn entity_fields<T: Serialize>(data: &T) -> AppResult<Fields> {
    match serde_json::to_value(data)? {
        Value::Object(fields) => Ok(fields),
        other => Err(AppError::Validation(format!("entity must serialize to an object, got {}", other))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    Snapshot,
    Realtime,
}

#[derive(Debug, Clone)]
pub struct MalformedRecord {
    pub id: String,
    pub message: String,
    pub fields: Fields,
}

impl MalformedRecord {
    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct LoadOutcome<T> {
    pub documents: Vec<Document<T>>,
    pub malformed: Vec<MalformedRecord>,
}

pub type DocumentCallback<T> = Arc<dyn Fn(&[Document<T>]) + Send + Sync>;

pub struct Repository<T: Entity> {
    store: Arc<dyn StoreAdapter>,
    context: SessionContext,
    mode: SyncMode,
    retry: RetryPolicy,
    poll_interval: Duration,
    cache: Arc<RwLock<Vec<Document<T>>>>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            context: self.context.clone(),
            mode: self.mode,
            retry: self.retry,
            poll_interval: self.poll_interval,
            cache: self.cache.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> Repository<T> {
    pub fn new(store: Arc<dyn StoreAdapter>, context: SessionContext, mode: SyncMode) -> Self {
        Self {
            store,
            context,
            mode,
            retry: RetryPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            cache: Arc::new(RwLock::new(Vec::new())),
            _entity: PhantomData,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn collection(&self) -> &'static str {
        T::COLLECTION
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    fn scoped(&self, filters: &[FieldFilter]) -> Vec<FieldFilter> {
        let mut scoped = Vec::with_capacity(filters.len() + 1);
        scoped.push(FieldFilter::eq(SCOPE_FIELD, self.context.scope.clone()));
        scoped.extend(filters.iter().cloned());
        scoped
    }

    fn scoped_query(&self, query: &Query) -> Query {
        Query {
            filters: self.scoped(&query.filters),
            order: query.order.clone(),
            limit: query.limit,
        }
    }

    pub async fn load(&self, filters: &[FieldFilter]) -> AppResult<Vec<Document<T>>> {
        let outcome = self.load_partitioned(filters).await?;
        for bad in &outcome.malformed {
            tracing::warn!(
                collection = T::COLLECTION,
                id = %bad.id,
                error = %bad.message,
                "skipping malformed record"
            );
        }
        if self.mode == SyncMode::Snapshot {
            self.replace_cache(outcome.documents.clone());
        }
        Ok(outcome.documents)
    }

    pub async fn load_partitioned(&self, filters: &[FieldFilter]) -> AppResult<LoadOutcome<T>> {
        let query = Query {
            filters: self.scoped(filters),
            order: None,
            limit: None,
        };
        let records = with_backoff(self.retry, "load", || execute(self.store.as_ref(), T::COLLECTION, &query)).await?;
        Ok(partition(records))
    }

    pub async fn query(&self, query: &Query) -> AppResult<Vec<Document<T>>> {
        let scoped = self.scoped_query(query);
        let records = with_backoff(self.retry, "query", || execute(self.store.as_ref(), T::COLLECTION, &scoped)).await?;
        Ok(partition(records).documents)
    }

    pub async fn page(&self, query: &Query, request: PageRequest) -> AppResult<Page<Document<T>>> {
        let documents = self.query(query).await?;
        paginate(documents, request.limit, request.cursor)
    }

    pub async fn count(&self, filters: &[FieldFilter]) -> AppResult<usize> {
        let scoped = self.scoped(filters);
        with_backoff(self.retry, "count", || self.store.count(T::COLLECTION, &scoped)).await
    }

    pub async fn get_by_id(&self, id: &str) -> AppResult<Document<T>> {
        let record = with_backoff(self.retry, "get_by_id", || self.store.get_by_id(T::COLLECTION, id)).await?;
        if record.fields.get(SCOPE_FIELD).and_then(Value::as_str) != Some(self.context.scope.as_str()) {
            return Err(AppError::NotFound(format!("record '{}' not found in {}", id, T::COLLECTION)));
        }
        Document::from_record(record)
    }

    pub async fn add(&self, data: T) -> AppResult<Document<T>> {
        self.insert(None, data).await
    }

    // Taken ids conflict in any scope.
    pub async fn add_with_id(&self, id: &str, data: T) -> AppResult<Document<T>> {
        self.insert(Some(id), data).await
    }

    async fn insert(&self, id: Option<&str>, data: T) -> AppResult<Document<T>> {
        let mut fields = entity_fields(&data)?;
        fields.insert(SCOPE_FIELD.to_string(), Value::String(self.context.scope.clone()));
        fields.insert(OWNER_FIELD.to_string(), Value::String(self.context.user_id.clone()));

        let record = self.store.create(T::COLLECTION, fields, id).await?;
        let document = Document::from_record(record)?;
        if self.mode == SyncMode::Snapshot {
            self.with_cache(|cache| cache.push(document.clone()));
        }
        Ok(document)
    }

    pub async fn update(&self, id: &str, patch: Fields) -> AppResult<Document<T>> {
        if patch.contains_key(SCOPE_FIELD) || patch.contains_key(OWNER_FIELD) {
            return Err(AppError::Validation(format!(
                "'{}' and '{}' cannot be changed",
                SCOPE_FIELD, OWNER_FIELD
            )));
        }
        let current = self.get_by_id(id).await?;
        let mut merged = entity_fields(&current.data)?;
        merged.extend(patch.clone());
        serde_json::from_value::<T>(Value::Object(merged))
            .map_err(|err| AppError::Validation(format!("invalid {} patch: {}", T::COLLECTION, err)))?;

        let record = with_backoff(self.retry, "update", || {
            self.store.update(T::COLLECTION, id, patch.clone())
        })
        .await?;
        let document = Document::from_record(record)?;
        if self.mode == SyncMode::Snapshot {
            self.with_cache(|cache| match cache.iter_mut().find(|cached| cached.id == document.id) {
                Some(cached) => *cached = document.clone(),
                None => cache.push(document.clone()),
            });
        }
        Ok(document)
    }

    pub async fn remove(&self, id: &str) -> AppResult<()> {
        match self.get_by_id(id).await {
            Ok(_) => {}
            Err(AppError::NotFound(_)) => return Ok(()),
            // A malformed record in our scope can still be removed.
            Err(AppError::Validation(_)) => {}
            Err(error) => return Err(error),
        }
        with_backoff(self.retry, "remove", || self.store.delete(T::COLLECTION, id)).await?;
        if self.mode == SyncMode::Snapshot {
            self.with_cache(|cache| cache.retain(|cached| cached.id != id));
        }
        Ok(())
    }

    pub fn cached(&self) -> AppResult<Vec<Document<T>>> {
        if self.mode != SyncMode::Snapshot {
            return Err(AppError::Validation(format!(
                "{} repository is realtime and keeps no cache",
                T::COLLECTION
            )));
        }
        Ok(self.cache.read().map(|cache| cache.clone()).unwrap_or_else(|p| p.into_inner().clone()))
    }

    pub async fn subscribe(&self, filters: &[FieldFilter], on_change: DocumentCallback<T>) -> AppResult<Watch> {
        match self.mode {
            SyncMode::Realtime => self.subscribe_live(filters, on_change).await,
            SyncMode::Snapshot => Ok(self.subscribe_polling(filters, on_change)),
        }
    }

    async fn subscribe_live(&self, filters: &[FieldFilter], on_change: DocumentCallback<T>) -> AppResult<Watch> {
        let scoped = self.scoped(filters);
        let subscription = self
            .store
            .subscribe(
                T::COLLECTION,
                Arc::new(move |snapshot: &[Record]| {
                    let records = snapshot
                        .iter()
                        .filter(|record| scoped.iter().all(|filter| filter.matches(record)))
                        .cloned()
                        .collect();
                    let outcome = partition::<T>(records);
                    for bad in &outcome.malformed {
                        tracing::warn!(collection = T::COLLECTION, id = %bad.id, error = %bad.message, "skipping malformed record");
                    }
                    on_change(&outcome.documents);
                }),
                Arc::new(|error: &AppError| {
                    tracing::warn!(collection = T::COLLECTION, error = %error, "subscription interrupted");
                }),
            )
            .await?;
        Ok(Watch::Live(subscription))
    }

    fn subscribe_polling(&self, filters: &[FieldFilter], on_change: DocumentCallback<T>) -> Watch {
        let active = Arc::new(AtomicBool::new(true));
        let flag = active.clone();
        let repository = self.clone();
        let filters = filters.to_vec();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(repository.poll_interval);
            let mut last_seen: Option<Vec<(String, DateTime<Utc>)>> = None;
            loop {
                ticker.tick().await;
                if !flag.load(Ordering::Acquire) {
                    break;
                }
                match repository.load(&filters).await {
                    Ok(documents) => {
                        let versions: Vec<_> = documents.iter().map(Document::version).collect();
                        if last_seen.as_ref() == Some(&versions) {
                            continue;
                        }
                        last_seen = Some(versions);
                        if flag.load(Ordering::Acquire) {
                            on_change(&documents);
                        }
                    }
                    Err(error) => {
                        tracing::warn!(collection = T::COLLECTION, error = %error, "poll refresh failed");
                    }
                }
            }
        });
        Watch::Poll { active, task }
    }

    fn replace_cache(&self, documents: Vec<Document<T>>) {
        self.with_cache(|cache| *cache = documents);
    }

    fn with_cache(&self, apply: impl FnOnce(&mut Vec<Document<T>>)) {
        let mut cache = self.cache.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        apply(&mut cache);
    }
}

fn partition<T: Entity>(records: Vec<Record>) -> LoadOutcome<T> {
    let mut documents = Vec::with_capacity(records.len());
    let mut malformed = Vec::new();
    for record in records {
        let id = record.id.clone();
        let fields = record.fields.clone();
        match Document::<T>::from_record(record) {
            Ok(document) => documents.push(document),
            Err(error) => malformed.push(MalformedRecord {
                id,
                message: error.to_string(),
                fields,
            }),
        }
    }
    LoadOutcome { documents, malformed }
}

#[derive(Debug)]
pub enum Watch {
    Live(Subscription),
    Poll { active: Arc<AtomicBool>, task: JoinHandle<()> },
}

impl Watch {
    pub fn is_active(&self) -> bool {
        match self {
            Self::Live(subscription) => subscription.is_active(),
            Self::Poll { active, .. } => active.load(Ordering::Acquire),
        }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        if let Self::Poll { active, task } = self {
            active.store(false, Ordering::Release);
            task.abort();
        }
    }
}
