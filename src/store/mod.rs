pub mod batch;
pub mod memory;
pub mod sqlite;
pub mod subscriptions;

use crate::errors::{AppError, AppResult};
use crate::models::{FieldFilter, Fields, OrderBy, Record};
use crate::query::{apply_residual_filters, sort_records};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use subscriptions::{ChangeCallback, ErrorCallback, Subscription};

static PATH_SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("valid path segment regex"));

static FIELD_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("valid field name regex"));

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub equality: Option<FieldFilter>,
    pub order: Option<OrderBy>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait StoreAdapter: Send + Sync {
    fn backend_name(&self) -> &'static str;

    // A caller-supplied id that already exists fails with Conflict. Otherwise
    // the store assigns a time-prefixed id so key order follows insertion order.
    async fn create(&self, path: &str, data: Fields, id: Option<&str>) -> AppResult<Record>;

    async fn get_by_id(&self, path: &str, id: &str) -> AppResult<Record>;

    async fn scan_native(&self, path: &str, equality: Option<&FieldFilter>) -> AppResult<Vec<Record>>;

    async fn update(&self, path: &str, id: &str, partial: Fields) -> AppResult<Record>;

    async fn delete(&self, path: &str, id: &str) -> AppResult<()>;

    async fn subscribe(
        &self,
        path: &str,
        on_change: ChangeCallback,
        on_error: ErrorCallback,
    ) -> AppResult<Subscription>;

    async fn exists(&self, path: &str, id: &str) -> AppResult<bool> {
        match self.get_by_id(path, id).await {
            Ok(_) => Ok(true),
            Err(AppError::NotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    // Non-key orders are sorted client-side, so the limit applies after the sort.
    async fn scan(&self, path: &str, options: &ScanOptions) -> AppResult<Vec<Record>> {
        let mut records = self.scan_native(path, options.equality.as_ref()).await?;
        if let Some(order) = options.order.as_ref().filter(|order| !order.is_key_ascending()) {
            sort_records(&mut records, order);
        }
        if let Some(limit) = options.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn count(&self, path: &str, filters: &[FieldFilter]) -> AppResult<usize> {
        let records = self.scan_native(path, filters.first()).await?;
        Ok(apply_residual_filters(records, filters.get(1..).unwrap_or_default()).len())
    }

    async fn close(&self) -> AppResult<()> {
        Ok(())
    }
}

pub fn validate_path(path: &str) -> AppResult<()> {
    if path.is_empty() || !path.split('/').all(|segment| PATH_SEGMENT_RE.is_match(segment)) {
        return Err(AppError::Validation(format!("invalid store path '{}'", path)));
    }
    Ok(())
}

pub fn validate_id(id: &str) -> AppResult<()> {
    if !PATH_SEGMENT_RE.is_match(id) {
        return Err(AppError::Validation(format!("invalid record id '{}'", id)));
    }
    Ok(())
}

pub fn validate_field_name(field: &str) -> AppResult<()> {
    if !FIELD_NAME_RE.is_match(field) {
        return Err(AppError::Validation(format!("invalid field name '{}'", field)));
    }
    Ok(())
}

static ID_SEQUENCE: AtomicU32 = AtomicU32::new(0);

pub fn new_record_id(now: DateTime<Utc>) -> String {
    let sequence = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed) % 1_000_000;
    let short = Uuid::new_v4().simple().to_string();
    format!("{}{:06}{}", now.format("%Y%m%d%H%M%S%3f"), sequence, &short[..4])
}

pub(crate) fn strip_metadata(mut data: Fields) -> Fields {
    for key in [
        crate::models::ID_FIELD,
        crate::models::CREATED_AT_FIELD,
        crate::models::UPDATED_AT_FIELD,
    ] {
        data.remove(key);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn path_validation_rejects_empty_and_traversal_segments() {
        assert!(validate_path("installments").is_ok());
        assert!(validate_path("electronics/installments").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("a//b").is_err());
        assert!(validate_path("../etc").is_err());
        assert!(validate_id("abc-123_x").is_ok());
        assert!(validate_id("a/b").is_err());
        assert!(validate_field_name("dueDate").is_ok());
        assert!(validate_field_name("$.x").is_err());
    }

    #[test]
    fn generated_ids_sort_by_creation_time() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::milliseconds(5);
        assert!(new_record_id(earlier) < new_record_id(later));
    }

    #[tokio::test]
    async fn default_scan_emulates_descending_order_before_limit() {
        let store: Arc<dyn StoreAdapter> = Arc::new(MemoryStore::new());
        for amount in [300, 500, 100] {
            let mut data = Fields::new();
            data.insert("amount".to_string(), json!(amount));
            store.create("installments", data, None).await.expect("create");
        }

        let options = ScanOptions {
            equality: None,
            order: Some(OrderBy::desc("amount")),
            limit: Some(2),
        };
        let records = store.scan("installments", &options).await.expect("scan");
        let amounts: Vec<_> = records.iter().map(|r| r.fields["amount"].clone()).collect();
        assert_eq!(amounts, vec![json!(500), json!(300)]);
    }

    #[tokio::test]
    async fn count_applies_filters_beyond_the_first() {
        let store = MemoryStore::new();
        for (scope, read) in [("electronics", false), ("electronics", true), ("furniture", false)] {
            let mut data = Fields::new();
            data.insert("scope".to_string(), json!(scope));
            data.insert("read".to_string(), json!(read));
            store.create("notifications", data, None).await.expect("create");
        }

        let filters = vec![
            FieldFilter::eq("scope", "electronics"),
            FieldFilter::eq("read", false),
        ];
        assert_eq!(store.count("notifications", &filters).await.expect("count"), 1);
        assert!(!store.exists("notifications", "nope").await.expect("exists"));
    }
}
