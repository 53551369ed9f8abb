use super::subscriptions::{ChangeCallback, ErrorCallback, Subscription, SubscriptionRegistry};
use super::{new_record_id, strip_metadata, validate_field_name, validate_id, validate_path, StoreAdapter};
use crate::errors::{AppError, AppResult};
use crate::models::{FieldFilter, Fields, Record};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, BTreeMap<String, Record>>,
    revisions: HashMap<String, u64>,
}

impl Tree {
    fn snapshot(&self, path: &str) -> (u64, Vec<Record>) {
        let records = self
            .nodes
            .get(path)
            .map(|children| children.values().cloned().collect())
            .unwrap_or_default();
        (self.revisions.get(path).copied().unwrap_or(0), records)
    }

    fn bump(&mut self, path: &str) -> (u64, Vec<Record>) {
        *self.revisions.entry(path.to_string()).or_insert(0) += 1;
        self.snapshot(path)
    }
}

pub struct MemoryStore {
    tree: Mutex<Tree>,
    available: AtomicBool,
    subscriptions: SubscriptionRegistry,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tree: Mutex::new(Tree::default()),
            available: AtomicBool::new(true),
            subscriptions: SubscriptionRegistry::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn set_available(&self, available: bool) {
        let was_available = self.available.swap(available, Ordering::AcqRel);
        if was_available == available {
            return;
        }
        if !available {
            tracing::warn!("memory store marked unavailable");
            self.subscriptions
                .notify_error(&AppError::StoreUnavailable("store connection lost".to_string()));
            return;
        }

        tracing::info!("memory store reconnected; redelivering snapshots");
        for path in self.subscriptions.subscribed_paths() {
            let (revision, snapshot) = match self.lock() {
                Ok(tree) => tree.snapshot(&path),
                Err(error) => {
                    tracing::warn!(path = %path, error = %error, "snapshot redelivery failed");
                    continue;
                }
            };
            self.subscriptions.redeliver(&path, revision, &snapshot);
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn ensure_available(&self) -> AppResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(AppError::StoreUnavailable("memory store is offline".to_string()))
        }
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Tree>> {
        self.tree
            .lock()
            .map_err(|_| AppError::Internal("memory store mutex poisoned".to_string()))
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, path: &str, data: Fields, id: Option<&str>) -> AppResult<Record> {
        validate_path(path)?;
        if let Some(id) = id {
            validate_id(id)?;
        }
        self.ensure_available()?;

        let now = Utc::now();
        let (record, revision, snapshot) = {
            let mut tree = self.lock()?;
            let children = tree.nodes.entry(path.to_string()).or_default();
            let id = match id {
                Some(id) if children.contains_key(id) => {
                    return Err(AppError::Conflict(format!("record '{}' already exists at '{}'", id, path)));
                }
                Some(id) => id.to_string(),
                None => new_record_id(now),
            };
            let record = Record {
                id: id.clone(),
                fields: strip_metadata(data),
                created_at: now.timestamp_millis(),
                updated_at: now.timestamp_millis(),
            };
            children.insert(id, record.clone());
            let (revision, snapshot) = tree.bump(path);
            (record, revision, snapshot)
        };

        self.subscriptions.notify(path, revision, &snapshot);
        Ok(record)
    }

    async fn get_by_id(&self, path: &str, id: &str) -> AppResult<Record> {
        validate_path(path)?;
        self.ensure_available()?;
        let tree = self.lock()?;
        tree.nodes
            .get(path)
            .and_then(|children| children.get(id))
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("record '{}' not found at '{}'", id, path)))
    }

    async fn scan_native(&self, path: &str, equality: Option<&FieldFilter>) -> AppResult<Vec<Record>> {
        validate_path(path)?;
        if let Some(filter) = equality {
            validate_field_name(&filter.field)?;
        }
        self.ensure_available()?;
        let tree = self.lock()?;
        let Some(children) = tree.nodes.get(path) else {
            return Ok(Vec::new());
        };
        Ok(children
            .values()
            .filter(|record| equality.map_or(true, |filter| filter.matches(record)))
            .cloned()
            .collect())
    }

    async fn update(&self, path: &str, id: &str, partial: Fields) -> AppResult<Record> {
        validate_path(path)?;
        self.ensure_available()?;

        let (record, revision, snapshot) = {
            let mut tree = self.lock()?;
            let record = tree
                .nodes
                .get_mut(path)
                .and_then(|children| children.get_mut(id))
                .ok_or_else(|| AppError::NotFound(format!("record '{}' not found at '{}'", id, path)))?;
            for (key, value) in strip_metadata(partial) {
                record.fields.insert(key, value);
            }
            record.updated_at = Utc::now().timestamp_millis().max(record.updated_at);
            let record = record.clone();
            let (revision, snapshot) = tree.bump(path);
            (record, revision, snapshot)
        };

        self.subscriptions.notify(path, revision, &snapshot);
        Ok(record)
    }

    async fn delete(&self, path: &str, id: &str) -> AppResult<()> {
        validate_path(path)?;
        self.ensure_available()?;

        let change = {
            let mut tree = self.lock()?;
            let removed = tree
                .nodes
                .get_mut(path)
                .and_then(|children| children.remove(id))
                .is_some();
            removed.then(|| tree.bump(path))
        };

        if let Some((revision, snapshot)) = change {
            self.subscriptions.notify(path, revision, &snapshot);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        path: &str,
        on_change: ChangeCallback,
        on_error: ErrorCallback,
    ) -> AppResult<Subscription> {
        validate_path(path)?;
        self.ensure_available()?;
        let subscription = self.subscriptions.register(path, on_change, on_error);
        let (revision, snapshot) = self.lock()?.snapshot(path);
        self.subscriptions.deliver_to(subscription.id(), revision, &snapshot);
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().expect("object payload")
    }

    #[tokio::test]
    async fn custom_id_conflicts_and_auto_ids_do_not() {
        let store = MemoryStore::new();
        store
            .create("complaints", fields(json!({"status": "open"})), Some("c-1"))
            .await
            .expect("first create");
        let error = store
            .create("complaints", fields(json!({"status": "open"})), Some("c-1"))
            .await
            .expect_err("duplicate custom id");
        assert!(matches!(error, AppError::Conflict(_)));

        let a = store.create("complaints", fields(json!({})), None).await.expect("auto a");
        let b = store.create("complaints", fields(json!({})), None).await.expect("auto b");
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn update_merges_and_preserves_identity() {
        let store = MemoryStore::new();
        let created = store
            .create(
                "deliveries",
                fields(json!({"status": "scheduled", "customerName": "Rana"})),
                Some("d-1"),
            )
            .await
            .expect("create");
        let updated = store
            .update(
                "deliveries",
                "d-1",
                fields(json!({"status": "delivered", "id": "hijack", "createdAt": 1})),
            )
            .await
            .expect("update");

        assert_eq!(updated.id, "d-1");
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at >= created.updated_at);
        assert_eq!(updated.fields["status"], json!("delivered"));
        assert_eq!(updated.fields["customerName"], json!("Rana"));

        let missing = store.update("deliveries", "nope", Fields::new()).await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryStore::new();
        store
            .create("installments", fields(json!({})), Some("i-1"))
            .await
            .expect("create");
        store.delete("installments", "i-1").await.expect("first delete");
        store.delete("installments", "i-1").await.expect("second delete");
        assert!(matches!(
            store.get_by_id("installments", "i-1").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn subscription_sees_initial_and_subsequent_snapshots() {
        let store = MemoryStore::new();
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let sink = sizes.clone();
        let subscription = store
            .subscribe(
                "notifications",
                Arc::new(move |snapshot: &[Record]| sink.lock().expect("sink").push(snapshot.len())),
                Arc::new(|_: &AppError| {}),
            )
            .await
            .expect("subscribe");

        store
            .create("notifications", fields(json!({"read": false})), Some("n-1"))
            .await
            .expect("create");
        store
            .update("notifications", "n-1", fields(json!({"read": true})))
            .await
            .expect("update");
        subscription.unsubscribe();
        store.delete("notifications", "n-1").await.expect("delete");

        assert_eq!(*sizes.lock().expect("sizes"), vec![0, 1, 1]);
        assert_eq!(store.subscription_count(), 0);
    }

    #[tokio::test]
    async fn outage_fails_calls_and_reconnect_redelivers() {
        let store = MemoryStore::new();
        let snapshots = Arc::new(Mutex::new(0usize));
        let errors = Arc::new(Mutex::new(0usize));
        let (snap_sink, err_sink) = (snapshots.clone(), errors.clone());
        let _subscription = store
            .subscribe(
                "installments",
                Arc::new(move |_: &[Record]| *snap_sink.lock().expect("snap") += 1),
                Arc::new(move |error: &AppError| {
                    assert!(error.is_retryable());
                    *err_sink.lock().expect("err") += 1;
                }),
            )
            .await
            .expect("subscribe");

        store.set_available(false);
        let failed = store.create("installments", Fields::new(), None).await;
        assert!(matches!(failed, Err(AppError::StoreUnavailable(_))));
        store.set_available(true);

        assert_eq!(*errors.lock().expect("errors"), 1);
        assert_eq!(*snapshots.lock().expect("snapshots"), 2);
    }

    #[tokio::test]
    async fn native_scan_is_key_ordered_with_single_equality() {
        let store = MemoryStore::new();
        for (id, scope) in [("b", "electronics"), ("a", "electronics"), ("c", "furniture")] {
            store
                .create("installments", fields(json!({"scope": scope})), Some(id))
                .await
                .expect("create");
        }
        let filter = FieldFilter::eq("scope", "electronics");
        let ids: Vec<String> = store
            .scan_native("installments", Some(&filter))
            .await
            .expect("scan")
            .into_iter()
            .map(|record| record.id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
