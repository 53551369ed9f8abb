use std::sync::Arc;

use bizdash_core::models::{FieldFilter, Fields, OrderBy, PageRequest, Query};
use bizdash_core::subjects::{Delivery, DeliveryStatus, Installment, InstallmentStatus};
use bizdash_core::{
    AppError, DashboardConfig, DashboardCore, MemoryStore, Notification, Role, SessionContext, StoreAdapter,
    StoreBackend, SubjectType, SyncMode, UrgencyTier,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeSet;
use serde_json::json;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().expect("timestamp")
}

fn context(user: &str, role: Role, scope: &str) -> SessionContext {
    SessionContext::new(user, role, scope).expect("context")
}

fn memory_core() -> DashboardCore {
    let store: Arc<dyn StoreAdapter> = Arc::new(MemoryStore::new());
    let config = DashboardConfig {
        store: StoreBackend::Memory,
        ..DashboardConfig::default()
    };
    DashboardCore::with_store(store, config).expect("core")
}

fn installment(customer: &str, amount: f64, due: DateTime<Utc>) -> Installment {
    Installment {
        invoice_id: None,
        customer_name: customer.to_string(),
        amount,
        due_date: due,
        status: InstallmentStatus::Pending,
    }
}

async fn seed_installment(core: &DashboardCore, ctx: &SessionContext, data: Installment) -> String {
    core.repository::<Installment>(ctx, SyncMode::Snapshot)
        .add(data)
        .await
        .expect("add installment")
        .id
}

#[tokio::test]
async fn due_today_and_overdue_installments_produce_one_notification_each() {
    let core = memory_core();
    let ctx = context("U", Role::Owner, "electronics");
    seed_installment(&core, &ctx, installment("A", 500.0, now())).await;
    seed_installment(&core, &ctx, installment("B", 300.0, now() - Duration::days(2))).await;

    let first = core.generator().generate_all_at(&ctx, now()).await.expect("first run");
    assert_eq!(first.created, 2);
    assert_eq!(first.due_today, 1);
    assert_eq!(first.overdue, 1);
    assert!(first.errors.is_empty());

    let notifications = core.repository::<Notification>(&ctx, SyncMode::Snapshot);
    let mut before: Vec<String> = notifications.load(&[]).await.expect("load").into_iter().map(|doc| doc.id).collect();
    before.sort();

    let second = core.generator().generate_all_at(&ctx, now()).await.expect("second run");
    assert_eq!(second.created, 0);
    assert_eq!((second.due_today, second.overdue), (1, 1));

    let after = notifications.load(&[]).await.expect("load");
    let mut after_ids: Vec<String> = after.iter().map(|doc| doc.id.clone()).collect();
    after_ids.sort();
    assert_eq!(before, after_ids);

    let overdue = after
        .iter()
        .find(|doc| doc.data.urgency_tier == UrgencyTier::Overdue)
        .expect("overdue notification");
    assert_eq!(overdue.data.day_offset, -2);
    assert_eq!(overdue.data.label, "2 days overdue");
    assert_eq!(overdue.data.user_id, "U");
    assert_eq!(overdue.scope, "electronics");
}

#[tokio::test]
async fn repeated_generation_is_idempotent() {
    let core = memory_core();
    let ctx = context("U", Role::Manager, "electronics");
    for day in [-3, 0, 1, 6, 8] {
        seed_installment(&core, &ctx, installment("C", 10.0, now() + Duration::days(day))).await;
    }

    let first = core.generator().generate_all_at(&ctx, now()).await.expect("first run");
    assert_eq!(first.created, 4);
    for _ in 0..4 {
        let again = core.generator().generate_all_at(&ctx, now()).await.expect("rerun");
        assert_eq!((again.created, again.updated, again.removed), (0, 0, 0));
    }
    let count = core
        .repository::<Notification>(&ctx, SyncMode::Snapshot)
        .count(&[])
        .await
        .expect("count");
    assert_eq!(count, 4);
}

#[tokio::test]
async fn paid_installment_is_cleaned_and_not_regenerated() {
    let core = memory_core();
    let ctx = context("U", Role::Employee, "electronics");
    let paid_id = seed_installment(&core, &ctx, installment("A", 500.0, now())).await;
    seed_installment(&core, &ctx, installment("B", 300.0, now() + Duration::days(1))).await;
    core.generator().generate_all_at(&ctx, now()).await.expect("generate");

    let mut patch = Fields::new();
    patch.insert("status".to_string(), json!("paid"));
    core.repository::<Installment>(&ctx, SyncMode::Snapshot)
        .update(&paid_id, patch)
        .await
        .expect("mark paid");

    let cleaned = core.generator().cleanup_resolved_at(&ctx, now()).await.expect("cleanup");
    assert_eq!(cleaned, 1);

    let rerun = core.generator().generate_all_at(&ctx, now()).await.expect("rerun");
    assert_eq!(rerun.created, 0);
    let remaining = core
        .repository::<Notification>(&ctx, SyncMode::Snapshot)
        .load(&[])
        .await
        .expect("load");
    assert_eq!(remaining.len(), 1);
    assert!(remaining.iter().all(|doc| doc.data.subject_id != paid_id));

    let mut reopened = Fields::new();
    reopened.insert("status".to_string(), json!("pending"));
    core.repository::<Installment>(&ctx, SyncMode::Snapshot)
        .update(&paid_id, reopened)
        .await
        .expect("back to pending");
    let renotified = core.generator().generate_all_at(&ctx, now()).await.expect("after reopen");
    assert_eq!(renotified.created, 1);
    let notifications = core.repository::<Notification>(&ctx, SyncMode::Snapshot);
    assert_eq!(notifications.count(&[]).await.expect("count"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_generation_settles_to_one_notification_per_subject() {
    let core = memory_core();
    let ctx = context("U", Role::Owner, "electronics");
    let mut subject_ids = BTreeSet::new();
    for day in [-2, -1, 0, 1, 2, 3] {
        subject_ids.insert(seed_installment(&core, &ctx, installment("C", 15.0, now() + Duration::days(day))).await);
    }

    let runs: Vec<_> = (0..2)
        .map(|_| {
            let generator = core.generator().clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { generator.generate_all_at(&ctx, now()).await })
        })
        .collect();
    for run in runs {
        run.await.expect("join").expect("concurrent run");
    }

    let settled = core.generator().generate_all_at(&ctx, now()).await.expect("settling run");
    assert_eq!(settled.created, 0);
    let stored = core
        .repository::<Notification>(&ctx, SyncMode::Snapshot)
        .load(&[])
        .await
        .expect("load");
    assert_eq!(stored.len(), subject_ids.len());
    let notified: BTreeSet<String> = stored.into_iter().map(|doc| doc.data.subject_id).collect();
    assert_eq!(notified, subject_ids);
}

#[tokio::test]
async fn notifications_page_through_in_day_offset_order() {
    let core = memory_core();
    let ctx = context("U", Role::Owner, "electronics");
    for day in [-4, -3, -2, -1, 0] {
        seed_installment(&core, &ctx, installment("P", 5.0, now() + Duration::days(day))).await;
    }
    core.generator().generate_all_at(&ctx, now()).await.expect("generate");

    let notifications = core.repository::<Notification>(&ctx, SyncMode::Snapshot);
    let query = Query::new()
        .where_eq("userId", "U")
        .order_by(OrderBy::asc("dayOffset"));
    let first = notifications
        .page(&query, PageRequest { limit: Some(2), cursor: None })
        .await
        .expect("first page");
    assert_eq!(first.items.len(), 2);
    assert_eq!(first.total_approx, Some(5));
    assert_eq!(first.items[0].data.day_offset, -4);
    let cursor = first.next_cursor.clone().expect("more pages");

    let second = notifications
        .page(&query, PageRequest { limit: Some(2), cursor: Some(cursor) })
        .await
        .expect("second page");
    assert_eq!(
        second.items.iter().map(|doc| doc.data.day_offset).collect::<Vec<_>>(),
        vec![-2, -1]
    );
    let last = notifications
        .page(&query, PageRequest { limit: Some(2), cursor: second.next_cursor })
        .await
        .expect("last page");
    assert_eq!(last.items.len(), 1);
    assert!(last.next_cursor.is_none());

    let bad = notifications
        .page(&query, PageRequest { limit: None, cursor: Some("soon".to_string()) })
        .await;
    assert!(matches!(bad, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn background_refresh_watches_source_collections_until_stopped() {
    let store = Arc::new(MemoryStore::new());
    let shared: Arc<dyn StoreAdapter> = store.clone();
    let config = DashboardConfig {
        store: StoreBackend::Memory,
        ..DashboardConfig::default()
    };
    let core = DashboardCore::with_store(shared, config).expect("core");
    let ctx = context("U", Role::Owner, "electronics");

    let background = core.start_background_refresh(&ctx).await.expect("start");
    assert_eq!(store.subscription_count(), 3);
    assert!(!background.gate().is_in_flight());

    seed_installment(&core, &ctx, installment("W", 1.0, now())).await;
    background.stop();
    assert_eq!(store.subscription_count(), 0);
}

#[tokio::test]
async fn scopes_never_see_each_other() {
    let core = memory_core();
    let electronics = context("U", Role::Owner, "electronics");
    let furniture = context("U", Role::Owner, "furniture");
    let foreign_id = seed_installment(&core, &furniture, installment("F", 90.0, now())).await;
    seed_installment(&core, &electronics, installment("E", 40.0, now())).await;

    let summary = core.generator().generate_all_at(&electronics, now()).await.expect("generate");
    assert_eq!(summary.created, 1);

    let installments = core.repository::<Installment>(&electronics, SyncMode::Snapshot);
    assert!(matches!(installments.get_by_id(&foreign_id).await, Err(AppError::NotFound(_))));
    installments.remove(&foreign_id).await.expect("foreign remove is a no-op");
    assert!(core
        .repository::<Installment>(&furniture, SyncMode::Snapshot)
        .get_by_id(&foreign_id)
        .await
        .is_ok());

    let furniture_notifications = core
        .repository::<Notification>(&furniture, SyncMode::Snapshot)
        .count(&[])
        .await
        .expect("count");
    assert_eq!(furniture_notifications, 0);
}

#[tokio::test]
async fn employees_cannot_clear_or_regenerate() {
    let core = memory_core();
    let employee = context("U", Role::Employee, "electronics");
    assert!(matches!(core.clear_all(&employee).await, Err(AppError::Forbidden(_))));
    assert!(matches!(core.regenerate(&employee).await, Err(AppError::Forbidden(_))));

    let manager = context("U", Role::Manager, "electronics");
    seed_installment(&core, &manager, installment("A", 5.0, now())).await;
    core.generator().generate_all_at(&manager, now()).await.expect("generate");
    let regenerated = core.generator().regenerate_at(&manager, now()).await.expect("regenerate");
    assert_eq!((regenerated.deleted_count, regenerated.created_count), (1, 1));
}

#[tokio::test]
async fn recording_a_subject_notifies_immediately_and_inbox_tracks_it() {
    let core = memory_core();
    let ctx = context("U", Role::Owner, "electronics");
    let inbox = core.inbox(&ctx);
    core.record_delivery(
        &inbox,
        Delivery {
            customer_name: "Omar".to_string(),
            address: Some("12 Nile St".to_string()),
            scheduled_at: Utc::now() + Duration::days(2),
            status: DeliveryStatus::Scheduled,
        },
    )
    .await
    .expect("record delivery");
    core.record_installment(&inbox, installment("A", 20.0, Utc::now() - Duration::days(3)))
        .await
        .expect("record installment");

    assert_eq!(inbox.unread_count(), 2);
    assert_eq!(inbox.unread_by_category().get(&SubjectType::Delivery), Some(&1));
    let ordered = inbox.notifications();
    assert_eq!(ordered.len(), 2);
    assert_eq!(ordered[0].data.urgency_tier, UrgencyTier::Overdue);

    inbox.mark_read(&ordered[0].id).await.expect("mark read");
    assert_eq!(inbox.unread_count(), 1);

    let watch = inbox.watch().await.expect("watch");
    assert_eq!(inbox.unread_count(), 1);
    watch.unsubscribe();
}

#[tokio::test]
async fn sqlite_backend_persists_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = DashboardConfig {
        data_dir: dir.path().to_path_buf(),
        store: StoreBackend::Sqlite,
        ..DashboardConfig::default()
    };
    let ctx = context("U", Role::Owner, "electronics");

    let core = DashboardCore::init(config.clone()).expect("open");
    seed_installment(&core, &ctx, installment("A", 500.0, now())).await;
    seed_installment(&core, &ctx, installment("B", 300.0, now() - Duration::days(2))).await;
    let first = core.generator().generate_all_at(&ctx, now()).await.expect("generate");
    assert_eq!((first.created, first.due_today, first.overdue), (2, 1, 1));
    core.close().await.expect("close");
    drop(core);
    assert!(config.sqlite_path().exists());

    let reopened = DashboardCore::init(config).expect("reopen");
    let second = reopened.generator().generate_all_at(&ctx, now()).await.expect("rerun");
    assert_eq!(second.created, 0);
    let stored = reopened
        .repository::<Notification>(&ctx, SyncMode::Snapshot)
        .load(&[])
        .await
        .expect("load");
    assert_eq!(stored.len(), 2);
    reopened.close().await.expect("close");
}

#[tokio::test]
async fn sqlite_filters_beyond_the_first_and_cleanup_run_on_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = DashboardConfig {
        data_dir: dir.path().to_path_buf(),
        store: StoreBackend::Sqlite,
        ..DashboardConfig::default()
    };
    let ctx = context("U", Role::Manager, "electronics");
    let core = DashboardCore::init(config).expect("open");

    let paid_id = seed_installment(&core, &ctx, installment("A", 500.0, now())).await;
    seed_installment(&core, &ctx, installment("B", 300.0, now() - Duration::days(2))).await;
    seed_installment(&core, &ctx, installment("C", 300.0, now() + Duration::days(3))).await;
    core.generator().generate_all_at(&ctx, now()).await.expect("generate");

    let notifications = core.repository::<Notification>(&ctx, SyncMode::Snapshot);
    let overdue = notifications
        .query(&Query::new().where_eq("userId", "U").where_eq("urgencyTier", "overdue"))
        .await
        .expect("two filters");
    assert_eq!(overdue.len(), 1);
    assert_eq!(overdue[0].data.day_offset, -2);
    assert_eq!(
        notifications
            .count(&[FieldFilter::eq("urgencyTier", "dueToday")])
            .await
            .expect("count"),
        1
    );

    let mut patch = Fields::new();
    patch.insert("status".to_string(), json!("paid"));
    core.repository::<Installment>(&ctx, SyncMode::Snapshot)
        .update(&paid_id, patch)
        .await
        .expect("mark paid");
    let cleaned = core.generator().cleanup_resolved_at(&ctx, now()).await.expect("cleanup");
    assert_eq!(cleaned, 1);
    let remaining = notifications.load(&[]).await.expect("load");
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|doc| doc.data.subject_id != paid_id));
    core.close().await.expect("close");
}
