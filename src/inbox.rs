use crate::errors::AppResult;
use crate::generator::Notification;
use crate::models::{FieldFilter, Fields, SubjectType};
use crate::repository::{Document, DocumentCallback, Repository, Watch};
use crate::session::SessionContext;
use crate::urgency::sort_by_urgency;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCounter {
    by_type: BTreeMap<SubjectType, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountDrift {
    pub before: usize,
    pub after: usize,
}

impl CountDrift {
    pub fn drifted(&self) -> bool {
        self.before != self.after
    }
}

impl UnreadCounter {
    pub fn total(&self) -> usize {
        self.by_type.values().sum()
    }

    pub fn for_type(&self, subject_type: SubjectType) -> usize {
        self.by_type.get(&subject_type).copied().unwrap_or(0)
    }

    pub fn by_type(&self) -> BTreeMap<SubjectType, usize> {
        self.by_type.clone()
    }

    pub fn reload(&mut self, notifications: &[Document<Notification>]) -> CountDrift {
        let before = self.total();
        self.by_type.clear();
        for notification in notifications.iter().filter(|doc| !doc.data.read) {
            *self.by_type.entry(notification.data.subject_type).or_insert(0) += 1;
        }
        CountDrift {
            before,
            after: self.total(),
        }
    }

    pub fn on_created(&mut self, subject_type: SubjectType) {
        *self.by_type.entry(subject_type).or_insert(0) += 1;
    }

    pub fn on_marked_read(&mut self, subject_type: SubjectType) {
        self.decrement(subject_type);
    }

    pub fn on_deleted(&mut self, subject_type: SubjectType, was_unread: bool) {
        if was_unread {
            self.decrement(subject_type);
        }
    }

    fn decrement(&mut self, subject_type: SubjectType) {
        if let Some(count) = self.by_type.get_mut(&subject_type) {
            *count = count.saturating_sub(1);
        }
    }
}

#[derive(Default)]
struct InboxState {
    notifications: Vec<Document<Notification>>,
    counter: UnreadCounter,
    tracking: bool,
}

#[derive(Clone)]
pub struct NotificationInbox {
    repository: Repository<Notification>,
    state: Arc<Mutex<InboxState>>,
}

impl NotificationInbox {
    pub fn new(repository: Repository<Notification>) -> Self {
        Self {
            repository,
            state: Arc::new(Mutex::new(InboxState::default())),
        }
    }

    pub fn context(&self) -> &SessionContext {
        self.repository.context()
    }

    fn user_filter(&self) -> Vec<FieldFilter> {
        vec![FieldFilter::eq("userId", self.repository.context().user_id.clone())]
    }

    fn lock(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn load(&self) -> AppResult<Vec<Document<Notification>>> {
        let notifications = self.repository.load(&self.user_filter()).await?;
        let (notifications, drift) = self.replace(notifications);
        if let Some(drift) = drift.filter(CountDrift::drifted) {
            tracing::warn!(
                before = drift.before,
                after = drift.after,
                "unread count drifted; corrected from full reload"
            );
        }
        Ok(notifications)
    }

    pub async fn watch(&self) -> AppResult<Watch> {
        let inbox = self.clone();
        let callback: DocumentCallback<Notification> = Arc::new(move |docs: &[Document<Notification>]| {
            inbox.replace(docs.to_vec());
        });
        self.repository.subscribe(&self.user_filter(), callback).await
    }

    // Drift is only meaningful once the counter has been tracking increments.
    fn replace(&self, mut notifications: Vec<Document<Notification>>) -> (Vec<Document<Notification>>, Option<CountDrift>) {
        sort_by_urgency(&mut notifications, |doc| (doc.data.urgency_tier, doc.data.day_offset));
        let mut state = self.lock();
        let tracked = state.tracking;
        let drift = state.counter.reload(&notifications);
        state.tracking = true;
        state.notifications = notifications.clone();
        (notifications, tracked.then_some(drift))
    }

    pub fn track_created(&self, notification: Document<Notification>) {
        let mut state = self.lock();
        if state.notifications.iter().any(|doc| doc.id == notification.id) {
            return;
        }
        if !notification.data.read {
            state.counter.on_created(notification.data.subject_type);
        }
        state.notifications.push(notification);
        sort_by_urgency(&mut state.notifications, |doc| (doc.data.urgency_tier, doc.data.day_offset));
    }

    pub async fn mark_read(&self, id: &str) -> AppResult<()> {
        if self.lock().notifications.iter().any(|doc| doc.id == id && doc.data.read) {
            return Ok(());
        }
        let mut patch = Fields::new();
        patch.insert("read".to_string(), Value::Bool(true));
        patch.insert("readAt".to_string(), serde_json::to_value(Utc::now())?);
        let updated = self.repository.update(id, patch).await?;

        let mut state = self.lock();
        if let Some(doc) = state.notifications.iter_mut().find(|doc| doc.id == id) {
            let was_unread = !doc.data.read;
            *doc = updated;
            if was_unread {
                let subject_type = doc.data.subject_type;
                state.counter.on_marked_read(subject_type);
            }
        }
        Ok(())
    }

    pub async fn mark_all_read(&self) -> AppResult<usize> {
        let unread: Vec<String> = self
            .lock()
            .notifications
            .iter()
            .filter(|doc| !doc.data.read)
            .map(|doc| doc.id.clone())
            .collect();
        let mut marked = 0;
        for id in unread {
            self.mark_read(&id).await?;
            marked += 1;
        }
        Ok(marked)
    }

    pub async fn delete(&self, id: &str) -> AppResult<()> {
        self.repository.remove(id).await?;
        let mut state = self.lock();
        if let Some(position) = state.notifications.iter().position(|doc| doc.id == id) {
            let removed = state.notifications.remove(position);
            state.counter.on_deleted(removed.data.subject_type, !removed.data.read);
        }
        Ok(())
    }

    pub fn notifications(&self) -> Vec<Document<Notification>> {
        self.lock().notifications.clone()
    }

    pub fn unread_count(&self) -> usize {
        self.lock().counter.total()
    }

    pub fn unread_by_category(&self) -> BTreeMap<SubjectType, usize> {
        self.lock().counter.by_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Role, UrgencyTier};
    use crate::repository::SyncMode;
    use crate::store::{MemoryStore, StoreAdapter};
    use chrono::{DateTime, Duration, TimeZone};

    fn due() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).single().expect("timestamp")
    }

    fn notification(subject_type: SubjectType, subject_id: &str, tier: UrgencyTier, day_offset: i64) -> Notification {
        Notification {
            subject_type,
            subject_id: subject_id.to_string(),
            user_id: "u-1".to_string(),
            urgency_tier: tier,
            day_offset,
            label: String::new(),
            due_at: due() + Duration::days(day_offset),
            title: "t".to_string(),
            message: "m".to_string(),
            read: false,
            read_at: None,
        }
    }

    fn inbox() -> NotificationInbox {
        let store: Arc<dyn StoreAdapter> = Arc::new(MemoryStore::new());
        let context = SessionContext::new("u-1", Role::Employee, "electronics").expect("context");
        NotificationInbox::new(Repository::new(store, context, SyncMode::Snapshot))
    }

    #[tokio::test]
    async fn unread_count_survives_reload() {
        let inbox = inbox();
        let mut ids = Vec::new();
        for i in 0..5 {
            let doc = inbox
                .repository
                .add(notification(SubjectType::Installment, &format!("i-{}", i), UrgencyTier::DueToday, 0))
                .await
                .expect("add");
            ids.push(doc.id);
        }
        inbox.load().await.expect("load");
        assert_eq!(inbox.unread_count(), 5);

        inbox.mark_read(&ids[0]).await.expect("mark");
        inbox.mark_read(&ids[1]).await.expect("mark");
        inbox.mark_read(&ids[1]).await.expect("mark twice");
        assert_eq!(inbox.unread_count(), 3);

        inbox.load().await.expect("reload");
        assert_eq!(inbox.unread_count(), 3);
    }

    #[tokio::test]
    async fn delete_only_decrements_for_unread() {
        let inbox = inbox();
        let read = inbox
            .repository
            .add(notification(SubjectType::Delivery, "d-1", UrgencyTier::Overdue, -1))
            .await
            .expect("add");
        let unread = inbox
            .repository
            .add(notification(SubjectType::Complaint, "c-1", UrgencyTier::Upcoming, 2))
            .await
            .expect("add");
        inbox.load().await.expect("load");
        inbox.mark_read(&read.id).await.expect("mark");

        inbox.delete(&read.id).await.expect("delete read");
        assert_eq!(inbox.unread_count(), 1);
        inbox.delete(&unread.id).await.expect("delete unread");
        inbox.delete(&unread.id).await.expect("delete again");
        assert_eq!(inbox.unread_count(), 0);
        assert!(inbox.unread_by_category().values().all(|count| *count == 0));
    }

    #[tokio::test]
    async fn load_orders_by_urgency_and_counts_by_category() {
        let inbox = inbox();
        for (kind, id, tier, offset) in [
            (SubjectType::Installment, "a", UrgencyTier::Upcoming, 3),
            (SubjectType::Delivery, "b", UrgencyTier::Overdue, -1),
            (SubjectType::Installment, "c", UrgencyTier::DueToday, 0),
            (SubjectType::Complaint, "d", UrgencyTier::Overdue, -5),
        ] {
            inbox
                .repository
                .add(notification(kind, id, tier, offset))
                .await
                .expect("add");
        }

        let loaded = inbox.load().await.expect("load");
        let order: Vec<&str> = loaded.iter().map(|doc| doc.data.subject_id.as_str()).collect();
        assert_eq!(order, vec!["d", "b", "c", "a"]);
        assert_eq!(inbox.unread_by_category().get(&SubjectType::Installment), Some(&2));
        assert_eq!(inbox.mark_all_read().await.expect("mark all"), 4);
        assert_eq!(inbox.unread_count(), 0);
    }

    #[tokio::test]
    async fn drift_is_reported_only_against_tracked_counts() {
        let inbox = inbox();
        let first = inbox
            .repository
            .add(notification(SubjectType::Installment, "i-1", UrgencyTier::DueToday, 0))
            .await
            .expect("add");
        let (_, drift) = inbox.replace(vec![first.clone()]);
        assert!(drift.is_none());

        let second = inbox
            .repository
            .add(notification(SubjectType::Delivery, "d-1", UrgencyTier::Upcoming, 2))
            .await
            .expect("add");
        inbox.track_created(second.clone());
        inbox.track_created(second.clone());
        assert_eq!(inbox.unread_count(), 2);

        let (_, drift) = inbox.replace(vec![first.clone(), second]);
        assert!(!drift.expect("tracked").drifted());
        let (_, drift) = inbox.replace(vec![first]);
        assert!(drift.expect("tracked").drifted());
        assert_eq!(inbox.unread_count(), 1);
    }

    #[test]
    fn counter_never_goes_negative_and_reports_drift() {
        let mut counter = UnreadCounter::default();
        counter.on_marked_read(SubjectType::Delivery);
        assert_eq!(counter.total(), 0);
        counter.on_created(SubjectType::Delivery);
        counter.on_created(SubjectType::Delivery);
        let drift = counter.reload(&[]);
        assert!(drift.drifted());
        assert_eq!((drift.before, drift.after), (2, 0));
    }
}
