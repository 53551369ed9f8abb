use crate::errors::{AppError, AppResult};
use crate::models::{
    FieldFilter, GenerationSummary, RegenerationSummary, SubjectError, SubjectType, UrgencyTier,
};
use crate::policy::{authorize, Action};
use crate::repository::{entity_fields, Document, Entity, MalformedRecord, Repository, SyncMode};
use crate::session::SessionContext;
use crate::store::batch::{self, WriteBatch};
use crate::store::StoreAdapter;
use crate::subjects::{Complaint, Delivery, Installment, Subject};
use crate::urgency::{classify_in, utc, Urgency};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const DEFAULT_LOOKAHEAD_DAYS: u32 = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub user_id: String,
    pub urgency_tier: UrgencyTier,
    pub day_offset: i64,
    pub label: String,
    pub due_at: DateTime<Utc>,
    pub title: String,
    pub message: String,
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl Entity for Notification {
    const COLLECTION: &'static str = "notifications";
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NaturalKey {
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub user_id: String,
    pub scope: String,
}

impl NaturalKey {
    pub fn of(document: &Document<Notification>) -> Self {
        Self {
            subject_type: document.data.subject_type,
            subject_id: document.data.subject_id.clone(),
            user_id: document.data.user_id.clone(),
            scope: document.scope.clone(),
        }
    }

    fn for_subject(subject: &Subject, context: &SessionContext) -> Self {
        Self {
            subject_type: subject.subject_type(),
            subject_id: subject.id().to_string(),
            user_id: context.user_id.clone(),
            scope: context.scope.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorPolicy {
    pub lookahead_days: u32,
    pub subject_types: BTreeSet<SubjectType>,
    pub utc_offset: FixedOffset,
}

impl Default for GeneratorPolicy {
    fn default() -> Self {
        Self {
            lookahead_days: DEFAULT_LOOKAHEAD_DAYS,
            subject_types: SubjectType::ALL.into_iter().collect(),
            utc_offset: utc(),
        }
    }
}

impl GeneratorPolicy {
    pub fn classify(&self, subject: &Subject, now: DateTime<Utc>) -> Urgency {
        classify_in(subject.due_at(), now, &self.utc_offset)
    }

    pub fn qualifying_urgency(&self, subject: &Subject, now: DateTime<Utc>) -> Option<Urgency> {
        if subject.is_resolved() || !self.subject_types.contains(&subject.subject_type()) {
            return None;
        }
        let urgency = self.classify(subject, now);
        urgency.within_lookahead(self.lookahead_days).then_some(urgency)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Created(Document<Notification>),
    Updated,
    Unchanged,
    Removed,
    Skipped,
}

#[derive(Clone)]
pub struct NotificationGenerator {
    store: Arc<dyn StoreAdapter>,
    policy: GeneratorPolicy,
}

struct LoadedSubjects {
    subjects: Vec<Subject>,
    loaded_types: BTreeSet<SubjectType>,
    errors: Vec<SubjectError>,
}

impl NotificationGenerator {
    pub fn new(store: Arc<dyn StoreAdapter>, policy: GeneratorPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &GeneratorPolicy {
        &self.policy
    }

    pub fn notifications(&self, context: &SessionContext) -> Repository<Notification> {
        Repository::new(self.store.clone(), context.clone(), SyncMode::Snapshot)
    }

    pub async fn generate_all(&self, context: &SessionContext) -> AppResult<GenerationSummary> {
        self.generate_all_at(context, Utc::now()).await
    }

    pub async fn generate_all_at(&self, context: &SessionContext, now: DateTime<Utc>) -> AppResult<GenerationSummary> {
        authorize(context, Action::GenerateNotifications)?;
        let notifications = self.notifications(context);
        let loaded = self.load_subjects(context).await?;
        let mut summary = GenerationSummary {
            errors: loaded.errors,
            ..GenerationSummary::default()
        };

        let (mut existing, mut corrupt) = self.existing_by_key(&notifications, &mut summary).await?;

        for subject in &loaded.subjects {
            let key = NaturalKey::for_subject(subject, context);
            let current = existing.remove(&key);
            if let Some(ids) = corrupt.remove(&key) {
                match purge(&notifications, &ids).await {
                    Ok(purged) => summary.removed += purged,
                    Err(error) => summary.errors.push(SubjectError {
                        subject_type: subject.subject_type(),
                        subject_id: subject.id().to_string(),
                        message: error.to_string(),
                    }),
                }
            }
            let urgency = self.policy.qualifying_urgency(subject, now);
            if let Some(urgency) = &urgency {
                match urgency.tier {
                    UrgencyTier::Overdue => summary.overdue += 1,
                    UrgencyTier::DueToday => summary.due_today += 1,
                    UrgencyTier::Upcoming => summary.upcoming += 1,
                }
            }
            match self
                .reconcile(&notifications, context, subject, urgency, current.as_ref())
                .await
            {
                Ok(UpsertOutcome::Created(_)) => summary.created += 1,
                Ok(UpsertOutcome::Updated) => summary.updated += 1,
                Ok(UpsertOutcome::Removed) => summary.removed += 1,
                Ok(UpsertOutcome::Unchanged | UpsertOutcome::Skipped) => {}
                Err(error) => summary.errors.push(SubjectError {
                    subject_type: subject.subject_type(),
                    subject_id: subject.id().to_string(),
                    message: error.to_string(),
                }),
            }
        }

        // Whatever is left points at subjects that no longer exist.
        for (key, stale) in existing {
            if !loaded.loaded_types.contains(&key.subject_type) || malformed_subject(&summary.errors, &key) {
                continue;
            }
            match notifications.remove(&stale.id).await {
                Ok(()) => summary.removed += 1,
                Err(error) => summary.errors.push(SubjectError {
                    subject_type: key.subject_type,
                    subject_id: key.subject_id.clone(),
                    message: error.to_string(),
                }),
            }
        }

        tracing::info!(
            scope = %context.scope,
            user_id = %context.user_id,
            created = summary.created,
            updated = summary.updated,
            removed = summary.removed,
            collapsed = summary.collapsed,
            due_today = summary.due_today,
            overdue = summary.overdue,
            upcoming = summary.upcoming,
            errors = summary.errors.len(),
            "notification generation finished"
        );
        Ok(summary)
    }

    pub async fn clear_all(&self, context: &SessionContext) -> AppResult<usize> {
        authorize(context, Action::ClearNotifications)?;
        self.clear_for_user(context).await
    }

    async fn clear_for_user(&self, context: &SessionContext) -> AppResult<usize> {
        let notifications = self.notifications(context);
        let outcome = notifications
            .load_partitioned(&[FieldFilter::eq("userId", context.user_id.clone())])
            .await?;

        let mut batch = WriteBatch::new();
        for id in outcome
            .documents
            .iter()
            .map(|doc| doc.id.as_str())
            .chain(outcome.malformed.iter().map(|bad| bad.id.as_str()))
        {
            batch.delete(Notification::COLLECTION, id);
        }
        let report = batch::apply(self.store.as_ref(), batch).await;
        let summary = report.summary();
        tracing::info!(
            scope = %context.scope,
            user_id = %context.user_id,
            deleted = summary.succeeded,
            failed = summary.failed,
            "notifications cleared"
        );
        for failure in &summary.failures {
            tracing::warn!(failure = %failure, "notification delete failed");
        }
        report.into_result()?;
        Ok(summary.succeeded)
    }

    pub async fn cleanup_resolved(&self, context: &SessionContext) -> AppResult<usize> {
        self.cleanup_resolved_at(context, Utc::now()).await
    }

    pub async fn cleanup_resolved_at(&self, context: &SessionContext, now: DateTime<Utc>) -> AppResult<usize> {
        authorize(context, Action::CleanupResolved)?;
        let notifications = self.notifications(context);
        let loaded = self.load_subjects(context).await?;
        let by_key: BTreeMap<NaturalKey, &Subject> = loaded
            .subjects
            .iter()
            .map(|subject| (NaturalKey::for_subject(subject, context), subject))
            .collect();

        let mut cleaned = 0;
        for notification in notifications
            .load(&[FieldFilter::eq("userId", context.user_id.clone())])
            .await?
        {
            let key = NaturalKey::of(&notification);
            if !loaded.loaded_types.contains(&key.subject_type) || malformed_subject(&loaded.errors, &key) {
                continue;
            }
            let keep = by_key
                .get(&key)
                .is_some_and(|subject| self.policy.qualifying_urgency(subject, now).is_some());
            if keep {
                continue;
            }
            match notifications.remove(&notification.id).await {
                Ok(()) => cleaned += 1,
                Err(error) => {
                    tracing::warn!(id = %notification.id, error = %error, "failed to remove resolved notification");
                }
            }
        }
        tracing::info!(scope = %context.scope, user_id = %context.user_id, cleaned, "resolved notifications cleaned");
        Ok(cleaned)
    }

    pub async fn regenerate(&self, context: &SessionContext) -> AppResult<RegenerationSummary> {
        self.regenerate_at(context, Utc::now()).await
    }

    pub async fn regenerate_at(&self, context: &SessionContext, now: DateTime<Utc>) -> AppResult<RegenerationSummary> {
        authorize(context, Action::RegenerateNotifications)?;
        let deleted_count = self.clear_for_user(context).await?;
        let generation = self.generate_all_at(context, now).await?;
        Ok(RegenerationSummary {
            deleted_count,
            created_count: generation.created,
            generation,
        })
    }

    pub async fn notify_subject(&self, context: &SessionContext, subject: &Subject) -> Option<UpsertOutcome> {
        self.notify_subject_at(context, subject, Utc::now()).await
    }

    pub async fn notify_subject_at(
        &self,
        context: &SessionContext,
        subject: &Subject,
        now: DateTime<Utc>,
    ) -> Option<UpsertOutcome> {
        match self.upsert_one(context, subject, now).await {
            Ok(outcome) => Some(outcome),
            Err(error) => {
                tracing::warn!(
                    subject_type = subject.subject_type().as_str(),
                    subject_id = %subject.id(),
                    error = %error,
                    "notification update after write failed"
                );
                None
            }
        }
    }

    async fn upsert_one(&self, context: &SessionContext, subject: &Subject, now: DateTime<Utc>) -> AppResult<UpsertOutcome> {
        let notifications = self.notifications(context);
        let outcome = notifications
            .load_partitioned(&[
                FieldFilter::eq("userId", context.user_id.clone()),
                FieldFilter::eq("subjectType", subject.subject_type().as_str()),
                FieldFilter::eq("subjectId", subject.id()),
            ])
            .await?;
        let corrupt: Vec<String> = outcome.malformed.into_iter().map(|bad| bad.id).collect();
        purge(&notifications, &corrupt).await?;
        let mut matches = outcome.documents;
        let current = if matches.len() > 1 {
            Some(self.collapse(&notifications, matches).await?.0)
        } else {
            matches.pop()
        };
        let urgency = self.policy.qualifying_urgency(subject, now);
        self.reconcile(&notifications, context, subject, urgency, current.as_ref())
            .await
    }

    async fn reconcile(
        &self,
        notifications: &Repository<Notification>,
        context: &SessionContext,
        subject: &Subject,
        urgency: Option<Urgency>,
        current: Option<&Document<Notification>>,
    ) -> AppResult<UpsertOutcome> {
        let Some(urgency) = urgency else {
            return match current {
                Some(current) => {
                    notifications.remove(&current.id).await?;
                    Ok(UpsertOutcome::Removed)
                }
                None => Ok(UpsertOutcome::Skipped),
            };
        };

        let Some(current) = current else {
            let created = notifications
                .add(build_notification(subject, context, &urgency, None))
                .await?;
            return Ok(UpsertOutcome::Created(created));
        };

        let desired = build_notification(subject, context, &urgency, Some(&current.data));
        if desired == current.data {
            return Ok(UpsertOutcome::Unchanged);
        }
        let mut patch = entity_fields(&desired)?;
        if desired.read_at.is_none() {
            patch.insert("readAt".to_string(), Value::Null);
        }
        notifications.update(&current.id, patch).await?;
        Ok(UpsertOutcome::Updated)
    }

    async fn load_subjects(&self, context: &SessionContext) -> AppResult<LoadedSubjects> {
        let mut loaded = LoadedSubjects {
            subjects: Vec::new(),
            loaded_types: BTreeSet::new(),
            errors: Vec::new(),
        };
        for subject_type in &self.policy.subject_types {
            match subject_type {
                SubjectType::Installment => self.load_kind::<Installment>(context, *subject_type, &mut loaded).await?,
                SubjectType::Delivery => self.load_kind::<Delivery>(context, *subject_type, &mut loaded).await?,
                SubjectType::Complaint => self.load_kind::<Complaint>(context, *subject_type, &mut loaded).await?,
            }
        }
        Ok(loaded)
    }

    async fn load_kind<T>(
        &self,
        context: &SessionContext,
        subject_type: SubjectType,
        loaded: &mut LoadedSubjects,
    ) -> AppResult<()>
    where
        T: Entity,
        Subject: From<Document<T>>,
    {
        let repository = Repository::<T>::new(self.store.clone(), context.clone(), SyncMode::Snapshot);
        let outcome = repository.load_partitioned(&[]).await?;
        for bad in outcome.malformed {
            tracing::warn!(subject_type = subject_type.as_str(), id = %bad.id, error = %bad.message, "malformed subject");
            loaded.errors.push(SubjectError {
                subject_type,
                subject_id: bad.id,
                message: bad.message,
            });
        }
        loaded.subjects.extend(outcome.documents.into_iter().map(Subject::from));
        loaded.loaded_types.insert(subject_type);
        Ok(())
    }

    async fn existing_by_key(
        &self,
        notifications: &Repository<Notification>,
        summary: &mut GenerationSummary,
    ) -> AppResult<(BTreeMap<NaturalKey, Document<Notification>>, BTreeMap<NaturalKey, Vec<String>>)> {
        let context = notifications.context();
        let outcome = notifications
            .load_partitioned(&[FieldFilter::eq("userId", context.user_id.clone())])
            .await?;
        let mut corrupt: BTreeMap<NaturalKey, Vec<String>> = BTreeMap::new();
        for bad in outcome.malformed {
            tracing::warn!(id = %bad.id, error = %bad.message, "malformed notification");
            if let Some(key) = malformed_key(&bad, context) {
                corrupt.entry(key).or_default().push(bad.id);
            }
        }
        let mut groups: BTreeMap<NaturalKey, Vec<Document<Notification>>> = BTreeMap::new();
        for document in outcome.documents {
            groups.entry(NaturalKey::of(&document)).or_default().push(document);
        }

        let mut existing = BTreeMap::new();
        for (key, group) in groups {
            let keep = if group.len() > 1 {
                let (keep, removed) = self.collapse(notifications, group).await?;
                summary.collapsed += removed;
                keep
            } else {
                match group.into_iter().next() {
                    Some(only) => only,
                    None => continue,
                }
            };
            existing.insert(key, keep);
        }
        Ok((existing, corrupt))
    }

    // Concurrent runs can both create for one key; the oldest record wins.
    async fn collapse(
        &self,
        notifications: &Repository<Notification>,
        mut group: Vec<Document<Notification>>,
    ) -> AppResult<(Document<Notification>, usize)> {
        group.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let mut rest = group.into_iter();
        let keep = rest
            .next()
            .ok_or_else(|| AppError::Internal("cannot collapse an empty group".to_string()))?;
        let mut removed = 0;
        for duplicate in rest {
            tracing::warn!(
                keep = %keep.id,
                duplicate = %duplicate.id,
                subject_id = %keep.data.subject_id,
                "collapsing duplicate notification"
            );
            notifications.remove(&duplicate.id).await?;
            removed += 1;
        }
        Ok((keep, removed))
    }
}

fn malformed_key(bad: &MalformedRecord, context: &SessionContext) -> Option<NaturalKey> {
    let subject_type = serde_json::from_value::<SubjectType>(bad.fields.get("subjectType")?.clone()).ok()?;
    Some(NaturalKey {
        subject_type,
        subject_id: bad.text("subjectId")?.to_string(),
        user_id: bad.text("userId")?.to_string(),
        scope: context.scope.clone(),
    })
}

async fn purge(notifications: &Repository<Notification>, ids: &[String]) -> AppResult<usize> {
    for id in ids {
        tracing::warn!(id = %id, "replacing malformed notification");
        notifications.remove(id).await?;
    }
    Ok(ids.len())
}

fn malformed_subject(errors: &[SubjectError], key: &NaturalKey) -> bool {
    errors
        .iter()
        .any(|error| error.subject_type == key.subject_type && error.subject_id == key.subject_id)
}

// Read state survives re-classification unless the tier changed.
fn build_notification(
    subject: &Subject,
    context: &SessionContext,
    urgency: &Urgency,
    current: Option<&Notification>,
) -> Notification {
    let (read, read_at) = match current {
        Some(current) if current.urgency_tier == urgency.tier => (current.read, current.read_at),
        _ => (false, None),
    };
    Notification {
        subject_type: subject.subject_type(),
        subject_id: subject.id().to_string(),
        user_id: context.user_id.clone(),
        urgency_tier: urgency.tier,
        day_offset: urgency.day_offset,
        label: urgency.label.clone(),
        due_at: subject.due_at(),
        title: subject.title(),
        message: subject.message(&urgency.label),
        read,
        read_at,
    }
}
