pub mod config;
pub mod errors;
pub mod generator;
pub mod inbox;
pub mod models;
pub mod policy;
pub mod query;
pub mod refresh;
pub mod repository;
pub mod retry;
pub mod session;
pub mod store;
pub mod subjects;
pub mod urgency;

pub use crate::config::{DashboardConfig, StoreBackend};
pub use crate::errors::{AppError, AppResult};
pub use crate::generator::{GeneratorPolicy, Notification, NotificationGenerator, UpsertOutcome};
pub use crate::inbox::NotificationInbox;
pub use crate::models::{GenerationSummary, RegenerationSummary, Role, SubjectType, UrgencyTier};
pub use crate::repository::{Document, Entity, Repository, SyncMode, Watch};
pub use crate::session::SessionContext;
pub use crate::store::{MemoryStore, SqliteStore, StoreAdapter};

use crate::refresh::{spawn_periodic, PeriodicRefresh, RefreshFuture, RefreshGate, RefreshTask};
use crate::models::Record;
use crate::store::{ChangeCallback, ErrorCallback, Subscription};
use crate::subjects::{Complaint, Delivery, Installment, Subject};
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

pub fn init_tracing(log_dir: &Path, default_filter: &str) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "bizdash.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}

#[derive(Clone)]
pub struct DashboardCore {
    store: Arc<dyn StoreAdapter>,
    config: DashboardConfig,
    generator: NotificationGenerator,
}

impl DashboardCore {
    pub fn init(config: DashboardConfig) -> AppResult<Self> {
        config.validate()?;
        let store: Arc<dyn StoreAdapter> = match config.store {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Sqlite => Arc::new(SqliteStore::open(&config.sqlite_path())?),
        };
        tracing::info!(
            backend = store.backend_name(),
            data_dir = %config.data_dir.display(),
            "dashboard store opened"
        );
        Self::with_store(store, config)
    }

    pub fn with_store(store: Arc<dyn StoreAdapter>, config: DashboardConfig) -> AppResult<Self> {
        let generator = NotificationGenerator::new(store.clone(), config.generator_policy()?);
        Ok(Self {
            store,
            config,
            generator,
        })
    }

    pub fn store(&self) -> Arc<dyn StoreAdapter> {
        self.store.clone()
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    pub fn generator(&self) -> &NotificationGenerator {
        &self.generator
    }

    pub fn repository<T: Entity>(&self, context: &SessionContext, mode: SyncMode) -> Repository<T> {
        Repository::new(self.store.clone(), context.clone(), mode)
            .with_retry(self.config.retry_policy())
            .with_poll_interval(self.config.refresh_interval())
    }

    pub fn inbox(&self, context: &SessionContext) -> NotificationInbox {
        NotificationInbox::new(self.repository::<Notification>(context, SyncMode::Realtime))
    }

    pub async fn generate_all(&self, context: &SessionContext) -> AppResult<GenerationSummary> {
        self.generator.generate_all(context).await
    }

    pub async fn clear_all(&self, context: &SessionContext) -> AppResult<usize> {
        self.generator.clear_all(context).await
    }

    pub async fn cleanup_resolved(&self, context: &SessionContext) -> AppResult<usize> {
        self.generator.cleanup_resolved(context).await
    }

    pub async fn regenerate(&self, context: &SessionContext) -> AppResult<RegenerationSummary> {
        self.generator.regenerate(context).await
    }

    pub async fn record_installment(
        &self,
        inbox: &NotificationInbox,
        installment: Installment,
    ) -> AppResult<Document<Installment>> {
        let document = self
            .repository::<Installment>(inbox.context(), SyncMode::Snapshot)
            .add(installment)
            .await?;
        self.notify_recorded(inbox, Subject::from(document.clone())).await;
        Ok(document)
    }

    pub async fn record_delivery(&self, inbox: &NotificationInbox, delivery: Delivery) -> AppResult<Document<Delivery>> {
        let document = self
            .repository::<Delivery>(inbox.context(), SyncMode::Snapshot)
            .add(delivery)
            .await?;
        self.notify_recorded(inbox, Subject::from(document.clone())).await;
        Ok(document)
    }

    pub async fn record_complaint(&self, inbox: &NotificationInbox, complaint: Complaint) -> AppResult<Document<Complaint>> {
        let document = self
            .repository::<Complaint>(inbox.context(), SyncMode::Snapshot)
            .add(complaint)
            .await?;
        self.notify_recorded(inbox, Subject::from(document.clone())).await;
        Ok(document)
    }

    async fn notify_recorded(&self, inbox: &NotificationInbox, subject: Subject) {
        if let Some(UpsertOutcome::Created(notification)) = self.generator.notify_subject(inbox.context(), &subject).await {
            inbox.track_created(notification);
        }
    }

    // Source collections feed the gate so a write landing mid-run earns one
    // follow-up run; periodic ticks alone never do.
    pub async fn start_background_refresh(&self, context: &SessionContext) -> AppResult<BackgroundRefresh> {
        let generator = self.generator.clone();
        let task_context = context.clone();
        let task: RefreshTask = Arc::new(move || -> RefreshFuture {
            let generator = generator.clone();
            let context = task_context.clone();
            Box::pin(async move {
                match generator.generate_all(&context).await {
                    Ok(summary) => tracing::debug!(
                        created = summary.created,
                        updated = summary.updated,
                        removed = summary.removed,
                        errors = summary.errors.len(),
                        "background notification refresh finished"
                    ),
                    Err(error) => tracing::warn!(error = %error, "background notification refresh failed"),
                }
            })
        });
        let gate = RefreshGate::new(task);

        let mut watches = Vec::with_capacity(self.generator.policy().subject_types.len());
        for subject_type in &self.generator.policy().subject_types {
            let collection = match subject_type {
                SubjectType::Installment => Installment::COLLECTION,
                SubjectType::Delivery => Delivery::COLLECTION,
                SubjectType::Complaint => Complaint::COLLECTION,
            };
            let changed = gate.clone();
            let on_change: ChangeCallback = Arc::new(move |_: &[Record]| changed.mark_changed());
            let on_error: ErrorCallback = Arc::new(move |error: &AppError| {
                tracing::warn!(collection, error = %error, "source watch failed");
            });
            watches.push(self.store.subscribe(collection, on_change, on_error).await?);
        }

        let periodic = spawn_periodic(gate.clone(), self.config.refresh_interval());
        Ok(BackgroundRefresh {
            gate,
            periodic,
            watches,
        })
    }

    pub async fn close(&self) -> AppResult<()> {
        self.store.close().await
    }
}

pub struct BackgroundRefresh {
    gate: RefreshGate,
    periodic: PeriodicRefresh,
    watches: Vec<Subscription>,
}

impl BackgroundRefresh {
    pub fn gate(&self) -> &RefreshGate {
        &self.gate
    }

    pub fn stop(self) {
        self.periodic.stop();
        for watch in self.watches {
            watch.unsubscribe();
        }
    }
}
