use std::sync::Arc;

use storage::repository::Storage;

use crate::channel::{DeliveryChannel, LocalDeliveryChannel};
use crate::config::{ProgressConfig, WorkflowConfig};
use crate::error::AppServicesError;
use crate::progress::ProgressTracker;
use crate::validator::{SessionValidator, StaticSessionValidator};
use crate::workflow::SessionStateStore;
use crate::Clock;

/// Assembles the workflow store and progress tracker over shared collaborators.
///
/// Built once at startup and handed to whatever drives the intake flow.
#[derive(Clone)]
pub struct AppServices {
    session_store: SessionStateStore,
    progress_tracker: ProgressTracker,
    channel: Arc<dyn DeliveryChannel>,
}

impl AppServices {
    #[must_use]
    pub fn new(
        clock: Clock,
        storage: &Storage,
        channel: Arc<dyn DeliveryChannel>,
        validator: Arc<dyn SessionValidator>,
        workflow_config: WorkflowConfig,
        progress_config: ProgressConfig,
    ) -> Self {
        let session_store = SessionStateStore::new(
            clock,
            Arc::clone(&storage.workflow),
            validator,
            workflow_config,
        );
        let progress_tracker = ProgressTracker::new(clock, Arc::clone(&channel), progress_config);
        Self {
            session_store,
            progress_tracker,
            channel,
        }
    }

    /// Build services backed by `SQLite` storage, an in-process channel and a
    /// validator that accepts every session.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if storage initialization fails.
    pub async fn new_sqlite(
        db_url: &str,
        clock: Clock,
        workflow_config: WorkflowConfig,
    ) -> Result<Self, AppServicesError> {
        let storage = Storage::sqlite(db_url).await?;
        let channel: Arc<dyn DeliveryChannel> = Arc::new(LocalDeliveryChannel::new());
        let validator: Arc<dyn SessionValidator> = Arc::new(StaticSessionValidator::new(true));
        Ok(Self::new(
            clock,
            &storage,
            channel,
            validator,
            workflow_config,
            ProgressConfig::default(),
        ))
    }

    #[must_use]
    pub fn in_memory(clock: Clock) -> Self {
        Self::new(
            clock,
            &Storage::in_memory(),
            Arc::new(LocalDeliveryChannel::new()),
            Arc::new(StaticSessionValidator::new(true)),
            WorkflowConfig::default(),
            ProgressConfig::default(),
        )
    }

    #[must_use]
    pub fn session_store(&self) -> SessionStateStore {
        self.session_store.clone()
    }

    #[must_use]
    pub fn progress_tracker(&self) -> ProgressTracker {
        self.progress_tracker.clone()
    }

    #[must_use]
    pub fn channel(&self) -> Arc<dyn DeliveryChannel> {
        Arc::clone(&self.channel)
    }
}
