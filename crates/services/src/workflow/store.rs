use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use intake_core::Clock;
use intake_core::model::{
    AssessmentProgress, ErrorReport, FormData, RecoveryOptions, WorkflowState, WorkflowSummary,
};
use storage::repository::KeyValueStore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::persistence::{self, StoredSession};
use crate::config::WorkflowConfig;
use crate::error::SessionStoreError;
use crate::runtime::{lock, spawn_after};
use crate::validator::SessionValidator;

/// Callback invoked after every state change; `None` once the state is cleared.
pub type StateListener = Arc<dyn Fn(Option<&WorkflowState>) + Send + Sync>;

/// Handle returned by `SessionStateStore::subscribe`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Debug for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerId({})", self.0)
    }
}

/// How a form update reaches storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaveOptions {
    /// Write now instead of waiting for the debounce window.
    pub immediate: bool,
}

impl SaveOptions {
    #[must_use]
    pub fn immediate() -> Self {
        Self { immediate: true }
    }

    #[must_use]
    pub fn debounced() -> Self {
        Self { immediate: false }
    }
}

struct StoreInner {
    clock: Clock,
    storage: Arc<dyn KeyValueStore>,
    validator: Arc<dyn SessionValidator>,
    config: WorkflowConfig,
    state: Mutex<Option<WorkflowState>>,
    listeners: Mutex<Vec<(ListenerId, StateListener)>>,
    next_listener: AtomicU64,
    pending_save: Mutex<Option<JoinHandle<()>>>,
    completion_generation: AtomicU64,
}

impl StoreInner {
    fn snapshot(&self) -> Option<WorkflowState> {
        lock(&self.state).clone()
    }

    /// Applies `f` to the active state and returns a copy of the result.
    fn mutate<R>(&self, f: impl FnOnce(&mut WorkflowState) -> R) -> Option<(R, WorkflowState)> {
        let mut guard = lock(&self.state);
        let state = guard.as_mut()?;
        let out = f(state);
        Some((out, state.clone()))
    }

    fn notify(&self, state: Option<&WorkflowState>) {
        let listeners: Vec<StateListener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(state);
        }
    }

    async fn persist(&self, state: &WorkflowState) {
        let key = self.config.storage_key();
        match persistence::save(self.storage.as_ref(), key, state).await {
            Ok(()) => debug!(session_id = %state.session_id, "workflow state persisted"),
            Err(err) => warn!(
                session_id = %state.session_id,
                error = %err,
                "workflow state not persisted; continuing in memory"
            ),
        }
    }

    async fn persist_current(&self) {
        if let Some(state) = self.snapshot() {
            self.persist(&state).await;
        }
    }

    async fn remove_stored(&self) {
        if let Err(err) = self.storage.remove_item(self.config.storage_key()).await {
            warn!(error = %err, "failed to remove stored workflow state");
        }
    }

    async fn load_stored(&self) -> StoredSession {
        let loaded = persistence::load(
            self.storage.as_ref(),
            self.config.storage_key(),
            self.clock.now(),
            self.config.max_session_age(),
        )
        .await;
        match loaded {
            Ok(stored) => stored,
            Err(err) => {
                warn!(error = %err, "workflow storage unreadable; treating as no session");
                StoredSession::Missing
            }
        }
    }

    async fn session_is_valid(&self) -> bool {
        match self.validator.validate_session().await {
            Ok(validation) => validation.is_valid,
            Err(err) => {
                warn!(error = %err, "session validation failed");
                false
            }
        }
    }

    fn cancel_pending_save(&self) {
        if let Some(handle) = lock(&self.pending_save).take() {
            handle.abort();
        }
    }

    /// Invalidates any scheduled completion cleanup and returns the new generation.
    fn bump_generation(&self) -> u64 {
        self.completion_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current_generation(&self, generation: u64) -> bool {
        self.completion_generation.load(Ordering::SeqCst) == generation
    }

    /// Whether a session was started or cleared since `generation` was read.
    fn superseded_since(&self, generation: u64) -> bool {
        let guard = lock(&self.state);
        guard.is_some() || !self.is_current_generation(generation)
    }

    /// Removes a stored record that a resume begun at `generation` rejected,
    /// unless a newer session has taken over the key.
    async fn discard_rejected(&self, generation: u64) -> Option<WorkflowState> {
        if self.superseded_since(generation) {
            debug!("stored record left alone; a newer session is active");
            return self.snapshot();
        }
        self.remove_stored().await;
        if self.superseded_since(generation) {
            self.persist_current().await;
            return self.snapshot();
        }
        None
    }

    async fn finish_completion(&self, generation: u64) {
        let cleared = {
            let mut guard = lock(&self.state);
            if self.is_current_generation(generation) {
                guard.take().is_some()
            } else {
                false
            }
        };
        if !cleared {
            debug!("stale workflow completion timer ignored");
            return;
        }

        self.notify(None);
        self.remove_stored().await;
        // A session started while the delete was in flight must survive it.
        if !self.is_current_generation(generation) {
            self.persist_current().await;
        }
        info!("completed workflow session removed");
    }
}

/// Owns the single resumable workflow record.
///
/// In-memory changes are visible to listeners before the matching write
/// reaches storage. Storage failures are logged and never surface from the
/// mutating calls.
#[derive(Clone)]
pub struct SessionStateStore {
    inner: Arc<StoreInner>,
}

impl SessionStateStore {
    #[must_use]
    pub fn new(
        clock: Clock,
        storage: Arc<dyn KeyValueStore>,
        validator: Arc<dyn SessionValidator>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                clock,
                storage,
                validator,
                config,
                state: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                pending_save: Mutex::new(None),
                completion_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Discard whatever is active and start over at step 1.
    pub async fn start_session(&self, anonymous: bool) -> WorkflowState {
        self.inner.cancel_pending_save();
        self.inner.bump_generation();

        let state = WorkflowState::new(anonymous, self.inner.clock.now());
        *lock(&self.inner.state) = Some(state.clone());
        info!(session_id = %state.session_id, anonymous, "workflow session started");

        self.inner.notify(Some(&state));
        self.inner.persist(&state).await;
        state
    }

    /// Return the active session, loading a stored one if none is active.
    ///
    /// Expired, malformed or no-longer-authenticated records are removed. A
    /// session started while the load is pending wins: it is returned and its
    /// stored record is kept.
    pub async fn resume_session(&self) -> Option<WorkflowState> {
        let generation = {
            let guard = lock(&self.inner.state);
            if let Some(state) = guard.as_ref() {
                return Some(state.clone());
            }
            self.inner.completion_generation.load(Ordering::SeqCst)
        };

        let state = match self.inner.load_stored().await {
            StoredSession::Missing => return self.inner.snapshot(),
            StoredSession::Rejected(reason) => {
                info!(%reason, "discarding stored workflow session");
                return self.inner.discard_rejected(generation).await;
            }
            StoredSession::Valid(state) => state,
        };

        if !state.is_anonymous && !self.inner.session_is_valid().await {
            info!(session_id = %state.session_id, "stored session failed revalidation");
            return self.inner.discard_rejected(generation).await;
        }

        {
            let mut guard = lock(&self.inner.state);
            if guard.is_some() || !self.inner.is_current_generation(generation) {
                return guard.clone();
            }
            *guard = Some(state.clone());
        }

        info!(
            session_id = %state.session_id,
            step = state.current_step,
            "workflow session resumed"
        );
        self.inner.notify(Some(&state));
        Some(state)
    }

    /// Merge answers captured on `step`.
    pub async fn update_form_data(&self, step: u32, partial: FormData, options: SaveOptions) {
        let now = self.inner.clock.now();
        let Some(((), state)) = self
            .inner
            .mutate(|s| s.apply_form_update(step, partial, now))
        else {
            warn!(step, "form update without an active workflow session");
            return;
        };

        self.inner.notify(Some(&state));
        if options.immediate {
            self.inner.cancel_pending_save();
            self.inner.persist(&state).await;
        } else {
            self.schedule_save();
        }
    }

    /// Mirror the latest pipeline snapshot.
    pub async fn update_progress(&self, snapshot: AssessmentProgress) {
        let now = self.inner.clock.now();
        let Some(((), state)) = self.inner.mutate(|s| s.mirror_progress(snapshot, now)) else {
            debug!("progress snapshot without an active workflow session");
            return;
        };
        self.inner.notify(Some(&state));
        self.inner.persist(&state).await;
    }

    pub async fn report_error(&self, report: ErrorReport) {
        let now = self.inner.clock.now();
        let (code, stage, recoverable) = (report.code.clone(), report.stage.clone(), report.recoverable);
        let Some(((), state)) = self.inner.mutate(|s| s.record_error(report, now)) else {
            warn!(%code, %stage, "workflow error without an active session");
            return;
        };
        warn!(session_id = %state.session_id, %code, %stage, recoverable, "workflow error reported");
        self.inner.notify(Some(&state));
        self.inner.persist(&state).await;
    }

    /// Apply recovery actions.
    ///
    /// Returns `true` when nothing needed recovering or recovery ran, `false`
    /// without an active session.
    pub async fn recover_from_errors(&self, options: RecoveryOptions) -> bool {
        let now = self.inner.clock.now();
        let Some((recovered, state)) = self.inner.mutate(|s| s.recover(options, now)) else {
            return false;
        };
        if !recovered {
            return true;
        }

        info!(session_id = %state.session_id, ?options, "workflow recovered from errors");
        self.inner.notify(Some(&state));
        self.inner.persist(&state).await;
        true
    }

    /// Promote an anonymous session once the validator accepts it.
    pub async fn convert_to_authenticated(&self) -> bool {
        let Some(current) = self.inner.snapshot() else {
            warn!("authentication conversion without an active session");
            return false;
        };
        if !current.is_anonymous {
            return true;
        }
        if !self.inner.session_is_valid().await {
            return false;
        }

        let now = self.inner.clock.now();
        let Some(((), state)) = self.inner.mutate(|s| {
            s.is_anonymous = false;
            s.last_updated_at = now;
        }) else {
            return false;
        };
        info!(session_id = %state.session_id, "workflow session converted to authenticated");
        self.inner.notify(Some(&state));
        self.inner.persist(&state).await;
        true
    }

    /// Mark the workflow finished and delete it after the grace window.
    pub async fn complete_workflow(&self) {
        let now = self.inner.clock.now();
        let Some(((), state)) = self.inner.mutate(|s| {
            s.resumable = false;
            s.last_updated_at = now;
        }) else {
            warn!("completion without an active workflow session");
            return;
        };

        self.inner.cancel_pending_save();
        let generation = self.inner.bump_generation();
        info!(session_id = %state.session_id, "workflow completed");
        self.inner.notify(Some(&state));
        self.inner.persist(&state).await;

        let inner = Arc::clone(&self.inner);
        let scheduled = spawn_after(self.inner.config.completion_grace(), async move {
            inner.finish_completion(generation).await;
        });
        if scheduled.is_none() {
            warn!("no async runtime; completed workflow kept until cleared");
        }
    }

    /// Drop the active and stored state right away.
    pub async fn clear_state(&self) {
        self.inner.cancel_pending_save();
        self.inner.bump_generation();
        let previous = lock(&self.inner.state).take();
        if let Some(state) = &previous {
            info!(session_id = %state.session_id, "workflow state cleared");
        }
        self.inner.notify(None);
        self.inner.remove_stored().await;
    }

    /// Write the active state now, cancelling any pending debounced save.
    ///
    /// # Errors
    ///
    /// Returns `SessionStoreError` when there is no session or the write fails.
    pub async fn flush(&self) -> Result<(), SessionStoreError> {
        self.inner.cancel_pending_save();
        let state = self.inner.snapshot().ok_or(SessionStoreError::NoSession)?;
        persistence::save(self.inner.storage.as_ref(), self.inner.config.storage_key(), &state).await
    }

    /// Whether a stored session could be resumed, without adopting it.
    pub async fn can_resume(&self) -> bool {
        self.stored_summary().await.is_some()
    }

    /// Summary of the stored record if it passes the structure and age
    /// checks. Read-only: nothing is adopted, removed or revalidated.
    pub async fn stored_summary(&self) -> Option<WorkflowSummary> {
        match self.inner.load_stored().await {
            StoredSession::Valid(state) => Some(state.summary()),
            StoredSession::Missing | StoredSession::Rejected(_) => None,
        }
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(Option<&WorkflowState>) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::SeqCst) + 1);
        lock(&self.inner.listeners).push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    #[must_use]
    pub fn current_state(&self) -> Option<WorkflowState> {
        self.inner.snapshot()
    }

    #[must_use]
    pub fn summary(&self) -> Option<WorkflowSummary> {
        lock(&self.inner.state).as_ref().map(WorkflowState::summary)
    }

    fn schedule_save(&self) {
        let inner = Arc::clone(&self.inner);
        let mut pending = lock(&self.inner.pending_save);
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        *pending = spawn_after(self.inner.config.save_debounce(), async move {
            inner.persist_current().await;
        });
        if pending.is_none() {
            warn!("no async runtime; debounced workflow save skipped");
        }
    }
}
