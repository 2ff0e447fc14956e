use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use intake_core::Clock;
use intake_core::model::{
    AssessmentId, AssessmentProgress, ProgressFailure, ProgressStage, report_to_outer_progress,
};
use tracing::{debug, info, warn};

use super::envelope::{CompletionNotice, ProgressEnvelope};
use crate::channel::{DeliveryChannel, DeliveryOptions, MessageHandler, Routing, SubscribeOptions, SubscriptionId};
use crate::config::{ProgressConfig, TransitionPolicy};
use crate::error::ProgressError;
use crate::runtime::{lock, spawn_after};

pub type ProgressCallback = Arc<dyn Fn(&AssessmentProgress) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&ProgressFailure) + Send + Sync>;
pub type CompleteCallback = Arc<dyn Fn(&CompletionNotice) + Send + Sync>;

/// Callbacks for one assessment's progress topic.
#[derive(Clone)]
pub struct ProgressSubscription {
    assessment_id: AssessmentId,
    on_progress: Option<ProgressCallback>,
    on_error: Option<ErrorCallback>,
    on_complete: Option<CompleteCallback>,
}

impl ProgressSubscription {
    #[must_use]
    pub fn new(assessment_id: AssessmentId) -> Self {
        Self {
            assessment_id,
            on_progress: None,
            on_error: None,
            on_complete: None,
        }
    }

    #[must_use]
    pub fn on_progress(mut self, f: impl Fn(&AssessmentProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&ProgressFailure) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_complete(mut self, f: impl Fn(&CompletionNotice) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn assessment_id(&self) -> &AssessmentId {
        &self.assessment_id
    }

    fn route(&self, message: &Value) {
        let envelope = match serde_json::from_value::<ProgressEnvelope>(message.clone()) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(assessment_id = %self.assessment_id, error = %err, "dropping malformed progress message");
                return;
            }
        };

        match envelope {
            ProgressEnvelope::ProgressUpdate(progress) => match (&progress.error, progress.stage) {
                (Some(failure), ProgressStage::Error) => {
                    if let Some(on_error) = &self.on_error {
                        on_error(failure);
                    }
                }
                _ => {
                    if let Some(on_progress) = &self.on_progress {
                        on_progress(&progress);
                    }
                }
            },
            ProgressEnvelope::AssessmentCompleted(notice) => {
                if let Some(on_complete) = &self.on_complete {
                    on_complete(&notice);
                }
            }
        }
    }
}

struct TrackedProgress {
    progress: AssessmentProgress,
    generation: u64,
}

struct TrackerInner {
    clock: Clock,
    channel: Arc<dyn DeliveryChannel>,
    config: ProgressConfig,
    records: Mutex<HashMap<AssessmentId, TrackedProgress>>,
    subscriptions: Mutex<HashMap<SubscriptionId, AssessmentId>>,
    next_generation: AtomicU64,
}

impl TrackerInner {
    fn evict_if_current(&self, id: &AssessmentId, generation: u64) {
        let mut records = lock(&self.records);
        if records.get(id).is_some_and(|t| t.generation == generation) {
            records.remove(id);
            debug!(assessment_id = %id, "evicted completed progress record");
        } else {
            debug!(assessment_id = %id, "stale eviction timer ignored");
        }
    }
}

/// Tracks in-flight assessment submissions and fans progress out to subscribers.
///
/// Cloning is cheap; clones share the same records and channel.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(clock: Clock, channel: Arc<dyn DeliveryChannel>, config: ProgressConfig) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                clock,
                channel,
                config,
                records: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Begin tracking `id` at the `validating` stage and broadcast it.
    ///
    /// Replaces any previous record for the same id; pending eviction timers
    /// for the old record no longer apply.
    pub fn start_progress(&self, id: AssessmentId) -> AssessmentProgress {
        let record = AssessmentProgress::started(id.clone(), self.inner.clock.now());
        let generation = self.next_generation();
        lock(&self.inner.records).insert(
            id.clone(),
            TrackedProgress {
                progress: record.clone(),
                generation,
            },
        );
        info!(assessment_id = %id, "assessment progress started");
        self.broadcast_progress(&record);
        record
    }

    /// Move `id` to `stage` at `progress` percent.
    ///
    /// Unknown ids are ignored with a warning.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::InvalidTransition` for a backwards move when the
    /// tracker runs with `TransitionPolicy::Strict`.
    pub fn update_progress(
        &self,
        id: &AssessmentId,
        stage: ProgressStage,
        progress: f64,
        label: impl Into<String>,
        extra: Option<Map<String, Value>>,
    ) -> Result<(), ProgressError> {
        self.apply_update(id, stage, progress, label.into(), extra, None)
    }

    /// Report inner report-generation progress (0–100).
    ///
    /// Only applies while the record sits in `generating_report`.
    ///
    /// # Errors
    ///
    /// Propagates `update_progress` errors.
    pub fn update_report_progress(&self, id: &AssessmentId, inner: f64) -> Result<(), ProgressError> {
        let label = format!("Generating report ({:.0}%)", inner.clamp(0.0, 100.0));
        self.apply_update(
            id,
            ProgressStage::GeneratingReport,
            report_to_outer_progress(inner),
            label,
            None,
            Some(ProgressStage::GeneratingReport),
        )
    }

    /// Stage update shared by the public entry points; `required` gates the
    /// update on the current stage under the same lock that applies it.
    fn apply_update(
        &self,
        id: &AssessmentId,
        stage: ProgressStage,
        progress: f64,
        label: String,
        extra: Option<Map<String, Value>>,
        required: Option<ProgressStage>,
    ) -> Result<(), ProgressError> {
        let snapshot = {
            let mut records = lock(&self.inner.records);
            let Some(tracked) = records.get_mut(id) else {
                warn!(assessment_id = %id, %stage, "progress update for unknown assessment");
                return Ok(());
            };
            if let Some(required) = required {
                if tracked.progress.stage != required {
                    debug!(
                        assessment_id = %id,
                        current = %tracked.progress.stage,
                        %required,
                        "stage-gated progress update ignored"
                    );
                    return Ok(());
                }
            }

            let from = tracked.progress.stage;
            if !from.can_transition_to(stage) {
                match self.inner.config.transition_policy() {
                    TransitionPolicy::Strict => {
                        return Err(ProgressError::InvalidTransition { from, to: stage });
                    }
                    TransitionPolicy::Lenient => {
                        warn!(assessment_id = %id, %from, to = %stage, "out-of-order stage transition");
                    }
                }
            }

            tracked
                .progress
                .apply_update(stage, progress, label, extra, self.inner.clock.now());
            tracked.progress.clone()
        };

        debug!(
            assessment_id = %id,
            stage = %snapshot.stage,
            progress = snapshot.progress,
            "assessment progress updated"
        );
        self.broadcast_progress(&snapshot);
        Ok(())
    }

    /// Fail the pipeline for `id`; `progress` keeps its last value.
    pub fn report_error(&self, id: &AssessmentId, failure: ProgressFailure) {
        let snapshot = {
            let mut records = lock(&self.inner.records);
            let Some(tracked) = records.get_mut(id) else {
                warn!(assessment_id = %id, "error reported for unknown assessment");
                return;
            };
            tracked.progress.fail(failure);
            tracked.progress.clone()
        };

        if let Some(failure) = &snapshot.error {
            warn!(assessment_id = %id, error = %failure.message, "assessment pipeline failed");
        }
        self.broadcast_progress(&snapshot);
    }

    /// Mark `id` completed, announce it, and schedule eviction of the record.
    pub fn complete_progress(&self, id: &AssessmentId, result: Value) {
        let generation = self.next_generation();
        let snapshot = {
            let mut records = lock(&self.inner.records);
            let Some(tracked) = records.get_mut(id) else {
                warn!(assessment_id = %id, "completion for unknown assessment");
                return;
            };
            tracked.progress.complete();
            tracked.generation = generation;
            tracked.progress.clone()
        };

        info!(assessment_id = %id, "assessment progress completed");
        self.broadcast_progress(&snapshot);

        let notice = CompletionNotice {
            assessment_id: id.clone(),
            result,
            completed_at: self.inner.clock.now(),
        };
        self.broadcast(&ProgressEnvelope::AssessmentCompleted(notice), id, true);
        self.schedule_eviction(id.clone(), generation);
    }

    #[must_use]
    pub fn get_progress(&self, id: &AssessmentId) -> Option<AssessmentProgress> {
        lock(&self.inner.records)
            .get(id)
            .map(|t| t.progress.clone())
    }

    /// Ids that currently have a live record, sorted.
    #[must_use]
    pub fn active_assessments(&self) -> Vec<AssessmentId> {
        let mut ids: Vec<_> = lock(&self.inner.records).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Listen on the assessment's progress topic.
    pub fn subscribe(&self, subscription: ProgressSubscription) -> SubscriptionId {
        let assessment_id = subscription.assessment_id.clone();
        let topic = assessment_id.progress_topic();
        let handler: MessageHandler = Arc::new(move |message: &Value| subscription.route(message));
        let options = SubscribeOptions {
            debounce: self.inner.config.subscription_debounce(),
            deduplicate: self.inner.config.deduplicate(),
        };

        let subscription_id = self.inner.channel.subscribe(&topic, handler, options);
        lock(&self.inner.subscriptions).insert(subscription_id, assessment_id);
        subscription_id
    }

    /// Drop a subscription; the last one out also evicts the cached record.
    pub fn unsubscribe(&self, subscription_id: SubscriptionId) -> bool {
        let channel_removed = self.inner.channel.unsubscribe(subscription_id);

        let orphaned = {
            let mut subscriptions = lock(&self.inner.subscriptions);
            let Some(id) = subscriptions.remove(&subscription_id) else {
                return channel_removed;
            };
            let still_watched = subscriptions.values().any(|a| a == &id);
            (!still_watched).then_some(id)
        };

        if let Some(id) = orphaned {
            if lock(&self.inner.records).remove(&id).is_some() {
                debug!(assessment_id = %id, "evicted progress record after last unsubscribe");
            }
        }
        true
    }

    fn next_generation(&self) -> u64 {
        self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn schedule_eviction(&self, id: AssessmentId, generation: u64) {
        let inner = Arc::clone(&self.inner);
        let scheduled = spawn_after(self.inner.config.eviction_delay(), async move {
            inner.evict_if_current(&id, generation);
        });
        if scheduled.is_none() {
            warn!("no async runtime; completed progress record kept until unsubscribe");
        }
    }

    fn broadcast_progress(&self, snapshot: &AssessmentProgress) {
        let terminal = snapshot.stage.is_terminal();
        self.broadcast(
            &ProgressEnvelope::ProgressUpdate(snapshot.clone()),
            &snapshot.assessment_id,
            terminal,
        );
    }

    fn broadcast(&self, envelope: &ProgressEnvelope, id: &AssessmentId, immediate: bool) {
        let message = match serde_json::to_value(envelope) {
            Ok(message) => message,
            Err(err) => {
                warn!(assessment_id = %id, error = %err, "failed to encode progress message");
                return;
            }
        };
        let mut options = DeliveryOptions::high();
        if immediate {
            options = options.immediate();
        }
        self.inner
            .channel
            .broadcast(message, &Routing::for_assessment(id), options);
    }
}
