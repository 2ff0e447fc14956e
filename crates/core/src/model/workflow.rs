use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::ids::{AssessmentId, SessionId};
use crate::model::progress::AssessmentProgress;

/// Maximum number of distinct workflow errors retained per session.
pub const MAX_WORKFLOW_ERRORS: usize = 10;

/// Form fields that survive a destructive recovery.
pub const IDENTITY_FIELDS: [&str; 5] = [
    "parentFirstName",
    "parentLastName",
    "childFirstName",
    "childLastName",
    "email",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WorkflowStateError {
    #[error("session id is missing")]
    MissingSessionId,

    #[error("current step must be at least 1")]
    InvalidStep,

    #[error("last update precedes session start")]
    InvalidTimeRange,

    #[error("workflow has already been completed")]
    NotResumable,
}

//
// ─── FORM DATA ─────────────────────────────────────────────────────────────────
//

/// Answers captured so far, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormData(Map<String, Value>);

impl FormData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shallow merge: each incoming key replaces the stored value wholesale.
    pub fn merge(&mut self, partial: FormData) {
        self.0.extend(partial.0);
    }

    /// Drops everything outside the identity allow-list.
    pub fn retain_identity(&mut self) {
        self.0.retain(|key, _| IDENTITY_FIELDS.contains(&key.as_str()));
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for FormData {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for FormData {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

//
// ─── WORKFLOW ERRORS ───────────────────────────────────────────────────────────
//

/// A user-facing error retained on the workflow for recovery UIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowError {
    pub code: String,
    pub message: String,
    pub stage: String,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
    pub retry_attempts: u32,
}

/// Input for `WorkflowState::record_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    pub stage: String,
    pub recoverable: bool,
}

impl ErrorReport {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            stage: stage.into(),
            recoverable: true,
        }
    }

    #[must_use]
    pub fn fatal(mut self) -> Self {
        self.recoverable = false;
        self
    }
}

/// Independently toggled recovery actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOptions {
    pub clear_errors: bool,
    pub reset_step: bool,
    pub preserve_form_data: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            clear_errors: true,
            reset_step: false,
            preserve_form_data: true,
        }
    }
}

//
// ─── WORKFLOW STATE ────────────────────────────────────────────────────────────
//

/// The resumable record of one user's trip through the intake form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment_id: Option<AssessmentId>,
    pub current_step: u32,
    pub form_data: FormData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<AssessmentProgress>,
    pub is_anonymous: bool,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub saved_count: u64,
    #[serde(default)]
    pub errors: Vec<WorkflowError>,
    pub resumable: bool,
}

impl WorkflowState {
    /// Fresh state at step 1 with no answers.
    #[must_use]
    pub fn new(anonymous: bool, now: DateTime<Utc>) -> Self {
        Self {
            session_id: SessionId::generate(),
            assessment_id: None,
            current_step: 1,
            form_data: FormData::new(),
            progress: None,
            is_anonymous: anonymous,
            started_at: now,
            last_updated_at: now,
            saved_count: 0,
            errors: Vec::new(),
            resumable: true,
        }
    }

    /// Structural checks applied to records loaded from storage.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowStateError` for the first violated invariant.
    pub fn validate(&self) -> Result<(), WorkflowStateError> {
        if self.session_id.value().is_nil() {
            return Err(WorkflowStateError::MissingSessionId);
        }
        if self.current_step < 1 {
            return Err(WorkflowStateError::InvalidStep);
        }
        if self.last_updated_at < self.started_at {
            return Err(WorkflowStateError::InvalidTimeRange);
        }
        if !self.resumable {
            return Err(WorkflowStateError::NotResumable);
        }
        Ok(())
    }

    /// Merges answers for `step`; the step never moves backwards here.
    pub fn apply_form_update(&mut self, step: u32, partial: FormData, now: DateTime<Utc>) {
        self.form_data.merge(partial);
        self.current_step = self.current_step.max(step).max(1);
        self.saved_count = self.saved_count.saturating_add(1);
        self.last_updated_at = now;
    }

    /// Mirrors a progress snapshot, adopting its assessment id once.
    pub fn mirror_progress(&mut self, snapshot: AssessmentProgress, now: DateTime<Utc>) {
        if self.assessment_id.is_none() {
            self.assessment_id = Some(snapshot.assessment_id.clone());
        }
        self.progress = Some(snapshot);
        self.last_updated_at = now;
    }

    /// Records an error, bumping the retry counter of a matching `(code, stage)`.
    pub fn record_error(&mut self, report: ErrorReport, now: DateTime<Utc>) {
        let existing = self
            .errors
            .iter_mut()
            .find(|e| e.code == report.code && e.stage == report.stage);

        match existing {
            Some(entry) => {
                entry.retry_attempts = entry.retry_attempts.saturating_add(1);
                entry.timestamp = now;
                entry.message = report.message;
                entry.recoverable = report.recoverable;
            }
            None => {
                self.errors.push(WorkflowError {
                    code: report.code,
                    message: report.message,
                    stage: report.stage,
                    timestamp: now,
                    recoverable: report.recoverable,
                    retry_attempts: 0,
                });
                if self.errors.len() > MAX_WORKFLOW_ERRORS {
                    let overflow = self.errors.len() - MAX_WORKFLOW_ERRORS;
                    self.errors.drain(..overflow);
                }
            }
        }
        self.last_updated_at = now;
    }

    #[must_use]
    pub fn has_recoverable_errors(&self) -> bool {
        self.errors.iter().any(|e| e.recoverable)
    }

    /// Applies recovery actions. Returns `false` when there was nothing to recover.
    pub fn recover(&mut self, options: RecoveryOptions, now: DateTime<Utc>) -> bool {
        if !self.has_recoverable_errors() {
            return false;
        }
        if options.clear_errors {
            self.errors.retain(|e| !e.recoverable);
        }
        if options.reset_step {
            self.current_step = self.current_step.saturating_sub(1).max(1);
        }
        if !options.preserve_form_data {
            self.form_data.retain_identity();
        }
        self.last_updated_at = now;
        true
    }

    #[must_use]
    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            session_id: self.session_id,
            current_step: self.current_step,
            saved_count: self.saved_count,
            error_count: self.errors.len(),
            recoverable_error_count: self.errors.iter().filter(|e| e.recoverable).count(),
            has_progress: self.progress.is_some(),
            resumable: self.resumable,
            is_anonymous: self.is_anonymous,
            last_updated_at: self.last_updated_at,
        }
    }
}

/// Read-only projection used by recovery and resume prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSummary {
    pub session_id: SessionId,
    pub current_step: u32,
    pub saved_count: u64,
    pub error_count: usize,
    pub recoverable_error_count: usize,
    pub has_progress: bool,
    pub resumable: bool,
    pub is_anonymous: bool,
    pub last_updated_at: DateTime<Utc>,
}
