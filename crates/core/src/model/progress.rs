use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::model::ids::AssessmentId;

/// Number of real pipeline stages a submission walks through.
pub const TOTAL_PIPELINE_STEPS: u32 = 5;

/// Outer progress range claimed by the report generation stage.
pub const REPORT_PROGRESS_START: f64 = 60.0;
pub const REPORT_PROGRESS_SPAN: f64 = 30.0;

//
// ─── STAGE ─────────────────────────────────────────────────────────────────────
//

/// Stage of the assessment submission pipeline.
///
/// The five working stages run in declaration order; `Completed` and `Error`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Validating,
    SavingResponses,
    CompletingAssessment,
    GeneratingReport,
    Finalizing,
    Completed,
    Error,
}

impl ProgressStage {
    /// Steps counted as done once this stage is reached.
    #[must_use]
    pub fn completed_steps(self) -> u32 {
        match self {
            Self::Validating | Self::Error => 0,
            Self::SavingResponses => 1,
            Self::CompletingAssessment => 2,
            Self::GeneratingReport => 3,
            Self::Finalizing => 4,
            Self::Completed => 5,
        }
    }

    /// Default label shown to the user for this stage.
    #[must_use]
    pub fn default_label(self) -> &'static str {
        match self {
            Self::Validating => "Validating responses",
            Self::SavingResponses => "Saving responses",
            Self::CompletingAssessment => "Completing assessment",
            Self::GeneratingReport => "Generating report",
            Self::Finalizing => "Finalizing",
            Self::Completed => "Completed",
            Self::Error => "Error",
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::SavingResponses => "saving_responses",
            Self::CompletingAssessment => "completing_assessment",
            Self::GeneratingReport => "generating_report",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Forward-only transition table.
    ///
    /// A stage may repeat itself, jump to any later working stage, or fail.
    /// Terminal stages only leave through a fresh `start_progress`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Error => true,
            _ => next.completed_steps() > self.completed_steps(),
        }
    }
}

impl fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//
// ─── FAILURE PAYLOAD ───────────────────────────────────────────────────────────
//

/// Terminal pipeline failure attached to a progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ProgressFailure {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

//
// ─── PROGRESS RECORD ───────────────────────────────────────────────────────────
//

/// Snapshot of one in-flight assessment submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentProgress {
    pub assessment_id: AssessmentId,
    pub stage: ProgressStage,
    pub progress: f64,
    pub current_step: String,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub start_time: DateTime<Utc>,
    /// Milliseconds, absent until some progress has been made.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProgressFailure>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl AssessmentProgress {
    /// Fresh record at the `validating` stage.
    #[must_use]
    pub fn started(assessment_id: AssessmentId, now: DateTime<Utc>) -> Self {
        Self {
            assessment_id,
            stage: ProgressStage::Validating,
            progress: 0.0,
            current_step: ProgressStage::Validating.default_label().to_string(),
            total_steps: TOTAL_PIPELINE_STEPS,
            completed_steps: 0,
            start_time: now,
            estimated_time_remaining: None,
            error: None,
            metadata: Map::new(),
        }
    }

    /// Applies a stage update and recomputes the derived fields.
    ///
    /// Any stage other than `error` drops a previously attached failure.
    pub fn apply_update(
        &mut self,
        stage: ProgressStage,
        progress: f64,
        label: impl Into<String>,
        extra: Option<Map<String, Value>>,
        now: DateTime<Utc>,
    ) {
        self.stage = stage;
        if stage != ProgressStage::Error {
            self.error = None;
        }
        self.progress = clamp_percent(progress);
        self.current_step = label.into();
        self.completed_steps = stage.completed_steps();
        if let Some(extra) = extra {
            self.metadata.extend(extra);
        }
        self.estimated_time_remaining = estimate_remaining(now - self.start_time, self.progress);
    }

    /// Moves the record to the terminal failure stage, keeping `progress`.
    pub fn fail(&mut self, failure: ProgressFailure) {
        self.stage = ProgressStage::Error;
        self.current_step = ProgressStage::Error.default_label().to_string();
        self.completed_steps = ProgressStage::Error.completed_steps();
        self.estimated_time_remaining = None;
        self.error = Some(failure);
    }

    /// Moves the record to `completed` regardless of the prior stage.
    pub fn complete(&mut self) {
        self.stage = ProgressStage::Completed;
        self.error = None;
        self.progress = 100.0;
        self.current_step = ProgressStage::Completed.default_label().to_string();
        self.completed_steps = self.total_steps;
        self.estimated_time_remaining = Some(0);
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.stage == ProgressStage::Error && self.error.is_some()
    }
}

/// Maps report-generation progress (0–100) onto the outer 60–90 band.
#[must_use]
pub fn report_to_outer_progress(inner: f64) -> f64 {
    REPORT_PROGRESS_START + clamp_percent(inner) * (REPORT_PROGRESS_SPAN / 100.0)
}

/// Linear remaining-time estimate in milliseconds.
///
/// Returns `None` when no progress has been made yet.
#[must_use]
pub fn estimate_remaining(elapsed: Duration, progress: f64) -> Option<u64> {
    if progress <= 0.0 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let elapsed_ms = elapsed.num_milliseconds().max(0) as f64;
    let total = elapsed_ms / progress * 100.0;
    let remaining = (total - elapsed_ms).max(0.0);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Some(remaining.round() as u64)
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    #[test]
    fn completed_steps_table() {
        assert_eq!(ProgressStage::Validating.completed_steps(), 0);
        assert_eq!(ProgressStage::SavingResponses.completed_steps(), 1);
        assert_eq!(ProgressStage::CompletingAssessment.completed_steps(), 2);
        assert_eq!(ProgressStage::GeneratingReport.completed_steps(), 3);
        assert_eq!(ProgressStage::Finalizing.completed_steps(), 4);
        assert_eq!(ProgressStage::Completed.completed_steps(), 5);
        assert_eq!(ProgressStage::Error.completed_steps(), 0);
    }

    #[test]
    fn transitions_are_forward_only() {
        use ProgressStage::*;
        assert!(Validating.can_transition_to(SavingResponses));
        assert!(Validating.can_transition_to(GeneratingReport));
        assert!(GeneratingReport.can_transition_to(GeneratingReport));
        assert!(Finalizing.can_transition_to(Error));
        assert!(!Finalizing.can_transition_to(SavingResponses));
        assert!(!Completed.can_transition_to(Validating));
        assert!(!Error.can_transition_to(Finalizing));
    }

    #[test]
    fn report_progress_maps_onto_outer_band() {
        assert!((report_to_outer_progress(0.0) - 60.0).abs() < f64::EPSILON);
        assert!((report_to_outer_progress(50.0) - 75.0).abs() < f64::EPSILON);
        assert!((report_to_outer_progress(100.0) - 90.0).abs() < f64::EPSILON);
        assert!((report_to_outer_progress(250.0) - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn estimate_is_linear_and_never_negative() {
        assert_eq!(estimate_remaining(Duration::seconds(10), 0.0), None);
        assert_eq!(estimate_remaining(Duration::seconds(10), 50.0), Some(10_000));
        assert_eq!(estimate_remaining(Duration::seconds(10), 100.0), Some(0));
        assert_eq!(estimate_remaining(Duration::seconds(-5), 10.0), Some(0));
    }

    #[test]
    fn complete_overrides_error_stage() {
        let mut record = AssessmentProgress::started(AssessmentId::new("a1"), fixed_now());
        record.apply_update(ProgressStage::SavingResponses, 20.0, "saving", None, fixed_now());
        record.fail(ProgressFailure::new("db down"));
        assert!(record.is_failed());
        assert!((record.progress - 20.0).abs() < f64::EPSILON);

        record.complete();
        assert_eq!(record.stage, ProgressStage::Completed);
        assert!((record.progress - 100.0).abs() < f64::EPSILON);
        assert_eq!(record.completed_steps, record.total_steps);
        assert!(record.error.is_none());
    }

    #[test]
    fn leaving_error_stage_drops_failure() {
        let mut record = AssessmentProgress::started(AssessmentId::new("a1"), fixed_now());
        record.fail(ProgressFailure::new("timeout"));
        record.apply_update(ProgressStage::Error, 0.0, "still failing", None, fixed_now());
        assert!(record.error.is_some());

        record.apply_update(ProgressStage::SavingResponses, 20.0, "retry", None, fixed_now());
        assert!(record.error.is_none());
        assert!(!record.is_failed());
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("error").is_none());
    }

    #[test]
    fn serializes_with_wire_names() {
        let record = AssessmentProgress::started(AssessmentId::new("a1"), fixed_now());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["assessmentId"], "a1");
        assert_eq!(json["stage"], "validating");
        assert_eq!(json["totalSteps"], 5);
        assert!(json.get("estimatedTimeRemaining").is_none());
    }
}
