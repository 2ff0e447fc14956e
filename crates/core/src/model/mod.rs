mod ids;
mod progress;
mod workflow;

pub use ids::{AssessmentId, ParseIdError, SessionId};
pub use progress::{
    AssessmentProgress, ProgressFailure, ProgressStage, REPORT_PROGRESS_SPAN,
    REPORT_PROGRESS_START, TOTAL_PIPELINE_STEPS, estimate_remaining, report_to_outer_progress,
};
pub use workflow::{
    ErrorReport, FormData, IDENTITY_FIELDS, MAX_WORKFLOW_ERRORS, RecoveryOptions, WorkflowError,
    WorkflowState, WorkflowStateError, WorkflowSummary,
};
