use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use intake_core::model::{AssessmentId, AssessmentProgress};

/// Message shape carried on `progress-{assessmentId}` topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ProgressEnvelope {
    ProgressUpdate(AssessmentProgress),
    AssessmentCompleted(CompletionNotice),
}

/// Payload of the `assessment_completed` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionNotice {
    pub assessment_id: AssessmentId,
    pub result: Value,
    pub completed_at: DateTime<Utc>,
}
