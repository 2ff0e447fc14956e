use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a workflow session.
///
/// Generated once per `start_session` and never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generates a fresh random `SessionId`.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID
    #[must_use]
    pub fn value(&self) -> Uuid {
        self.0
    }
}

/// Identifier of an assessment owned by the backend.
///
/// Opaque to this crate; only emptiness is rejected.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssessmentId(String);

impl AssessmentId {
    /// Creates a new `AssessmentId`
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Topic name used for progress fan-out of this assessment.
    #[must_use]
    pub fn progress_topic(&self) -> String {
        format!("progress-{}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Debug for AssessmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssessmentId({})", self.0)
    }
}

// ─── Display Implementations ───────────────────────────────────────────────────

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AssessmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssessmentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ─── FromStr Implementations ───────────────────────────────────────────────────

/// Error type for parsing ID from string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    kind: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {} from string", self.kind)
    }
}

impl std::error::Error for ParseIdError {}

impl FromStr for SessionId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(SessionId)
            .map_err(|_| ParseIdError {
                kind: "SessionId".to_string(),
            })
    }
}

impl FromStr for AssessmentId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ParseIdError {
                kind: "AssessmentId".to_string(),
            });
        }
        Ok(AssessmentId::new(trimmed))
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_session_ids_differ() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn session_id_display_parses_back() {
        let original = SessionId::generate();
        let parsed: SessionId = original.to_string().parse().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn session_id_from_str_invalid() {
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }

    #[test]
    fn assessment_id_topic() {
        let id = AssessmentId::new("a1");
        assert_eq!(id.progress_topic(), "progress-a1");
        assert_eq!(id.to_string(), "a1");
    }

    #[test]
    fn assessment_id_rejects_blank() {
        assert!("   ".parse::<AssessmentId>().is_err());
        assert_eq!(" x ".parse::<AssessmentId>().unwrap(), AssessmentId::new("x"));
    }

    #[test]
    fn session_id_serializes_as_plain_string() {
        let id = SessionId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
