use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use intake_core::model::{WorkflowState, WorkflowStateError};
use storage::codec::{self, CodecError};
use storage::repository::{KeyValueStore, StorageError};

use crate::error::SessionStoreError;

/// Why a stored record cannot be resumed.
#[derive(Debug, Error)]
pub(crate) enum Rejection {
    #[error("record could not be decoded: {0}")]
    Undecodable(#[from] CodecError),
    #[error("record is structurally incomplete: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("record failed validation: {0}")]
    Invalid(#[from] WorkflowStateError),
    #[error("record is older than {max_age_hours}h")]
    Expired { max_age_hours: i64 },
}

pub(crate) enum StoredSession {
    Missing,
    Rejected(Rejection),
    Valid(WorkflowState),
}

/// Reads and checks the stored record without touching the active session.
pub(crate) async fn load(
    storage: &dyn KeyValueStore,
    key: &str,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Result<StoredSession, StorageError> {
    let Some(raw) = storage.get_item(key).await? else {
        return Ok(StoredSession::Missing);
    };
    Ok(match check(&raw, now, max_age) {
        Ok(state) => StoredSession::Valid(state),
        Err(rejection) => StoredSession::Rejected(rejection),
    })
}

fn check(raw: &str, now: DateTime<Utc>, max_age: Duration) -> Result<WorkflowState, Rejection> {
    let json = codec::decode(raw)?;
    let state: WorkflowState = serde_json::from_str(&json)?;
    state.validate()?;
    if now - state.last_updated_at >= max_age {
        return Err(Rejection::Expired {
            max_age_hours: max_age.num_hours(),
        });
    }
    Ok(state)
}

/// Encodes and writes `state` under `key`.
pub(crate) async fn save(
    storage: &dyn KeyValueStore,
    key: &str,
    state: &WorkflowState,
) -> Result<(), SessionStoreError> {
    let json = serde_json::to_string(state)?;
    storage.set_item(key, &codec::encode(&json)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use intake_core::time::fixed_now;
    use storage::repository::InMemoryKeyValueStore;

    #[tokio::test]
    async fn saved_record_loads_back() {
        let store = InMemoryKeyValueStore::new();
        let state = WorkflowState::new(true, fixed_now());
        save(&store, "k", &state).await.unwrap();

        let loaded = load(&store, "k", fixed_now(), Duration::hours(24)).await.unwrap();
        assert!(matches!(loaded, StoredSession::Valid(s) if s == state));
    }

    #[tokio::test]
    async fn expired_and_garbage_records_are_rejected() {
        let store = InMemoryKeyValueStore::new();
        let state = WorkflowState::new(true, fixed_now());
        save(&store, "k", &state).await.unwrap();

        let later = fixed_now() + Duration::hours(24);
        let loaded = load(&store, "k", later, Duration::hours(24)).await.unwrap();
        assert!(matches!(loaded, StoredSession::Rejected(Rejection::Expired { .. })));

        store.set_item("k", "not-encoded").await.unwrap();
        let loaded = load(&store, "k", fixed_now(), Duration::hours(24)).await.unwrap();
        assert!(matches!(loaded, StoredSession::Rejected(Rejection::Undecodable(_))));

        store.set_item("k", &codec::encode("{\"sessionId\":1}")).await.unwrap();
        let loaded = load(&store, "k", fixed_now(), Duration::hours(24)).await.unwrap();
        assert!(matches!(loaded, StoredSession::Rejected(Rejection::Malformed(_))));
    }

    #[tokio::test]
    async fn missing_record_is_not_an_error() {
        let store = InMemoryKeyValueStore::new();
        let loaded = load(&store, "k", fixed_now(), Duration::hours(24)).await.unwrap();
        assert!(matches!(loaded, StoredSession::Missing));
    }
}
