use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use intake_core::model::{ErrorReport, FormData, RecoveryOptions, WorkflowState};
use intake_core::time::{fixed_clock, fixed_now};
use async_trait::async_trait;
use serde_json::json;
use services::{
    Clock, SaveOptions, SessionStateStore, SessionValidation, SessionValidator,
    StaticSessionValidator, ValidatorError, WorkflowConfig,
};
use storage::repository::{InMemoryKeyValueStore, KeyValueStore};
use tokio::sync::Notify;

const KEY: &str = "assessment_workflow_state";

fn build_store(
    clock: Clock,
    storage: &InMemoryKeyValueStore,
    validator: &Arc<StaticSessionValidator>,
) -> SessionStateStore {
    SessionStateStore::new(
        clock,
        Arc::new(storage.clone()),
        Arc::clone(validator) as Arc<dyn services::SessionValidator>,
        WorkflowConfig::default(),
    )
}

fn answers(pairs: &[(&str, serde_json::Value)]) -> FormData {
    pairs.iter().map(|(k, v)| (*k, v.clone())).collect()
}

#[tokio::test]
async fn resume_returns_active_session_without_storage() {
    let storage = InMemoryKeyValueStore::new();
    let validator = Arc::new(StaticSessionValidator::new(true));
    let store = build_store(fixed_clock(), &storage, &validator);

    let started = store.start_session(true).await;
    storage.set_available(false);

    let resumed = store.resume_session().await.expect("active session");
    assert_eq!(resumed.session_id, started.session_id);
}

#[tokio::test]
async fn stored_session_resumes_in_a_fresh_store() {
    let storage = InMemoryKeyValueStore::new();
    let validator = Arc::new(StaticSessionValidator::new(true));
    let first = build_store(fixed_clock(), &storage, &validator);
    let started = first.start_session(false).await;
    first
        .update_form_data(2, answers(&[("email", json!("a@b.c"))]), SaveOptions::immediate())
        .await;

    let second = build_store(fixed_clock(), &storage, &validator);
    assert!(second.can_resume().await);
    assert!(second.current_state().is_none());

    let resumed = second.resume_session().await.expect("resumable");
    assert_eq!(resumed.session_id, started.session_id);
    assert_eq!(resumed.current_step, 2);
    assert_eq!(resumed.form_data.get("email"), Some(&json!("a@b.c")));
    assert!(second.current_state().is_some());
}

#[tokio::test]
async fn expired_session_is_rejected_and_cleared() {
    let storage = InMemoryKeyValueStore::new();
    let validator = Arc::new(StaticSessionValidator::new(true));
    let first = build_store(fixed_clock(), &storage, &validator);
    first.start_session(true).await;

    let later = Clock::fixed(fixed_now() + ChronoDuration::hours(25));
    let second = build_store(later, &storage, &validator);
    assert!(!second.can_resume().await);
    assert!(second.resume_session().await.is_none());
    assert_eq!(storage.get_item(KEY).await.unwrap(), None);
}

#[tokio::test]
async fn authenticated_session_is_revalidated_on_resume() {
    let storage = InMemoryKeyValueStore::new();
    let validator = Arc::new(StaticSessionValidator::new(true));
    build_store(fixed_clock(), &storage, &validator)
        .start_session(false)
        .await;

    validator.set_valid(false);
    let second = build_store(fixed_clock(), &storage, &validator);
    assert!(second.resume_session().await.is_none());
    assert_eq!(storage.get_item(KEY).await.unwrap(), None);
}

/// Validator that parks until released, then rejects the session.
#[derive(Default)]
struct GatedValidator {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl SessionValidator for GatedValidator {
    async fn validate_session(&self) -> Result<SessionValidation, ValidatorError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(SessionValidation { is_valid: false })
    }
}

#[tokio::test]
async fn session_started_during_revalidation_survives_rejection() {
    let storage = InMemoryKeyValueStore::new();
    let static_validator = Arc::new(StaticSessionValidator::new(true));
    build_store(fixed_clock(), &storage, &static_validator)
        .start_session(false)
        .await;

    let gate = Arc::new(GatedValidator::default());
    let store = SessionStateStore::new(
        fixed_clock(),
        Arc::new(storage.clone()),
        Arc::clone(&gate) as Arc<dyn SessionValidator>,
        WorkflowConfig::default(),
    );

    let resuming = tokio::spawn({
        let store = store.clone();
        async move { store.resume_session().await }
    });
    gate.entered.notified().await;

    let fresh = store.start_session(true).await;
    gate.release.notify_one();

    let resumed = resuming.await.unwrap().expect("fresh session returned");
    assert_eq!(resumed.session_id, fresh.session_id);
    assert_eq!(store.current_state().unwrap().session_id, fresh.session_id);

    let stored = storage.get_item(KEY).await.unwrap().expect("fresh record kept");
    let json = storage::codec::decode(&stored).unwrap();
    assert!(json.contains(&fresh.session_id.to_string()));
}

#[tokio::test]
async fn stored_summary_reads_without_revalidating_or_removing() {
    let storage = InMemoryKeyValueStore::new();
    let validator = Arc::new(StaticSessionValidator::new(true));
    let started = build_store(fixed_clock(), &storage, &validator)
        .start_session(false)
        .await;

    validator.set_valid(false);
    let reader = build_store(fixed_clock(), &storage, &validator);
    let summary = reader.stored_summary().await.expect("stored record summarized");
    assert_eq!(summary.session_id, started.session_id);
    assert!(reader.can_resume().await);
    assert!(reader.current_state().is_none());
    assert!(storage.get_item(KEY).await.unwrap().is_some());
}

#[tokio::test]
async fn anonymous_session_skips_validator() {
    let storage = InMemoryKeyValueStore::new();
    let validator = Arc::new(StaticSessionValidator::new(true));
    build_store(fixed_clock(), &storage, &validator)
        .start_session(true)
        .await;

    validator.set_reachable(false);
    let second = build_store(fixed_clock(), &storage, &validator);
    assert!(second.resume_session().await.is_some());
}

#[tokio::test]
async fn unreadable_storage_means_no_session() {
    let storage = InMemoryKeyValueStore::new();
    let validator = Arc::new(StaticSessionValidator::new(true));
    let store = build_store(fixed_clock(), &storage, &validator);
    storage.set_available(false);

    assert!(!store.can_resume().await);
    assert!(store.resume_session().await.is_none());
}

#[tokio::test]
async fn offline_storage_degrades_to_memory() {
    let storage = InMemoryKeyValueStore::new();
    let validator = Arc::new(StaticSessionValidator::new(true));
    let store = build_store(fixed_clock(), &storage, &validator);
    storage.set_available(false);

    store.start_session(true).await;
    store
        .update_form_data(3, answers(&[("notes", json!("hi"))]), SaveOptions::immediate())
        .await;
    store.report_error(ErrorReport::new("E", "x", "save")).await;

    let state = store.current_state().unwrap();
    assert_eq!(state.current_step, 3);
    assert_eq!(state.errors.len(), 1);
    assert!(store.flush().await.is_err());
}

#[tokio::test]
async fn step_tracks_maximum_and_recovery_steps_back_once() {
    let storage = InMemoryKeyValueStore::new();
    let validator = Arc::new(StaticSessionValidator::new(true));
    let store = build_store(fixed_clock(), &storage, &validator);
    store.start_session(true).await;

    for step in [1, 4, 2, 3] {
        store
            .update_form_data(step, FormData::new(), SaveOptions::immediate())
            .await;
    }
    assert_eq!(store.current_state().unwrap().current_step, 4);
    assert_eq!(store.current_state().unwrap().saved_count, 4);

    store.report_error(ErrorReport::new("NET", "offline", "submit")).await;
    store.report_error(ErrorReport::new("NET", "still offline", "submit")).await;
    let state = store.current_state().unwrap();
    assert_eq!(state.errors.len(), 1);
    assert_eq!(state.errors[0].retry_attempts, 1);

    let recovered = store
        .recover_from_errors(RecoveryOptions {
            clear_errors: true,
            reset_step: true,
            preserve_form_data: true,
        })
        .await;
    assert!(recovered);
    let state = store.current_state().unwrap();
    assert_eq!(state.current_step, 3);
    assert!(state.errors.is_empty());

    // Nothing recoverable left: reports success without touching the step.
    assert!(
        store
            .recover_from_errors(RecoveryOptions {
                clear_errors: true,
                reset_step: true,
                preserve_form_data: true,
            })
            .await
    );
    assert_eq!(store.current_state().unwrap().current_step, 3);
}

#[tokio::test]
async fn destructive_recovery_keeps_identity_fields() {
    let storage = InMemoryKeyValueStore::new();
    let validator = Arc::new(StaticSessionValidator::new(true));
    let store = build_store(fixed_clock(), &storage, &validator);
    store.start_session(true).await;
    store
        .update_form_data(
            2,
            answers(&[
                ("parentFirstName", json!("Ana")),
                ("parentLastName", json!("Ruiz")),
                ("childFirstName", json!("Leo")),
                ("childLastName", json!("Ruiz")),
                ("email", json!("ana@example.com")),
                ("diagnosis", json!("pending")),
            ]),
            SaveOptions::immediate(),
        )
        .await;
    store.report_error(ErrorReport::new("E", "x", "save")).await;

    assert!(
        store
            .recover_from_errors(RecoveryOptions {
                preserve_form_data: false,
                ..RecoveryOptions::default()
            })
            .await
    );
    let state = store.current_state().unwrap();
    assert_eq!(state.form_data.len(), 5);
    assert!(!state.form_data.contains_key("diagnosis"));
}

#[tokio::test]
async fn listeners_run_in_registration_order() {
    let storage = InMemoryKeyValueStore::new();
    let validator = Arc::new(StaticSessionValidator::new(true));
    let store = build_store(fixed_clock(), &storage, &validator);

    let calls: Arc<Mutex<Vec<(&'static str, Option<u32>)>>> = Arc::new(Mutex::new(Vec::new()));
    let first_sink = Arc::clone(&calls);
    let second_sink = Arc::clone(&calls);
    store.subscribe(move |s: Option<&WorkflowState>| {
        first_sink.lock().unwrap().push(("first", s.map(|s| s.current_step)));
    });
    let second = store.subscribe(move |s: Option<&WorkflowState>| {
        second_sink.lock().unwrap().push(("second", s.map(|s| s.current_step)));
    });

    store.start_session(true).await;
    assert!(store.unsubscribe(second));
    store.clear_state().await;

    assert_eq!(
        *calls.lock().unwrap(),
        vec![("first", Some(1)), ("second", Some(1)), ("first", None)]
    );
}

#[tokio::test]
async fn convert_to_authenticated_follows_validator() {
    let storage = InMemoryKeyValueStore::new();
    let validator = Arc::new(StaticSessionValidator::new(true));
    let store = build_store(fixed_clock(), &storage, &validator);
    store.start_session(true).await;

    validator.set_reachable(false);
    assert!(!store.convert_to_authenticated().await);
    assert!(store.current_state().unwrap().is_anonymous);

    validator.set_reachable(true);
    assert!(store.convert_to_authenticated().await);
    assert!(!store.current_state().unwrap().is_anonymous);

    validator.set_valid(false);
    assert!(store.convert_to_authenticated().await);
}

#[tokio::test(start_paused = true)]
async fn debounced_updates_coalesce_into_one_write() {
    let storage = InMemoryKeyValueStore::new();
    let validator = Arc::new(StaticSessionValidator::new(true));
    let store = build_store(fixed_clock(), &storage, &validator);
    store.start_session(true).await;
    assert_eq!(storage.write_count(), 1);

    for (i, letter) in ["a", "ab", "abc", "abcd"].iter().enumerate() {
        store
            .update_form_data(1, answers(&[("notes", json!(letter))]), SaveOptions::debounced())
            .await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(storage.write_count(), 1, "write {i} flushed early");
    }

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(storage.write_count(), 2);

    let fresh = build_store(fixed_clock(), &storage, &validator);
    let resumed = fresh.resume_session().await.unwrap();
    assert_eq!(resumed.form_data.get("notes"), Some(&json!("abcd")));
}

#[tokio::test(start_paused = true)]
async fn completed_workflow_is_removed_after_grace_window() {
    let storage = InMemoryKeyValueStore::new();
    let validator = Arc::new(StaticSessionValidator::new(true));
    let store = build_store(fixed_clock(), &storage, &validator);
    store.start_session(true).await;

    store.complete_workflow().await;
    let state = store.current_state().expect("kept during grace window");
    assert!(!state.resumable);
    assert!(storage.get_item(KEY).await.unwrap().is_some());

    let other = build_store(fixed_clock(), &storage, &validator);
    assert!(!other.can_resume().await);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(store.current_state().is_none());
    assert_eq!(storage.get_item(KEY).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn stale_completion_timer_spares_new_session() {
    let storage = InMemoryKeyValueStore::new();
    let validator = Arc::new(StaticSessionValidator::new(true));
    let store = build_store(fixed_clock(), &storage, &validator);
    store.start_session(true).await;
    store.complete_workflow().await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    let fresh = store.start_session(true).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(store.current_state().unwrap().session_id, fresh.session_id);
    assert!(storage.get_item(KEY).await.unwrap().is_some());
}

#[tokio::test]
async fn clear_state_removes_everything() {
    let storage = InMemoryKeyValueStore::new();
    let validator = Arc::new(StaticSessionValidator::new(true));
    let store = build_store(fixed_clock(), &storage, &validator);
    store.start_session(true).await;

    store.clear_state().await;
    assert!(store.current_state().is_none());
    assert!(store.summary().is_none());
    assert_eq!(storage.get_item(KEY).await.unwrap(), None);
}
