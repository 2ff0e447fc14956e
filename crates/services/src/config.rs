use std::time::Duration;

/// Storage key used when none is configured.
pub const DEFAULT_STORAGE_KEY: &str = "assessment_workflow_state";

/// Tunables for `SessionStateStore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConfig {
    storage_key: String,
    save_debounce: Duration,
    max_session_age: chrono::Duration,
    completion_grace: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            save_debounce: Duration::from_secs(1),
            max_session_age: chrono::Duration::hours(24),
            completion_grace: Duration::from_secs(30),
        }
    }
}

impl WorkflowConfig {
    #[must_use]
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    #[must_use]
    pub fn with_save_debounce(mut self, delay: Duration) -> Self {
        self.save_debounce = delay;
        self
    }

    #[must_use]
    pub fn with_max_session_age(mut self, age: chrono::Duration) -> Self {
        self.max_session_age = age;
        self
    }

    #[must_use]
    pub fn with_completion_grace(mut self, grace: Duration) -> Self {
        self.completion_grace = grace;
        self
    }

    #[must_use]
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    #[must_use]
    pub fn save_debounce(&self) -> Duration {
        self.save_debounce
    }

    #[must_use]
    pub fn max_session_age(&self) -> chrono::Duration {
        self.max_session_age
    }

    #[must_use]
    pub fn completion_grace(&self) -> Duration {
        self.completion_grace
    }
}

/// How `ProgressTracker::update_progress` treats out-of-order stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransitionPolicy {
    /// Log a warning and apply the update anyway.
    #[default]
    Lenient,
    /// Reject the update with `ProgressError::InvalidTransition`.
    Strict,
}

/// Tunables for `ProgressTracker`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressConfig {
    eviction_delay: Duration,
    subscription_debounce: Duration,
    deduplicate: bool,
    transition_policy: TransitionPolicy,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            eviction_delay: Duration::from_secs(30),
            subscription_debounce: Duration::from_millis(100),
            deduplicate: true,
            transition_policy: TransitionPolicy::Lenient,
        }
    }
}

impl ProgressConfig {
    #[must_use]
    pub fn with_eviction_delay(mut self, delay: Duration) -> Self {
        self.eviction_delay = delay;
        self
    }

    #[must_use]
    pub fn with_subscription_debounce(mut self, delay: Duration) -> Self {
        self.subscription_debounce = delay;
        self
    }

    #[must_use]
    pub fn with_deduplicate(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }

    #[must_use]
    pub fn with_transition_policy(mut self, policy: TransitionPolicy) -> Self {
        self.transition_policy = policy;
        self
    }

    #[must_use]
    pub fn eviction_delay(&self) -> Duration {
        self.eviction_delay
    }

    #[must_use]
    pub fn subscription_debounce(&self) -> Duration {
        self.subscription_debounce
    }

    #[must_use]
    pub fn deduplicate(&self) -> bool {
        self.deduplicate
    }

    #[must_use]
    pub fn transition_policy(&self) -> TransitionPolicy {
        self.transition_policy
    }
}
