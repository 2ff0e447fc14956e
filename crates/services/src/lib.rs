#![forbid(unsafe_code)]

pub mod app_services;
pub mod channel;
pub mod config;
pub mod error;
pub mod progress;
mod runtime;
pub mod validator;
pub mod workflow;

pub use intake_core::Clock;

pub use app_services::AppServices;
pub use channel::{
    DeliveryChannel, DeliveryOptions, LocalDeliveryChannel, MessageHandler, Priority, Routing,
    SubscribeOptions, SubscriptionId,
};
pub use config::{ProgressConfig, TransitionPolicy, WorkflowConfig};
pub use error::{AppServicesError, ProgressError, SessionStoreError, ValidatorError};
pub use progress::{CompletionNotice, ProgressEnvelope, ProgressSubscription, ProgressTracker};
pub use validator::{SessionValidation, SessionValidator, StaticSessionValidator};
pub use workflow::{ListenerId, SaveOptions, SessionStateStore, StateListener};
