mod envelope;
mod tracker;

pub use envelope::{CompletionNotice, ProgressEnvelope};
pub use tracker::{
    CompleteCallback, ErrorCallback, ProgressCallback, ProgressSubscription, ProgressTracker,
};
