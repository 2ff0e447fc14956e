mod persistence;
mod store;

pub use store::{ListenerId, SaveOptions, SessionStateStore, StateListener};
