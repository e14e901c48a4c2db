pub mod actions;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod interpolate;
pub mod metrics;
pub mod providers;
pub mod retry;
pub mod variables;
pub mod vault;
pub mod webhook;

// Re-export engine types at crate root for convenience
pub use actions::{
    Action, ActionStore, EventSource, ExecutionCoordinator, ExecutionRecord, PlatformEvent,
    SubAction, Trigger, TriggerDispatcher,
};
pub use error::{HandlerError, StoreError};
