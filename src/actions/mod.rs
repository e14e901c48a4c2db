//! Automation rule engine: triggers, actions, and ordered sub-action
//! execution.

pub mod coordinator;
pub mod dispatcher;
pub mod executor;
pub mod handlers;
pub mod schedule;
pub mod store;
pub mod types;

// Re-export main types
pub use coordinator::{Admission, CoordinatorConfig, ExecutionCoordinator};
pub use dispatcher::{EventSource, PlatformEvent, ScheduleChecker, TriggerDispatcher};
pub use executor::{ActionExecutor, ExecutionRecord, ExecutionStatus, TriggerContext};
pub use handlers::{HandlerEnv, HandlerRegistry, SubActionHandler};
pub use store::{ActionFilter, ActionStore};
pub use types::{Action, ActionPatch, NewAction, Role, SubAction, SubActionKind, Trigger};
