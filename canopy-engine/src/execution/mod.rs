// Execution Engine Module
// Scope resolution, lazy expansion, scheduling, lifecycle events and run reports

pub mod control;
pub mod events;
pub mod lazy;
pub mod report;
pub mod scheduler;
pub mod scope;
pub mod state;

// Re-export key types
pub use control::{OperatorCommand, RunControl};
pub use events::{
    handler, progress_channel, Callback, EventKind, EventSender, Handler, HandlerResult,
    NodeEvent, ProgressReceiver, ProgressSender, RunEvent,
};
pub use lazy::LazyContext;
pub use report::{Failure, FailureKind, NodeReport, RunReport};
pub use scheduler::Run;
pub use scope::{scope_key, ScopeId, ScopeKey, ScopeTable};
pub use state::{aggregate, GroupOrder, LazyState, NodeState};
