// Execution Events
// Lifecycle callbacks on nodes and the run-level progress stream

use crate::execution::control::RunControl;
use crate::execution::state::NodeState;
use crate::tree::NodeId;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Sender for run progress events
pub type ProgressSender = mpsc::UnboundedSender<RunEvent>;

/// Receiver for run progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<RunEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Result of a lifecycle handler
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Lifecycle handler registered on a node
pub type Handler = Arc<dyn Fn(&NodeEvent, &RunControl) -> HandlerResult + Send + Sync>;

/// Wrap a closure as a shareable [`Handler`]
pub fn handler<F>(func: F) -> Handler
where
    F: Fn(&NodeEvent, &RunControl) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(func)
}

/// Lifecycle event kinds a handler can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Queued,
    Running,
    Done,
    Errored,
    Killed,
    AnyStateChange,
}

impl EventKind {
    /// Does a transition into `state` fire handlers of this kind?
    pub fn matches(&self, state: NodeState) -> bool {
        match self {
            EventKind::AnyStateChange => true,
            EventKind::Queued => state == NodeState::Queued,
            EventKind::Running => state == NodeState::Running,
            EventKind::Done => state == NodeState::Done,
            EventKind::Errored => state == NodeState::Error,
            EventKind::Killed => state == NodeState::Killed,
        }
    }
}

/// A handler bound to an event kind
#[derive(Clone)]
pub struct Callback {
    pub kind: EventKind,
    pub handler: Handler,
}

impl Callback {
    pub fn new(kind: EventKind, handler: Handler) -> Self {
        Self { kind, handler }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// A recorded state transition, as handed to handlers
#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub id: NodeId,
    pub path: String,
    pub from: NodeState,
    pub to: NodeState,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

/// Handlers matching a transition into `to`, in registration order.
///
/// A handler registered under several matching kinds runs once.
pub(crate) fn matching_handlers(callbacks: &[Callback], to: NodeState) -> Vec<Handler> {
    let mut selected: Vec<Handler> = Vec::new();
    for callback in callbacks.iter().filter(|c| c.kind.matches(to)) {
        if !selected.iter().any(|h| Arc::ptr_eq(h, &callback.handler)) {
            selected.push(callback.handler.clone());
        }
    }
    selected
}

/// A transition together with the handlers it triggers
pub(crate) struct PendingDispatch {
    pub event: NodeEvent,
    pub handlers: Vec<Handler>,
}

/// Invoke handlers for already-recorded transitions.
///
/// A failing or panicking handler is logged and skipped; it never affects the
/// node or the remaining handlers.
pub(crate) fn dispatch(pending: Vec<PendingDispatch>, control: &RunControl) {
    for PendingDispatch { event, handlers } in pending {
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event, control))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(path = %event.path, state = %event.to, error = %err, "node handler failed");
                }
                Err(_) => {
                    warn!(path = %event.path, state = %event.to, "node handler panicked");
                }
            }
        }
    }
}

/// Events emitted on the progress stream during a run
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Scheduling started (or resumed after a RESET)
    RunStarted { run_id: String, total_nodes: usize },

    /// A node changed state
    NodeStateChanged {
        path: String,
        from: NodeState,
        to: NodeState,
    },

    /// A Lazy node was replaced by its generated subtree
    LazyExpanded { path: String, children: usize },

    /// A leaf's work finished on the runtime
    LeafExited {
        path: String,
        scope: String,
        exit_code: i32,
        duration: Duration,
    },

    /// The root reached a terminal state
    RunFinished {
        run_id: String,
        state: NodeState,
        duration: Duration,
    },
}

impl RunEvent {
    pub fn state_changed(path: impl Into<String>, from: NodeState, to: NodeState) -> Self {
        Self::NodeStateChanged {
            path: path.into(),
            from,
            to,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: RunEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: RunEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: RunEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn event(to: NodeState) -> NodeEvent {
        NodeEvent {
            id: NodeId::root(),
            path: "/".to_string(),
            from: NodeState::Running,
            to,
            exit_code: None,
            message: None,
        }
    }

    #[test]
    fn test_kind_matching() {
        assert!(EventKind::Errored.matches(NodeState::Error));
        assert!(!EventKind::Errored.matches(NodeState::Done));
        assert!(EventKind::AnyStateChange.matches(NodeState::Pending));
    }

    #[test]
    fn test_matching_handlers_dedupes_shared_handler() {
        let shared = handler(|_, _| Ok(()));
        let other = handler(|_, _| Ok(()));
        let callbacks = vec![
            Callback::new(EventKind::Done, shared.clone()),
            Callback::new(EventKind::Errored, other.clone()),
            Callback::new(EventKind::AnyStateChange, shared.clone()),
            Callback::new(EventKind::AnyStateChange, other.clone()),
        ];

        let done = matching_handlers(&callbacks, NodeState::Done);
        assert_eq!(done.len(), 2);
        assert!(Arc::ptr_eq(&done[0], &shared));
        assert!(Arc::ptr_eq(&done[1], &other));
    }

    #[test]
    fn test_dispatch_isolates_failures() {
        let (control, _rx) = RunControl::channel();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let first = calls.clone();
        let failing = handler(move |_, _| {
            first.lock().unwrap().push("failing");
            Err("boom".into())
        });
        let panicking = handler(|_, _| panic!("handler bug"));
        let last = calls.clone();
        let recording = handler(move |_, _| {
            last.lock().unwrap().push("recording");
            Ok(())
        });

        dispatch(
            vec![PendingDispatch {
                event: event(NodeState::Done),
                handlers: vec![failing, panicking, recording],
            }],
            &control,
        );

        assert_eq!(*calls.lock().unwrap(), vec!["failing", "recording"]);
    }

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(RunEvent::RunStarted {
            run_id: "test".to_string(),
            total_nodes: 3,
        });
        tx.send_event(RunEvent::state_changed(
            "/build",
            NodeState::Pending,
            NodeState::Queued,
        ));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, RunEvent::RunStarted { total_nodes: 3, .. }));

        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second,
            RunEvent::NodeStateChanged { to: NodeState::Queued, .. }
        ));
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        // Should not panic
        sender.send_event(RunEvent::LazyExpanded {
            path: "/gen".to_string(),
            children: 0,
        });
    }
}
