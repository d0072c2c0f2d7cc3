// Node States
// Per-node scheduling state, Lazy expansion state, and group aggregation

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scheduling state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Pending,
    Queued,
    Running,
    Done,
    Error,
    Killed,
    Skipped,
}

impl NodeState {
    /// No further progress will happen without an operator RESET
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Done | NodeState::Error | NodeState::Killed | NodeState::Skipped
        )
    }

    /// Dispatched to (or waiting on) the runtime
    pub fn is_active(&self) -> bool {
        matches!(self, NodeState::Queued | NodeState::Running)
    }

    /// Counts as success for readiness and aggregation
    pub fn is_satisfied(&self) -> bool {
        matches!(self, NodeState::Done | NodeState::Skipped)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NodeState::Pending => "PENDING",
            NodeState::Queued => "QUEUED",
            NodeState::Running => "RUNNING",
            NodeState::Done => "DONE",
            NodeState::Error => "ERROR",
            NodeState::Killed => "KILLED",
            NodeState::Skipped => "SKIPPED",
        };
        f.write_str(label)
    }
}

/// Expansion state of a Lazy node, tracked apart from its scheduling state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LazyState {
    Unexpanded,
    Expanding,
    Expanded,
    ExpandFailed,
}

impl fmt::Display for LazyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LazyState::Unexpanded => "UNEXPANDED",
            LazyState::Expanding => "EXPANDING",
            LazyState::Expanded => "EXPANDED",
            LazyState::ExpandFailed => "EXPAND_FAILED",
        };
        f.write_str(label)
    }
}

/// Ordering policy of a group node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOrder {
    Serial { stop_on_error: bool },
    Parallel,
}

/// Index of the Serial child that may progress next, if any.
///
/// Only the first unfinished child is eligible; it is blocked by a killed
/// predecessor, or by a failed one when `stop_on_error` is set.
pub(crate) fn serial_next(children: &[NodeState], stop_on_error: bool) -> Option<usize> {
    for (index, state) in children.iter().enumerate() {
        match state {
            NodeState::Done | NodeState::Skipped => continue,
            NodeState::Error if !stop_on_error => continue,
            NodeState::Error | NodeState::Killed => return None,
            NodeState::Pending | NodeState::Queued | NodeState::Running => return Some(index),
        }
    }
    None
}

/// Compute a group's state from its children's states.
///
/// `DONE` iff every child is `DONE` or `SKIPPED`; once nothing can progress,
/// `ERROR` wins over `KILLED`. Kill flags on the group itself are applied by
/// the caller.
pub fn aggregate(order: GroupOrder, children: &[NodeState]) -> NodeState {
    if children.iter().all(NodeState::is_satisfied) {
        return NodeState::Done;
    }

    let any_active = children.iter().any(NodeState::is_active);
    let can_start = match order {
        GroupOrder::Parallel => children.contains(&NodeState::Pending),
        GroupOrder::Serial { stop_on_error } => serial_next(children, stop_on_error).is_some(),
    };

    if any_active || can_start {
        let mut started = children
            .iter()
            .filter(|s| !matches!(s, NodeState::Pending | NodeState::Skipped))
            .peekable();
        if started.peek().is_none() {
            return NodeState::Pending;
        }
        if started.all(|s| *s == NodeState::Queued) {
            return NodeState::Queued;
        }
        return NodeState::Running;
    }

    if children.contains(&NodeState::Error) {
        NodeState::Error
    } else {
        NodeState::Killed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NodeState::*;

    const SERIAL: GroupOrder = GroupOrder::Serial {
        stop_on_error: true,
    };
    const SERIAL_CONTINUE: GroupOrder = GroupOrder::Serial {
        stop_on_error: false,
    };

    #[test]
    fn test_empty_group_is_done() {
        assert_eq!(aggregate(GroupOrder::Parallel, &[]), Done);
        assert_eq!(aggregate(SERIAL, &[]), Done);
    }

    #[test]
    fn test_done_and_skipped_children() {
        assert_eq!(aggregate(GroupOrder::Parallel, &[Done, Skipped, Done]), Done);
        assert_eq!(aggregate(SERIAL, &[Skipped, Skipped]), Done);
    }

    #[test]
    fn test_serial_stop_on_error_settles_to_error() {
        assert_eq!(aggregate(SERIAL, &[Error, Pending]), Error);
        assert_eq!(aggregate(SERIAL, &[Done, Error, Pending, Pending]), Error);
    }

    #[test]
    fn test_serial_continue_keeps_running_after_error() {
        assert_eq!(aggregate(SERIAL_CONTINUE, &[Error, Pending]), Running);
        assert_eq!(aggregate(SERIAL_CONTINUE, &[Error, Running]), Running);
        assert_eq!(aggregate(SERIAL_CONTINUE, &[Error, Done]), Error);
    }

    #[test]
    fn test_parallel_error_waits_for_active_siblings() {
        assert_eq!(aggregate(GroupOrder::Parallel, &[Error, Running]), Running);
        assert_eq!(aggregate(GroupOrder::Parallel, &[Error, Done]), Error);
    }

    #[test]
    fn test_pending_and_queued() {
        assert_eq!(aggregate(GroupOrder::Parallel, &[Pending, Pending]), Pending);
        assert_eq!(aggregate(GroupOrder::Parallel, &[Queued, Pending]), Queued);
        assert_eq!(aggregate(SERIAL, &[Skipped, Queued, Pending]), Queued);
        assert_eq!(aggregate(SERIAL, &[Done, Pending]), Running);
    }

    #[test]
    fn test_killed_child() {
        assert_eq!(aggregate(SERIAL, &[Killed, Pending]), Killed);
        assert_eq!(aggregate(GroupOrder::Parallel, &[Killed, Done]), Killed);
        assert_eq!(aggregate(GroupOrder::Parallel, &[Killed, Error]), Error);
        // a killed predecessor blocks even when errors are tolerated
        assert_eq!(aggregate(SERIAL_CONTINUE, &[Killed, Pending]), Killed);
    }

    #[test]
    fn test_serial_next_picks_first_unfinished_child() {
        assert_eq!(serial_next(&[Done, Skipped, Pending, Pending], true), Some(2));
        assert_eq!(serial_next(&[Done, Running, Pending], true), Some(1));
        assert_eq!(serial_next(&[Error, Pending], true), None);
        assert_eq!(serial_next(&[Error, Pending], false), Some(1));
        assert_eq!(serial_next(&[Killed, Pending], false), None);
        assert_eq!(serial_next(&[Done, Done], true), None);
    }

    #[test]
    fn test_state_predicates() {
        assert!(Skipped.is_terminal());
        assert!(!Pending.is_terminal());
        assert!(Queued.is_active());
        assert!(Skipped.is_satisfied());
        assert!(!Error.is_satisfied());
        assert_eq!(Error.to_string(), "ERROR");
        assert_eq!(LazyState::ExpandFailed.to_string(), "EXPAND_FAILED");
    }
}
