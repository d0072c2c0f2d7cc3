// Run Control
// Operator commands (reset, kill, skip) delivered to a run's scheduling loop

use tokio::sync::mpsc;

/// Operator command addressed to a node by path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Return a terminal subtree to PENDING so it runs again
    Reset { path: String },
    /// Cooperatively stop a subtree
    Kill { path: String },
    /// Change the skip flag; takes effect at the node's next RESET
    SetSkip { path: String, skip: bool },
}

pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<OperatorCommand>;

/// Cloneable handle for steering a run.
///
/// Commands are queued and applied by the scheduling loop between state
/// transitions; when the run is idle they are applied at the start of the
/// next `execute`.
#[derive(Debug, Clone)]
pub struct RunControl {
    tx: mpsc::UnboundedSender<OperatorCommand>,
}

impl RunControl {
    pub(crate) fn channel() -> (Self, CommandReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, command: OperatorCommand) {
        let _ = self.tx.send(command);
    }

    pub fn reset(&self, path: impl Into<String>) {
        self.send(OperatorCommand::Reset { path: path.into() });
    }

    pub fn kill(&self, path: impl Into<String>) {
        self.send(OperatorCommand::Kill { path: path.into() });
    }

    pub fn set_skip(&self, path: impl Into<String>, skip: bool) {
        self.send(OperatorCommand::SetSkip {
            path: path.into(),
            skip,
        });
    }
}
