// Run Scheduler
// Drives a node tree to completion: readiness, dispatch, aggregation and operator commands

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, ExpansionError};
use crate::execution::control::{CommandReceiver, OperatorCommand, RunControl};
use crate::execution::events::{
    dispatch, matching_handlers, Callback, EventKind, EventSender, Handler, NodeEvent,
    PendingDispatch, ProgressSender, RunEvent,
};
use crate::execution::lazy::{self, LazyContext};
use crate::execution::report::RunReport;
use crate::execution::scope::{scope_key, ScopeId, ScopeTable};
use crate::execution::state::{aggregate, serial_next, GroupOrder, LazyState, NodeState};
use crate::runners::{LeafExit, LeafStatus, LeafTask, Runtime, RuntimeHandle};
use crate::store::DataStore;
use crate::tree::{LazyGenerator, Node, NodeId, NodeKind, Outcome, Tree};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Work handed off to a background task after a scheduling pass
enum Work {
    Leaf {
        id: NodeId,
        generation: u64,
        scope: ScopeId,
        task: LeafTask,
    },
    Expand {
        id: NodeId,
        generation: u64,
        generator: LazyGenerator,
        ctx: LazyContext,
    },
}

/// Reports from background tasks back to the scheduling loop
enum Completion {
    Started {
        id: NodeId,
        generation: u64,
        handle: RuntimeHandle,
    },
    StartFailed {
        id: NodeId,
        generation: u64,
        error: String,
    },
    Exited {
        id: NodeId,
        generation: u64,
        scope: ScopeId,
        exit: LeafExit,
        duration: Duration,
    },
    Expanded {
        id: NodeId,
        generation: u64,
        result: Result<Node, ExpansionError>,
    },
}

impl Completion {
    /// Every piece of dispatched work ends with exactly one final completion
    fn is_final(&self) -> bool {
        !matches!(self, Completion::Started { .. })
    }
}

/// Mutable run state, guarded by a single mutex
struct RunState {
    tree: Tree,
    scopes: ScopeTable,
    handles: HashMap<NodeId, RuntimeHandle>,
    transitions: Vec<NodeEvent>,
    /// Spliced leaves and Lazy nodes that continue from RUNNING
    resume: Vec<NodeId>,
    elapsed: Duration,
}

impl RunState {
    /// Record a transition; handlers fire once the lock is released
    fn set_state(&mut self, id: NodeId, to: NodeState) {
        let slot = self.tree.slot_mut(id);
        let from = slot.state;
        if from == to {
            return;
        }
        slot.state = to;
        let (exit_code, message) = match &slot.outcome {
            Some(outcome) => (outcome.exit_code, outcome.message.clone()),
            None => (None, None),
        };
        self.transitions.push(NodeEvent {
            id,
            path: self.tree.path(id),
            from,
            to,
            exit_code,
            message,
        });
    }

    fn group_state(&self, id: NodeId) -> NodeState {
        let slot = self.tree.slot(id);
        if slot.state == NodeState::Skipped {
            return NodeState::Skipped;
        }
        if slot.killed {
            return NodeState::Killed;
        }
        let order = match slot.kind {
            NodeKind::Serial => GroupOrder::Serial {
                stop_on_error: slot.attrs.stop_on_error,
            },
            _ => GroupOrder::Parallel,
        };
        let children: Vec<NodeState> = slot
            .children
            .iter()
            .map(|child| self.tree.state(*child))
            .collect();
        let state = aggregate(order, &children);
        // an expanded Lazy node stays RUNNING until its replacement finishes
        if slot.lazy == Some(LazyState::Expanded)
            && slot.state == NodeState::Running
            && matches!(state, NodeState::Pending | NodeState::Queued)
        {
            return NodeState::Running;
        }
        state
    }

    /// Recompute every group state bottom-up
    fn refresh(&mut self) {
        for id in self.tree.preorder().into_iter().rev() {
            if self.tree.kind(id).is_group() {
                let state = self.group_state(id);
                self.set_state(id, state);
            }
        }
    }

    fn take_transitions(&mut self) -> Vec<PendingDispatch> {
        let tree = &self.tree;
        self.transitions
            .drain(..)
            .map(|event| PendingDispatch {
                handlers: matching_handlers(&tree.slot(event.id).callbacks, event.to),
                event,
            })
            .collect()
    }

    /// Nodes that may start now, in tree order
    fn ready(&self, id: NodeId, out: &mut Vec<NodeId>) {
        let slot = self.tree.slot(id);
        match &slot.kind {
            NodeKind::Exec(_) => {
                if slot.state == NodeState::Pending {
                    out.push(id);
                }
            }
            NodeKind::Lazy(_) => {
                if slot.state == NodeState::Pending && slot.lazy == Some(LazyState::Unexpanded) {
                    out.push(id);
                }
            }
            NodeKind::Parallel => {
                if slot.state.is_terminal() {
                    return;
                }
                for child in &slot.children {
                    self.ready(*child, out);
                }
            }
            NodeKind::Serial => {
                if slot.state.is_terminal() {
                    return;
                }
                let children: Vec<NodeState> = slot
                    .children
                    .iter()
                    .map(|child| self.tree.state(*child))
                    .collect();
                if let Some(next) = serial_next(&children, slot.attrs.stop_on_error) {
                    self.ready(slot.children[next], out);
                }
            }
        }
    }
}

/// A run of one node tree against one runtime.
///
/// All state transitions and scope assignments happen under a single lock;
/// runtime calls and handler invocations happen outside it.
pub struct Run {
    config: EngineConfig,
    runtime: Arc<dyn Runtime>,
    store: Option<Arc<dyn DataStore>>,
    progress: Option<ProgressSender>,
    state: Mutex<RunState>,
    control: RunControl,
    commands: tokio::sync::Mutex<CommandReceiver>,
}

impl Run {
    /// Create a run over `root` with default configuration
    pub fn new(root: impl Into<Tree>, runtime: Arc<dyn Runtime>) -> Self {
        let config = EngineConfig::default();
        let (control, commands) = RunControl::channel();
        Self {
            state: Mutex::new(RunState {
                tree: root.into(),
                scopes: ScopeTable::new(config.run_id.clone()),
                handles: HashMap::new(),
                transitions: Vec::new(),
                resume: Vec::new(),
                elapsed: Duration::ZERO,
            }),
            config,
            runtime,
            store: None,
            progress: None,
            control,
            commands: tokio::sync::Mutex::new(commands),
        }
    }

    /// Set run configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        {
            let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
            state.scopes = ScopeTable::new(config.run_id.clone());
        }
        self.config = config;
        self
    }

    /// Data store handed to callable leaves and Lazy generators
    pub fn with_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.config.run_id
    }

    /// Handle for issuing RESET, kill and skip commands, also from handlers
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a lifecycle handler on the node at `path`
    pub fn register(&self, path: &str, kind: EventKind, handler: Handler) -> EngineResult<()> {
        let mut state = self.lock();
        let id = state.tree.lookup(path)?;
        state
            .tree
            .slot_mut(id)
            .callbacks
            .push(Callback::new(kind, handler));
        Ok(())
    }

    pub fn state_of(&self, path: &str) -> EngineResult<NodeState> {
        let state = self.lock();
        let id = state.tree.lookup(path)?;
        Ok(state.tree.state(id))
    }

    pub fn lazy_state_of(&self, path: &str) -> EngineResult<Option<LazyState>> {
        let state = self.lock();
        let id = state.tree.lookup(path)?;
        Ok(state.tree.lazy_state(id))
    }

    /// Scope assigned to the leaf at `path`, once it has been dispatched
    pub fn scope_of(&self, path: &str) -> EngineResult<Option<ScopeId>> {
        let state = self.lock();
        let id = state.tree.lookup(path)?;
        Ok(state.scopes.assigned(id).cloned())
    }

    /// Every leaf dispatched so far with its scope, in tree order
    pub fn scope_assignments(&self) -> Vec<(String, ScopeId)> {
        let state = self.lock();
        state
            .tree
            .preorder()
            .into_iter()
            .filter_map(|id| {
                state
                    .scopes
                    .assigned(id)
                    .map(|scope| (state.tree.path(id), scope.clone()))
            })
            .collect()
    }

    /// Read access to the live tree
    pub fn inspect<R>(&self, f: impl FnOnce(&Tree) -> R) -> R {
        f(&self.lock().tree)
    }

    /// Indented tree with each node's kind and state
    pub fn render(&self) -> String {
        let state = self.lock();
        state.tree.render(|id| {
            let mut line = format!("[{}] {}", state.tree.kind(id).label(), state.tree.state(id));
            if let Some(scope) = state.scopes.assigned(id) {
                line.push_str(&format!(" scope={}", scope));
            }
            if let Some(code) = state.tree.outcome(id).and_then(|o| o.exit_code) {
                if code != 0 {
                    line.push_str(&format!(" exit={}", code));
                }
            }
            line
        })
    }

    pub fn report(&self) -> RunReport {
        let state = self.lock();
        RunReport::build(&state.tree, &state.scopes, &self.config.run_id, state.elapsed)
    }

    /// Release runtime resources held for this run's scopes
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.runtime.shutdown().await?;
        Ok(())
    }

    /// Apply an operator command immediately.
    ///
    /// While `execute` is in progress prefer [`Run::control`], which wakes the
    /// scheduling loop.
    pub async fn apply(&self, command: OperatorCommand) -> EngineResult<()> {
        let (handles, transitions) = {
            let mut state = self.lock();
            let handles = self.apply_locked(&mut state, command)?;
            state.refresh();
            (handles, state.take_transitions())
        };
        self.emit(transitions);
        self.kill_handles(handles).await;
        Ok(())
    }

    async fn apply_logged(&self, command: OperatorCommand) {
        if let Err(err) = self.apply(command).await {
            warn!(error = %err, "operator command rejected");
        }
    }

    fn apply_locked(
        &self,
        state: &mut RunState,
        command: OperatorCommand,
    ) -> EngineResult<Vec<RuntimeHandle>> {
        match command {
            OperatorCommand::Kill { path } => {
                let target = state.tree.lookup(&path)?;
                info!(path = %path, "killing subtree");
                let mut handles = Vec::new();
                for id in state.tree.descendants(target) {
                    let slot = state.tree.slot_mut(id);
                    if slot.state.is_terminal() {
                        continue;
                    }
                    slot.generation += 1;
                    if slot.kind.is_group() {
                        slot.killed = true;
                        continue;
                    }
                    if slot.lazy == Some(LazyState::Expanding) {
                        slot.lazy = Some(LazyState::Unexpanded);
                    }
                    if let Some(handle) = state.handles.remove(&id) {
                        handles.push(handle);
                    }
                    state.set_state(id, NodeState::Killed);
                }
                Ok(handles)
            }
            OperatorCommand::Reset { path } => {
                let target = state.tree.lookup(&path)?;
                let subtree = state.tree.descendants(target);
                if let Some(active) = subtree.iter().find(|id| state.tree.state(**id).is_active()) {
                    return Err(EngineError::invalid_transition(
                        state.tree.path(*active),
                        "reset",
                        state.tree.state(*active),
                    ));
                }

                info!(path = %path, "resetting subtree");
                for id in subtree {
                    lazy::rearm(&mut state.tree, id);
                    let slot = state.tree.slot_mut(id);
                    slot.killed = false;
                    slot.outcome = None;
                    slot.generation += 1;
                    let to = if slot.attrs.skip {
                        NodeState::Skipped
                    } else {
                        NodeState::Pending
                    };
                    state.handles.remove(&id);
                    state.set_state(id, to);
                }
                for id in state.tree.ancestors(target) {
                    state.tree.slot_mut(id).killed = false;
                }
                Ok(Vec::new())
            }
            OperatorCommand::SetSkip { path, skip } => {
                let target = state.tree.lookup(&path)?;
                debug!(path = %path, skip, "skip flag changed");
                state.tree.slot_mut(target).attrs.skip = skip;
                Ok(Vec::new())
            }
        }
    }

    async fn kill_handles(&self, handles: Vec<RuntimeHandle>) {
        if !self.config.forward_kills {
            return;
        }
        for handle in handles {
            if let Err(err) = self.runtime.kill(&handle).await {
                warn!(scope = %handle.scope, handle = handle.id, error = %err, "runtime kill failed");
            }
        }
    }

    /// Publish transitions and run their handlers
    fn emit(&self, transitions: Vec<PendingDispatch>) {
        for pending in transitions {
            debug!(path = %pending.event.path, from = %pending.event.from, to = %pending.event.to, "node state changed");
            self.progress.send_event(RunEvent::state_changed(
                pending.event.path.clone(),
                pending.event.from,
                pending.event.to,
            ));
            dispatch(vec![pending], &self.control);
        }
    }

    /// Build the task for an Exec leaf and assign its scope
    fn leaf_work(&self, state: &mut RunState, id: NodeId) -> EngineResult<Work> {
        let scope = state.scopes.resolve(&state.tree, id)?;
        let path = state.tree.path(id);
        let command = match state.tree.kind(id) {
            NodeKind::Exec(command) => command.clone(),
            other => {
                return Err(EngineError::invalid_transition(path, "dispatch", other.label()))
            }
        };

        let mut env = state.tree.effective_env(id);
        env.insert(self.config.env_var("RUN_ID"), self.config.run_id.clone());
        env.insert(self.config.env_var("NODE_PATH"), path.clone());
        env.insert(self.config.env_var("SCOPE_ID"), scope.to_string());

        Ok(Work::Leaf {
            id,
            generation: state.tree.slot(id).generation,
            task: LeafTask {
                path,
                command,
                env,
                image: state.tree.effective_image(id),
                resources: state.tree.effective_resources(id),
                store: self.store.clone(),
            },
            scope,
        })
    }

    fn expand_work(&self, state: &mut RunState, id: NodeId) -> EngineResult<Option<Work>> {
        let Some(generator) = lazy::begin(&mut state.tree, id) else {
            return Ok(None);
        };
        let scope = state.scopes.id_for(&scope_key(&state.tree, id)?);
        let ctx = LazyContext {
            path: state.tree.path(id),
            args: generator.args.clone(),
            run_id: self.config.run_id.clone(),
            workspace: self.runtime.workspace(&scope),
            scope,
            store: self.store.clone(),
        };
        Ok(Some(Work::Expand {
            id,
            generation: state.tree.slot(id).generation,
            generator,
            ctx,
        }))
    }

    /// One locked scheduling pass: aggregate, pick ready nodes, queue them.
    ///
    /// Returns the work to dispatch and whether any transition was recorded.
    fn schedule_pass(&self) -> EngineResult<(Vec<Work>, bool)> {
        let (work, transitions) = {
            let mut state = self.lock();
            state.refresh();

            let mut ready = Vec::new();
            state.ready(state.tree.root(), &mut ready);

            let mut work = Vec::new();
            for id in std::mem::take(&mut state.resume) {
                if state.tree.state(id) != NodeState::Running {
                    continue;
                }
                match state.tree.kind(id) {
                    NodeKind::Exec(_) => work.push(self.leaf_work(&mut state, id)?),
                    NodeKind::Lazy(_) => {
                        if let Some(expansion) = self.expand_work(&mut state, id)? {
                            work.push(expansion);
                        }
                    }
                    _ => {}
                }
            }

            for id in ready {
                match state.tree.kind(id) {
                    NodeKind::Exec(_) => {
                        work.push(self.leaf_work(&mut state, id)?);
                        state.set_state(id, NodeState::Queued);
                    }
                    _ => {
                        if let Some(expansion) = self.expand_work(&mut state, id)? {
                            work.push(expansion);
                            state.set_state(id, NodeState::Queued);
                            state.set_state(id, NodeState::Running);
                        }
                    }
                }
            }

            state.refresh();
            (work, state.take_transitions())
        };

        let fired = !transitions.is_empty();
        self.emit(transitions);
        Ok((work, fired))
    }

    fn spawn(&self, work: Work, tx: &mpsc::UnboundedSender<Completion>) {
        let tx = tx.clone();
        match work {
            Work::Leaf {
                id,
                generation,
                scope,
                task,
            } => {
                let runtime = self.runtime.clone();
                let interval = self.config.poll_interval;
                debug!(path = %task.path, scope = %scope, "dispatching leaf");
                tokio::spawn(async move {
                    let started = Instant::now();
                    let handle = match runtime.start(&scope, task).await {
                        Ok(handle) => handle,
                        Err(err) => {
                            let _ = tx.send(Completion::StartFailed {
                                id,
                                generation,
                                error: err.to_string(),
                            });
                            return;
                        }
                    };
                    let _ = tx.send(Completion::Started {
                        id,
                        generation,
                        handle: handle.clone(),
                    });

                    let exit = loop {
                        match runtime.poll(&handle).await {
                            Ok(LeafStatus::Exited(exit)) => break exit,
                            Ok(LeafStatus::Pending | LeafStatus::Running) => {
                                tokio::time::sleep(interval).await
                            }
                            Err(err) => {
                                break LeafExit::failure(-1, format!("lost track of leaf: {}", err))
                            }
                        }
                    };
                    let _ = tx.send(Completion::Exited {
                        id,
                        generation,
                        scope,
                        exit,
                        duration: started.elapsed(),
                    });
                });
            }
            Work::Expand {
                id,
                generation,
                generator,
                ctx,
            } => {
                debug!(path = %ctx.path, "expanding lazy node");
                tokio::spawn(async move {
                    let result = lazy::expand(generator, ctx).await;
                    let _ = tx.send(Completion::Expanded {
                        id,
                        generation,
                        result,
                    });
                });
            }
        }
    }

    /// Fold a background report into the run state
    async fn complete(&self, completion: Completion) {
        let mut stale_handle = None;
        let transitions = {
            let mut state = self.lock();
            match completion {
                Completion::Started {
                    id,
                    generation,
                    handle,
                } => {
                    if state.tree.slot(id).generation != generation {
                        stale_handle = Some(handle);
                    } else {
                        state.handles.insert(id, handle);
                        state.set_state(id, NodeState::Running);
                    }
                }
                Completion::StartFailed {
                    id,
                    generation,
                    error,
                } => {
                    let path = state.tree.path(id);
                    if state.tree.slot(id).generation != generation {
                        debug!(path = %path, "ignoring start failure of a killed leaf");
                    } else {
                        warn!(path = %path, error = %error, "leaf failed to start");
                        state.tree.slot_mut(id).outcome = Some(Outcome {
                            exit_code: None,
                            message: Some(error),
                        });
                        state.set_state(id, NodeState::Error);
                    }
                }
                Completion::Exited {
                    id,
                    generation,
                    scope,
                    exit,
                    duration,
                } => {
                    let path = state.tree.path(id);
                    if state.tree.slot(id).generation != generation {
                        warn!(path = %path, code = exit.code, "discarding result of killed or reset leaf");
                    } else {
                        state.handles.remove(&id);
                        self.progress.send_event(RunEvent::LeafExited {
                            path: path.clone(),
                            scope: scope.to_string(),
                            exit_code: exit.code,
                            duration,
                        });
                        let to = if exit.succeeded() {
                            NodeState::Done
                        } else {
                            NodeState::Error
                        };
                        state.tree.slot_mut(id).outcome = Some(Outcome {
                            exit_code: Some(exit.code),
                            message: exit.message,
                        });
                        state.set_state(id, to);
                    }
                }
                Completion::Expanded {
                    id,
                    generation,
                    result,
                } => {
                    let path = state.tree.path(id);
                    if state.tree.slot(id).generation != generation {
                        warn!(path = %path, "discarding expansion of killed lazy node");
                    } else {
                        match lazy::complete(&mut state.tree, id, result) {
                            Ok(children) => {
                                info!(path = %path, children, "lazy node expanded");
                                self.progress
                                    .send_event(RunEvent::LazyExpanded { path, children });
                                if !state.tree.kind(id).is_group() {
                                    state.resume.push(id);
                                }
                            }
                            Err(err) => {
                                warn!(path = %path, error = %err, "lazy expansion failed");
                                state.tree.slot_mut(id).outcome = Some(Outcome {
                                    exit_code: None,
                                    message: Some(err.message),
                                });
                                state.set_state(id, NodeState::Error);
                            }
                        }
                    }
                }
            }
            state.refresh();
            state.take_transitions()
        };

        self.emit(transitions);
        if let Some(handle) = stale_handle {
            self.kill_handles(vec![handle]).await;
        }
    }

    /// Schedule until the root reaches a terminal state.
    ///
    /// Commands queued through [`Run::control`] are applied between
    /// transitions. Calling `execute` again after a RESET resumes the run.
    pub async fn execute(&self) -> EngineResult<RunReport> {
        let mut commands = self
            .commands
            .try_lock()
            .map_err(|_| EngineError::AlreadyRunning)?;
        let started = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut outstanding = 0usize;

        let total_nodes = self.inspect(|tree| tree.preorder().len());
        info!(run_id = %self.config.run_id, total_nodes, "run started");
        self.progress.send_event(RunEvent::RunStarted {
            run_id: self.config.run_id.clone(),
            total_nodes,
        });

        loop {
            while let Ok(command) = commands.try_recv() {
                self.apply_logged(command).await;
            }

            let (work, fired) = self.schedule_pass()?;
            let dispatched = !work.is_empty();
            for item in work {
                outstanding += 1;
                self.spawn(item, &tx);
            }
            if fired || dispatched {
                continue;
            }

            let root_state = self.inspect(|tree| tree.state(tree.root()));
            if root_state.is_terminal() {
                break;
            }
            if outstanding == 0 {
                warn!(state = %root_state, "run stalled with nothing in flight");
                break;
            }

            tokio::select! {
                Some(completion) = rx.recv() => {
                    if completion.is_final() {
                        outstanding = outstanding.saturating_sub(1);
                    }
                    self.complete(completion).await;
                }
                Some(command) = commands.recv() => {
                    self.apply_logged(command).await;
                }
                else => break,
            }
        }

        // late reports: stale starts still get their kill forwarded
        while let Ok(completion) = rx.try_recv() {
            self.complete(completion).await;
        }

        let duration = started.elapsed();
        let report = {
            let mut state = self.lock();
            state.elapsed += duration;
            RunReport::build(&state.tree, &state.scopes, &self.config.run_id, state.elapsed)
        };

        info!(run_id = %self.config.run_id, state = %report.state, duration = ?duration, "run finished");
        self.progress.send_event(RunEvent::RunFinished {
            run_id: self.config.run_id.clone(),
            state: report.state,
            duration,
        });
        Ok(report)
    }
}
