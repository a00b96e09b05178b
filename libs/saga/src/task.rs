//! Task Tree
//!
//! Tasks are nodes in an explicit arena indexed by [`TaskId`]. Parent and
//! child links are ids, never references, so cancellation cascades walk the
//! arena without cyclic ownership. Each task also owns a [`TaskCell`] shared
//! with every [`TaskHandle`] so status and outcome stay observable after the
//! scheduler drops the record.
//!
//! # Lifecycle
//!
//! ```text
//! Pending ──► Running ──┬──► Completed
//!                       ├──► Cancelled
//!                       └──► Failed
//! ```
//!
//! Transitions are monotonic; nothing leaves a terminal state.

use crate::procedure::{BoxedSaga, Output};
use crate::{Result, SagaError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Placeholder for failures raised before their task is known
    pub const UNASSIGNED: TaskId = TaskId(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Failed
        )
    }

    /// Check whether the lifecycle permits moving to `next`
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => next != TaskStatus::Pending,
            TaskStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a task was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelKind {
    /// Explicit Cancel effect or `TaskHandle::cancel`
    User,
    /// Lost a Race to a sibling that completed first
    RaceLost,
    /// A sibling failed and tore down the group
    FailFast,
    /// An ancestor was cancelled
    ParentCancelled,
    /// The parent finished its own procedure
    ParentCompleted,
}

impl fmt::Display for CancelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::RaceLost => write!(f, "race lost"),
            Self::FailFast => write!(f, "fail-fast"),
            Self::ParentCancelled => write!(f, "parent cancelled"),
            Self::ParentCompleted => write!(f, "parent completed"),
        }
    }
}

/// Terminal result of a task
pub type TaskOutcome = std::result::Result<Output, SagaError>;

/// Scheduler operations reachable from a detached handle
pub(crate) trait TaskControl: Send + Sync {
    fn request_cancel(&self, task: TaskId);
}

#[derive(Debug)]
struct CellState {
    status: TaskStatus,
    outcome: Option<TaskOutcome>,
    cancel_kind: Option<CancelKind>,
}

/// Observable state shared between a task record and its handles
pub(crate) struct TaskCell {
    id: TaskId,
    name: String,
    parent: Option<TaskId>,
    state: Mutex<CellState>,
    status_tx: watch::Sender<TaskStatus>,
}

impl TaskCell {
    pub(crate) fn new(id: TaskId, name: impl Into<String>, parent: Option<TaskId>) -> Arc<Self> {
        let (status_tx, _) = watch::channel(TaskStatus::Pending);
        Arc::new(Self {
            id,
            name: name.into(),
            parent,
            state: Mutex::new(CellState {
                status: TaskStatus::Pending,
                outcome: None,
                cancel_kind: None,
            }),
            status_tx,
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    /// Publish a transition; the outcome is stored before waiters wake
    pub(crate) fn publish(
        &self,
        status: TaskStatus,
        outcome: Option<TaskOutcome>,
        cancel_kind: Option<CancelKind>,
    ) {
        {
            let mut state = self.state.lock();
            if !state.status.can_transition_to(status) {
                return;
            }
            state.status = status;
            if outcome.is_some() {
                state.outcome = outcome;
            }
            if cancel_kind.is_some() {
                state.cancel_kind = cancel_kind;
            }
        }
        self.status_tx.send_replace(status);
    }
}

/// Handle to a task owned by a scheduler
#[derive(Clone)]
pub struct TaskHandle {
    cell: Arc<TaskCell>,
    control: Weak<dyn TaskControl>,
}

impl TaskHandle {
    pub(crate) fn new(cell: Arc<TaskCell>, control: Weak<dyn TaskControl>) -> Self {
        Self { cell, control }
    }

    pub(crate) fn cell(&self) -> &Arc<TaskCell> {
        &self.cell
    }

    /// Get task ID
    pub fn id(&self) -> TaskId {
        self.cell.id
    }

    /// Procedure name given at creation
    pub fn name(&self) -> &str {
        &self.cell.name
    }

    /// Parent task, `None` for root tasks
    pub fn parent(&self) -> Option<TaskId> {
        self.cell.parent
    }

    /// Current lifecycle state
    pub fn status(&self) -> TaskStatus {
        self.cell.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Terminal result, once the task has finished
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.cell.state.lock().outcome.clone()
    }

    /// Failure cause if the task ended Failed or Cancelled
    pub fn failure(&self) -> Option<SagaError> {
        match self.outcome() {
            Some(Err(err)) => Some(err),
            _ => None,
        }
    }

    /// Reason recorded when the task was cancelled
    pub fn cancel_kind(&self) -> Option<CancelKind> {
        self.cell.state.lock().cancel_kind
    }

    /// Request cancellation of the task and its descendants
    ///
    /// A no-op for terminal tasks. Fails only if the owning scheduler is gone.
    pub fn cancel(&self) -> Result<()> {
        if self.is_terminal() {
            return Ok(());
        }
        match self.control.upgrade() {
            Some(control) => {
                control.request_cancel(self.id());
                Ok(())
            }
            None => Err(SagaError::runtime(format!(
                "scheduler owning {} has shut down",
                self.id()
            ))),
        }
    }

    /// Wait until the task reaches a terminal state
    pub async fn join(&self) -> TaskOutcome {
        let mut rx = self.cell.status_tx.subscribe();
        if rx.wait_for(|status| status.is_terminal()).await.is_err() {
            return Err(SagaError::runtime("task status channel closed"));
        }
        self.outcome()
            .unwrap_or_else(|| Err(SagaError::runtime("terminal task has no outcome")))
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

/// Group of children run on behalf of a Race or All effect
#[derive(Debug)]
pub(crate) struct Group {
    pub members: Vec<(String, TaskId)>,
    pub results: Vec<Option<Output>>,
}

impl Group {
    pub fn new(members: Vec<(String, TaskId)>) -> Self {
        let results = members.iter().map(|_| None).collect();
        Self { members, results }
    }

    pub fn position(&self, task: TaskId) -> Option<usize> {
        self.members.iter().position(|(_, id)| *id == task)
    }

    pub fn member_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.members.iter().map(|(_, id)| *id)
    }

    pub fn is_complete(&self) -> bool {
        self.results.iter().all(Option::is_some)
    }
}

/// Effect a task is currently suspended on
#[derive(Debug)]
pub(crate) enum Pending {
    Take,
    Call { token: u64 },
    Join { target: TaskId },
    /// Join on a task outside this tree, resolved by a watcher on the runtime
    Watch { target: TaskId, token: u64 },
    Race(Group),
    All(Group),
}

impl Pending {
    pub fn group(&self) -> Option<&Group> {
        match self {
            Pending::Race(group) | Pending::All(group) => Some(group),
            _ => None,
        }
    }
}

/// Scheduler-side task record
pub(crate) struct TaskRecord {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    pub children: Vec<TaskId>,
    pub status: TaskStatus,
    pub procedure: Option<BoxedSaga>,
    pub pending: Option<Pending>,
    pub join_waiters: Vec<TaskId>,
    /// Failure raised at the next resumption instead of the resume value
    pub injected: Option<SagaError>,
    pub call_abort: Option<AbortHandle>,
    pub cell: Arc<TaskCell>,
}

impl TaskRecord {
    pub fn new(cell: Arc<TaskCell>, procedure: BoxedSaga) -> Self {
        Self {
            id: cell.id,
            parent: cell.parent,
            children: Vec::new(),
            status: TaskStatus::Pending,
            procedure: Some(procedure),
            pending: None,
            join_waiters: Vec::new(),
            injected: None,
            call_abort: None,
            cell,
        }
    }

    /// Move to `next` if the lifecycle allows it
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    pub fn is_suspended(&self) -> bool {
        self.pending.is_some()
    }
}

/// Arena of live task records
#[derive(Default)]
pub(crate) struct TaskTree {
    tasks: HashMap<TaskId, TaskRecord>,
}

impl TaskTree {
    pub fn insert(&mut self, record: TaskRecord) {
        if let Some(parent) = record.parent {
            if let Some(parent) = self.tasks.get_mut(&parent) {
                parent.children.push(record.id);
            }
        }
        self.tasks.insert(record.id, record);
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskRecord> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskRecord> {
        self.tasks.get_mut(&id)
    }

    /// Check that a task exists and has not reached a terminal state
    pub fn is_live(&self, id: TaskId) -> bool {
        self.tasks
            .get(&id)
            .map(|record| !record.status.is_terminal())
            .unwrap_or(false)
    }

    /// Remove a finished record and unlink it from its parent
    pub fn remove(&mut self, id: TaskId) -> Option<TaskRecord> {
        let record = self.tasks.remove(&id)?;
        if let Some(parent) = record.parent.and_then(|p| self.tasks.get_mut(&p)) {
            parent.children.retain(|child| *child != id);
        }
        Some(record)
    }

    /// Non-terminal children in spawn order
    pub fn live_children(&self, id: TaskId) -> Vec<TaskId> {
        self.tasks
            .get(&id)
            .map(|record| {
                record
                    .children
                    .iter()
                    .copied()
                    .filter(|child| self.is_live(*child))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}
