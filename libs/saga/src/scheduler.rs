//! Saga Scheduler
//!
//! The interpreter loop. One scheduler owns a task tree, a take registry and
//! a ready queue of tasks whose pending effect has been satisfied. All of
//! that state lives behind a single mutex; whichever thread holds it drives
//! the loop until it is quiescent.
//!
//! # Event flow
//!
//! ```text
//!  bus delivery ──┐
//!  run_saga ──────┤                    ┌──────────────────────────────┐
//!  handle.cancel ─┼──► inbox ──► drive │ ready queue ──► advance(task) │
//!  call settled ──┘   (FIFO)           │      ▲              │        │
//!                                      │      └── interpret(effect)   │
//!                                      └──────────────────────────────┘
//! ```
//!
//! Events are applied one at a time and the ready queue is drained after
//! each, so every reaction to a dispatched action (including the actions
//! those reactions Put) settles before the next inbox event is looked at.
//!
//! # Threading
//!
//! Procedures run synchronously on whichever thread drives the loop. Only
//! Call effects leave it: their futures run on the tokio runtime that was
//! current when the scheduler was created and report back through the inbox.
//! Inspection methods such as [`Scheduler::pending_takes`] take the same
//! lock, so they must not be called from inside a procedure or a bus
//! subscriber.

use crate::action::{Action, SharedAction};
use crate::bus::{ActionBus, ActionHandler, SubscriptionId};
use crate::effect::{CallSpec, Effect, Selector};
use crate::metrics::{SchedulerMetrics, SchedulerStats};
use crate::pattern::Pattern;
use crate::procedure::{BoxedSaga, OneShot, Output, Resume, Saga, Step};
use crate::registry::TakeRegistry;
use crate::task::{
    CancelKind, Group, Pending, TaskCell, TaskControl, TaskHandle, TaskId, TaskOutcome,
    TaskRecord, TaskStatus, TaskTree,
};
use crate::{Result, SagaError};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use saga_config::SchedulerConfig;
use serde_json::Value;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Callback invoked for every root task failure nobody joined
pub type ErrorHandler = Arc<dyn Fn(&TaskHandle, &SagaError) + Send + Sync>;

enum Event {
    Dispatch(SharedAction),
    Start {
        cell: Arc<TaskCell>,
        saga: BoxedSaga,
    },
    Cancel {
        task: TaskId,
        kind: CancelKind,
    },
    CallSettled {
        task: TaskId,
        token: u64,
        result: Result<Value>,
    },
    JoinSettled {
        task: TaskId,
        token: u64,
        outcome: TaskOutcome,
    },
}

/// State mutated only by the thread driving the loop
#[derive(Default)]
struct Core {
    tasks: TaskTree,
    takes: TakeRegistry,
    ready: VecDeque<(TaskId, Resume)>,
    unhandled: Vec<(TaskHandle, SagaError)>,
    steps: usize,
    next_call: u64,
}

/// Cooperative effect interpreter bound to one action bus
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    id: String,
    config: SchedulerConfig,
    bus: Arc<dyn ActionBus>,
    runtime: Option<Handle>,
    this: Weak<SchedulerInner>,
    core: Mutex<Core>,
    inbox: Mutex<VecDeque<Event>>,
    /// Actions this scheduler Put, awaiting their delivery back from the bus
    echoes: Mutex<Vec<SharedAction>>,
    next_task: AtomicU64,
    live_tasks: AtomicUsize,
    metrics: SchedulerMetrics,
    error_handlers: RwLock<Vec<ErrorHandler>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl Scheduler {
    /// Create a scheduler and subscribe it to `bus`
    ///
    /// Call effects run on the tokio runtime current at this point; without
    /// one they fail the issuing task with a runtime error.
    pub fn new(bus: Arc<dyn ActionBus>, config: SchedulerConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SagaError::configuration(format!("{e:#}"), None))?;

        let runtime = Handle::try_current().ok();
        if runtime.is_none() {
            debug!(name = %config.name, "No tokio runtime available; Call effects will fail");
        }

        let inner = Arc::new_cyclic(|this: &Weak<SchedulerInner>| SchedulerInner {
            id: format!("scheduler-{}", Uuid::new_v4().simple()),
            config,
            bus,
            runtime,
            this: this.clone(),
            core: Mutex::new(Core::default()),
            inbox: Mutex::new(VecDeque::new()),
            echoes: Mutex::new(Vec::new()),
            next_task: AtomicU64::new(1),
            live_tasks: AtomicUsize::new(0),
            metrics: SchedulerMetrics::default(),
            error_handlers: RwLock::new(Vec::new()),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let handler: ActionHandler = Arc::new(move |action: SharedAction| {
            if let Some(inner) = weak.upgrade() {
                inner.on_dispatch(action);
            }
        });
        let subscription = inner.bus.subscribe(handler);
        *inner.subscription.lock() = Some(subscription);

        info!(
            scheduler_id = %inner.id,
            name = %inner.config.name,
            "Saga scheduler created"
        );
        Ok(Self { inner })
    }

    /// Create a scheduler with the default configuration
    pub fn with_defaults(bus: Arc<dyn ActionBus>) -> Result<Self> {
        Self::new(bus, SchedulerConfig::default())
    }

    /// Start a root task running `saga`
    pub fn run_saga(&self, saga: impl Saga) -> Result<TaskHandle> {
        self.run_boxed(Box::new(saga))
    }

    /// Start a root task running an already boxed procedure
    pub fn run_boxed(&self, saga: BoxedSaga) -> Result<TaskHandle> {
        let inner = &self.inner;
        inner.reserve_slot()?;
        let cell = inner.new_cell(saga.name(), None);
        let handle = inner.handle_for(&cell);

        info!(
            scheduler_id = %inner.id,
            task_id = %handle.id(),
            saga = handle.name(),
            "Starting root saga"
        );
        inner.submit(Event::Start { cell, saga });
        Ok(handle)
    }

    /// Dispatch an action on the scheduler's bus
    pub fn dispatch(&self, action: Action) -> Result<()> {
        self.inner.bus.dispatch(Arc::new(action))
    }

    /// Bus entry point; invoked by the subscription made at construction
    pub fn on_dispatch(&self, action: SharedAction) {
        self.inner.on_dispatch(action);
    }

    /// Cancel a task owned by this scheduler; unknown or finished tasks are ignored
    pub fn cancel(&self, task: TaskId) {
        self.inner.submit(Event::Cancel {
            task,
            kind: CancelKind::User,
        });
    }

    /// Register a callback for root failures that no Join observed
    ///
    /// Handlers run outside the scheduler lock; a panicking handler is logged
    /// and skipped.
    pub fn add_error_handler<F>(&self, handler: F)
    where
        F: Fn(&TaskHandle, &SagaError) + Send + Sync + 'static,
    {
        self.inner.error_handlers.write().push(Arc::new(handler));
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &Arc<dyn ActionBus> {
        &self.inner.bus
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.inner.metrics
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.metrics.snapshot()
    }

    /// Tasks created and not yet terminal
    pub fn live_tasks(&self) -> usize {
        self.inner.live_tasks.load(Ordering::Acquire)
    }

    /// Number of Take registrations currently held
    pub fn pending_takes(&self) -> usize {
        self.inner.core.lock().takes.len()
    }

    /// Check whether a task is suspended on a Take
    pub fn is_waiting_on_take(&self, task: TaskId) -> bool {
        self.inner.core.lock().takes.contains(task)
    }

    /// Handles of a task's live children in spawn order
    ///
    /// Race and All members show up here while their group is unresolved.
    pub fn children(&self, task: TaskId) -> Vec<TaskHandle> {
        let core = self.inner.core.lock();
        core.tasks
            .live_children(task)
            .into_iter()
            .filter_map(|child| core.tasks.get(child))
            .map(|record| self.inner.handle_for(&record.cell))
            .collect()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .field("live_tasks", &self.live_tasks())
            .finish()
    }
}

impl TaskControl for SchedulerInner {
    fn request_cancel(&self, task: TaskId) {
        self.submit(Event::Cancel {
            task,
            kind: CancelKind::User,
        });
    }
}

impl SchedulerInner {
    fn on_dispatch(&self, action: SharedAction) {
        {
            let mut echoes = self.echoes.lock();
            if let Some(pos) = echoes.iter().position(|echo| Arc::ptr_eq(echo, &action)) {
                echoes.remove(pos);
                trace!(scheduler_id = %self.id, action_type = action.action_type(), "Skipping own Put");
                return;
            }
        }
        self.metrics.record_dispatch();
        self.submit(Event::Dispatch(action));
    }

    fn submit(&self, event: Event) {
        self.inbox.lock().push_back(event);
        self.drive();
    }

    /// Run the loop unless another caller already is
    ///
    /// The inbox is re-checked after the lock is released so an event
    /// submitted while the previous holder was finishing is never stranded.
    fn drive(&self) {
        loop {
            let unhandled = {
                let Some(mut core) = self.core.try_lock() else {
                    return;
                };
                self.run_until_quiescent(&mut core);
                std::mem::take(&mut core.unhandled)
            };
            self.report_unhandled(unhandled);

            if self.inbox.lock().is_empty() {
                return;
            }
        }
    }

    fn run_until_quiescent(&self, core: &mut Core) {
        loop {
            while let Some((task, input)) = core.ready.pop_front() {
                self.advance(core, task, input);
            }
            let Some(event) = self.inbox.lock().pop_front() else {
                return;
            };
            core.steps = 0;
            self.apply(core, event);
        }
    }

    fn apply(&self, core: &mut Core, event: Event) {
        match event {
            Event::Dispatch(action) => self.match_takes(core, &action),
            Event::Start { cell, saga } => self.insert_task(core, cell, saga),
            Event::Cancel { task, kind } => {
                if !self.cancel_task(core, task, kind) {
                    debug!(scheduler_id = %self.id, task_id = %task, "Cancel ignored; task not live");
                }
            }
            Event::CallSettled {
                task,
                token,
                result,
            } => self.settle_call(core, task, token, result),
            Event::JoinSettled {
                task,
                token,
                outcome,
            } => self.settle_watch(core, task, token, outcome),
        }
    }

    fn report_unhandled(&self, unhandled: Vec<(TaskHandle, SagaError)>) {
        if unhandled.is_empty() {
            return;
        }
        let handlers = self.error_handlers.read().clone();
        for (handle, err) in &unhandled {
            for handler in &handlers {
                if catch_unwind(AssertUnwindSafe(|| handler(handle, err))).is_err() {
                    warn!(
                        scheduler_id = %self.id,
                        task_id = %handle.id(),
                        "Unhandled-failure handler panicked"
                    );
                }
            }
        }
    }

    // ---- task creation -------------------------------------------------

    fn reserve_slot(&self) -> Result<()> {
        let limit = self.config.max_live_tasks;
        self.live_tasks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| match limit {
                Some(max) if live >= max => None,
                _ => Some(live + 1),
            })
            .map(|_| ())
            .map_err(|live| {
                SagaError::resource_exhausted("tasks", format!("live task limit of {live} reached"))
            })
    }

    fn release_slot(&self) {
        self.live_tasks.fetch_sub(1, Ordering::AcqRel);
    }

    fn new_cell(&self, name: &str, parent: Option<TaskId>) -> Arc<TaskCell> {
        let id = TaskId::new(self.next_task.fetch_add(1, Ordering::Relaxed));
        TaskCell::new(id, name, parent)
    }

    fn handle_for(&self, cell: &Arc<TaskCell>) -> TaskHandle {
        let control: Weak<dyn TaskControl> = self.this.clone();
        TaskHandle::new(Arc::clone(cell), control)
    }

    /// Insert a task whose slot is already reserved and schedule its start
    fn insert_task(&self, core: &mut Core, cell: Arc<TaskCell>, saga: BoxedSaga) {
        let id = cell.id();
        let mut record = TaskRecord::new(Arc::clone(&cell), saga);
        record.transition(TaskStatus::Running);
        cell.publish(TaskStatus::Running, None, None);
        core.tasks.insert(record);
        self.metrics.record_spawn();
        core.ready.push_back((id, Resume::Start));
    }

    /// Create a child (or detached root) from inside the loop
    fn fork_task(&self, core: &mut Core, saga: BoxedSaga, parent: Option<TaskId>) -> Result<TaskHandle> {
        self.reserve_slot()?;
        let cell = self.new_cell(saga.name(), parent);
        let handle = self.handle_for(&cell);
        debug!(
            scheduler_id = %self.id,
            task_id = %handle.id(),
            parent = ?parent,
            saga = handle.name(),
            "Forked task"
        );
        self.insert_task(core, cell, saga);
        Ok(handle)
    }

    fn owns(&self, core: &Core, handle: &TaskHandle) -> bool {
        core.tasks
            .get(handle.id())
            .map(|record| Arc::ptr_eq(&record.cell, handle.cell()))
            .unwrap_or(false)
    }

    // ---- step function -------------------------------------------------

    fn advance(&self, core: &mut Core, id: TaskId, input: Resume) {
        let (mut procedure, input) = {
            let Some(record) = core.tasks.get_mut(id) else {
                self.cancellation_race(id, "resume");
                return;
            };
            let Some(procedure) = record.procedure.take() else {
                self.cancellation_race(id, "resume");
                return;
            };
            let input = match record.injected.take() {
                Some(err) => Resume::Failure(err),
                None => input,
            };
            (procedure, input)
        };

        core.steps += 1;
        if core.steps > self.config.max_steps_per_cycle {
            core.steps = 0;
            if let Some(record) = core.tasks.get_mut(id) {
                record.procedure = Some(procedure);
            }
            let err = SagaError::resource_exhausted(
                "steps",
                format!(
                    "more than {} resumptions in one dispatch cycle",
                    self.config.max_steps_per_cycle
                ),
            );
            warn!(scheduler_id = %self.id, task_id = %id, error = %err, "Step budget exceeded");
            self.fail_task(core, id, err);
            return;
        }

        let step = catch_unwind(AssertUnwindSafe(|| procedure.resume(input)));
        if let Some(record) = core.tasks.get_mut(id) {
            record.procedure = Some(procedure);
        }

        match step {
            Ok(Step::Yield(effect)) => self.interpret(core, id, effect),
            Ok(Step::Complete(output)) => self.complete_task(core, id, output),
            Ok(Step::Fail(err)) => self.fail_task(core, id, err.attributed_to(id)),
            Err(payload) => {
                let err = SagaError::task_failure(
                    id,
                    format!("procedure panicked: {}", panic_message(&*payload)),
                );
                self.fail_task(core, id, err);
            }
        }
    }

    fn interpret(&self, core: &mut Core, id: TaskId, effect: Effect) {
        self.metrics.record_effect();
        if self.config.trace_effects {
            debug!(scheduler_id = %self.id, task_id = %id, effect = effect.kind(), "Interpreting effect");
        }

        match effect {
            Effect::Take(pattern) => self.register_take(core, id, pattern, false),
            Effect::TakeExclusive(pattern) => self.register_take(core, id, pattern, true),
            Effect::Put(action) => self.put(core, id, action),
            Effect::Fork(saga) => match self.fork_task(core, saga, Some(id)) {
                Ok(handle) => core.ready.push_back((id, Resume::Value(Output::Task(handle)))),
                Err(err) => self.fail_task(core, id, err),
            },
            Effect::Spawn(saga) => match self.fork_task(core, saga, None) {
                Ok(handle) => core.ready.push_back((id, Resume::Value(Output::Task(handle)))),
                Err(err) => self.fail_task(core, id, err),
            },
            Effect::Race(effects) => self.start_race(core, id, effects),
            Effect::All(effects) => self.start_all(core, id, effects),
            Effect::Call(spec) => self.start_call(core, id, spec),
            Effect::Cancel(handle) => {
                if self.owns(core, &handle) {
                    self.cancel_task(core, handle.id(), CancelKind::User);
                } else if let Err(err) = handle.cancel() {
                    debug!(task_id = %handle.id(), error = %err, "Cancel of foreign task failed");
                }
                if core.tasks.get(id).is_some() {
                    core.ready.push_back((id, Resume::Value(Output::Unit)));
                }
            }
            Effect::Join(handle) => self.join(core, id, handle),
            Effect::Select(selector) => self.select(core, id, selector),
        }
    }

    fn register_take(&self, core: &mut Core, id: TaskId, pattern: Pattern, exclusive: bool) {
        match core.takes.register(pattern, id, exclusive) {
            Ok(seq) => {
                if let Some(record) = core.tasks.get_mut(id) {
                    record.pending = Some(Pending::Take);
                }
                trace!(scheduler_id = %self.id, task_id = %id, seq, exclusive, "Suspended on take");
            }
            Err(err) => {
                warn!(scheduler_id = %self.id, task_id = %id, error = %err, "Rejected take");
                self.fail_task(core, id, err);
            }
        }
    }

    /// Dispatch through the bus, then resolve the takes it satisfies before resuming the putter
    fn put(&self, core: &mut Core, id: TaskId, action: Action) {
        let action: SharedAction = Arc::new(action);
        self.echoes.lock().push(Arc::clone(&action));
        self.metrics.record_put();

        if let Err(err) = self.bus.dispatch(Arc::clone(&action)) {
            self.echoes.lock().retain(|echo| !Arc::ptr_eq(echo, &action));
            warn!(scheduler_id = %self.id, task_id = %id, error = %err, "Put failed");
            self.fail_task(core, id, err);
            return;
        }

        self.match_takes(core, &action);
        core.ready.push_back((id, Resume::Value(Output::Unit)));
    }

    fn match_takes(&self, core: &mut Core, action: &SharedAction) {
        let matched = core.takes.dispatch(action);
        if matched.is_empty() {
            trace!(scheduler_id = %self.id, action_type = action.action_type(), "No take matched");
            return;
        }

        self.metrics.record_take_matches(matched.len());
        for task in matched {
            core.takes.unregister(task);
            if let Some(record) = core.tasks.get_mut(task) {
                record.pending = None;
            }
            trace!(scheduler_id = %self.id, task_id = %task, action_type = action.action_type(), "Take matched");
            core.ready
                .push_back((task, Resume::Value(Output::Action(Arc::clone(action)))));
        }
    }

    fn start_race(&self, core: &mut Core, id: TaskId, effects: Vec<(String, Effect)>) {
        if effects.is_empty() {
            self.fail_task(core, id, SagaError::task_failure(id, "race requires at least one effect"));
            return;
        }

        let mut members = Vec::with_capacity(effects.len());
        for (name, effect) in effects {
            let child = OneShot::new(format!("race:{name}"), effect);
            match self.fork_task(core, Box::new(child), Some(id)) {
                Ok(handle) => members.push((name, handle.id())),
                Err(err) => {
                    self.fail_task(core, id, err);
                    return;
                }
            }
        }

        debug!(scheduler_id = %self.id, task_id = %id, members = members.len(), "Race started");
        if let Some(record) = core.tasks.get_mut(id) {
            record.pending = Some(Pending::Race(Group::new(members)));
        }
    }

    fn start_all(&self, core: &mut Core, id: TaskId, effects: Vec<Effect>) {
        if effects.is_empty() {
            core.ready.push_back((id, Resume::Value(Output::All(Vec::new()))));
            return;
        }

        let mut members = Vec::with_capacity(effects.len());
        for (index, effect) in effects.into_iter().enumerate() {
            let child = OneShot::new(format!("all:{index}"), effect);
            match self.fork_task(core, Box::new(child), Some(id)) {
                Ok(handle) => members.push((index.to_string(), handle.id())),
                Err(err) => {
                    self.fail_task(core, id, err);
                    return;
                }
            }
        }

        debug!(scheduler_id = %self.id, task_id = %id, members = members.len(), "All started");
        if let Some(record) = core.tasks.get_mut(id) {
            record.pending = Some(Pending::All(Group::new(members)));
        }
    }

    fn start_call(&self, core: &mut Core, id: TaskId, spec: CallSpec) {
        let Some(runtime) = self.runtime.clone() else {
            self.fail_task(
                core,
                id,
                SagaError::runtime(format!("call '{}' needs a tokio runtime", spec.name)),
            );
            return;
        };

        core.next_call += 1;
        let token = core.next_call;
        let CallSpec {
            name,
            function,
            args,
        } = spec;
        let timeout = self.config.call_timeout();
        let scheduler = self.this.clone();

        debug!(scheduler_id = %self.id, task_id = %id, call = %name, token, "Invoking external call");
        let join = runtime.spawn(async move {
            let work = AssertUnwindSafe(async move { function(args).await }).catch_unwind();
            let settled = match timeout {
                Some(limit) => tokio::time::timeout(limit, work).await.unwrap_or_else(|_| {
                    Ok(Err(anyhow::anyhow!("timed out after {}ms", limit.as_millis())))
                }),
                None => work.await,
            };

            let result = match settled {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(SagaError::external_call(&name, format!("{err:#}"))),
                Err(payload) => Err(SagaError::external_call(
                    &name,
                    format!("panicked: {}", panic_message(&*payload)),
                )),
            };

            if let Some(inner) = scheduler.upgrade() {
                inner.submit(Event::CallSettled {
                    task: id,
                    token,
                    result,
                });
            }
        });

        if let Some(record) = core.tasks.get_mut(id) {
            record.pending = Some(Pending::Call { token });
            record.call_abort = Some(join.abort_handle());
        }
    }

    fn settle_call(&self, core: &mut Core, task: TaskId, token: u64, result: Result<Value>) {
        let awaiting = core
            .tasks
            .get(task)
            .map(|record| matches!(record.pending, Some(Pending::Call { token: t }) if t == token))
            .unwrap_or(false);
        if !awaiting {
            self.cancellation_race(task, "call settle");
            return;
        }

        if let Some(record) = core.tasks.get_mut(task) {
            record.pending = None;
            record.call_abort = None;
        }
        let input = match result {
            Ok(value) => Resume::Value(Output::Value(value)),
            Err(err) => {
                debug!(scheduler_id = %self.id, task_id = %task, error = %err, "External call failed");
                Resume::Failure(err)
            }
        };
        core.ready.push_back((task, input));
    }

    fn join(&self, core: &mut Core, id: TaskId, handle: TaskHandle) {
        let target = handle.id();
        if self.owns(core, &handle) {
            if target == id {
                self.fail_task(core, id, SagaError::task_failure(id, "task cannot join itself"));
                return;
            }
            if let Some(record) = core.tasks.get_mut(target) {
                record.join_waiters.push(id);
            }
            if let Some(record) = core.tasks.get_mut(id) {
                record.pending = Some(Pending::Join { target });
            }
            return;
        }

        match handle.outcome() {
            Some(outcome) => core.ready.push_back((id, Self::join_input(outcome))),
            None => self.watch_join(core, id, handle),
        }
    }

    /// Suspend on a live task this tree does not hold: one owned by another
    /// scheduler, or a root whose start is still queued in the inbox
    fn watch_join(&self, core: &mut Core, id: TaskId, handle: TaskHandle) {
        let target = handle.id();
        let Some(runtime) = self.runtime.clone() else {
            let err = SagaError::runtime(format!(
                "joining {target} outside this scheduler needs a tokio runtime"
            ));
            core.ready.push_back((id, Resume::Failure(err)));
            return;
        };

        core.next_call += 1;
        let token = core.next_call;
        let scheduler = self.this.clone();

        debug!(scheduler_id = %self.id, task_id = %id, target = %target, token, "Watching task outside this tree");
        let watcher = runtime.spawn(async move {
            let outcome = handle.join().await;
            if let Some(inner) = scheduler.upgrade() {
                inner.submit(Event::JoinSettled {
                    task: id,
                    token,
                    outcome,
                });
            }
        });

        if let Some(record) = core.tasks.get_mut(id) {
            record.pending = Some(Pending::Watch { target, token });
            record.call_abort = Some(watcher.abort_handle());
        }
    }

    fn settle_watch(&self, core: &mut Core, task: TaskId, token: u64, outcome: TaskOutcome) {
        let awaiting = core
            .tasks
            .get(task)
            .map(|record| matches!(record.pending, Some(Pending::Watch { token: t, .. }) if t == token))
            .unwrap_or(false);
        if !awaiting {
            self.cancellation_race(task, "join settle");
            return;
        }

        if let Some(record) = core.tasks.get_mut(task) {
            record.pending = None;
            record.call_abort = None;
        }
        core.ready.push_back((task, Self::join_input(outcome)));
    }

    fn join_input(outcome: TaskOutcome) -> Resume {
        match outcome {
            Ok(output) => Resume::Value(output),
            Err(err) => Resume::Failure(err),
        }
    }

    fn select(&self, core: &mut Core, id: TaskId, selector: Option<Selector>) {
        let state = self.bus.state().unwrap_or(Value::Null);
        let value = match selector {
            None => state,
            Some(selector) => match catch_unwind(AssertUnwindSafe(|| selector(&state))) {
                Ok(value) => value,
                Err(payload) => {
                    let err = SagaError::task_failure(
                        id,
                        format!("selector panicked: {}", panic_message(&*payload)),
                    );
                    self.fail_task(core, id, err);
                    return;
                }
            },
        };
        core.ready.push_back((id, Resume::Value(Output::Value(value))));
    }

    // ---- terminal transitions ------------------------------------------

    fn complete_task(&self, core: &mut Core, id: TaskId, output: Output) {
        for child in core.tasks.live_children(id) {
            self.cancel_task(core, child, CancelKind::ParentCompleted);
        }

        let Some(mut record) = core.tasks.remove(id) else {
            return;
        };
        record.transition(TaskStatus::Completed);
        record.procedure = None;
        record.cell.publish(TaskStatus::Completed, Some(Ok(output.clone())), None);
        self.release_slot();
        self.metrics.record_completed();

        if record.parent.is_none() {
            info!(scheduler_id = %self.id, task_id = %id, saga = record.cell.name(), "Root saga completed");
        } else {
            debug!(scheduler_id = %self.id, task_id = %id, "Task completed");
        }

        for waiter in std::mem::take(&mut record.join_waiters) {
            self.wake_joiner(core, waiter, id, Resume::Value(output.clone()));
        }
        if let Some(parent) = record.parent {
            self.child_completed(core, parent, id, output);
        }
    }

    /// Resolve a Race or All the parent is suspended on, if the child belongs to it
    fn child_completed(&self, core: &mut Core, parent: TaskId, child: TaskId, output: Output) {
        let slot = core
            .tasks
            .get(parent)
            .and_then(|record| record.pending.as_ref())
            .and_then(|pending| {
                let index = pending.group()?.position(child)?;
                Some((matches!(pending, Pending::Race(_)), index))
            });
        let Some((is_race, index)) = slot else {
            return;
        };

        if is_race {
            let Some(Pending::Race(group)) = core
                .tasks
                .get_mut(parent)
                .and_then(|record| record.pending.take())
            else {
                return;
            };

            for (position, member) in group.member_ids().enumerate() {
                if position != index {
                    self.cancel_task(core, member, CancelKind::RaceLost);
                }
            }
            let winner = group
                .members
                .into_iter()
                .nth(index)
                .map(|(name, _)| name)
                .unwrap_or_default();

            debug!(scheduler_id = %self.id, task_id = %parent, winner = %winner, "Race resolved");
            core.ready.push_back((
                parent,
                Resume::Value(Output::Race {
                    winner,
                    value: Box::new(output),
                }),
            ));
            return;
        }

        let Some(record) = core.tasks.get_mut(parent) else {
            return;
        };
        let complete = match record.pending.as_mut() {
            Some(Pending::All(group)) => {
                group.results[index] = Some(output);
                group.is_complete()
            }
            _ => false,
        };
        if complete {
            if let Some(Pending::All(group)) = record.pending.take() {
                let results = group.results.into_iter().flatten().collect();
                core.ready.push_back((parent, Resume::Value(Output::All(results))));
            }
        }
    }

    fn fail_task(&self, core: &mut Core, id: TaskId, err: SagaError) {
        for child in core.tasks.live_children(id) {
            self.cancel_task(core, child, CancelKind::FailFast);
        }
        self.clear_pending(core, id);

        let Some(mut record) = core.tasks.remove(id) else {
            return;
        };
        record.transition(TaskStatus::Failed);
        record.procedure = None;
        record.cell.publish(TaskStatus::Failed, Some(Err(err.clone())), None);
        self.release_slot();
        self.metrics.record_failed();

        let waiters = std::mem::take(&mut record.join_waiters);
        let observed = !waiters.is_empty();
        for waiter in waiters {
            self.wake_joiner(core, waiter, id, Resume::Failure(err.clone()));
        }

        match record.parent {
            Some(parent) => {
                if self.fail_group(core, parent, id, &err) {
                    return;
                }
                if observed {
                    debug!(scheduler_id = %self.id, task_id = %id, error = %err, "Task failed; observed by join");
                    return;
                }

                debug!(
                    scheduler_id = %self.id,
                    task_id = %id,
                    parent = %parent,
                    error = %err,
                    "Propagating child failure to parent"
                );
                for sibling in core.tasks.live_children(parent) {
                    self.cancel_task(core, sibling, CancelKind::FailFast);
                }
                self.interrupt(core, parent, err);
            }
            None if observed => {
                debug!(scheduler_id = %self.id, task_id = %id, error = %err, "Root saga failed; observed by join");
            }
            None => {
                error!(
                    scheduler_id = %self.id,
                    task_id = %id,
                    saga = record.cell.name(),
                    error = %err,
                    "Unhandled saga failure"
                );
                self.metrics.record_unhandled();
                core.unhandled.push((self.handle_for(&record.cell), err));
            }
        }
    }

    /// Fail the Race or All the parent is suspended on, if the child belongs to it
    fn fail_group(&self, core: &mut Core, parent: TaskId, child: TaskId, err: &SagaError) -> bool {
        let member = core
            .tasks
            .get(parent)
            .and_then(|record| record.pending.as_ref())
            .and_then(Pending::group)
            .map(|group| group.position(child).is_some())
            .unwrap_or(false);
        if !member {
            return false;
        }

        let pending = core
            .tasks
            .get_mut(parent)
            .and_then(|record| record.pending.take());
        if let Some(group) = pending.as_ref().and_then(Pending::group) {
            for sibling in group.member_ids() {
                if sibling != child {
                    self.cancel_task(core, sibling, CancelKind::FailFast);
                }
            }
        }

        debug!(scheduler_id = %self.id, task_id = %parent, error = %err, "Group failed");
        core.ready.push_back((parent, Resume::Failure(err.clone())));
        true
    }

    /// Raise a child failure at the parent's current or next suspension point
    fn interrupt(&self, core: &mut Core, parent: TaskId, err: SagaError) {
        let suspended = core.tasks.get(parent).map(TaskRecord::is_suspended);
        match suspended {
            Some(true) => {
                self.clear_pending(core, parent);
                core.ready.push_back((parent, Resume::Failure(err)));
            }
            Some(false) => {
                if let Some(record) = core.tasks.get_mut(parent) {
                    if record.injected.is_none() {
                        record.injected = Some(err);
                    }
                }
            }
            None => {}
        }
    }

    /// Abandon whatever the task is suspended on
    fn clear_pending(&self, core: &mut Core, id: TaskId) {
        let Some(record) = core.tasks.get_mut(id) else {
            return;
        };
        let Some(pending) = record.pending.take() else {
            return;
        };
        let abort = record.call_abort.take();

        match pending {
            Pending::Take => {
                core.takes.unregister(id);
            }
            Pending::Call { token } => {
                if let Some(abort) = abort {
                    abort.abort();
                }
                debug!(scheduler_id = %self.id, task_id = %id, token, "Detached from pending call");
            }
            Pending::Join { target } => {
                if let Some(target) = core.tasks.get_mut(target) {
                    target.join_waiters.retain(|waiter| *waiter != id);
                }
            }
            Pending::Watch { target, .. } => {
                if let Some(abort) = abort {
                    abort.abort();
                }
                debug!(scheduler_id = %self.id, task_id = %id, target = %target, "Stopped watching joined task");
            }
            Pending::Race(group) | Pending::All(group) => {
                for member in group.member_ids() {
                    self.cancel_task(core, member, CancelKind::ParentCancelled);
                }
            }
        }
    }

    /// Cancel a task depth-first; returns false if it was not live
    fn cancel_task(&self, core: &mut Core, id: TaskId, kind: CancelKind) -> bool {
        if core.tasks.get(id).is_none() {
            return false;
        }

        for child in core.tasks.live_children(id) {
            self.cancel_task(core, child, CancelKind::ParentCancelled);
        }
        self.clear_pending(core, id);

        let Some(mut record) = core.tasks.remove(id) else {
            return false;
        };
        if let Some(mut procedure) = record.procedure.take() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| procedure.on_cancel())) {
                warn!(
                    scheduler_id = %self.id,
                    task_id = %id,
                    "Cancellation finalizer panicked: {}",
                    panic_message(&*payload)
                );
            }
        }

        record.transition(TaskStatus::Cancelled);
        record
            .cell
            .publish(TaskStatus::Cancelled, Some(Err(SagaError::cancelled(id))), Some(kind));
        self.release_slot();
        self.metrics.record_cancelled();
        debug!(scheduler_id = %self.id, task_id = %id, reason = %kind, "Task cancelled");

        for waiter in std::mem::take(&mut record.join_waiters) {
            self.wake_joiner(core, waiter, id, Resume::Failure(SagaError::cancelled(id)));
        }
        true
    }

    fn wake_joiner(&self, core: &mut Core, waiter: TaskId, target: TaskId, input: Resume) {
        let woken = match core.tasks.get_mut(waiter) {
            Some(record) if matches!(record.pending, Some(Pending::Join { target: t }) if t == target) => {
                record.pending = None;
                true
            }
            _ => false,
        };
        if woken {
            core.ready.push_back((waiter, input));
        }
    }

    fn cancellation_race(&self, id: TaskId, operation: &str) {
        self.metrics.record_cancellation_race();
        let err = SagaError::cancellation_race(id, operation);
        warn!(scheduler_id = %self.id, task_id = %id, error = %err, "Ignoring event for terminated task");
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            self.bus.unsubscribe(subscription);
        }

        // Tasks cannot make progress once the scheduler is gone
        let core = self.core.get_mut();
        for record in core.tasks.iter() {
            if let Some(abort) = &record.call_abort {
                abort.abort();
            }
            record
                .cell
                .publish(TaskStatus::Cancelled, Some(Err(SagaError::cancelled(record.id))), None);
        }
        for event in self.inbox.get_mut().drain(..) {
            if let Event::Start { cell, .. } = event {
                cell.publish(TaskStatus::Cancelled, Some(Err(SagaError::cancelled(cell.id()))), None);
            }
        }
        debug!(scheduler_id = %self.id, live = core.tasks.len(), "Scheduler dropped");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
