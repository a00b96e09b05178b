//! Shared helpers for scheduler integration tests
#![allow(dead_code)]

use parking_lot::Mutex;
use saga_runtime::{
    BoxedSaga, Effect, Output, Pattern, Resume, Saga, Scheduler, SchedulerConfig, Step, Store,
    TaskHandle,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Initialize tracing for tests; repeated calls are harmless
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Store plus a scheduler subscribed to it
pub fn harness() -> (Store, Scheduler) {
    harness_with(SchedulerConfig::named("test"))
}

pub fn harness_with(config: SchedulerConfig) -> (Store, Scheduler) {
    init_tracing();
    let store = Store::new();
    let scheduler = Scheduler::new(Arc::new(store.clone()), config).expect("scheduler");
    (store, scheduler)
}

/// Ordered log written by test procedures
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

/// Takes once, completes with the action; journals its cancellation finalizer
pub struct Waiter {
    name: String,
    pattern: Pattern,
    exclusive: bool,
    journal: Journal,
    started: bool,
}

impl Waiter {
    pub fn new(name: &str, pattern: impl Into<Pattern>, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.into(),
            exclusive: false,
            journal: journal.clone(),
            started: false,
        }
    }

    /// Compete with other exclusive takes instead of broadcasting
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

impl Saga for Waiter {
    fn resume(&mut self, input: Resume) -> Step {
        match input {
            Resume::Start if !self.started => {
                self.started = true;
                let pattern = self.pattern.clone();
                if self.exclusive {
                    Step::Yield(Effect::TakeExclusive(pattern))
                } else {
                    Step::Yield(Effect::Take(pattern))
                }
            }
            Resume::Failure(err) => Step::Fail(err),
            Resume::Value(output) => {
                self.journal.push(format!("done:{}", self.name));
                Step::Complete(output)
            }
            Resume::Start => Step::Complete(Output::Unit),
        }
    }

    fn on_cancel(&mut self) {
        self.journal.push(format!("cancel:{}", self.name));
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Forks its children in order, then takes once
///
/// A failure raised at the take is journaled and either recovered from
/// (completing with `"recovered"`) or re-raised.
pub struct Forker {
    name: String,
    children: VecDeque<BoxedSaga>,
    handles: Arc<Mutex<Vec<TaskHandle>>>,
    wait: Pattern,
    recover: bool,
    journal: Journal,
    waiting: bool,
}

impl Forker {
    pub fn new(name: &str, children: Vec<BoxedSaga>, wait: impl Into<Pattern>, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            children: children.into(),
            handles: Arc::new(Mutex::new(Vec::new())),
            wait: wait.into(),
            recover: false,
            journal: journal.clone(),
            waiting: false,
        }
    }

    pub fn recovering(mut self) -> Self {
        self.recover = true;
        self
    }

    /// Handles of the forked children, filled in as they are created
    pub fn handles(&self) -> Arc<Mutex<Vec<TaskHandle>>> {
        Arc::clone(&self.handles)
    }
}

impl Saga for Forker {
    fn resume(&mut self, input: Resume) -> Step {
        let output = match input {
            Resume::Failure(err) => {
                self.journal.push(format!("caught:{}:{}", self.name, err));
                return if self.recover {
                    Step::Complete(Output::Value(json!("recovered")))
                } else {
                    Step::Fail(err)
                };
            }
            Resume::Start => None,
            Resume::Value(output) => Some(output),
        };

        if let Some(Output::Task(handle)) = &output {
            self.handles.lock().push(handle.clone());
        }
        if let Some(child) = self.children.pop_front() {
            return Step::Yield(Effect::Fork(child));
        }
        if !self.waiting {
            self.waiting = true;
            return Step::Yield(Effect::Take(self.wait.clone()));
        }

        self.journal.push(format!("done:{}", self.name));
        Step::Complete(output.unwrap_or(Output::Unit))
    }

    fn on_cancel(&mut self) {
        self.journal.push(format!("cancel:{}", self.name));
    }

    fn name(&self) -> &str {
        &self.name
    }
}
