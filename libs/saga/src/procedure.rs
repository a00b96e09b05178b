//! Saga Procedures
//!
//! A saga procedure is an explicit state machine driven by the scheduler:
//! each call to [`Saga::resume`] feeds in the result of the previous effect
//! and gets back exactly one [`Step`]. Suspension points are wherever the
//! procedure yields; the scheduler owns the resume-value slot.
//!
//! Small procedures can be written as closures with [`saga_fn`], or as a
//! fixed list of effects with [`Sequence`].

use crate::action::SharedAction;
use crate::effect::Effect;
use crate::task::TaskHandle;
use crate::SagaError;
use serde_json::Value;
use std::collections::VecDeque;

/// Value a task is resumed with, or completes with
#[derive(Debug, Clone)]
pub enum Output {
    /// Put, Cancel and finished procedures without a result
    Unit,
    /// Action that satisfied a Take
    Action(SharedAction),
    /// Handle to a task created by Fork or Spawn
    Task(TaskHandle),
    /// Winning branch of a Race
    Race { winner: String, value: Box<Output> },
    /// Results of an All, in listed order
    All(Vec<Output>),
    /// Result of a Call or Select
    Value(Value),
}

impl Output {
    pub fn as_action(&self) -> Option<&SharedAction> {
        match self {
            Output::Action(action) => Some(action),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<&TaskHandle> {
        match self {
            Output::Task(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Output::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Winner name and value of a Race result
    pub fn as_race(&self) -> Option<(&str, &Output)> {
        match self {
            Output::Race { winner, value } => Some((winner.as_str(), value.as_ref())),
            _ => None,
        }
    }

    pub fn as_all(&self) -> Option<&[Output]> {
        match self {
            Output::All(results) => Some(results),
            _ => None,
        }
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Output::Unit)
    }
}

impl From<Value> for Output {
    fn from(value: Value) -> Self {
        Output::Value(value)
    }
}

/// Input fed into a procedure when the scheduler resumes it
#[derive(Debug)]
pub enum Resume {
    /// First resumption; nothing has been yielded yet
    Start,
    /// The pending effect produced a value
    Value(Output),
    /// The pending effect failed, or a child failure was injected
    Failure(SagaError),
}

impl Resume {
    /// Turn the input into a result; `Start` becomes `Ok(None)`
    pub fn into_result(self) -> std::result::Result<Option<Output>, SagaError> {
        match self {
            Resume::Start => Ok(None),
            Resume::Value(output) => Ok(Some(output)),
            Resume::Failure(err) => Err(err),
        }
    }
}

/// What a procedure does next
#[derive(Debug)]
pub enum Step {
    /// Suspend on an effect
    Yield(Effect),
    /// Finish normally
    Complete(Output),
    /// Finish with an unrecovered failure
    Fail(SagaError),
}

/// Suspendable computation driven by the scheduler
pub trait Saga: Send + 'static {
    /// Advance to the next suspension point
    fn resume(&mut self, input: Resume) -> Step;

    /// Finalization run exactly once when the task is cancelled
    fn on_cancel(&mut self) {}

    /// Name used in logs and on task handles
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Boxed procedure owned by a task record
pub type BoxedSaga = Box<dyn Saga>;

/// Procedure backed by a closure
pub struct FnSaga<F> {
    name: String,
    step: F,
}

/// Build a procedure from a closure over its resume input
///
/// ```rust
/// use saga_runtime::{saga_fn, Effect, Output, Resume, Step};
///
/// let mut started = false;
/// let saga = saga_fn("ping", move |input| match input {
///     Resume::Start if !started => {
///         started = true;
///         Step::Yield(Effect::take("Ping"))
///     }
///     Resume::Failure(err) => Step::Fail(err),
///     _ => Step::Complete(Output::Unit),
/// });
/// # let _ = saga;
/// ```
pub fn saga_fn<F>(name: impl Into<String>, step: F) -> FnSaga<F>
where
    F: FnMut(Resume) -> Step + Send + 'static,
{
    FnSaga {
        name: name.into(),
        step,
    }
}

impl<F> Saga for FnSaga<F>
where
    F: FnMut(Resume) -> Step + Send + 'static,
{
    fn resume(&mut self, input: Resume) -> Step {
        (self.step)(input)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Procedure yielding a fixed list of effects in order
///
/// Completes with the output of the last effect; any failure ends it.
pub struct Sequence {
    name: String,
    effects: VecDeque<Effect>,
    last: Output,
}

impl Sequence {
    pub fn new(name: impl Into<String>, effects: Vec<Effect>) -> Self {
        Self {
            name: name.into(),
            effects: effects.into(),
            last: Output::Unit,
        }
    }
}

impl Saga for Sequence {
    fn resume(&mut self, input: Resume) -> Step {
        match input {
            Resume::Start => {}
            Resume::Value(output) => self.last = output,
            Resume::Failure(err) => return Step::Fail(err),
        }
        match self.effects.pop_front() {
            Some(effect) => Step::Yield(effect),
            None => Step::Complete(std::mem::replace(&mut self.last, Output::Unit)),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Performs a single effect and completes with its result
///
/// Used for the children the scheduler creates for Race and All.
pub(crate) struct OneShot {
    name: String,
    effect: Option<Effect>,
}

impl OneShot {
    pub fn new(name: impl Into<String>, effect: Effect) -> Self {
        Self {
            name: name.into(),
            effect: Some(effect),
        }
    }
}

impl Saga for OneShot {
    fn resume(&mut self, input: Resume) -> Step {
        match input {
            Resume::Start => match self.effect.take() {
                Some(effect) => Step::Yield(effect),
                None => Step::Complete(Output::Unit),
            },
            Resume::Value(output) => Step::Complete(output),
            Resume::Failure(err) => Step::Fail(err),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
