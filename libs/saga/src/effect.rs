//! Effect Descriptors
//!
//! Inert data describing what a procedure wants the scheduler to do next.
//! Building an effect never performs it; only the scheduler interprets them.

use crate::action::Action;
use crate::pattern::Pattern;
use crate::procedure::{BoxedSaga, Saga};
use crate::task::TaskHandle;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Future returned by an external unit of work
pub type CallFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// External unit of work invoked by a Call effect
pub type CallFn = Arc<dyn Fn(Vec<Value>) -> CallFuture + Send + Sync>;

/// Projection applied to the bus state by a Select effect
pub type Selector = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// External call description
pub struct CallSpec {
    pub name: String,
    pub function: CallFn,
    pub args: Vec<Value>,
}

/// Declarative description of one interpreter operation
pub enum Effect {
    /// Suspend until a dispatched action matches; every matching Take fires
    Take(Pattern),
    /// Like Take, but among exclusive Takes only the earliest-registered fires
    TakeExclusive(Pattern),
    /// Dispatch an action to the bus and resume immediately
    Put(Action),
    /// Start an attached child task and resume with its handle
    Fork(BoxedSaga),
    /// Start a detached root task and resume with its handle
    Spawn(BoxedSaga),
    /// Run named effects concurrently; the first to complete wins
    Race(Vec<(String, Effect)>),
    /// Run effects concurrently and resume with every result
    All(Vec<Effect>),
    /// Invoke external asynchronous work
    Call(CallSpec),
    /// Cancel a task and its descendants
    Cancel(TaskHandle),
    /// Suspend until a task reaches a terminal state
    Join(TaskHandle),
    /// Read the bus state, optionally through a selector
    Select(Option<Selector>),
}

impl Effect {
    pub fn take(pattern: impl Into<Pattern>) -> Self {
        Effect::Take(pattern.into())
    }

    pub fn take_exclusive(pattern: impl Into<Pattern>) -> Self {
        Effect::TakeExclusive(pattern.into())
    }

    pub fn put(action: Action) -> Self {
        Effect::Put(action)
    }

    pub fn fork(saga: impl Saga) -> Self {
        Effect::Fork(Box::new(saga))
    }

    pub fn spawn(saga: impl Saga) -> Self {
        Effect::Spawn(Box::new(saga))
    }

    /// Race named effects; listing order breaks ties
    pub fn race<N>(effects: impl IntoIterator<Item = (N, Effect)>) -> Self
    where
        N: Into<String>,
    {
        Effect::Race(
            effects
                .into_iter()
                .map(|(name, effect)| (name.into(), effect))
                .collect(),
        )
    }

    pub fn all(effects: impl IntoIterator<Item = Effect>) -> Self {
        Effect::All(effects.into_iter().collect())
    }

    /// Call an async function with JSON arguments
    pub fn call<F, Fut>(name: impl Into<String>, callable: F, args: Vec<Value>) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let function: CallFn =
            Arc::new(move |args: Vec<Value>| -> CallFuture { callable(args).boxed() });
        Effect::Call(CallSpec {
            name: name.into(),
            function,
            args,
        })
    }

    /// Call that resolves with `null` after `duration`
    pub fn delay(duration: Duration) -> Self {
        Effect::call(
            format!("delay({}ms)", duration.as_millis()),
            move |_| async move {
                tokio::time::sleep(duration).await;
                Ok::<_, anyhow::Error>(Value::Null)
            },
            Vec::new(),
        )
    }

    pub fn cancel(handle: &TaskHandle) -> Self {
        Effect::Cancel(handle.clone())
    }

    pub fn join(handle: &TaskHandle) -> Self {
        Effect::Join(handle.clone())
    }

    /// Read the whole bus state
    pub fn select() -> Self {
        Effect::Select(None)
    }

    /// Read the bus state through a selector
    pub fn select_with<F>(selector: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Effect::Select(Some(Arc::new(selector)))
    }

    /// Short effect name for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Effect::Take(_) => "take",
            Effect::TakeExclusive(_) => "take_exclusive",
            Effect::Put(_) => "put",
            Effect::Fork(_) => "fork",
            Effect::Spawn(_) => "spawn",
            Effect::Race(_) => "race",
            Effect::All(_) => "all",
            Effect::Call(_) => "call",
            Effect::Cancel(_) => "cancel",
            Effect::Join(_) => "join",
            Effect::Select(_) => "select",
        }
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Take(pattern) => f.debug_tuple("Take").field(pattern).finish(),
            Effect::TakeExclusive(pattern) => f.debug_tuple("TakeExclusive").field(pattern).finish(),
            Effect::Put(action) => f.debug_tuple("Put").field(action).finish(),
            Effect::Fork(saga) => f.debug_tuple("Fork").field(&saga.name()).finish(),
            Effect::Spawn(saga) => f.debug_tuple("Spawn").field(&saga.name()).finish(),
            Effect::Race(effects) => f.debug_tuple("Race").field(effects).finish(),
            Effect::All(effects) => f.debug_tuple("All").field(effects).finish(),
            Effect::Call(spec) => f
                .debug_struct("Call")
                .field("name", &spec.name)
                .field("args", &spec.args)
                .finish(),
            Effect::Cancel(handle) => f.debug_tuple("Cancel").field(&handle.id()).finish(),
            Effect::Join(handle) => f.debug_tuple("Join").field(&handle.id()).finish(),
            Effect::Select(selector) => f
                .debug_tuple("Select")
                .field(&selector.as_ref().map(|_| "<fn>"))
                .finish(),
        }
    }
}
