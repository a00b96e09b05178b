//! Action Bus
//!
//! The scheduler consumes an [`ActionBus`]: something that accepts actions,
//! delivers each one to every subscriber exactly once in dispatch order, and
//! optionally exposes a state value for Select effects.
//!
//! [`Store`] is the in-memory implementation: a JSON state folded by an
//! optional reducer, FIFO delivery, and a dispatch log. Dispatches issued
//! while a delivery is in progress (from a subscriber, or from another
//! thread) are queued and delivered by the dispatcher already running, so
//! subscribers never observe actions out of order.

use crate::action::{Action, SharedAction};
use crate::{Result, SagaError};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Subscriber callback invoked once per delivered action
pub type ActionHandler = Arc<dyn Fn(SharedAction) + Send + Sync>;

/// State transition applied to every dispatched action
pub type Reducer = Arc<dyn Fn(&Value, &Action) -> Value + Send + Sync>;

/// Token returned by [`ActionBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Bus adapter consumed by the scheduler
///
/// Implementations must hand subscribers the same `Arc` that was passed to
/// [`dispatch`](ActionBus::dispatch); the scheduler recognises its own Puts
/// by pointer identity.
pub trait ActionBus: Send + Sync {
    /// Enqueue an action for delivery to every subscriber
    fn dispatch(&self, action: SharedAction) -> Result<()>;

    /// Register a handler invoked once per dispatched action, in dispatch order
    fn subscribe(&self, handler: ActionHandler) -> SubscriptionId;

    /// Remove a handler; returns false if it was not registered
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Current state read by Select effects
    fn state(&self) -> Option<Value> {
        None
    }
}

/// In-memory action bus with reducer state
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    state: RwLock<Value>,
    reducer: Option<Reducer>,
    subscribers: RwLock<Vec<(SubscriptionId, ActionHandler)>>,
    queue: Mutex<VecDeque<SharedAction>>,
    history: Mutex<Vec<SharedAction>>,
    delivering: AtomicBool,
    closed: AtomicBool,
    next_subscription: AtomicU64,
}

impl Store {
    /// Store with a `null` state and no reducer
    pub fn new() -> Self {
        Self::build(Value::Null, None)
    }

    /// Store with a fixed initial state and no reducer
    pub fn with_state(initial: Value) -> Self {
        Self::build(initial, None)
    }

    /// Store whose state is folded over every dispatched action
    pub fn with_reducer<F>(initial: Value, reducer: F) -> Self
    where
        F: Fn(&Value, &Action) -> Value + Send + Sync + 'static,
    {
        Self::build(initial, Some(Arc::new(reducer)))
    }

    fn build(initial: Value, reducer: Option<Reducer>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(initial),
                reducer,
                subscribers: RwLock::new(Vec::new()),
                queue: Mutex::new(VecDeque::new()),
                history: Mutex::new(Vec::new()),
                delivering: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Dispatch an owned action
    pub fn put(&self, action: Action) -> Result<()> {
        self.dispatch(Arc::new(action))
    }

    /// Dispatch an action given in JSON form
    pub fn dispatch_value(&self, value: Value) -> Result<()> {
        self.put(Action::from_value(value)?)
    }

    /// Current state value
    pub fn state_value(&self) -> Value {
        self.inner.state.read().clone()
    }

    /// Every action accepted so far, in dispatch order
    pub fn history(&self) -> Vec<SharedAction> {
        self.inner.history.lock().clone()
    }

    /// Type tags of the dispatch log
    pub fn history_types(&self) -> Vec<String> {
        self.inner
            .history
            .lock()
            .iter()
            .map(|action| action.action_type().to_string())
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Refuse further dispatches
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        debug!("Store closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Drain the queue unless another dispatcher already is
    fn deliver(&self) {
        let inner = &self.inner;
        loop {
            if inner
                .delivering
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            loop {
                let Some(action) = inner.queue.lock().pop_front() else {
                    break;
                };
                let handlers: Vec<ActionHandler> = inner
                    .subscribers
                    .read()
                    .iter()
                    .map(|(_, handler)| Arc::clone(handler))
                    .collect();

                trace!(action_type = action.action_type(), subscribers = handlers.len(), "Delivering action");
                for handler in handlers {
                    let delivered = Arc::clone(&action);
                    if catch_unwind(AssertUnwindSafe(|| handler(delivered))).is_err() {
                        warn!(action_type = action.action_type(), "Subscriber panicked during delivery");
                    }
                }
            }

            inner.delivering.store(false, Ordering::Release);
            if inner.queue.lock().is_empty() {
                return;
            }
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("state", &*self.inner.state.read())
            .field("subscribers", &self.subscriber_count())
            .field("dispatched", &self.inner.history.lock().len())
            .finish()
    }
}

impl ActionBus for Store {
    fn dispatch(&self, action: SharedAction) -> Result<()> {
        if self.is_closed() {
            return Err(SagaError::dispatch(format!(
                "store is closed; dropped {}",
                action.action_type()
            )));
        }

        {
            // Queue lock held across reduce and enqueue so state and delivery order agree
            let mut queue = self.inner.queue.lock();
            if let Some(reducer) = &self.inner.reducer {
                let mut state = self.inner.state.write();
                match catch_unwind(AssertUnwindSafe(|| reducer(&state, &action))) {
                    Ok(next) => *state = next,
                    Err(_) => {
                        return Err(SagaError::dispatch(format!(
                            "reducer panicked on {}",
                            action.action_type()
                        )))
                    }
                }
            }
            self.inner.history.lock().push(Arc::clone(&action));
            queue.push_back(action);
        }

        self.deliver();
        Ok(())
    }

    fn subscribe(&self, handler: ActionHandler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.write().push((id, handler));
        debug!(subscription = %id, "Subscribed to store");
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        before != subscribers.len()
    }

    fn state(&self) -> Option<Value> {
        Some(self.state_value())
    }
}
