//! Saga Effect Interpreter
//!
//! Cooperative scheduler for long-running, effect-yielding procedures
//! ("sagas") that react to actions dispatched on a shared bus. Procedures
//! never perform side effects directly: they yield declarative [`Effect`]s
//! and the [`Scheduler`] interprets them, resuming each procedure with the
//! result.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐  dispatch   ┌──────────────────────────────────┐
//! │     Action Bus     │────────────►│            Scheduler             │
//! │  (Store, reducer)  │◄────────────│                                  │
//! └────────────────────┘    Put      │  ┌────────────┐  ┌─────────────┐ │
//!                                    │  │ Task Tree  │  │    Take     │ │
//! ┌────────────────────┐   Call      │  │  (arena)   │  │  Registry   │ │
//! │   tokio runtime    │◄────────────│  └────────────┘  └─────────────┘ │
//! │  (external work)   │────────────►│        ready queue ► advance     │
//! └────────────────────┘  settled    └──────────────────────────────────┘
//! ```
//!
//! Every task belongs to a tree: children forked by a task are cancelled
//! when it terminates, a child failure nobody joined tears down its siblings
//! and is raised in the parent, and a root failure nobody joined is
//! reported to the registered error handlers.
//!
//! # Examples
//!
//! ```rust
//! use saga_runtime::{Action, Effect, Scheduler, Sequence, Store, TaskStatus};
//! use std::sync::Arc;
//!
//! let store = Store::new();
//! let scheduler = Scheduler::with_defaults(Arc::new(store.clone())).unwrap();
//!
//! let handle = scheduler
//!     .run_saga(Sequence::new(
//!         "greeter",
//!         vec![
//!             Effect::take("Hello"),
//!             Effect::put(Action::new("World")),
//!         ],
//!     ))
//!     .unwrap();
//!
//! store.put(Action::new("Hello")).unwrap();
//! assert_eq!(handle.status(), TaskStatus::Completed);
//! assert_eq!(store.history_types(), vec!["Hello", "World"]);
//! ```

pub mod action;
pub mod bus;
pub mod effect;
pub mod error;
pub mod metrics;
pub mod pattern;
pub mod procedure;
pub mod registry;
pub mod scheduler;
pub mod task;
pub mod testing;

pub use action::{Action, SharedAction};
pub use bus::{ActionBus, ActionHandler, Reducer, Store, SubscriptionId};
pub use effect::{CallFn, CallSpec, Effect, Selector};
pub use error::{Result, SagaError};
pub use metrics::{SchedulerMetrics, SchedulerStats};
pub use pattern::{matches, Pattern, ValueKind};
pub use procedure::{saga_fn, BoxedSaga, FnSaga, Output, Resume, Saga, Sequence, Step};
pub use registry::{Registration, TakeRegistry};
pub use scheduler::{ErrorHandler, Scheduler};
pub use task::{CancelKind, TaskHandle, TaskId, TaskOutcome, TaskStatus};
pub use testing::SagaTester;

pub use saga_config::SchedulerConfig;
