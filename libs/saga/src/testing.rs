//! Stepping procedures without a scheduler
//!
//! [`SagaTester`] feeds scripted [`Resume`] values into a procedure and
//! records every effect it yields, so procedure logic can be checked in
//! isolation from buses, runtimes and task trees.

use crate::effect::Effect;
use crate::error::{Result, SagaError};
use crate::procedure::{Output, Resume, Saga, Step};

/// Drives a procedure by hand and records what it yields
pub struct SagaTester<S> {
    saga: S,
    effects: Vec<Effect>,
    outcome: Option<std::result::Result<Output, SagaError>>,
    started: bool,
}

impl<S: Saga> SagaTester<S> {
    pub fn new(saga: S) -> Self {
        Self {
            saga,
            effects: Vec::new(),
            outcome: None,
            started: false,
        }
    }

    /// Resume the procedure once with `input`
    ///
    /// Returns the yielded effect, or `None` once the procedure finished.
    /// Stepping a finished procedure is an error.
    pub fn step(&mut self, input: Resume) -> Result<Option<&Effect>> {
        if self.outcome.is_some() {
            return Err(SagaError::runtime(format!(
                "{} already finished",
                self.saga.name()
            )));
        }
        self.started = true;

        match self.saga.resume(input) {
            Step::Yield(effect) => {
                self.effects.push(effect);
                Ok(self.effects.last())
            }
            Step::Complete(output) => {
                self.outcome = Some(Ok(output));
                Ok(None)
            }
            Step::Fail(err) => {
                self.outcome = Some(Err(err));
                Ok(None)
            }
        }
    }

    /// Start the procedure, then answer its effects with `responses` in order
    ///
    /// Stops early when the procedure finishes; leftover responses are
    /// dropped. Returns the number of effects yielded during this run.
    pub fn run<I>(&mut self, responses: I) -> Result<usize>
    where
        I: IntoIterator<Item = Resume>,
    {
        let before = self.effects.len();
        if !self.started && self.step(Resume::Start)?.is_none() {
            return Ok(0);
        }
        for response in responses {
            if self.step(response)?.is_none() {
                break;
            }
        }
        Ok(self.effects.len() - before)
    }

    /// Run the procedure to completion, answering every effect with `Unit`
    pub fn run_to_end(&mut self) -> Result<&std::result::Result<Output, SagaError>> {
        if !self.started {
            self.step(Resume::Start)?;
        }
        while self.outcome.is_none() {
            self.step(Resume::Value(Output::Unit))?;
        }
        self.outcome
            .as_ref()
            .ok_or_else(|| SagaError::runtime("procedure did not finish"))
    }

    /// Effects yielded so far, in order
    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    /// Short names of the yielded effects
    pub fn kinds(&self) -> Vec<&'static str> {
        self.effects.iter().map(Effect::kind).collect()
    }

    /// How the procedure finished, if it has
    pub fn outcome(&self) -> Option<&std::result::Result<Output, SagaError>> {
        self.outcome.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn into_inner(self) -> S {
        self.saga
    }
}
