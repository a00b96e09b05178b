//! Take Registry
//!
//! Index of tasks suspended on Take. Registrations carry a monotonically
//! increasing sequence number so matching always runs in insertion order;
//! registrations whose pattern pins a type tag are additionally indexed by
//! that tag so a dispatch only evaluates plausible candidates.

use crate::action::Action;
use crate::pattern::Pattern;
use crate::task::TaskId;
use crate::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, trace};

/// A (pattern, task) pair held while the task is suspended on Take
#[derive(Debug, Clone)]
pub struct Registration {
    pub seq: u64,
    pub task: TaskId,
    pub pattern: Pattern,
    /// Single-consumer Take: competes with other exclusive registrations
    pub exclusive: bool,
}

/// Registry of blocked Takes
#[derive(Debug, Default)]
pub struct TakeRegistry {
    next_seq: u64,
    entries: BTreeMap<u64, Registration>,
    by_task: HashMap<TaskId, Vec<u64>>,
    by_type: HashMap<String, BTreeSet<u64>>,
    untyped: BTreeSet<u64>,
}

impl TakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a Take; malformed patterns are rejected
    pub fn register(&mut self, pattern: Pattern, task: TaskId, exclusive: bool) -> Result<u64> {
        pattern.validate()?;

        let seq = self.next_seq;
        self.next_seq += 1;

        match pattern.type_key() {
            Some(tag) => {
                self.by_type.entry(tag.to_string()).or_default().insert(seq);
            }
            None => {
                self.untyped.insert(seq);
            }
        }

        trace!(task = %task, seq, exclusive, ?pattern, "Registering take");
        self.by_task.entry(task).or_default().push(seq);
        self.entries.insert(
            seq,
            Registration {
                seq,
                task,
                pattern,
                exclusive,
            },
        );
        Ok(seq)
    }

    /// Remove every registration held by a task; returns how many were removed
    pub fn unregister(&mut self, task: TaskId) -> usize {
        let Some(seqs) = self.by_task.remove(&task) else {
            return 0;
        };

        for seq in &seqs {
            if let Some(registration) = self.entries.remove(seq) {
                match registration.pattern.type_key() {
                    Some(tag) => {
                        if let Some(set) = self.by_type.get_mut(tag) {
                            set.remove(seq);
                            if set.is_empty() {
                                self.by_type.remove(tag);
                            }
                        }
                    }
                    None => {
                        self.untyped.remove(seq);
                    }
                }
            }
        }

        debug!(task = %task, removed = seqs.len(), "Unregistered takes");
        seqs.len()
    }

    /// Tasks whose registration matches the action, in registration order
    ///
    /// Broadcast registrations all match; among exclusive registrations only
    /// the earliest-registered match is returned.
    pub fn dispatch(&self, action: &Action) -> Vec<TaskId> {
        let typed = self.by_type.get(action.action_type());
        let mut candidates: Vec<u64> = self.untyped.iter().copied().collect();
        if let Some(typed) = typed {
            candidates.extend(typed.iter().copied());
            candidates.sort_unstable();
        }

        let mut matched = Vec::new();
        let mut exclusive_taken = false;
        for seq in candidates {
            let Some(registration) = self.entries.get(&seq) else {
                continue;
            };
            if registration.exclusive && exclusive_taken {
                continue;
            }
            if registration.pattern.matches(action) {
                if registration.exclusive {
                    exclusive_taken = true;
                }
                if !matched.contains(&registration.task) {
                    matched.push(registration.task);
                }
            }
        }

        trace!(
            action_type = action.action_type(),
            matched = matched.len(),
            "Matched takes"
        );
        matched
    }

    /// Check whether a task holds a registration
    pub fn contains(&self, task: TaskId) -> bool {
        self.by_task.contains_key(&task)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
