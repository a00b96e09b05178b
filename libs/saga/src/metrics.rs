//! Scheduler Metrics
//!
//! Lock-free counters updated from inside the interpreter loop and read
//! from any thread through [`SchedulerMetrics::snapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by a scheduler
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub tasks_spawned: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_cancelled: AtomicU64,
    // Actions delivered by the bus from outside this scheduler
    pub actions_dispatched: AtomicU64,
    // Actions dispatched by this scheduler's own Put effects
    pub actions_put: AtomicU64,
    pub effects_interpreted: AtomicU64,
    pub take_matches: AtomicU64,

    // Resumes and settles that arrived after their task terminated
    pub cancellation_races: AtomicU64,
    pub unhandled_failures: AtomicU64,
}

/// Point-in-time copy of [`SchedulerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub tasks_spawned: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub actions_dispatched: u64,
    pub actions_put: u64,
    pub effects_interpreted: u64,
    pub take_matches: u64,
    pub cancellation_races: u64,
    pub unhandled_failures: u64,
}

impl SchedulerStats {
    /// Tasks that reached any terminal state
    pub fn tasks_finished(&self) -> u64 {
        self.tasks_completed + self.tasks_failed + self.tasks_cancelled
    }
}

impl SchedulerMetrics {
    pub fn record_spawn(&self) {
        self.tasks_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.actions_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self) {
        self.actions_put.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_effect(&self) {
        self.effects_interpreted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_take_matches(&self, count: usize) {
        self.take_matches.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_cancellation_race(&self) {
        self.cancellation_races.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unhandled(&self) {
        self.unhandled_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get metrics snapshot
    pub fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            tasks_spawned: self.tasks_spawned.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            actions_dispatched: self.actions_dispatched.load(Ordering::Relaxed),
            actions_put: self.actions_put.load(Ordering::Relaxed),
            effects_interpreted: self.effects_interpreted.load(Ordering::Relaxed),
            take_matches: self.take_matches.load(Ordering::Relaxed),
            cancellation_races: self.cancellation_races.load(Ordering::Relaxed),
            unhandled_failures: self.unhandled_failures.load(Ordering::Relaxed),
        }
    }
}
