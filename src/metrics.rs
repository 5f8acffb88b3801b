//! Process-wide execution counters.
//!
//! Mirrors the atomic-counter style of the source host's instrumentation:
//! cheap enough to bump unconditionally from the hot call path, cloneable
//! (shared counters, not per-instance) so every `ScriptInstance` reports
//! into the same `Host`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct Metrics {
    instructions_executed: Arc<AtomicU64>,
    budget_overruns: Arc<AtomicU64>,
    remote_calls: Arc<AtomicU64>,
    faults: Arc<AtomicU64>,
    dyncalls_dispatched: Arc<AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_instructions(&self, count: u64) {
        self.instructions_executed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_budget_overrun(&self) {
        self.budget_overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_call(&self) {
        self.remote_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dyncall(&self) {
        self.dyncalls_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn instructions_executed(&self) -> u64 {
        self.instructions_executed.load(Ordering::Relaxed)
    }

    pub fn budget_overruns(&self) -> u64 {
        self.budget_overruns.load(Ordering::Relaxed)
    }

    pub fn remote_calls(&self) -> u64 {
        self.remote_calls.load(Ordering::Relaxed)
    }

    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn dyncalls_dispatched(&self) -> u64 {
        self.dyncalls_dispatched.load(Ordering::Relaxed)
    }
}
