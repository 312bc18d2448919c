//! Pool statistics

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::config::PoolMode;

/// Snapshot of the instance pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub mode: PoolMode,
    /// Workers currently held by the pool
    pub workers: usize,
    /// Of those, workers still able to take calls
    pub live_workers: usize,
    /// Open documents
    pub documents: usize,
    /// Opens in flight that hold a slot but no document yet
    pub pending_opens: usize,
    /// Document slots left before admission control kicks in
    pub available_slots: usize,
    pub max_workers: usize,
    /// Total workers ever started
    pub spawned: usize,
    /// Total workers stopped
    pub retired: usize,
    /// Total documents opened
    pub opened: usize,
    /// Total opens refused with `PoolExhausted`
    pub rejected: usize,
}

impl PoolStats {
    /// Share of the worker bound in use (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.max_workers == 0 {
            return 0.0;
        }
        (self.workers as f64 / self.max_workers as f64).min(1.0)
    }

    /// Fraction of opens served without starting a worker
    ///
    /// Always 0 in per-document mode; higher is better in shared mode.
    pub fn reuse_efficiency(&self) -> f64 {
        if self.opened == 0 {
            return 1.0;
        }
        self.opened.saturating_sub(self.spawned) as f64 / self.opened as f64
    }
}

/// Monotonic counters behind [`PoolStats`]
#[derive(Debug, Default)]
pub(super) struct Counters {
    pub spawned: AtomicUsize,
    pub retired: AtomicUsize,
    pub opened: AtomicUsize,
    pub rejected: AtomicUsize,
}

impl Counters {
    pub fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }
}
