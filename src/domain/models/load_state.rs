//! Lifecycle flags for lazily loaded cache entries.

use std::sync::atomic::{AtomicBool, Ordering};

/// Tracks whether a cache entry has been loaded from durable storage and
/// whether a loader is needed.
///
/// A freshly inserted entry starts with `is_loaded = false` and
/// `needs_loader = false`: the inserter takes the loader role implicitly.
/// A failed load hands the role back by setting `needs_loader = true`; the
/// next caller claims it through [`try_become_loader`](Self::try_become_loader).
#[derive(Debug)]
pub struct LoadState {
    is_loaded: AtomicBool,
    needs_loader: AtomicBool,
}

impl Default for LoadState {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadState {
    pub fn new() -> Self {
        Self { is_loaded: AtomicBool::new(false), needs_loader: AtomicBool::new(false) }
    }

    pub fn is_loaded(&self) -> bool {
        self.is_loaded.load(Ordering::SeqCst)
    }

    pub fn mark_loaded(&self) {
        self.is_loaded.store(true, Ordering::SeqCst);
        self.needs_loader.store(false, Ordering::SeqCst);
    }

    pub fn needs_loader(&self) -> bool {
        self.needs_loader.load(Ordering::SeqCst)
    }

    /// Hands the loader role back after a failed load.
    pub fn mark_loader_needed(&self) {
        self.needs_loader.store(true, Ordering::SeqCst);
    }

    /// Atomically claims the loader role. Returns true for exactly one caller
    /// until the role is handed back.
    pub fn try_become_loader(&self) -> bool {
        self.needs_loader
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
