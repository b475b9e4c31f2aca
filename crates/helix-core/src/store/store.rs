//! Process-global reactive state store.
//!
//! Cells are addressable by unique string key and live for the process.
//! The store follows the same global-service pattern as the transport
//! client and the AMS bridge: a `OnceLock` accessor plus an explicit
//! test-reset hook that clears observers without deallocating cells.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use super::cell::{Cell, CellValue};
use super::scheduler::{InlineScheduler, UiScheduler};

/// Thread-safe mapping from well-known keys to reactive cells
pub struct StateStore {
    cells: RwLock<HashMap<String, Arc<Cell>>>,
    scheduler: RwLock<Arc<dyn UiScheduler>>,
}

impl StateStore {
    /// Create an empty store with the inline scheduler
    pub fn new() -> Self {
        Self {
            cells: RwLock::new(HashMap::new()),
            scheduler: RwLock::new(Arc::new(InlineScheduler)),
        }
    }

    /// Install the UI thread scheduler
    ///
    /// Must be called before any non-UI thread writes cells. Until then
    /// the inline scheduler runs fan-out on the writing thread.
    pub fn set_scheduler(&self, scheduler: Arc<dyn UiScheduler>) {
        *self.scheduler.write() = scheduler;
    }

    /// Register a cell, returning the existing one if the key is taken
    ///
    /// Registration is idempotent by key; the initial value only applies
    /// on first registration.
    pub fn register(&self, key: &str, initial: CellValue) -> Arc<Cell> {
        if let Some(cell) = self.cells.read().get(key) {
            return cell.clone();
        }
        let mut cells = self.cells.write();
        cells
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Cell::new(key, initial)))
            .clone()
    }

    /// Register an integer cell
    pub fn register_int(&self, key: &str, initial: i32) -> Arc<Cell> {
        self.register(key, CellValue::Int(initial))
    }

    /// Register a text cell
    pub fn register_text(&self, key: &str, initial: &str) -> Arc<Cell> {
        self.register(key, CellValue::Text(initial.to_string()))
    }

    /// Look up a cell by key
    pub fn cell(&self, key: &str) -> Option<Arc<Cell>> {
        self.cells.read().get(key).cloned()
    }

    /// Write a cell from the UI thread
    ///
    /// No-op with a warning when the key is unknown; discovery registers
    /// all well-known cells before any writer runs.
    pub fn write(&self, key: &str, value: CellValue) {
        match self.cell(key) {
            Some(cell) => cell.set(value),
            None => tracing::warn!("Write to unregistered cell '{}'", key),
        }
    }

    /// Write a cell from any thread
    ///
    /// Posts the write and its observer fan-out to the UI scheduler so
    /// observers only ever run on the owning thread.
    pub fn write_marshalled(&self, key: &str, value: CellValue) {
        let Some(cell) = self.cell(key) else {
            tracing::warn!("Marshalled write to unregistered cell '{}'", key);
            return;
        };
        let scheduler = self.scheduler.read().clone();
        scheduler.post(Box::new(move || cell.set(value)));
    }

    /// Number of registered cells
    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    /// Whether the store has no cells
    pub fn is_empty(&self) -> bool {
        self.cells.read().is_empty()
    }

    /// Clear observers on every cell, keeping the cells and their values
    ///
    /// Test isolation hook. Cells are process-global by design, so tests
    /// reset fan-out rather than tearing the store down.
    pub fn reset_observers(&self) {
        for cell in self.cells.read().values() {
            cell.clear_observers();
        }
        *self.scheduler.write() = Arc::new(InlineScheduler);
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("cells", &self.len())
            .finish()
    }
}

/// Global state store instance
static STATE_STORE: OnceLock<StateStore> = OnceLock::new();

/// Get or initialize the global state store
///
/// This is the primary way to access cells throughout the process.
pub fn state_store() -> &'static StateStore {
    STATE_STORE.get_or_init(StateStore::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn test_register_is_idempotent() {
        let store = StateStore::new();
        let a = store.register_int("k", 7);
        let b = store.register_int("k", 99);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.get_int(), 7);
    }

    #[test]
    fn test_write_by_key() {
        let store = StateStore::new();
        store.register_int("temp", 0);
        store.write("temp", CellValue::Int(205));
        assert_eq!(store.cell("temp").unwrap().get_int(), 205);
    }

    #[test]
    fn test_marshalled_write_uses_scheduler() {
        let store = StateStore::new();
        let cell = store.register_int("temp", 0);
        let last = Arc::new(AtomicI32::new(-1));
        let l = last.clone();
        cell.observe(move |v| {
            l.store(v.as_int().unwrap_or(-1), Ordering::SeqCst);
        });

        let sched = super::super::scheduler::ChannelScheduler::new();
        store.set_scheduler(sched.clone());

        store.write_marshalled("temp", CellValue::Int(42));
        // Not applied until the owning thread drains its queue.
        assert_eq!(last.load(Ordering::SeqCst), -1);
        sched.run_pending();
        assert_eq!(last.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_reset_clears_observers_keeps_values() {
        let store = StateStore::new();
        let cell = store.register_int("temp", 55);
        cell.observe(|_| {});
        assert_eq!(cell.observer_count(), 1);

        store.reset_observers();
        assert_eq!(cell.observer_count(), 0);
        assert_eq!(cell.get_int(), 55);
        assert_eq!(store.len(), 1);
    }
}
