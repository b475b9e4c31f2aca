//! Reactive typed cells with observer fan-out.
//!
//! A cell holds one of a signed 32-bit integer, a UTF-8 string with a
//! double-buffered previous value, or an opaque pointer-sized word.
//! Observers are invoked in registration order on the writing thread;
//! cross-thread writers marshal through the store's `UiScheduler` first.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Value held by a [`Cell`]
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    /// Signed 32-bit integer
    Int(i32),
    /// UTF-8 string
    Text(String),
    /// Opaque pointer-sized word; meaning is defined by the writer
    Ptr(usize),
}

impl CellValue {
    /// Get the integer value, if this is an `Int` cell value
    pub fn as_int(&self) -> Option<i32> {
        match self {
            CellValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the string value, if this is a `Text` cell value
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the pointer word, if this is a `Ptr` cell value
    pub fn as_ptr(&self) -> Option<usize> {
        match self {
            CellValue::Ptr(p) => Some(*p),
            _ => None,
        }
    }
}

/// Handle for removing an observer from a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

impl ObserverId {
    fn next() -> Self {
        Self(NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

type ObserverFn = Box<dyn Fn(&CellValue) + Send + Sync>;

struct Inner {
    value: CellValue,
    /// Previous string value for `Text` cells. Unused for other kinds.
    previous_text: Option<String>,
    observers: Vec<(ObserverId, ObserverFn)>,
}

/// A reactive typed value with an ordered observer list
///
/// Writes that do not change an `Int` or `Text` value are no-ops; `Ptr`
/// writes always notify. Observer invocation is serialized per cell by
/// the internal lock.
pub struct Cell {
    key: String,
    inner: Mutex<Inner>,
}

impl Cell {
    /// Create a new cell with an initial value
    pub fn new(key: impl Into<String>, initial: CellValue) -> Self {
        Self {
            key: key.into(),
            inner: Mutex::new(Inner {
                value: initial,
                previous_text: None,
                observers: Vec::new(),
            }),
        }
    }

    /// The unique key this cell is addressed by
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get a copy of the current value
    pub fn get(&self) -> CellValue {
        self.inner.lock().value.clone()
    }

    /// Get the integer value, or 0 for non-integer cells
    pub fn get_int(&self) -> i32 {
        self.get().as_int().unwrap_or(0)
    }

    /// Get the string value, or empty for non-text cells
    pub fn get_text(&self) -> String {
        match self.get() {
            CellValue::Text(s) => s,
            _ => String::new(),
        }
    }

    /// Previous string value, for `Text` cells that have been rewritten
    pub fn previous_text(&self) -> Option<String> {
        self.inner.lock().previous_text.clone()
    }

    /// Write a new value, notifying observers on change
    ///
    /// Unchanged `Int`/`Text` writes are coalesced into no-ops; `Ptr`
    /// writes always notify. Observers run on the calling thread while
    /// the cell lock is held, so they must not re-enter this cell.
    pub fn set(&self, value: CellValue) {
        let mut inner = self.inner.lock();
        let changed = match (&inner.value, &value) {
            (CellValue::Int(old), CellValue::Int(new)) => old != new,
            (CellValue::Text(old), CellValue::Text(new)) => old != new,
            // Pointer cells notify even when the word is unchanged; the
            // pointee may have been mutated in place.
            (CellValue::Ptr(_), CellValue::Ptr(_)) => true,
            // Type change always counts as a change.
            _ => true,
        };
        if !changed {
            return;
        }

        if let CellValue::Text(old) = &inner.value {
            let old = old.clone();
            inner.previous_text = Some(old);
        }
        inner.value = value;

        let snapshot = inner.value.clone();
        for (_, observer) in &inner.observers {
            observer(&snapshot);
        }
    }

    /// Write an integer value
    pub fn set_int(&self, value: i32) {
        self.set(CellValue::Int(value));
    }

    /// Write a string value
    pub fn set_text(&self, value: impl Into<String>) {
        self.set(CellValue::Text(value.into()));
    }

    /// Register an observer; returns a handle for removal
    pub fn observe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&CellValue) + Send + Sync + 'static,
    {
        let id = ObserverId::next();
        self.inner.lock().observers.push((id, Box::new(observer)));
        id
    }

    /// Remove an observer. Returns true if it was registered.
    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.observers.len();
        inner.observers.retain(|(oid, _)| *oid != id);
        inner.observers.len() != before
    }

    /// Remove all observers without touching the value
    pub fn clear_observers(&self) {
        self.inner.lock().observers.clear();
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("key", &self.key)
            .field("value", &self.inner.lock().value)
            .field("observers", &self.observer_count())
            .finish()
    }
}
