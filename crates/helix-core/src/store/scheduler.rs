//! Marshalling of cell writes onto the UI thread.
//!
//! The reactive store is owned by a single UI thread. Writers on other
//! threads (transport I/O, AMS workers) post a closure to the owning
//! scheduler, which performs the write and the observer fan-out. The
//! display layer installs its own scheduler at startup; the default
//! inline scheduler runs closures immediately, which is correct for
//! single-threaded use and for tests.

use std::sync::Arc;

/// A task posted to the UI thread
pub type UiTask = Box<dyn FnOnce() + Send>;

/// Handle to the thread that owns the reactive store
pub trait UiScheduler: Send + Sync {
    /// Queue a task to run on the owning thread
    fn post(&self, task: UiTask);
}

/// Scheduler that runs tasks immediately on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl UiScheduler for InlineScheduler {
    fn post(&self, task: UiTask) {
        task();
    }
}

/// Scheduler backed by an unbounded channel
///
/// The owning thread drains tasks by calling [`ChannelScheduler::run_pending`]
/// from its event loop. Used by hosts whose display toolkit exposes a
/// poll-style main loop rather than a task queue.
pub struct ChannelScheduler {
    tx: std::sync::mpsc::Sender<UiTask>,
    rx: parking_lot::Mutex<std::sync::mpsc::Receiver<UiTask>>,
}

impl ChannelScheduler {
    /// Create a new channel scheduler
    pub fn new() -> Arc<Self> {
        let (tx, rx) = std::sync::mpsc::channel();
        Arc::new(Self {
            tx,
            rx: parking_lot::Mutex::new(rx),
        })
    }

    /// Run all tasks queued so far; returns the number executed
    ///
    /// Must be called from the owning thread.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        loop {
            let task = { self.rx.lock().try_recv() };
            match task {
                Ok(task) => {
                    task();
                    count += 1;
                }
                Err(_) => break,
            }
        }
        count
    }
}

impl UiScheduler for ChannelScheduler {
    fn post(&self, task: UiTask) {
        // Receiver dropped means shutdown; losing tasks then is fine.
        let _ = self.tx.send(task);
    }
}
