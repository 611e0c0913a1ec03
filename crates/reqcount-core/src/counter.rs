//! Sliding-window request counter.
//!
//! The window is a ring of one-second buckets. Requests accumulate in an open
//! bucket; each rotation closes it into the ring, evicting the bucket written
//! sixty rotations earlier, and keeps the settled total up to date without
//! rescanning the ring.

use crate::error::CounterError;
use crate::state::{PersistedState, StateStore};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

pub const WINDOW_SLOTS: usize = 60;
/// Length of one bucket; the rotation task fires at this period.
pub const TICK: Duration = Duration::from_secs(1);
pub const WINDOW: Duration = Duration::from_secs(WINDOW_SLOTS as u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindow {
    current: u64,
    buckets: [u64; WINDOW_SLOTS],
    cursor: usize,
    total: u64,
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self {
            current: 0,
            buckets: [0; WINDOW_SLOTS],
            cursor: 0,
            total: 0,
        }
    }
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a window from a validated snapshot. The open bucket starts
    /// empty whatever was in flight when the snapshot was taken.
    pub fn restore(state: &PersistedState) -> Self {
        let mut buckets = [0; WINDOW_SLOTS];
        for (slot, value) in buckets.iter_mut().zip(&state.buckets) {
            *slot = *value;
        }
        Self {
            current: 0,
            buckets,
            // a stored cursor of WINDOW_SLOTS is the same slot as 0
            cursor: state.cursor % WINDOW_SLOTS,
            total: state.window_total,
        }
    }

    pub fn increment(&mut self) {
        self.current += 1;
    }

    pub fn rotate(&mut self) {
        let evicted = self.buckets[self.cursor];
        self.total = self.total - evicted + self.current;
        self.buckets[self.cursor] = self.current;
        self.current = 0;
        self.cursor = (self.cursor + 1) % WINDOW_SLOTS;
    }

    /// Settled total plus the still-open bucket.
    pub fn window_total(&self) -> u64 {
        self.total + self.current
    }

    pub fn settled_total(&self) -> u64 {
        self.total
    }

    pub fn pending(&self) -> u64 {
        self.current
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn buckets(&self) -> &[u64; WINDOW_SLOTS] {
        &self.buckets
    }

    pub fn snapshot(&self) -> PersistedState {
        PersistedState {
            cursor: self.cursor,
            buckets: self.buckets.to_vec(),
            window_total: self.total,
        }
    }
}

/// A [`SlidingWindow`] behind one exclusive lock, bound to its durable store.
///
/// Every operation, flushing included, runs inside the same critical section,
/// so a written snapshot always matches some state the window really held.
pub struct RequestCounter {
    window: Mutex<SlidingWindow>,
    store: Arc<dyn StateStore>,
}

impl RequestCounter {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            window: Mutex::new(SlidingWindow::new()),
            store,
        }
    }

    /// Builds a counter from whatever the store holds. A missing snapshot is
    /// a cold start; a malformed one is an error the caller must not ignore.
    pub fn load(store: Arc<dyn StateStore>) -> Result<Self, CounterError> {
        let window = match store.load()? {
            Some(state) => {
                let window = SlidingWindow::restore(&state);
                info!(
                    cursor = window.cursor(),
                    window_total = window.settled_total(),
                    "restored request counter"
                );
                window
            }
            None => SlidingWindow::new(),
        };
        Ok(Self {
            window: Mutex::new(window),
            store,
        })
    }

    fn lock(&self) -> MutexGuard<'_, SlidingWindow> {
        // the window stays consistent even if a holder panicked mid-request
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn increment(&self) {
        self.lock().increment();
    }

    pub fn rotate(&self) {
        let mut window = self.lock();
        window.rotate();
        debug!(
            cursor = window.cursor(),
            window_total = window.settled_total(),
            "rotated request window"
        );
    }

    pub fn window_total(&self) -> u64 {
        self.lock().window_total()
    }

    pub fn snapshot(&self) -> PersistedState {
        self.lock().snapshot()
    }

    /// Writes the settled state while still holding the lock.
    pub fn flush(&self) -> Result<(), CounterError> {
        let window = self.lock();
        self.store.save(&window.snapshot())
    }
}

impl std::fmt::Debug for RequestCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCounter")
            .field("window", &*self.lock())
            .finish_non_exhaustive()
    }
}
