pub mod config;
pub mod counter;
pub mod error;
pub mod report;
pub mod state;
pub mod util;

pub use config::{FileConfig, ServerConfig, TlsPaths};
pub use counter::{RequestCounter, SlidingWindow, TICK, WINDOW, WINDOW_SLOTS};
pub use error::CounterError;
pub use state::{FileStateStore, InMemoryStateStore, PersistedState, StateStore};
