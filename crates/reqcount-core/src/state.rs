use crate::counter::WINDOW_SLOTS;
use crate::error::CounterError;
use crate::util::atomic_write;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// On-disk snapshot of the settled part of a sliding window.
///
/// The still-open bucket is never part of it, so up to one second of
/// requests is lost across a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(rename = "DeltaIdx")]
    pub cursor: usize,
    #[serde(rename = "Deltas")]
    pub buckets: Vec<u64>,
    #[serde(rename = "TimeWindowReqNo")]
    pub window_total: u64,
}

impl PersistedState {
    pub fn decode(raw: &str, origin: &Path) -> Result<Self, CounterError> {
        let state = serde_json::from_str::<PersistedState>(raw)
            .map_err(|err| CounterError::corrupt(origin, err.to_string()))?;
        state
            .validate()
            .map_err(|reason| CounterError::corrupt(origin, reason))?;
        Ok(state)
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// A cursor equal to the slot count is accepted: older writers stored the
    /// post-increment index and wrapped it only on the next rotation.
    pub fn validate(&self) -> Result<(), String> {
        if self.buckets.len() != WINDOW_SLOTS {
            return Err(format!(
                "expected {} buckets, found {}",
                WINDOW_SLOTS,
                self.buckets.len()
            ));
        }
        if self.cursor > WINDOW_SLOTS {
            return Err(format!("cursor {} out of range", self.cursor));
        }
        let sum = self
            .buckets
            .iter()
            .try_fold(0u64, |acc, b| acc.checked_add(*b))
            .ok_or_else(|| "bucket sum overflows".to_string())?;
        if sum != self.window_total {
            return Err(format!(
                "window total {} does not match bucket sum {}",
                self.window_total, sum
            ));
        }
        Ok(())
    }
}

pub trait StateStore: Send + Sync {
    /// `Ok(None)` means there is no prior state (cold start).
    fn load(&self) -> Result<Option<PersistedState>, CounterError>;
    fn save(&self, state: &PersistedState) -> Result<(), CounterError>;
}

#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<PersistedState>, CounterError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no request count file, cold start");
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|source| {
            CounterError::Unreadable {
                path: self.path.clone(),
                source,
            }
        })?;
        PersistedState::decode(&raw, &self.path).map(Some)
    }

    fn save(&self, state: &PersistedState) -> Result<(), CounterError> {
        let data = state
            .encode()
            .map_err(|err| CounterError::persist(&self.path, err))?;
        atomic_write(&self.path, &data).map_err(|err| CounterError::persist(&self.path, err))
    }
}

/// Keeps the encoded snapshot in memory; used where no disk is wanted.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    raw: Mutex<Option<String>>,
}

impl InMemoryStateStore {
    const ORIGIN: &'static str = "<memory>";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            raw: Mutex::new(Some(raw.into())),
        }
    }

    pub fn raw(&self) -> Option<String> {
        self.raw.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl StateStore for InMemoryStateStore {
    fn load(&self) -> Result<Option<PersistedState>, CounterError> {
        match self.raw() {
            Some(raw) => PersistedState::decode(&raw, Path::new(Self::ORIGIN)).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, state: &PersistedState) -> Result<(), CounterError> {
        let data = state
            .encode()
            .map_err(|err| CounterError::persist(Self::ORIGIN, err))?;
        let text =
            String::from_utf8(data).map_err(|err| CounterError::persist(Self::ORIGIN, err))?;
        *self.raw.lock().unwrap_or_else(|e| e.into_inner()) = Some(text);
        Ok(())
    }
}
