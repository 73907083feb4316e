//! Loaded models, keyed by (model path, model type).

use std::{
    collections::{BTreeMap, btree_map::Entry},
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

use crate::handler::{ModelHandle, ModelHandler};

/// Identifies one loaded model instance.
///
/// The same artifact loaded under two model types is two distinct entries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub model_path: String,
    pub model_type: String,
}

impl CacheKey {
    pub fn new(model_path: impl Into<String>, model_type: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            model_type: model_type.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model_type, self.model_path)
    }
}

/// A cached model together with the handler that loaded it.
pub struct ModelEntry {
    pub(crate) handler: Arc<dyn ModelHandler>,
    pub(crate) handle: ModelHandle,
    loaded_at: SystemTime,
    last_used_at: SystemTime,
}

impl ModelEntry {
    pub fn new(handler: Arc<dyn ModelHandler>, handle: ModelHandle) -> Self {
        let now = SystemTime::now();

        Self {
            handler,
            handle,
            loaded_at: now,
            last_used_at: now,
        }
    }

    /// Marks the entry as used right now.
    pub fn touch(&mut self) {
        self.last_used_at = SystemTime::now();
    }
}

/// What `status` shows about a cached model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSummary {
    pub model_path: String,
    pub model_type: String,
    /// Milliseconds since the Unix epoch.
    pub loaded_at: u64,
    pub last_used_at: u64,
}

fn epoch_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Store of loaded models, owned and mutated by the worker only.
#[derive(Default)]
pub struct ModelCache {
    entries: BTreeMap<CacheKey, ModelEntry>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry under `key`, creating it with `load` on a miss.
    ///
    /// A failing `load` leaves the cache untouched.
    ///
    /// # Returns
    /// The entry and whether it was freshly inserted.
    pub fn get_or_try_insert_with<F, E>(
        &mut self,
        key: &CacheKey,
        load: F,
    ) -> Result<(&mut ModelEntry, bool), E>
    where
        F: FnOnce() -> Result<ModelEntry, E>,
    {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) => Ok((entry.into_mut(), false)),
            Entry::Vacant(slot) => Ok((slot.insert(load()?), true)),
        }
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<ModelEntry> {
        self.entries.remove(key)
    }

    /// Empties the cache, handing every entry to the caller in key order.
    pub fn drain(&mut self) -> Vec<(CacheKey, ModelEntry)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn summaries(&self) -> Vec<ModelSummary> {
        self.entries
            .iter()
            .map(|(key, entry)| ModelSummary {
                model_path: key.model_path.clone(),
                model_type: key.model_type.clone(),
                loaded_at: epoch_ms(entry.loaded_at),
                last_used_at: epoch_ms(entry.last_used_at),
            })
            .collect()
    }
}
