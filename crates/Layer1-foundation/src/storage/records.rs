//! Controller record storage
//!
//! Agent node, pool and template records persisted as JSON arrays. The
//! controller core only needs whole-collection read/write; the file layout
//! stays private to this module.

use super::JsonStore;
use crate::Result;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// Agent node records (launched flag, task ids, survivability)
pub const NODES_FILE: &str = "nodes.json";

/// Agent pool configuration
pub const POOLS_FILE: &str = "pools.json";

/// Task template definitions
pub const TEMPLATES_FILE: &str = "templates.json";

/// Whole-collection JSON record store
#[derive(Debug)]
pub struct RecordStore {
    store: JsonStore,
    write_lock: Mutex<()>,
}

impl RecordStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(base_dir),
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_store(store: JsonStore) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Load every record in `filename`; a missing file is an empty collection
    pub fn load_all<T: DeserializeOwned>(&self, filename: &str) -> Result<Vec<T>> {
        Ok(self
            .store
            .load_optional::<Vec<T>>(filename)?
            .unwrap_or_default())
    }

    /// Replace the collection in `filename`
    pub fn save_all<T: Serialize>(&self, filename: &str, records: &[T]) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.store.save(filename, &records)?;
        debug!("Saved {} records to {}", records.len(), filename);
        Ok(())
    }

    pub fn store(&self) -> &JsonStore {
        &self.store
    }
}
