//! Content-addressed schema storage with an in-process cache

use super::Schema;
use crate::clock::SharedClock;
use crate::error::{FluxError, Result};
use crate::keys::FluxKeys;
use crate::store::SharedStore;
use ahash::AHashMap;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use tracing::{debug, info};

/// Stores raw schema JSON under its SHA-1 and caches parsed schemas
pub struct SchemaRegistry {
    store: SharedStore,
    clock: SharedClock,
    cache: RwLock<AHashMap<String, Arc<Schema>>>,
}

impl SchemaRegistry {
    pub fn new(store: SharedStore, clock: SharedClock) -> Self {
        SchemaRegistry {
            store,
            clock,
            cache: RwLock::new(AHashMap::new()),
        }
    }

    /// Hex SHA-1 of the raw schema text
    pub fn schema_id(raw: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(raw.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Validate and persist a schema. Identical content yields the same id.
    pub fn add_schema(&self, raw: &str) -> Result<String> {
        let id = Self::schema_id(raw);
        if self.cache.read().contains_key(&id) {
            return Ok(id);
        }

        let schema = Schema::from_json(raw)?;
        self.store.set(&FluxKeys::schema(&id), raw)?;
        if self.store.zscore(FluxKeys::SCHEMA_INDEX, &id)?.is_none() {
            self.store
                .zadd(FluxKeys::SCHEMA_INDEX, self.clock.now_secs() as f64, &id)?;
            info!("Registered schema {} ({} prefixes)", id, schema.len());
        }
        self.cache.write().insert(id.clone(), Arc::new(schema));
        Ok(id)
    }

    pub fn get_schema(&self, id: &str) -> Result<Arc<Schema>> {
        if let Some(schema) = self.cache.read().get(id) {
            return Ok(schema.clone());
        }

        let raw = self
            .store
            .get(&FluxKeys::schema(id))?
            .ok_or_else(|| FluxError::UnknownSchema(id.to_string()))?;
        let schema = Arc::new(Schema::from_json(&raw)?);
        debug!("Loaded schema {} into cache", id);
        self.cache.write().insert(id.to_string(), schema.clone());
        Ok(schema)
    }

    /// Every registered id, most recently registered first
    pub fn all_schema_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .zrevrange(FluxKeys::SCHEMA_INDEX, 0, -1)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    pub fn cached_count(&self) -> usize {
        self.cache.read().len()
    }
}
