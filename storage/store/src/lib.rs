// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Content-addressed blob store backing the authenticated trees.
//!
//! Every committed tree node, transaction and ledger header lives here keyed
//! by its hash. A bounded LRU fronts the durable backend; `put` writes
//! through, so an eviction never loses data. Missing data is reported upward
//! (`Ok(None)`), never fabricated.

mod backend;
mod cache;

pub use backend::{MemoryBackend, ObjectBackend};

use cache::LruCache;
use meridian_crypto::{content_hash, Hash256};
use meridian_infallible::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend failure: {0}")]
    Backend(String),
}

/// What a committed object is, for the persisted index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Ledger,
    Transaction,
    AccountNode,
    TransactionNode,
}

impl ObjectType {
    /// Single-character code used by the `CommittedObjects` table.
    pub fn code(self) -> char {
        match self {
            ObjectType::Ledger => 'L',
            ObjectType::Transaction => 'T',
            ObjectType::AccountNode => 'A',
            ObjectType::TransactionNode => 'N',
        }
    }
}

/// A stored blob together with its index fields.
#[derive(Debug, Clone)]
pub struct HashedObject {
    pub object_type: ObjectType,
    pub ledger_seq: u32,
    pub hash: Hash256,
    pub data: Arc<Vec<u8>>,
}

/// The C1 store: thread-safe, idempotent `put`, cache-first `get`.
pub struct HashedObjectStore {
    cache: Mutex<LruCache<Hash256, HashedObject>>,
    backend: Arc<dyn ObjectBackend>,
}

impl HashedObjectStore {
    pub fn new(backend: Arc<dyn ObjectBackend>, cache_capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(cache_capacity)),
            backend,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::default()), 65_536)
    }

    /// Stores `data` under `hash`. Duplicate stores are no-ops returning
    /// `false`. `hash` must be the content hash of `data`; a mismatch is a
    /// caller bug — asserted in debug, dropped with a log in release.
    pub fn put(
        &self,
        object_type: ObjectType,
        ledger_seq: u32,
        data: Vec<u8>,
        hash: Hash256,
    ) -> Result<bool, StoreError> {
        let computed = content_hash(&data);
        debug_assert_eq!(computed, hash, "object stored under the wrong hash");
        if computed != hash {
            warn!(target: "store", %hash, "dropping object whose bytes do not match its hash");
            return Ok(false);
        }

        if self.cache.lock().get(&hash).is_some() {
            return Ok(false);
        }
        if self.backend.fetch(&hash)?.is_some() {
            return Ok(false);
        }

        let object = HashedObject {
            object_type,
            ledger_seq,
            hash,
            data: Arc::new(data),
        };
        self.backend.store(&object)?;
        self.cache.lock().put(hash, object);
        Ok(true)
    }

    /// Fetches the raw bytes for `hash`, if present anywhere.
    pub fn get(&self, hash: &Hash256) -> Result<Option<Arc<Vec<u8>>>, StoreError> {
        Ok(self.get_object(hash)?.map(|o| o.data))
    }

    /// Fetches the object with its index fields.
    pub fn get_object(&self, hash: &Hash256) -> Result<Option<HashedObject>, StoreError> {
        if let Some(hit) = self.cache.lock().get(hash) {
            return Ok(Some(hit));
        }
        match self.backend.fetch(hash)? {
            Some(object) => {
                self.cache.lock().put(*hash, object.clone());
                Ok(Some(object))
            }
            None => Ok(None),
        }
    }

    pub fn contains(&self, hash: &Hash256) -> Result<bool, StoreError> {
        if self.cache.lock().get(hash).is_some() {
            return Ok(true);
        }
        Ok(self.backend.fetch(hash)?.is_some())
    }
}
