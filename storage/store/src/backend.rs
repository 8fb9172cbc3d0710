// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{HashedObject, StoreError};
use meridian_crypto::Hash256;
use meridian_infallible::Mutex;
use std::collections::HashMap;

/// The durable layer under the object-store cache. The production backend is
/// the `CommittedObjects` table; tests and standalone runs use
/// [`MemoryBackend`].
pub trait ObjectBackend: Send + Sync {
    fn store(&self, object: &HashedObject) -> Result<(), StoreError>;
    fn fetch(&self, hash: &Hash256) -> Result<Option<HashedObject>, StoreError>;
}

/// Keeps every object in a map. Unbounded; intended for tests and tools.
#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<Hash256, HashedObject>>,
}

impl MemoryBackend {
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

impl ObjectBackend for MemoryBackend {
    fn store(&self, object: &HashedObject) -> Result<(), StoreError> {
        self.objects.lock().insert(object.hash, object.clone());
        Ok(())
    }

    fn fetch(&self, hash: &Hash256) -> Result<Option<HashedObject>, StoreError> {
        Ok(self.objects.lock().get(hash).cloned())
    }
}
