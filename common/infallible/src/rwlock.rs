// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::{RwLock as StdRwLock, RwLockReadGuard, RwLockWriteGuard};

/// A [`std::sync::RwLock`] whose guards never return a poison error.
#[derive(Debug, Default)]
pub struct RwLock<T>(StdRwLock<T>);

impl<T> RwLock<T> {
    pub fn new(t: T) -> Self {
        Self(StdRwLock::new(t))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0
            .read()
            .expect("meridian cannot continue with a poisoned lock")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0
            .write()
            .expect("meridian cannot continue with a poisoned lock")
    }
}
