// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Lock wrappers that treat poisoning as fatal.
//!
//! A poisoned lock means another thread panicked while holding it; the data
//! behind the lock can no longer be trusted, so the only sound response is
//! to abort. These wrappers keep `.lock().unwrap()` noise out of call sites.

mod mutex;
mod rwlock;

pub use mutex::Mutex;
pub use rwlock::RwLock;
