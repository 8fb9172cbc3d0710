// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Mutex as StdMutex, MutexGuard};

/// A [`std::sync::Mutex`] whose `lock` never returns a poison error.
#[derive(Debug, Default)]
pub struct Mutex<T>(StdMutex<T>);

impl<T> Mutex<T> {
    pub fn new(t: T) -> Self {
        Self(StdMutex::new(t))
    }

    /// Locks the mutex, panicking if a previous holder panicked.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0
            .lock()
            .expect("meridian cannot continue with a poisoned lock")
    }

    pub fn into_inner(self) -> T {
        self.0
            .into_inner()
            .expect("meridian cannot continue with a poisoned lock")
    }
}

#[cfg(test)]
mod tests {
    use super::Mutex;
    use std::{sync::Arc, thread};

    #[test]
    fn lock_many_writers() {
        let count = Arc::new(Mutex::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let count = Arc::clone(&count);
                thread::spawn(move || {
                    for _ in 0..100 {
                        *count.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*count.lock(), 800);
    }
}
