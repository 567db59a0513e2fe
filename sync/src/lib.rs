// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A `Mutex` that hides lock poisoning: a thread that panics while holding a
//! lock aborts the protected invariants anyway, so every user would just
//! unwrap. This keeps call sites honest and small.

use std::sync::Mutex as StdMutex;
pub use std::sync::MutexGuard;

#[derive(Debug, Default)]
pub struct Mutex<T: ?Sized> {
    lock: StdMutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(v: T) -> Mutex<T> {
        Mutex {
            lock: StdMutex::new(v),
        }
    }

    pub fn into_inner(self) -> T {
        self.lock.into_inner().unwrap_or_else(|_| panic!("mutex is poisoned"))
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<T> {
        self.lock.lock().unwrap_or_else(|_| panic!("mutex is poisoned"))
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(v: T) -> Self {
        Mutex::new(v)
    }
}
