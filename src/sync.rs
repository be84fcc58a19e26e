// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Mutex;
use std::sync::MutexGuard;

/// This binary is compiled to abort on panic, so a Mutex can never actually
/// observe poisoning. Centralizes discarding the `LockResult` so call sites
/// don't each need their own `unwrap()`/`expect()`.
pub trait NoPoison<T: ?Sized> {
    fn do_lock(&self) -> MutexGuard<T>;
}

impl<T: ?Sized> NoPoison<T> for Mutex<T> {
    fn do_lock(&self) -> MutexGuard<T> {
        match self.lock() {
            Ok(guard) => guard,
            Err(_) => unreachable!("this binary aborts on panic"),
        }
    }
}
