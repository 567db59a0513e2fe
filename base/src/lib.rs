// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Thin platform support layer for the migration crates: errno results,
//! eventfd signalling, poll-based waiting and anonymous memory mappings.

#![cfg(unix)]

mod errno;
mod event;
mod mmap;
mod wait_context;

pub use errno::errno_result;
pub use errno::Error;
pub use errno::Result;
pub use event::Event;
pub use mmap::MemoryMapping;
pub use wait_context::TriggeredEvent;
pub use wait_context::WaitContext;

/// Returns the system page size in bytes.
pub fn pagesize() -> usize {
    // Trivially safe, no memory is touched.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
