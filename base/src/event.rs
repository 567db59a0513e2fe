// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::mem::size_of;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;

use crate::errno_result;
use crate::Result;

/// A safe wrapper around a Linux eventfd, used for cross-thread signalling.
///
/// The counter semantics follow eventfd(2): `write` adds to the counter and
/// `read` returns and resets it, blocking while it is zero.
#[derive(Debug)]
pub struct Event(OwnedFd);

impl Event {
    /// Creates a new event with an initial counter of zero.
    pub fn new() -> Result<Event> {
        // Safe because we check the return value and take ownership of the fd.
        let ret = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if ret < 0 {
            return errno_result();
        }
        // Safe because the fd is valid and owned solely by us.
        Ok(Event(unsafe { OwnedFd::from_raw_fd(ret) }))
    }

    /// Adds `v` to the event counter, waking any blocked reader.
    pub fn write(&self, v: u64) -> Result<()> {
        // Safe because the fd is valid and the buffer outlives the call.
        let ret = unsafe {
            libc::write(
                self.0.as_raw_fd(),
                &v as *const u64 as *const libc::c_void,
                size_of::<u64>(),
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Reads and resets the event counter, blocking while it is zero.
    pub fn read(&self) -> Result<u64> {
        let mut v = 0u64;
        // Safe because the fd is valid and the buffer outlives the call.
        let ret = unsafe {
            libc::read(
                self.0.as_raw_fd(),
                &mut v as *mut u64 as *mut libc::c_void,
                size_of::<u64>(),
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(v)
    }

    /// Clones the event, producing a new descriptor for the same counter.
    pub fn try_clone(&self) -> Result<Event> {
        match self.0.try_clone() {
            Ok(fd) => Ok(Event(fd)),
            Err(_) => errno_result(),
        }
    }
}

impl AsRawFd for Event {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let evt = Event::new().unwrap();
        evt.write(1).unwrap();
        evt.write(2).unwrap();
        assert_eq!(evt.read().unwrap(), 3);
    }

    #[test]
    fn clone_shares_counter() {
        let evt = Event::new().unwrap();
        let other = evt.try_clone().unwrap();
        other.write(5).unwrap();
        assert_eq!(evt.read().unwrap(), 5);
    }
}
