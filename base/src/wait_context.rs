// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::os::fd::AsRawFd;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::Error;
use crate::Result;

/// An event returned by [`WaitContext::wait`].
#[derive(Copy, Clone, Debug)]
pub struct TriggeredEvent<T: Copy> {
    pub token: T,
    pub is_readable: bool,
    pub is_hungup: bool,
}

/// Waits for readability on a set of file descriptors, yielding the token
/// associated with each triggered descriptor.
///
/// The descriptors are borrowed by raw fd; callers must keep them open for
/// the lifetime of the context.
pub struct WaitContext<T: Copy> {
    fds: Vec<(RawFd, T)>,
}

impl<T: Copy> WaitContext<T> {
    pub fn new() -> WaitContext<T> {
        WaitContext { fds: Vec::new() }
    }

    /// Creates a context pre-populated with `items`.
    pub fn build_with(items: &[(&dyn AsRawFd, T)]) -> WaitContext<T> {
        let mut ctx = WaitContext::new();
        for (fd, token) in items {
            ctx.add(*fd, *token);
        }
        ctx
    }

    pub fn add(&mut self, fd: &dyn AsRawFd, token: T) {
        self.fds.push((fd.as_raw_fd(), token));
    }

    /// Blocks until at least one descriptor is readable or hung up.
    pub fn wait(&self) -> Result<Vec<TriggeredEvent<T>>> {
        self.wait_internal(-1)
    }

    /// As [`wait`](Self::wait), returning an empty set on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Vec<TriggeredEvent<T>>> {
        let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        self.wait_internal(millis)
    }

    fn wait_internal(&self, timeout_millis: libc::c_int) -> Result<Vec<TriggeredEvent<T>>> {
        let mut pollfds: Vec<libc::pollfd> = self
            .fds
            .iter()
            .map(|(fd, _)| libc::pollfd {
                fd: *fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        loop {
            // Safe because the pollfd array is valid for the duration of the call.
            let ret = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    timeout_millis,
                )
            };
            if ret < 0 {
                let err = Error::last();
                if err.errno() == libc::EINTR {
                    continue;
                }
                return Err(err);
            }
            break;
        }

        Ok(pollfds
            .iter()
            .zip(self.fds.iter())
            .filter(|(pfd, _)| pfd.revents != 0)
            .map(|(pfd, (_, token))| TriggeredEvent {
                token: *token,
                is_readable: pfd.revents & libc::POLLIN != 0,
                is_hungup: pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0,
            })
            .collect())
    }
}

impl<T: Copy> Default for WaitContext<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Event;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Token {
        A,
        B,
    }

    #[test]
    fn triggered_token() {
        let a = Event::new().unwrap();
        let b = Event::new().unwrap();
        let ctx = WaitContext::build_with(&[(&a, Token::A), (&b, Token::B)]);

        b.write(1).unwrap();
        let events = ctx.wait().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, Token::B);
        assert!(events[0].is_readable);
    }

    #[test]
    fn timeout_returns_empty() {
        let a = Event::new().unwrap();
        let ctx = WaitContext::build_with(&[(&a, Token::A)]);
        let events = ctx.wait_timeout(Duration::from_millis(10)).unwrap();
        assert!(events.is_empty());
    }
}
