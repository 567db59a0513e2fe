// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::fmt::Display;
use std::io;

/// An error number, retrievable from `errno` after a failed system call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Error(i32);

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Constructs a new error with the given `errno` value.
    pub fn new(errno: i32) -> Error {
        Error(errno)
    }

    /// Constructs an error from the current value of `errno`.
    pub fn last() -> Error {
        Error(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }

    /// Gets the `errno` this error was constructed with.
    pub fn errno(self) -> i32 {
        self.0
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        io::Error::from_raw_os_error(e.0)
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "system error {}: {}", self.0, io::Error::from_raw_os_error(self.0))
    }
}

/// Returns the last `errno` as a `Result` that is always an error.
pub fn errno_result<T>() -> Result<T> {
    Err(Error::last())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let e = Error::new(libc::EBADF);
        assert_eq!(e.errno(), libc::EBADF);
        let io_err: io::Error = e.into();
        assert_eq!(io_err.raw_os_error(), Some(libc::EBADF));
    }
}
