// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;

use remain::sorted;
use thiserror::Error as ThisError;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("migration blocked by device {0}")]
    Blocked(String),
    #[error("migration cancelled")]
    Cancelled,
    #[error("bad stream format: {0}")]
    Format(String),
    #[error("postcopy unsupported on this host: {0}")]
    HostUnsupported(String),
    #[error("stream i/o: {0}")]
    Io(#[from] io::Error),
    #[error("allocation failed")]
    Memory,
    #[error("obsolete stream version {0}")]
    ObsoleteVersion(u32),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("unknown section {0}")]
    UnknownSection(String),
    #[error("unsupported stream version {0}")]
    UnsupportedVersion(u32),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Duplicates the error so the sticky latch can replay the first failure
    /// to every later caller. `io::Error` is not `Clone`; its kind and text
    /// are preserved.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::Blocked(s) => Error::Blocked(s.clone()),
            Error::Cancelled => Error::Cancelled,
            Error::Format(s) => Error::Format(s.clone()),
            Error::HostUnsupported(s) => Error::HostUnsupported(s.clone()),
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::Memory => Error::Memory,
            Error::ObsoleteVersion(v) => Error::ObsoleteVersion(*v),
            Error::Protocol(s) => Error::Protocol(s.clone()),
            Error::UnknownSection(s) => Error::UnknownSection(s.clone()),
            Error::UnsupportedVersion(v) => Error::UnsupportedVersion(*v),
        }
    }
}
