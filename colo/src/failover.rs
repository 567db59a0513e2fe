// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Failover arbitration shared between the coordinator loop and whatever
//! side channel delivers takeover requests.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FailoverStatus {
    None = 0,
    /// A takeover was requested and will be honoured at the next check.
    Require = 1,
    /// Takeover in progress.
    Active = 2,
    /// Requested while device state was mid-load; re-checked after the load
    /// completes.
    Relaunch = 3,
    Completed = 4,
}

impl FailoverStatus {
    fn from_u8(v: u8) -> FailoverStatus {
        match v {
            1 => FailoverStatus::Require,
            2 => FailoverStatus::Active,
            3 => FailoverStatus::Relaunch,
            4 => FailoverStatus::Completed,
            _ => FailoverStatus::None,
        }
    }
}

#[derive(Debug, Default)]
pub struct FailoverState {
    status: AtomicU8,
    vmstate_loading: AtomicBool,
}

impl FailoverState {
    pub fn new() -> FailoverState {
        FailoverState::default()
    }

    pub fn status(&self) -> FailoverStatus {
        FailoverStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Transitions `from` to `to` if the state still is `from`; returns the
    /// state observed before the attempt.
    pub fn set_status(&self, from: FailoverStatus, to: FailoverStatus) -> FailoverStatus {
        match self.status.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(prev) | Err(prev) => FailoverStatus::from_u8(prev),
        }
    }

    pub fn set_vmstate_loading(&self, loading: bool) {
        self.vmstate_loading.store(loading, Ordering::Release);
    }

    pub fn vmstate_loading(&self) -> bool {
        self.vmstate_loading.load(Ordering::Acquire)
    }

    /// A side-channel takeover request. While device state is mid-load the
    /// request is parked and honoured once the load finishes.
    pub fn request(&self) -> FailoverStatus {
        if self.vmstate_loading() {
            self.set_status(FailoverStatus::None, FailoverStatus::Relaunch);
        } else {
            self.set_status(FailoverStatus::None, FailoverStatus::Require);
        }
        self.status()
    }

    /// Promotes a parked request after a load completes; true if one was
    /// parked.
    pub fn take_relaunch(&self) -> bool {
        self.set_status(FailoverStatus::Relaunch, FailoverStatus::Require)
            == FailoverStatus::Relaunch
    }

    pub fn requested(&self) -> bool {
        matches!(
            self.status(),
            FailoverStatus::Require | FailoverStatus::Active
        )
    }

    pub fn complete(&self) {
        self.status
            .store(FailoverStatus::Completed as u8, Ordering::Release);
    }
}
