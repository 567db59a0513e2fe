// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wrapper around the kernel user-fault interface. On registration the kernel
//! reports which resolve operations it grants; postcopy needs wake, copy and
//! zero-page installation, so anything less fails the capability check.

use remain::sorted;
use thiserror::Error;

#[sorted]
#[derive(Error, Debug)]
pub enum UffdError {
    #[error("userfaultfd range grants insufficient ioctls: {0}")]
    MissingIoctls(String),
    #[error("userfaultfd is not supported by this host: {0}")]
    NotSupported(String),
    #[error("userfaultfd system error: {0}")]
    SystemError(String),
}

pub type Result<T> = std::result::Result<T, UffdError>;

/// Events surfaced to the fault thread.
#[derive(Debug)]
pub enum UffdEvent {
    Pagefault { addr: usize },
    Remove { start: usize, end: usize },
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        use std::os::fd::AsRawFd;
        use std::os::fd::RawFd;

        use userfaultfd::IoctlFlags;
        use userfaultfd::Uffd;
        use userfaultfd::UffdBuilder;

        pub struct Userfaultfd {
            uffd: Uffd,
        }

        fn build(user_mode_only: bool) -> std::result::Result<Uffd, userfaultfd::Error> {
            UffdBuilder::new()
                .close_on_exec(true)
                .non_blocking(true)
                .user_mode_only(user_mode_only)
                .create()
        }

        impl Userfaultfd {
            /// Whether the host offers a usable user-fault channel.
            pub fn supported() -> bool {
                Userfaultfd::new().is_ok()
            }

            pub fn new() -> Result<Userfaultfd> {
                // Handling kernel-originated faults needs privilege on hosts
                // with vm.unprivileged_userfaultfd = 0; fall back to
                // user-mode-only faults rather than failing outright.
                let uffd = build(false)
                    .or_else(|_| build(true))
                    .map_err(|e| UffdError::NotSupported(e.to_string()))?;
                Ok(Userfaultfd { uffd })
            }

            /// Registers a range for missing-page events and verifies the
            /// kernel grants atomic placement on it.
            ///
            /// # Safety
            ///
            /// The range must stay mapped until it is unregistered.
            pub unsafe fn register(&self, addr: usize, len: usize) -> Result<()> {
                let ioctls = self
                    .uffd
                    .register(addr as *mut libc::c_void, len)
                    .map_err(|e| UffdError::SystemError(e.to_string()))?;
                let required = IoctlFlags::WAKE | IoctlFlags::COPY | IoctlFlags::ZEROPAGE;
                if !ioctls.contains(required) {
                    return Err(UffdError::MissingIoctls(format!("{:?}", ioctls)));
                }
                Ok(())
            }

            /// Unregisters a range, waking any thread stalled on it.
            pub fn unregister(&self, addr: usize, len: usize) -> Result<()> {
                self.uffd
                    .unregister(addr as *mut libc::c_void, len)
                    .map_err(|e| UffdError::SystemError(e.to_string()))
            }

            /// Atomically installs `len` bytes from `src` at `dst`, waking
            /// stalled faulters when `wake` is set.
            pub fn copy(&self, src: usize, dst: usize, len: usize, wake: bool) -> Result<()> {
                // Safe because the caller stages `src` in memory it owns for
                // the duration of the call.
                unsafe {
                    self.uffd
                        .copy(src as *const libc::c_void, dst as *mut libc::c_void, len, wake)
                }
                .map(|_| ())
                .map_err(|e| UffdError::SystemError(e.to_string()))
            }

            /// Atomically installs a zero page at `dst`.
            pub fn zeropage(&self, dst: usize, len: usize, wake: bool) -> Result<()> {
                self.uffd
                    .zeropage(dst as *mut libc::c_void, len, wake)
                    .map(|_| ())
                    .map_err(|e| UffdError::SystemError(e.to_string()))
            }

            pub fn wake(&self, addr: usize, len: usize) -> Result<()> {
                self.uffd
                    .wake(addr as *mut libc::c_void, len)
                    .map_err(|e| UffdError::SystemError(e.to_string()))
            }

            /// Non-blocking read of the next pending event. `Ok(None)` means
            /// the queue is drained.
            pub fn read_event(&self) -> Result<Option<UffdEvent>> {
                match self.uffd.read_event() {
                    Ok(Some(userfaultfd::Event::Pagefault { addr, .. })) => {
                        Ok(Some(UffdEvent::Pagefault { addr: addr as usize }))
                    }
                    Ok(Some(userfaultfd::Event::Remove { start, end })) => {
                        Ok(Some(UffdEvent::Remove {
                            start: start as usize,
                            end: end as usize,
                        }))
                    }
                    // Fork/remap/unmap never occur here: the fault thread is
                    // the only consumer and guest mappings are static for the
                    // life of the session.
                    Ok(Some(_)) => Ok(None),
                    Ok(None) => Ok(None),
                    Err(userfaultfd::Error::SystemError(errno))
                        if errno as i32 == libc::EAGAIN =>
                    {
                        Ok(None)
                    }
                    Err(e) => Err(UffdError::SystemError(e.to_string())),
                }
            }
        }

        impl AsRawFd for Userfaultfd {
            fn as_raw_fd(&self) -> RawFd {
                self.uffd.as_raw_fd()
            }
        }
    } else {
        use std::os::fd::AsRawFd;
        use std::os::fd::RawFd;

        /// Hosts without a user-fault kernel interface: construction always
        /// fails, so the remaining methods are unreachable.
        pub struct Userfaultfd;

        impl Userfaultfd {
            pub fn supported() -> bool {
                false
            }

            pub fn new() -> Result<Userfaultfd> {
                Err(UffdError::NotSupported(
                    "no user-fault kernel interface on this platform".to_owned(),
                ))
            }

            /// # Safety
            ///
            /// Never reachable; `new` always fails on this platform.
            pub unsafe fn register(&self, _addr: usize, _len: usize) -> Result<()> {
                Err(UffdError::NotSupported("unreachable".to_owned()))
            }

            pub fn unregister(&self, _addr: usize, _len: usize) -> Result<()> {
                Err(UffdError::NotSupported("unreachable".to_owned()))
            }

            pub fn copy(&self, _src: usize, _dst: usize, _len: usize, _wake: bool) -> Result<()> {
                Err(UffdError::NotSupported("unreachable".to_owned()))
            }

            pub fn zeropage(&self, _dst: usize, _len: usize, _wake: bool) -> Result<()> {
                Err(UffdError::NotSupported("unreachable".to_owned()))
            }

            pub fn wake(&self, _addr: usize, _len: usize) -> Result<()> {
                Err(UffdError::NotSupported("unreachable".to_owned()))
            }

            pub fn read_event(&self) -> Result<Option<UffdEvent>> {
                Ok(None)
            }
        }

        impl AsRawFd for Userfaultfd {
            fn as_raw_fd(&self) -> RawFd {
                -1
            }
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use base::pagesize;
    use base::MemoryMapping;

    use super::*;

    #[test]
    fn register_and_place() {
        let Ok(uffd) = Userfaultfd::new() else {
            // The host denies userfaultfd (permissions or kernel config);
            // nothing to exercise.
            return;
        };
        let psize = pagesize();
        let mapping = MemoryMapping::new(2 * psize).unwrap();
        let addr = mapping.as_ptr() as usize;
        unsafe { uffd.register(addr, 2 * psize) }.unwrap();

        // Zero-page placement, then a data copy into the second page.
        uffd.zeropage(addr, psize, false).unwrap();
        let staging = MemoryMapping::new(psize).unwrap();
        staging.write_slice(&[0x5a; 8], 0).unwrap();
        uffd.copy(staging.as_ptr() as usize, addr + psize, psize, false)
            .unwrap();

        let mut buf = [0u8; 8];
        mapping.read_slice(&mut buf, psize).unwrap();
        assert_eq!(buf, [0x5a; 8]);

        uffd.unregister(addr, 2 * psize).unwrap();
    }
}
