// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The outgoing state machine: begin → iterate* → complete over the
//! registered entries, with rate limiting and the postcopy split.

use log::debug;

use crate::error::Error;
use crate::error::Result;
use crate::registry::IterateStatus;
use crate::registry::MigrateParams;
use crate::registry::PendingBytes;
use crate::registry::StateEntry;
use crate::registry::StateHandler;
use crate::registry::StateRegistry;
use crate::stream::SectionType;
use crate::stream::StreamWriter;

fn put_full_header(w: &mut StreamWriter, ty: SectionType, e: &StateEntry) {
    w.put_section_type(ty);
    w.put_u32(e.section_id());
    w.put_str8(e.idstr());
    w.put_u32(e.instance_id());
    w.put_u32(e.version_id());
}

fn put_part_header(w: &mut StreamWriter, ty: SectionType, e: &StateEntry) {
    w.put_section_type(ty);
    w.put_u32(e.section_id());
}

/// Drives one outgoing migration session over a registry whose entries are
/// frozen for the duration (the registry is read-only once a save begins).
///
/// Callers that stop the VM synchronize CPU state under the VM lock before
/// invoking the completion phases.
pub struct SaveVm<'r> {
    reg: &'r StateRegistry,
    cancelled: bool,
}

impl<'r> SaveVm<'r> {
    /// Fails with [`Error::Blocked`] if any registered device refuses
    /// migration.
    pub fn new(reg: &'r StateRegistry) -> Result<SaveVm<'r>> {
        if let Some((idstr, reason)) = reg.any_blocked() {
            return Err(Error::Blocked(format!("{}: {}", idstr, reason)));
        }
        Ok(SaveVm {
            reg,
            cancelled: false,
        })
    }

    /// Announces parameters to every entry, writes the file header and runs
    /// the setup hook of each iterative entry under a SECTION_START.
    pub fn begin(&mut self, w: &mut StreamWriter, params: &MigrateParams) -> Result<()> {
        for e in self.reg.entries() {
            if let StateHandler::Ops(ops) = e.handler() {
                ops.lock().set_params(params);
            }
        }
        debug!("save begins over {} entries", self.reg.len());

        w.write_header();
        for e in self.reg.entries() {
            let StateHandler::Ops(ops) = e.handler() else {
                continue;
            };
            let mut ops = ops.lock();
            if !ops.is_iterative() {
                continue;
            }
            put_full_header(w, SectionType::Start, e);
            if let Err(err) = ops.live_setup(w) {
                w.set_error(err);
                break;
            }
        }
        w.flush()
    }

    /// Runs one pass over the iterative entries, a SECTION_PART per entry.
    ///
    /// The pass stops at the first entry that still has data (or when the
    /// rate limiter denies further writes) rather than moving on, so a
    /// fast-changing entry cannot starve the entries behind it.
    pub fn iterate(&mut self, w: &mut StreamWriter) -> Result<IterateStatus> {
        let mut all_done = true;
        for e in self.reg.entries() {
            let StateHandler::Ops(ops) = e.handler() else {
                continue;
            };
            let mut ops = ops.lock();
            if !ops.is_iterative() {
                continue;
            }
            if w.rate_limit_exceeded() {
                all_done = false;
                break;
            }
            put_part_header(w, SectionType::Part, e);
            match ops.live_iterate(w) {
                Ok(IterateStatus::Done) => {}
                Ok(IterateStatus::Again) => {
                    all_done = false;
                    break;
                }
                Err(err) => {
                    w.set_error(err);
                    break;
                }
            }
        }
        w.check()?;
        Ok(if all_done {
            IterateStatus::Done
        } else {
            IterateStatus::Again
        })
    }

    /// Completion: SECTION_END for iterative entries, then SECTION_FULL for
    /// every entry with full state. With `in_postcopy` set, postcopiable
    /// entries are skipped here and finished by [`complete_postcopy`] after
    /// the flip, and the EOF marker is withheld.
    ///
    /// [`complete_postcopy`]: Self::complete_postcopy
    pub fn complete_precopy(&mut self, w: &mut StreamWriter, in_postcopy: bool) -> Result<()> {
        self.complete_entries(w, in_postcopy, false)?;
        if !in_postcopy {
            w.put_section_type(SectionType::Eof);
        }
        w.flush()
    }

    /// Finishes the postcopiable entries after the flip and terminates the
    /// stream.
    pub fn complete_postcopy(&mut self, w: &mut StreamWriter) -> Result<()> {
        self.complete_entries(w, false, true)?;
        w.put_section_type(SectionType::Eof);
        w.flush()
    }

    fn complete_entries(
        &mut self,
        w: &mut StreamWriter,
        skip_postcopiable: bool,
        only_postcopiable: bool,
    ) -> Result<()> {
        for e in self.reg.entries() {
            let StateHandler::Ops(ops) = e.handler() else {
                continue;
            };
            let mut ops = ops.lock();
            if !ops.is_iterative() {
                continue;
            }
            if (skip_postcopiable && ops.postcopiable())
                || (only_postcopiable && !ops.postcopiable())
            {
                continue;
            }
            put_part_header(w, SectionType::End, e);
            if let Err(err) = ops.live_complete(w) {
                w.set_error(err);
                break;
            }
        }
        w.check()?;

        for e in self.reg.entries() {
            match e.handler() {
                StateHandler::Ops(ops) => {
                    let mut ops = ops.lock();
                    if !ops.has_full_state() {
                        continue;
                    }
                    if (skip_postcopiable && ops.postcopiable())
                        || (only_postcopiable && !ops.postcopiable())
                    {
                        continue;
                    }
                    put_full_header(w, SectionType::Full, e);
                    if let Err(err) = ops.save(w) {
                        w.set_error(err);
                        break;
                    }
                }
                StateHandler::Schema { desc, state } => {
                    if only_postcopiable {
                        continue;
                    }
                    put_full_header(w, SectionType::Full, e);
                    if let Err(err) = desc.walk_save(&*state.lock(), w) {
                        w.set_error(err);
                        break;
                    }
                }
            }
        }
        w.check()
    }

    /// COLO service: SECTION_END for every iterative entry plus the EOF
    /// marker, written to the live stream each checkpoint round.
    pub fn save_live_state(&mut self, w: &mut StreamWriter) -> Result<()> {
        for e in self.reg.entries() {
            let StateHandler::Ops(ops) = e.handler() else {
                continue;
            };
            let mut ops = ops.lock();
            if !ops.is_iterative() {
                continue;
            }
            put_part_header(w, SectionType::End, e);
            if let Err(err) = ops.live_complete(w) {
                w.set_error(err);
                break;
            }
        }
        w.check()?;
        w.put_section_type(SectionType::Eof);
        w.flush()
    }

    /// COLO service: every full-state entry as a SECTION_FULL plus the EOF
    /// marker, typically into an in-memory buffer.
    pub fn save_device_state(&mut self, w: &mut StreamWriter) -> Result<()> {
        for e in self.reg.entries() {
            match e.handler() {
                StateHandler::Ops(ops) => {
                    let mut ops = ops.lock();
                    if !ops.has_full_state() || ops.is_iterative() {
                        continue;
                    }
                    put_full_header(w, SectionType::Full, e);
                    if let Err(err) = ops.save(w) {
                        w.set_error(err);
                        break;
                    }
                }
                StateHandler::Schema { desc, state } => {
                    put_full_header(w, SectionType::Full, e);
                    if let Err(err) = desc.walk_save(&*state.lock(), w) {
                        w.set_error(err);
                        break;
                    }
                }
            }
        }
        w.check()?;
        w.put_section_type(SectionType::Eof);
        w.flush()
    }

    /// Split estimate of the bytes still to transfer, for scheduling the
    /// postcopy flip point.
    pub fn pending(&self, max_size: u64) -> PendingBytes {
        let mut total = PendingBytes::default();
        for e in self.reg.entries() {
            if let StateHandler::Ops(ops) = e.handler() {
                let ops = ops.lock();
                if ops.is_iterative() {
                    let p = ops.pending(max_size);
                    total.precopy_only += p.precopy_only;
                    total.postcopy += p.postcopy;
                }
            }
        }
        total
    }

    /// Fans out to every entry's cancel hook. Idempotent.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        for e in self.reg.entries() {
            if let StateHandler::Ops(ops) = e.handler() {
                ops.lock().cancel();
            }
        }
    }

    /// Produces one complete precopy stream: begin, iterate to completion,
    /// complete.
    pub fn save(reg: &StateRegistry, w: &mut StreamWriter, params: &MigrateParams) -> Result<()> {
        let mut sv = SaveVm::new(reg)?;
        sv.begin(w, params)?;
        loop {
            match sv.iterate(w)? {
                IterateStatus::Done => break,
                IterateStatus::Again => w.reset_rate_limit(),
            }
        }
        sv.complete_precopy(w, false)
    }
}
