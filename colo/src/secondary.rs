// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The secondary's side of lock-stepping: receive each checkpoint, apply it
//! with failover deferred, acknowledge, resume.

use std::sync::Arc;

use log::error;
use log::info;
use migration::command::recv_command;
use migration::command::send_command;
use migration::command::MigCommand;
use migration::LoadVm;
use migration::SectionType;
use migration::StateRegistry;
use migration::StreamReader;
use migration::StreamWriter;

use crate::expect_colo_message;
use crate::ColoExitEvent;
use crate::ColoExitReason;
use crate::ColoMode;
use crate::Error;
use crate::FailoverState;
use crate::Result;
use crate::VmController;

enum Round {
    Resumed,
    FailoverRequested,
}

pub struct ColoSecondary<'r> {
    lv: LoadVm<'r>,
    vm: Box<dyn VmController>,
    failover: Arc<FailoverState>,
    checkpoints: u64,
}

impl<'r> ColoSecondary<'r> {
    pub fn new(
        reg: &'r StateRegistry,
        vm: Box<dyn VmController>,
        failover: Arc<FailoverState>,
    ) -> ColoSecondary<'r> {
        ColoSecondary {
            lv: LoadVm::new(reg),
            vm,
            failover,
            checkpoints: 0,
        }
    }

    pub fn checkpoints(&self) -> u64 {
        self.checkpoints
    }

    /// Mirrors the primary's loop until shutdown, failover or error, then
    /// emits the exit event.
    pub fn run(&mut self, r: &mut StreamReader, rp: &mut StreamWriter) -> ColoExitEvent {
        let reason = match self.run_loop(r, rp) {
            Ok(reason) => reason,
            Err(e) => {
                error!("colo secondary: {}", e);
                ColoExitReason::Error
            }
        };
        if let Err(e) = self.vm.stop_block_replication() {
            error!("stop block replication: {:#}", e);
        }
        self.failover.complete();
        ColoExitEvent::emit(ColoMode::Secondary, reason)
    }

    fn run_loop(&mut self, r: &mut StreamReader, rp: &mut StreamWriter) -> Result<ColoExitReason> {
        send_command(rp, MigCommand::ColoCheckpointReady, &[])?;
        self.vm
            .start_block_replication(ColoMode::Secondary)
            .map_err(Error::Vm)?;
        self.vm.start().map_err(Error::Vm)?;

        r.read_header()?;
        loop {
            if self.failover.requested() {
                return Ok(ColoExitReason::Request);
            }
            let ty = r.get_u8()?;
            let ty = SectionType::from_u8(ty).ok_or_else(|| {
                migration::Error::Format(format!("unknown section type {:#04x}", ty))
            })?;
            match ty {
                SectionType::Command => {
                    let (cmd, _payload) = recv_command(r)?;
                    match cmd {
                        MigCommand::ColoCheckpointRequest => {
                            match self.checkpoint(r, rp)? {
                                Round::Resumed => {}
                                Round::FailoverRequested => {
                                    return Ok(ColoExitReason::Request)
                                }
                            }
                        }
                        MigCommand::ColoGuestShutdown => {
                            info!("primary requested guest shutdown");
                            self.vm.shutdown().map_err(Error::Vm)?;
                            return Ok(ColoExitReason::Request);
                        }
                        got => {
                            return Err(Error::UnexpectedMessage {
                                expected: MigCommand::ColoCheckpointRequest,
                                got,
                            })
                        }
                    }
                }
                SectionType::Eof => {
                    return Err(Error::Migrate(migration::Error::Protocol(
                        "stream ended outside a checkpoint".to_owned(),
                    )))
                }
                // The priming SECTION_STARTs from the primary's begin phase.
                section => self.lv.load_section(section, r).map_err(Error::Migrate)?,
            }
        }
    }

    fn checkpoint(&mut self, r: &mut StreamReader, rp: &mut StreamWriter) -> Result<Round> {
        self.vm.stop().map_err(Error::Vm)?;

        expect_colo_message(r, MigCommand::ColoVmstateSend)?;
        // Live state (RAM) streams directly, terminated by its EOF marker.
        // The load map stays alive between rounds.
        self.lv.load_main(r)?;

        let size_payload = expect_colo_message(r, MigCommand::ColoVmstateSize)?;
        if size_payload.len() != 8 {
            return Err(Error::Migrate(migration::Error::Protocol(format!(
                "VMSTATE_SIZE payload length {} != 8",
                size_payload.len()
            ))));
        }
        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&size_payload);
        let size = u64::from_be_bytes(size_bytes) as usize;
        let mut device_state = vec![0u8; size];
        r.read_exact(&mut device_state)?;

        send_command(rp, MigCommand::ColoVmstateReceived, &[])?;

        // Device state applies under the VM lock; failover requests arriving
        // now are parked until the apply completes.
        self.failover.set_vmstate_loading(true);
        let mut sub = StreamReader::from_buffer(device_state);
        let apply = self.lv.load_main(&mut sub);
        self.failover.set_vmstate_loading(false);
        apply?;

        self.vm.block_checkpoint().map_err(Error::Vm)?;
        send_command(rp, MigCommand::ColoVmstateLoaded, &[])?;
        self.checkpoints += 1;

        if self.failover.take_relaunch() {
            info!("honouring failover request parked during vmstate load");
            return Ok(Round::FailoverRequested);
        }

        self.vm.start().map_err(Error::Vm)?;
        Ok(Round::Resumed)
    }
}
