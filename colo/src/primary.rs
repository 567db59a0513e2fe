// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The primary's side of lock-stepping: prime the stream, wait for the
//! secondary, then run stop-diff-ship-ack-resume transactions forever.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use log::error;
use log::info;
use migration::command::send_command;
use migration::command::MigCommand;
use migration::BufferChannel;
use migration::MigrateParams;
use migration::SaveVm;
use migration::StateRegistry;
use migration::StreamReader;
use migration::StreamWriter;

use crate::expect_colo_message;
use crate::ColoConfig;
use crate::ColoExitEvent;
use crate::ColoExitReason;
use crate::ColoMode;
use crate::Error;
use crate::FailoverState;
use crate::Result;
use crate::VmController;

enum Round {
    Resumed,
    ShutdownRequested,
}

pub struct ColoPrimary<'r> {
    sv: SaveVm<'r>,
    vm: Box<dyn VmController>,
    config: ColoConfig,
    failover: Arc<FailoverState>,
    buffer: BufferChannel,
    buffer_writer: StreamWriter,
    checkpoints: u64,
}

impl<'r> ColoPrimary<'r> {
    pub fn new(
        reg: &'r StateRegistry,
        vm: Box<dyn VmController>,
        config: ColoConfig,
        failover: Arc<FailoverState>,
    ) -> Result<ColoPrimary<'r>> {
        let sv = SaveVm::new(reg)?;
        let (buffer_writer, buffer) = StreamWriter::to_buffer();
        Ok(ColoPrimary {
            sv,
            vm,
            config,
            failover,
            buffer,
            buffer_writer,
            checkpoints: 0,
        })
    }

    pub fn checkpoints(&self) -> u64 {
        self.checkpoints
    }

    /// Runs lock-stepping over an established channel pair until shutdown,
    /// failover or error, then emits the exit event.
    pub fn run(&mut self, w: &mut StreamWriter, rp: &mut StreamReader) -> ColoExitEvent {
        let reason = match self.run_loop(w, rp) {
            Ok(reason) => reason,
            Err(e) => {
                error!("colo primary: {}", e);
                ColoExitReason::Error
            }
        };
        if let Err(e) = self.vm.stop_block_replication() {
            error!("stop block replication: {:#}", e);
        }
        self.failover.complete();
        ColoExitEvent::emit(ColoMode::Primary, reason)
    }

    fn run_loop(&mut self, w: &mut StreamWriter, rp: &mut StreamReader) -> Result<ColoExitReason> {
        self.vm.enable_packet_buffering().map_err(Error::Vm)?;

        // Prime the stream: header plus the SECTION_STARTs the per-round live
        // state will refer back to.
        self.sv.begin(w, &MigrateParams::default())?;

        expect_colo_message(rp, MigCommand::ColoCheckpointReady)?;
        info!("secondary is ready, starting lock-stepping");

        self.vm
            .start_block_replication(ColoMode::Primary)
            .map_err(Error::Vm)?;
        self.vm.start().map_err(Error::Vm)?;

        loop {
            let wakeup = Instant::now() + Duration::from_millis(self.config.checkpoint_delay_ms);
            while Instant::now() < wakeup {
                if self.failover.requested() {
                    return Ok(ColoExitReason::Request);
                }
                let left = wakeup.saturating_duration_since(Instant::now());
                thread::sleep(left.min(Duration::from_millis(100)));
            }
            if self.failover.requested() {
                return Ok(ColoExitReason::Request);
            }
            match self.checkpoint_transaction(w, rp)? {
                Round::Resumed => {}
                Round::ShutdownRequested => return Ok(ColoExitReason::Request),
            }
        }
    }

    fn checkpoint_transaction(
        &mut self,
        w: &mut StreamWriter,
        rp: &mut StreamReader,
    ) -> Result<Round> {
        send_command(w, MigCommand::ColoCheckpointRequest, &[])?;
        self.buffer.reset();

        // The implementation stops the guest under the VM lock; a pending
        // shutdown request switches this round into shutdown-after-ship mode.
        self.vm.stop().map_err(Error::Vm)?;
        let shutdown = self.vm.shutdown_requested();
        self.vm.block_checkpoint().map_err(Error::Vm)?;

        send_command(w, MigCommand::ColoVmstateSend, &[])?;
        self.sv.save_live_state(w)?;
        self.sv.save_device_state(&mut self.buffer_writer)?;

        let device_state = self.buffer.contents();
        send_command(
            w,
            MigCommand::ColoVmstateSize,
            &(device_state.len() as u64).to_be_bytes(),
        )?;
        w.put_raw(&device_state);
        w.flush()?;

        expect_colo_message(rp, MigCommand::ColoVmstateReceived)?;
        expect_colo_message(rp, MigCommand::ColoVmstateLoaded)?;

        self.vm.release_buffered_packets().map_err(Error::Vm)?;
        self.checkpoints += 1;

        if shutdown {
            self.vm.stop_block_replication().map_err(Error::Vm)?;
            send_command(w, MigCommand::ColoGuestShutdown, &[])?;
            info!("guest shutdown shipped to secondary");
            return Ok(Round::ShutdownRequested);
        }

        self.vm.start().map_err(Error::Vm)?;
        Ok(Round::Resumed)
    }
}
