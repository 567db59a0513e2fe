// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Coarse-grain lock-stepping: continuous replication driven by periodic
//! checkpoint transactions over the migration stream, with failover when
//! either peer disconnects.

pub mod failover;
mod primary;
mod secondary;

use log::info;
use migration::command::recv_command;
use migration::command::MigCommand;
use migration::SectionType;
use migration::StreamReader;
use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error as ThisError;

pub use failover::FailoverState;
pub use failover::FailoverStatus;
pub use primary::ColoPrimary;
pub use secondary::ColoSecondary;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("failover: {0}")]
    Failover(String),
    #[error("migration stream: {0}")]
    Migrate(#[from] migration::Error),
    #[error("expected {expected:?}, got {got:?}")]
    UnexpectedMessage {
        expected: MigCommand,
        got: MigCommand,
    },
    #[error("vm control: {0:#}")]
    Vm(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColoMode {
    Primary,
    Secondary,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColoExitReason {
    Error,
    Request,
}

/// Structured event emitted when a peer leaves lock-stepping.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ColoExitEvent {
    pub mode: ColoMode,
    pub reason: ColoExitReason,
}

impl ColoExitEvent {
    pub(crate) fn emit(mode: ColoMode, reason: ColoExitReason) -> ColoExitEvent {
        let event = ColoExitEvent { mode, reason };
        info!(
            "colo exit: {}",
            serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event))
        );
        event
    }
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub struct ColoConfig {
    /// Minimum delay between checkpoint transactions, in milliseconds.
    pub checkpoint_delay_ms: u64,
}

impl Default for ColoConfig {
    fn default() -> Self {
        ColoConfig {
            checkpoint_delay_ms: 20000,
        }
    }
}

/// Guest and replication control surface the coordinator drives. Implemented
/// by the VM layer; `stop`/`start` and `block_checkpoint` are called with the
/// VM lock held by the implementation.
pub trait VmController: Send {
    fn stop(&mut self) -> anyhow::Result<()>;
    fn start(&mut self) -> anyhow::Result<()>;
    /// Turns on the packet-buffering filters that hold guest egress between
    /// checkpoints.
    fn enable_packet_buffering(&mut self) -> anyhow::Result<()>;
    /// Releases the packets buffered since the previous checkpoint.
    fn release_buffered_packets(&mut self) -> anyhow::Result<()>;
    fn start_block_replication(&mut self, mode: ColoMode) -> anyhow::Result<()>;
    fn stop_block_replication(&mut self) -> anyhow::Result<()>;
    fn block_checkpoint(&mut self) -> anyhow::Result<()>;
    /// Whether a guest shutdown was requested since the last checkpoint.
    fn shutdown_requested(&mut self) -> bool {
        false
    }
    /// Shuts the local guest down (secondary, on GUEST_SHUTDOWN).
    fn shutdown(&mut self) -> anyhow::Result<()>;
}

/// Reads one COMMAND section and insists on a specific command, returning its
/// payload.
pub fn expect_colo_message(r: &mut StreamReader, expected: MigCommand) -> Result<Vec<u8>> {
    let ty = r.get_u8()?;
    if SectionType::from_u8(ty) != Some(SectionType::Command) {
        return Err(Error::Migrate(migration::Error::Protocol(format!(
            "expected a command section, got type {:#04x}",
            ty
        ))));
    }
    let (cmd, payload) = recv_command(r)?;
    if cmd != expected {
        return Err(Error::UnexpectedMessage {
            expected,
            got: cmd,
        });
    }
    Ok(payload)
}
