// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The incoming state machine: parses the section stream, dispatches device
//! sections to registered entries and commands to the channel, and tolerates
//! out-of-order PART/END sections via a per-session load map.

use std::collections::HashMap;
use std::io;
use std::io::Write;
use std::sync::Arc;

use log::debug;
use sync::Mutex;

use crate::command::recv_command;
use crate::command::rp_send;
use crate::command::MigCommand;
use crate::command::RpMessage;
use crate::error::Error;
use crate::error::Result;
use crate::registry::StateHandler;
use crate::registry::StateRegistry;
use crate::stream::SectionType;
use crate::stream::StreamReader;
use crate::stream::StreamWriter;
use crate::stream::MAX_BUFFER_SIZE;

/// Loop-control bits a command may set.
#[derive(Copy, Clone, Debug, Default)]
pub struct LoadControl {
    /// Leave the current loader loop.
    pub quit: bool,
    /// Leave the enclosing loop; consumed one nesting level up and never
    /// propagated past a packaged sub-stream boundary.
    pub quit_parent: bool,
    /// Keep the per-session load map alive after `load` returns, so a
    /// replication session can reuse it next round.
    pub keep_handlers: bool,
}

/// Context handed to external command handlers.
pub struct LoadContext<'a> {
    /// The reverse channel, once OPENRP has been processed.
    pub return_path: Option<&'a Arc<Mutex<StreamWriter>>>,
}

/// Receives the commands the engine does not consume itself (postcopy and
/// COLO). OPENRP, REQACK and PACKAGED never reach the handler.
pub trait CommandHandler: Send {
    fn handle(
        &mut self,
        cmd: MigCommand,
        payload: &[u8],
        ctx: &mut LoadContext,
    ) -> Result<LoadControl>;
}

type ReturnPathOpener = Box<dyn FnMut() -> io::Result<Box<dyn Write + Send>> + Send>;

struct LoadedSection {
    entry_index: usize,
    version_id: u32,
}

/// Drives one incoming migration session against a frozen registry.
///
/// After a clean [`load`](Self::load) the caller runs its post-init hooks
/// (CPU synchronization) under the VM lock.
pub struct LoadVm<'r> {
    reg: &'r StateRegistry,
    handler: Option<Box<dyn CommandHandler>>,
    rp_opener: Option<ReturnPathOpener>,
    return_path: Option<Arc<Mutex<StreamWriter>>>,
    loaded: HashMap<u32, LoadedSection>,
    keep_handlers: bool,
}

impl<'r> LoadVm<'r> {
    pub fn new(reg: &'r StateRegistry) -> LoadVm<'r> {
        LoadVm {
            reg,
            handler: None,
            rp_opener: None,
            return_path: None,
            loaded: HashMap::new(),
            keep_handlers: false,
        }
    }

    /// Installs the receiver for postcopy/COLO commands.
    pub fn set_command_handler(&mut self, handler: Box<dyn CommandHandler>) {
        self.handler = Some(handler);
    }

    /// Installs the transport hook used to open the reverse channel when
    /// OPENRP arrives.
    pub fn set_return_path_opener(&mut self, opener: ReturnPathOpener) {
        self.rp_opener = Some(opener);
    }

    pub fn return_path(&self) -> Option<Arc<Mutex<StreamWriter>>> {
        self.return_path.clone()
    }

    /// Parses a complete stream: header, sections until EOF (or a quitting
    /// command).
    pub fn load(&mut self, r: &mut StreamReader) -> Result<()> {
        r.read_header()?;
        self.main_loop(r)?;
        if !self.keep_handlers {
            self.loaded.clear();
        }
        Ok(())
    }

    /// Runs the section loop on an already-open stream with no header, as
    /// COLO does every checkpoint round.
    pub fn load_main(&mut self, r: &mut StreamReader) -> Result<LoadControl> {
        self.main_loop(r)
    }

    /// Dispatches one device section whose type byte has already been read,
    /// for callers that multiplex their own command handling onto the stream.
    pub fn load_section(&mut self, ty: SectionType, r: &mut StreamReader) -> Result<()> {
        match ty {
            SectionType::Start | SectionType::Full => self.handle_section_start(r),
            SectionType::Part | SectionType::End => self.handle_section_part(r),
            SectionType::Eof | SectionType::Command => Err(Error::Protocol(format!(
                "{:?} is not a device section",
                ty
            ))),
        }
    }

    fn main_loop(&mut self, r: &mut StreamReader) -> Result<LoadControl> {
        let mut control = LoadControl::default();
        loop {
            let ty = r.get_u8()?;
            let ty = SectionType::from_u8(ty)
                .ok_or_else(|| Error::Format(format!("unknown section type {:#04x}", ty)))?;
            match ty {
                SectionType::Eof => break,
                SectionType::Start | SectionType::Full => self.handle_section_start(r)?,
                SectionType::Part | SectionType::End => self.handle_section_part(r)?,
                SectionType::Command => {
                    let c = self.handle_command(r)?;
                    control.keep_handlers |= c.keep_handlers;
                    self.keep_handlers |= c.keep_handlers;
                    if c.quit_parent {
                        control.quit_parent = true;
                        break;
                    }
                    if c.quit {
                        control.quit = true;
                        break;
                    }
                }
            }
        }
        Ok(control)
    }

    fn handle_section_start(&mut self, r: &mut StreamReader) -> Result<()> {
        let section_id = r.get_u32()?;
        let idstr = r.get_str8()?;
        let instance_id = r.get_u32()?;
        let version_id = r.get_u32()?;

        let entry_index = self.reg.find_index(&idstr, instance_id).ok_or_else(|| {
            Error::UnknownSection(format!("{} (instance {})", idstr, instance_id))
        })?;
        let entry = &self.reg.entries()[entry_index];
        if version_id > entry.version_id() {
            return Err(Error::UnsupportedVersion(version_id));
        }

        self.loaded.insert(
            section_id,
            LoadedSection {
                entry_index,
                version_id,
            },
        );
        self.run_loader(entry_index, version_id, r)
    }

    fn handle_section_part(&mut self, r: &mut StreamReader) -> Result<()> {
        let section_id = r.get_u32()?;
        let loaded = self
            .loaded
            .get(&section_id)
            .ok_or_else(|| Error::UnknownSection(format!("section id {}", section_id)))?;
        self.run_loader(loaded.entry_index, loaded.version_id, r)
    }

    fn run_loader(&self, entry_index: usize, version_id: u32, r: &mut StreamReader) -> Result<()> {
        match self.reg.entries()[entry_index].handler() {
            StateHandler::Ops(ops) => ops.lock().load(r, version_id),
            StateHandler::Schema { desc, state } => {
                desc.walk_load(&mut *state.lock(), r, version_id)
            }
        }
    }

    fn handle_command(&mut self, r: &mut StreamReader) -> Result<LoadControl> {
        let (cmd, payload) = recv_command(r)?;
        debug!("incoming command {:?}, {} payload bytes", cmd, payload.len());
        match cmd {
            MigCommand::Invalid => Err(Error::Protocol("invalid command".to_owned())),
            MigCommand::OpenReturnPath => {
                self.open_return_path()?;
                Ok(LoadControl::default())
            }
            MigCommand::ReqAck => {
                if payload.len() != 4 {
                    return Err(Error::Protocol(format!(
                        "REQACK length {} != 4",
                        payload.len()
                    )));
                }
                let rp = self
                    .return_path
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("REQACK without a return path".to_owned()))?;
                rp_send(&mut rp.lock(), RpMessage::Ack, &payload)?;
                Ok(LoadControl::default())
            }
            MigCommand::Packaged => {
                if payload.len() != 4 {
                    return Err(Error::Protocol(format!(
                        "PACKAGED length {} != 4",
                        payload.len()
                    )));
                }
                let declared =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
                self.handle_packaged(declared, r)
            }
            other => {
                let handler = self
                    .handler
                    .as_mut()
                    .ok_or_else(|| Error::Protocol(format!("unhandled command {:?}", other)))?;
                let mut ctx = LoadContext {
                    return_path: self.return_path.as_ref(),
                };
                handler.handle(other, &payload, &mut ctx)
            }
        }
    }

    /// Buffers the declared bytes, wraps them in a synthetic stream and
    /// recurses the main loop on it.
    fn handle_packaged(&mut self, declared: usize, r: &mut StreamReader) -> Result<LoadControl> {
        if declared > MAX_BUFFER_SIZE {
            return Err(Error::Protocol(format!(
                "packaged stream length {} too large",
                declared
            )));
        }
        let mut buf = vec![0u8; declared];
        r.read_exact(&mut buf)?;
        let mut sub = StreamReader::from_buffer(buf);
        let mut control = self.main_loop(&mut sub)?;
        // The quit-parent bit asked to leave the synthetic stream; it stops
        // here and never reaches the outer loop.
        control.quit_parent = false;
        Ok(control)
    }

    fn open_return_path(&mut self) -> Result<()> {
        if self.return_path.is_some() {
            // The source may resend OPENRP; the channel stays as it is.
            return Ok(());
        }
        let opener = self
            .rp_opener
            .as_mut()
            .ok_or_else(|| Error::Protocol("no return path available".to_owned()))?;
        let sink = opener().map_err(Error::Io)?;
        self.return_path = Some(Arc::new(Mutex::new(StreamWriter::new(sink))));
        Ok(())
    }
}
