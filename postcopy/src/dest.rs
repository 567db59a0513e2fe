// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Destination side of postcopy: the one-way state machine driven by incoming
//! commands, the fault thread that turns missing-page faults into return-path
//! requests, and atomic page placement.

use std::io;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use anyhow::Context;
use base::pagesize;
use base::Event;
use base::MemoryMapping;
use base::WaitContext;
use log::error;
use log::info;
use log::warn;
use migration::command::encode_page_request;
use migration::command::rp_send;
use migration::command::MigCommand;
use migration::CommandHandler;
use migration::Error;
use migration::LoadContext;
use migration::LoadControl;
use migration::Result;
use migration::StreamWriter;
use sync::Mutex;
use vm_memory::GuestRam;
use vm_memory::RamBlock;

use crate::userfaultfd::UffdEvent;
use crate::userfaultfd::Userfaultfd;

/// Session state; transitions are monotonic and one-way, and END is terminal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IncomingState {
    None,
    Advise,
    Listening,
    Running,
    End,
}

fn ram_error(e: vm_memory::Error) -> Error {
    match e {
        vm_memory::Error::Madvise { err, .. } | vm_memory::Error::Mmap { err, .. } => {
            Error::Io(err.into())
        }
        other => Error::Protocol(other.to_string()),
    }
}

fn uffd_error(e: crate::userfaultfd::UffdError) -> Error {
    Error::HostUnsupported(e.to_string())
}

/// A decoded DISCARD message: runs of pages to evict from one block.
#[derive(Debug, PartialEq, Eq)]
pub struct RamDiscard {
    pub name: String,
    /// `(first_page, page_count)` runs.
    pub runs: Vec<(u64, u64)>,
}

/// Decodes the DISCARD payload:
/// `{version u8, first_bit_offset u8, name_len u8, name, N x {word be64, mask be64}}`.
/// Bit `b` of word `w` names page `w * 64 + b - first_bit_offset`.
pub fn parse_discard(payload: &[u8]) -> Result<RamDiscard> {
    if payload.len() < 3 {
        return Err(Error::Protocol("discard message truncated".to_owned()));
    }
    let version = payload[0];
    if version != crate::source::DISCARD_VERSION {
        return Err(Error::Protocol(format!(
            "discard version {} unsupported",
            version
        )));
    }
    let first_bit_offset = payload[1];
    if first_bit_offset >= 64 {
        return Err(Error::Protocol(format!(
            "first bit offset {} out of range",
            first_bit_offset
        )));
    }
    let name_len = payload[2] as usize;
    if payload.len() < 3 + name_len {
        return Err(Error::Protocol("discard name truncated".to_owned()));
    }
    let name = String::from_utf8(payload[3..3 + name_len].to_vec())
        .map_err(|_| Error::Format("RAM block name is not utf-8".to_owned()))?;

    let pairs = &payload[3 + name_len..];
    if pairs.len() % 16 != 0 {
        return Err(Error::Protocol(format!(
            "discard pair bytes {} not a multiple of 16",
            pairs.len()
        )));
    }

    let mut runs: Vec<(u64, u64)> = Vec::new();
    for pair in pairs.chunks_exact(16) {
        let mut word = [0u8; 8];
        word.copy_from_slice(&pair[..8]);
        let word = u64::from_be_bytes(word);
        let mut mask = [0u8; 8];
        mask.copy_from_slice(&pair[8..]);
        let mask = u64::from_be_bytes(mask);

        if word == 0 && first_bit_offset > 0 && mask & ((1u64 << first_bit_offset) - 1) != 0 {
            return Err(Error::Protocol(
                "discard bits below the start of the block".to_owned(),
            ));
        }
        for bit in 0..64u64 {
            if mask & (1 << bit) == 0 {
                continue;
            }
            let page = word * 64 + bit - first_bit_offset as u64;
            match runs.last_mut() {
                Some((start, count)) if *start + *count == page => *count += 1,
                _ => runs.push((page, 1)),
            }
        }
    }
    Ok(RamDiscard { name, runs })
}

/// The destination-side postcopy session.
pub struct PostcopyIncoming {
    ram: Arc<GuestRam>,
    state: IncomingState,
    /// Resume the guest on RUN; when disabled the guest stays paused.
    autostart: bool,
    run_hook: Option<Box<dyn FnMut() + Send>>,
    uffd: Option<Arc<Userfaultfd>>,
    fault_thread: Option<JoinHandle<()>>,
    quit_evt: Option<Event>,
    scratch: MemoryMapping,
    target_page_size: usize,
}

impl PostcopyIncoming {
    pub fn new(ram: Arc<GuestRam>) -> Result<PostcopyIncoming> {
        let scratch = MemoryMapping::new(pagesize()).map_err(|_| Error::Memory)?;
        Ok(PostcopyIncoming {
            ram,
            state: IncomingState::None,
            autostart: true,
            run_hook: None,
            uffd: None,
            fault_thread: None,
            quit_evt: None,
            scratch,
            target_page_size: pagesize(),
        })
    }

    pub fn state(&self) -> IncomingState {
        self.state
    }

    pub fn set_autostart(&mut self, autostart: bool) {
        self.autostart = autostart;
    }

    /// Installed by the VM layer; invoked when RUN resumes the guest.
    pub fn set_run_hook(&mut self, hook: Box<dyn FnMut() + Send>) {
        self.run_hook = Some(hook);
    }

    fn expect_state(&self, want: IncomingState, cmd: &str) -> Result<()> {
        if self.state != want {
            return Err(Error::Protocol(format!(
                "{} received in state {:?}",
                cmd, self.state
            )));
        }
        Ok(())
    }

    fn handle_advise(&mut self, payload: &[u8]) -> Result<LoadControl> {
        self.expect_state(IncomingState::None, "ADVISE")?;
        match payload.len() {
            0 => {}
            16 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&payload[..8]);
                let remote_page_size = u64::from_be_bytes(buf);
                buf.copy_from_slice(&payload[8..]);
                let target_page_size = u64::from_be_bytes(buf);
                let host_page_size = pagesize() as u64;
                if target_page_size > host_page_size {
                    return Err(Error::HostUnsupported(format!(
                        "target page size {} exceeds host page size {}",
                        target_page_size, host_page_size
                    )));
                }
                if remote_page_size != host_page_size {
                    warn!(
                        "source RAM page size {} differs from host {}",
                        remote_page_size, host_page_size
                    );
                }
                self.target_page_size = target_page_size as usize;
            }
            n => {
                return Err(Error::Protocol(format!("ADVISE length {} invalid", n)));
            }
        }
        if !Userfaultfd::supported() {
            return Err(Error::HostUnsupported(
                "no usable user-fault channel".to_owned(),
            ));
        }

        // Drop whatever precopy or stale contents the blocks hold and force
        // standard-sized pages so placement is one page at a time.
        for block in self.ram.blocks() {
            block.discard_all().map_err(ram_error)?;
            block.set_huge_pages(false).map_err(ram_error)?;
        }
        self.state = IncomingState::Advise;
        info!("postcopy advised, {} RAM blocks prepared", self.ram.blocks().len());
        Ok(LoadControl::default())
    }

    fn handle_discard(&mut self, payload: &[u8]) -> Result<LoadControl> {
        self.expect_state(IncomingState::Advise, "DISCARD")?;
        let discard = parse_discard(payload)?;
        let block = self
            .ram
            .find(&discard.name)
            .ok_or_else(|| {
                Error::Protocol(format!("discard for unknown RAM block {}", discard.name))
            })?
            .clone();
        let page_size = block.page_size();
        for (first_page, count) in &discard.runs {
            block
                .discard_range(*first_page as usize * page_size, *count as usize * page_size)
                .map_err(ram_error)?;
        }
        Ok(LoadControl::default())
    }

    fn handle_listen(&mut self, ctx: &mut LoadContext) -> Result<LoadControl> {
        self.expect_state(IncomingState::Advise, "LISTEN")?;
        let return_path = ctx
            .return_path
            .cloned()
            .ok_or_else(|| Error::Protocol("LISTEN before the return path is open".to_owned()))?;

        let uffd = Arc::new(Userfaultfd::new().map_err(uffd_error)?);
        for block in self.ram.blocks() {
            // Safe because blocks stay mapped until END teardown unregisters
            // them.
            unsafe { uffd.register(block.host_addr(), block.len()) }.map_err(uffd_error)?;
        }

        let quit_evt = Event::new().map_err(|e| Error::Io(e.into()))?;
        let thread_quit = quit_evt.try_clone().map_err(|e| Error::Io(e.into()))?;
        let thread_uffd = Arc::clone(&uffd);
        let thread_ram = Arc::clone(&self.ram);
        let join = thread::Builder::new()
            .name("postcopy_fault".to_owned())
            .spawn(move || {
                if let Err(e) = fault_thread(thread_uffd, thread_ram, return_path, thread_quit) {
                    error!("postcopy fault thread exited with error: {:#}", e);
                }
            })
            .map_err(Error::Io)?;

        self.uffd = Some(uffd);
        self.quit_evt = Some(quit_evt);
        self.fault_thread = Some(join);
        self.state = IncomingState::Listening;
        info!("postcopy listening for page faults");
        Ok(LoadControl::default())
    }

    fn handle_run(&mut self) -> Result<LoadControl> {
        self.expect_state(IncomingState::Listening, "RUN")?;
        self.state = IncomingState::Running;
        if self.autostart {
            if let Some(hook) = self.run_hook.as_mut() {
                hook();
            }
            info!("postcopy running, guest resumed");
        } else {
            info!("postcopy running, autostart disabled, guest stays paused");
        }
        // The command loop that delivered RUN is done; the listen thread owns
        // the stream from here.
        Ok(LoadControl {
            quit: true,
            ..Default::default()
        })
    }

    fn handle_end(&mut self, payload: &[u8]) -> Result<LoadControl> {
        self.expect_state(IncomingState::Running, "END")?;
        if payload.len() != 1 {
            return Err(Error::Protocol(format!(
                "END length {} != 1",
                payload.len()
            )));
        }
        let status = payload[0];
        self.state = IncomingState::End;
        self.teardown()?;
        if status != 0 {
            return Err(Error::Protocol(format!(
                "source ended postcopy with failure status {}",
                status
            )));
        }
        info!("postcopy complete");
        Ok(LoadControl {
            quit: true,
            ..Default::default()
        })
    }

    /// Stops the fault thread and releases the fault channel. Signal the quit
    /// event first and join before dropping the uffd; the thread must never
    /// see its fd close underneath it.
    fn teardown(&mut self) -> Result<()> {
        if let Some(quit_evt) = self.quit_evt.take() {
            quit_evt.write(1).map_err(|e| Error::Io(e.into()))?;
        }
        if let Some(join) = self.fault_thread.take() {
            if join.join().is_err() {
                error!("postcopy fault thread panicked");
            }
        }
        if let Some(uffd) = self.uffd.take() {
            for block in self.ram.blocks() {
                if let Err(e) = uffd.unregister(block.host_addr(), block.len()) {
                    warn!("unregister {}: {}", block.name(), e);
                }
                if let Err(e) = block.set_huge_pages(true) {
                    warn!("restore huge pages on {}: {}", block.name(), e);
                }
            }
        }
        Ok(())
    }

    /// Atomically installs one page at `host_addr`, waking any thread stalled
    /// on it. Non-zero pages are staged through the scratch page.
    pub fn place_page(&self, host_addr: usize, data: &[u8], all_zero: bool) -> Result<()> {
        let uffd = self
            .uffd
            .as_ref()
            .ok_or_else(|| Error::Protocol("page placement before LISTEN".to_owned()))?;
        let page_size = self.target_page_size;
        let (_, offset) = self
            .ram
            .resolve_host_addr(host_addr)
            .ok_or_else(|| {
                Error::Protocol(format!("placement outside guest RAM: {:#x}", host_addr))
            })?;
        if offset % page_size != 0 {
            return Err(Error::Protocol(format!(
                "placement not page aligned: {:#x}",
                host_addr
            )));
        }
        if all_zero {
            uffd.zeropage(host_addr, page_size, true)
                .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
        } else {
            if data.len() != page_size {
                return Err(Error::Protocol(format!(
                    "page payload length {} != {}",
                    data.len(),
                    page_size
                )));
            }
            self.scratch
                .write_slice(data, 0)
                .map_err(|_| Error::Memory)?;
            uffd.copy(self.scratch.as_ptr() as usize, host_addr, page_size, true)
                .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
        }
        Ok(())
    }
}

impl Drop for PostcopyIncoming {
    fn drop(&mut self) {
        // An aborted session still has a live fault thread to stop.
        if self.fault_thread.is_some() {
            if let Err(e) = self.teardown() {
                error!("postcopy teardown on drop: {}", e);
            }
        }
    }
}

/// Adapter installing a shared [`PostcopyIncoming`] as the loadvm command
/// handler.
pub struct PostcopyHandler(pub Arc<Mutex<PostcopyIncoming>>);

impl CommandHandler for PostcopyHandler {
    fn handle(
        &mut self,
        cmd: MigCommand,
        payload: &[u8],
        ctx: &mut LoadContext,
    ) -> Result<LoadControl> {
        let mut incoming = self.0.lock();
        match cmd {
            MigCommand::PostcopyAdvise => incoming.handle_advise(payload),
            MigCommand::PostcopyRamDiscard => incoming.handle_discard(payload),
            MigCommand::PostcopyListen => incoming.handle_listen(ctx),
            MigCommand::PostcopyRun => incoming.handle_run(),
            MigCommand::PostcopyEnd => incoming.handle_end(payload),
            other => Err(Error::Protocol(format!(
                "unexpected command {:?} on a postcopy channel",
                other
            ))),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Token {
    Uffd,
    Quit,
}

/// Waits on the fault channel and the quit event. Each missing-page fault is
/// resolved to `(block, page offset)` and forwarded as a request-pages
/// message, with the block name elided when it repeats.
fn fault_thread(
    uffd: Arc<Userfaultfd>,
    ram: Arc<GuestRam>,
    return_path: Arc<Mutex<StreamWriter>>,
    quit_evt: Event,
) -> anyhow::Result<()> {
    let wait_ctx: WaitContext<Token> =
        WaitContext::build_with(&[(&*uffd, Token::Uffd), (&quit_evt, Token::Quit)]);
    let mut last_block: Option<String> = None;

    'poll: loop {
        let events = wait_ctx.wait().context("wait on fault events")?;
        for event in events.iter() {
            match event.token {
                Token::Quit => {
                    let _ = quit_evt.read();
                    break 'poll;
                }
                Token::Uffd => {
                    // The fault queue is edge-style; drain it completely.
                    while let Some(uffd_event) =
                        uffd.read_event().context("read userfaultfd event")?
                    {
                        let UffdEvent::Pagefault { addr } = uffd_event else {
                            continue;
                        };
                        request_page(&ram, &return_path, addr, &mut last_block)
                            .context("request page from source")?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn request_page(
    ram: &GuestRam,
    return_path: &Mutex<StreamWriter>,
    addr: usize,
    last_block: &mut Option<String>,
) -> anyhow::Result<()> {
    let (block, offset): (&Arc<RamBlock>, usize) = ram
        .resolve_host_addr(addr)
        .with_context(|| format!("fault outside guest RAM: {:#x}", addr))?;
    let page_offset = offset - offset % block.page_size();

    let name = if last_block.as_deref() == Some(block.name()) {
        None
    } else {
        *last_block = Some(block.name().to_owned());
        Some(block.name())
    };
    let (msg, payload) =
        encode_page_request(name, page_offset as u64, block.page_size() as u32);
    let mut w = return_path.lock();
    rp_send(&mut w, msg, &payload).context("send page request")?;
    Ok(())
}
