// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Source side of the postcopy protocol: command sequencing and the compact
//! page-discard messages.

use migration::command::send_command;
use migration::command::MigCommand;
use migration::Error;
use migration::Result;
use migration::StreamWriter;
use vm_memory::PageBitmap;

/// Discard message encoding version.
pub const DISCARD_VERSION: u8 = 0;

/// Cap on pairs per DISCARD message, bounding worst-case receiver memory.
pub const MAX_DISCARDS_PER_COMMAND: usize = 12;

/// Accumulates `(word_index, mask)` pairs for one RAM block and flushes a
/// DISCARD command whenever the batch fills, and once more on `finish`.
pub struct DiscardSender {
    name: String,
    first_bit_offset: u8,
    pairs: Vec<(u64, u64)>,
    commands_sent: usize,
}

impl DiscardSender {
    /// `first_bit_offset` is the bit within word zero that is page zero of
    /// the block.
    pub fn new(name: &str, first_bit_offset: u8) -> Result<DiscardSender> {
        if name.len() > u8::MAX as usize {
            return Err(Error::Format(format!("RAM block name too long: {}", name)));
        }
        if first_bit_offset >= 64 {
            return Err(Error::Protocol(format!(
                "first bit offset {} out of range",
                first_bit_offset
            )));
        }
        Ok(DiscardSender {
            name: name.to_owned(),
            first_bit_offset,
            pairs: Vec::with_capacity(MAX_DISCARDS_PER_COMMAND),
            commands_sent: 0,
        })
    }

    /// Queues one bitmap word of pages to discard; emits a command when the
    /// batch is full. Bits of word zero below `first_bit_offset` land before
    /// the block and are rejected.
    pub fn send_word(&mut self, w: &mut StreamWriter, word_index: u64, mask: u64) -> Result<()> {
        if mask == 0 {
            return Ok(());
        }
        if word_index == 0 && self.first_bit_offset > 0 {
            let below = (1u64 << self.first_bit_offset) - 1;
            if mask & below != 0 {
                return Err(Error::Protocol(
                    "discard bits below the start of the block".to_owned(),
                ));
            }
        }
        self.pairs.push((word_index, mask));
        if self.pairs.len() == MAX_DISCARDS_PER_COMMAND {
            self.flush(w)?;
        }
        Ok(())
    }

    /// Emits any remaining partial batch.
    pub fn finish(&mut self, w: &mut StreamWriter) -> Result<()> {
        if !self.pairs.is_empty() {
            self.flush(w)?;
        }
        Ok(())
    }

    pub fn commands_sent(&self) -> usize {
        self.commands_sent
    }

    fn flush(&mut self, w: &mut StreamWriter) -> Result<()> {
        let mut payload = Vec::with_capacity(3 + self.name.len() + 16 * self.pairs.len());
        payload.push(DISCARD_VERSION);
        payload.push(self.first_bit_offset);
        payload.push(self.name.len() as u8);
        payload.extend_from_slice(self.name.as_bytes());
        for (word, mask) in self.pairs.drain(..) {
            payload.extend_from_slice(&word.to_be_bytes());
            payload.extend_from_slice(&mask.to_be_bytes());
        }
        send_command(w, MigCommand::PostcopyRamDiscard, &payload)?;
        self.commands_sent += 1;
        Ok(())
    }
}

/// Ships every set word of a block's discard bitmap; returns the number of
/// commands emitted.
pub fn send_discard_bitmap(
    w: &mut StreamWriter,
    name: &str,
    bitmap: &PageBitmap,
) -> Result<usize> {
    let mut sender = DiscardSender::new(name, 0)?;
    for (word, mask) in bitmap.set_words() {
        sender.send_word(w, word, mask)?;
    }
    sender.finish(w)?;
    Ok(sender.commands_sent())
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum OutgoingState {
    None,
    Advised,
    Listening,
    Running,
    Ended,
}

/// Enforces the source-side command order: one ADVISE before any RAM data,
/// discards only after it, then LISTEN → RUN → END exactly once each.
pub struct PostcopySource {
    state: OutgoingState,
}

impl PostcopySource {
    pub fn new() -> PostcopySource {
        PostcopySource {
            state: OutgoingState::None,
        }
    }

    fn expect(&self, want: OutgoingState, what: &str) -> Result<()> {
        if self.state != want {
            return Err(Error::Protocol(format!(
                "cannot send {} in state {:?}",
                what, self.state
            )));
        }
        Ok(())
    }

    /// Announces that a postcopy flip may happen, carrying the page sizes the
    /// destination validates against its host.
    pub fn send_advise(
        &mut self,
        w: &mut StreamWriter,
        page_size: u64,
        target_page_size: u64,
    ) -> Result<()> {
        self.expect(OutgoingState::None, "ADVISE")?;
        let mut payload = [0u8; 16];
        payload[..8].copy_from_slice(&page_size.to_be_bytes());
        payload[8..].copy_from_slice(&target_page_size.to_be_bytes());
        send_command(w, MigCommand::PostcopyAdvise, &payload)?;
        self.state = OutgoingState::Advised;
        Ok(())
    }

    /// Hands out a discard builder; discards are legal between ADVISE and
    /// LISTEN and again while the destination runs.
    pub fn discard_sender(&self, name: &str, first_bit_offset: u8) -> Result<DiscardSender> {
        match self.state {
            OutgoingState::Advised | OutgoingState::Running => {
                DiscardSender::new(name, first_bit_offset)
            }
            state => Err(Error::Protocol(format!(
                "cannot send DISCARD in state {:?}",
                state
            ))),
        }
    }

    pub fn send_listen(&mut self, w: &mut StreamWriter) -> Result<()> {
        self.expect(OutgoingState::Advised, "LISTEN")?;
        send_command(w, MigCommand::PostcopyListen, &[])?;
        self.state = OutgoingState::Listening;
        Ok(())
    }

    pub fn send_run(&mut self, w: &mut StreamWriter) -> Result<()> {
        self.expect(OutgoingState::Listening, "RUN")?;
        send_command(w, MigCommand::PostcopyRun, &[])?;
        self.state = OutgoingState::Running;
        Ok(())
    }

    /// Terminates the session; a zero status byte means success.
    pub fn send_end(&mut self, w: &mut StreamWriter, status: u8) -> Result<()> {
        self.expect(OutgoingState::Running, "END")?;
        send_command(w, MigCommand::PostcopyEnd, &[status])?;
        self.state = OutgoingState::Ended;
        Ok(())
    }
}

impl Default for PostcopySource {
    fn default() -> Self {
        PostcopySource::new()
    }
}

#[cfg(test)]
mod tests {
    use migration::command::recv_command;
    use migration::SectionType;
    use migration::StreamReader;

    use super::*;

    fn drain_commands(bytes: Vec<u8>) -> Vec<(MigCommand, Vec<u8>)> {
        let mut r = StreamReader::from_buffer(bytes);
        let mut cmds = Vec::new();
        while let Ok(ty) = r.get_u8() {
            assert_eq!(ty, SectionType::Command as u8);
            cmds.push(recv_command(&mut r).unwrap());
        }
        cmds
    }

    #[test]
    fn batch_of_twelve_is_one_command() {
        let (mut w, chan) = StreamWriter::to_buffer();
        let mut sender = DiscardSender::new("pc.ram", 0).unwrap();
        for i in 0..MAX_DISCARDS_PER_COMMAND as u64 {
            sender.send_word(&mut w, i, 1).unwrap();
        }
        assert_eq!(sender.commands_sent(), 1);

        // The thirteenth starts a new batch, emitted by finish.
        sender.send_word(&mut w, 40, 1).unwrap();
        assert_eq!(sender.commands_sent(), 1);
        sender.finish(&mut w).unwrap();
        assert_eq!(sender.commands_sent(), 2);

        let cmds = drain_commands(chan.contents());
        assert_eq!(cmds.len(), 2);
        assert!(cmds
            .iter()
            .all(|(cmd, _)| *cmd == MigCommand::PostcopyRamDiscard));
        // 12 pairs then 1 pair, after the 3-byte header and the name.
        let body = 3 + "pc.ram".len();
        assert_eq!(cmds[0].1.len(), body + 12 * 16);
        assert_eq!(cmds[1].1.len(), body + 16);
    }

    #[test]
    fn empty_words_are_skipped() {
        let (mut w, chan) = StreamWriter::to_buffer();
        let mut sender = DiscardSender::new("pc.ram", 0).unwrap();
        sender.send_word(&mut w, 3, 0).unwrap();
        sender.finish(&mut w).unwrap();
        assert_eq!(sender.commands_sent(), 0);
        assert!(chan.contents().is_empty());
    }

    #[test]
    fn bits_below_block_start_rejected() {
        let (mut w, _chan) = StreamWriter::to_buffer();
        let mut sender = DiscardSender::new("pc.ram", 12).unwrap();
        assert!(matches!(
            sender.send_word(&mut w, 0, 0x800),
            Err(Error::Protocol(_))
        ));
        // The same bit in any later word is fine.
        sender.send_word(&mut w, 1, 0x800).unwrap();
    }

    #[test]
    fn bitmap_sweep() {
        let mut bitmap = PageBitmap::new(64 * 20);
        for word in 0..13 {
            bitmap.set(word * 64);
        }
        let (mut w, chan) = StreamWriter::to_buffer();
        let sent = send_discard_bitmap(&mut w, "pc.ram", &bitmap).unwrap();
        assert_eq!(sent, 2);
        assert_eq!(drain_commands(chan.contents()).len(), 2);
    }

    #[test]
    fn command_order_enforced() {
        let (mut w, _chan) = StreamWriter::to_buffer();
        let mut src = PostcopySource::new();

        // LISTEN before ADVISE is a protocol violation.
        assert!(matches!(src.send_listen(&mut w), Err(Error::Protocol(_))));
        assert!(src.discard_sender("pc.ram", 0).is_err());

        src.send_advise(&mut w, 4096, 4096).unwrap();
        assert!(matches!(
            src.send_advise(&mut w, 4096, 4096),
            Err(Error::Protocol(_))
        ));
        src.discard_sender("pc.ram", 0).unwrap();
        assert!(matches!(src.send_run(&mut w), Err(Error::Protocol(_))));
        src.send_listen(&mut w).unwrap();
        src.send_run(&mut w).unwrap();
        src.discard_sender("pc.ram", 0).unwrap();
        src.send_end(&mut w, 0).unwrap();
        assert!(matches!(src.send_end(&mut w, 0), Err(Error::Protocol(_))));
    }
}
