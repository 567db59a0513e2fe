// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The in-band command channel multiplexed onto the section stream, and the
//! return-path message framing running in the opposite direction.

use crate::error::Error;
use crate::error::Result;
use crate::stream::SectionType;
use crate::stream::StreamReader;
use crate::stream::StreamWriter;
use crate::stream::MAX_BUFFER_SIZE;

/// In-band commands carried in COMMAND sections as `{cmd16, len16, payload}`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum MigCommand {
    Invalid = 0,
    /// Ask the destination to open the reverse channel.
    OpenReturnPath = 1,
    /// Carries a 32-bit cookie echoed back on the return path.
    ReqAck = 2,
    /// A length-declared embedded sub-stream follows.
    Packaged = 3,
    PostcopyAdvise = 4,
    PostcopyRamDiscard = 5,
    PostcopyListen = 6,
    PostcopyRun = 7,
    PostcopyEnd = 8,
    ColoCheckpointRequest = 9,
    ColoCheckpointReady = 10,
    ColoVmstateSend = 11,
    ColoVmstateSize = 12,
    ColoVmstateReceived = 13,
    ColoVmstateLoaded = 14,
    ColoGuestShutdown = 15,
}

impl MigCommand {
    pub fn from_u16(v: u16) -> Option<MigCommand> {
        use MigCommand::*;
        Some(match v {
            0 => Invalid,
            1 => OpenReturnPath,
            2 => ReqAck,
            3 => Packaged,
            4 => PostcopyAdvise,
            5 => PostcopyRamDiscard,
            6 => PostcopyListen,
            7 => PostcopyRun,
            8 => PostcopyEnd,
            9 => ColoCheckpointRequest,
            10 => ColoCheckpointReady,
            11 => ColoVmstateSend,
            12 => ColoVmstateSize,
            13 => ColoVmstateReceived,
            14 => ColoVmstateLoaded,
            15 => ColoGuestShutdown,
            _ => return None,
        })
    }
}

/// Writes a COMMAND section and flushes so the peer sees it promptly.
pub fn send_command(w: &mut StreamWriter, cmd: MigCommand, payload: &[u8]) -> Result<()> {
    if payload.len() > u16::MAX as usize {
        return Err(Error::Protocol(format!(
            "command payload too long: {}",
            payload.len()
        )));
    }
    w.put_section_type(SectionType::Command);
    w.put_u16(cmd as u16);
    w.put_u16(payload.len() as u16);
    w.put_raw(payload);
    w.flush()
}

/// Writes a PACKAGED command. The command payload is just the be32 length;
/// the sub-stream bytes follow it raw.
pub fn send_packaged(w: &mut StreamWriter, packaged: &[u8]) -> Result<()> {
    if packaged.len() > MAX_BUFFER_SIZE {
        return Err(Error::Protocol(format!(
            "packaged stream too long: {}",
            packaged.len()
        )));
    }
    w.put_section_type(SectionType::Command);
    w.put_u16(MigCommand::Packaged as u16);
    w.put_u16(4);
    w.put_u32(packaged.len() as u32);
    w.put_raw(packaged);
    w.flush()
}

/// Reads one COMMAND section from the point just after its section-type byte.
pub fn recv_command(r: &mut StreamReader) -> Result<(MigCommand, Vec<u8>)> {
    let raw = r.get_u16()?;
    let len = r.get_u16()? as usize;
    let cmd = MigCommand::from_u16(raw)
        .ok_or_else(|| Error::Format(format!("unknown command {:#06x}", raw)))?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok((cmd, payload))
}

/// Messages flowing destination → source on the return path, framed as
/// `{type16, len16, payload}`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum RpMessage {
    Invalid = 0,
    /// Final shutdown ack; payload is a be32 error indicator.
    Shut = 1,
    /// Echo of a REQACK cookie.
    Ack = 2,
    /// `{offset be64, length be32}` for the most recently named block.
    ReqPages = 3,
    /// `{name_len u8, name, offset be64, length be32}`.
    ReqPagesId = 4,
}

impl RpMessage {
    pub fn from_u16(v: u16) -> Option<RpMessage> {
        use RpMessage::*;
        Some(match v {
            0 => Invalid,
            1 => Shut,
            2 => Ack,
            3 => ReqPages,
            4 => ReqPagesId,
            _ => return None,
        })
    }

    /// Expected payload length; `None` for variable-length messages.
    fn fixed_len(self) -> Option<usize> {
        match self {
            RpMessage::Invalid => Some(0),
            RpMessage::Shut => Some(4),
            RpMessage::Ack => Some(4),
            RpMessage::ReqPages => Some(12),
            RpMessage::ReqPagesId => None,
        }
    }
}

pub fn rp_send(w: &mut StreamWriter, msg: RpMessage, payload: &[u8]) -> Result<()> {
    if payload.len() > u16::MAX as usize {
        return Err(Error::Protocol(format!(
            "return-path payload too long: {}",
            payload.len()
        )));
    }
    w.put_u16(msg as u16);
    w.put_u16(payload.len() as u16);
    w.put_raw(payload);
    w.flush()
}

pub fn rp_recv(r: &mut StreamReader) -> Result<(RpMessage, Vec<u8>)> {
    let raw = r.get_u16()?;
    let len = r.get_u16()? as usize;
    let msg = RpMessage::from_u16(raw)
        .ok_or_else(|| Error::Format(format!("unknown return-path message {:#06x}", raw)))?;
    if let Some(expected) = msg.fixed_len() {
        if len != expected {
            return Err(Error::Protocol(format!(
                "return-path message {:?} length {} != {}",
                msg, len, expected
            )));
        }
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok((msg, payload))
}

/// A demand-fetch request resolved from a return-path message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageRequest {
    /// `None` means "same block as the previous request".
    pub block: Option<String>,
    pub offset: u64,
    pub len: u32,
}

/// Encodes a page request, eliding the block name when `block` is `None`.
pub fn encode_page_request(block: Option<&str>, offset: u64, len: u32) -> (RpMessage, Vec<u8>) {
    match block {
        Some(name) => {
            let mut payload = Vec::with_capacity(1 + name.len() + 12);
            payload.push(name.len() as u8);
            payload.extend_from_slice(name.as_bytes());
            payload.extend_from_slice(&offset.to_be_bytes());
            payload.extend_from_slice(&len.to_be_bytes());
            (RpMessage::ReqPagesId, payload)
        }
        None => {
            let mut payload = Vec::with_capacity(12);
            payload.extend_from_slice(&offset.to_be_bytes());
            payload.extend_from_slice(&len.to_be_bytes());
            (RpMessage::ReqPages, payload)
        }
    }
}

pub fn decode_page_request(msg: RpMessage, payload: &[u8]) -> Result<PageRequest> {
    let (block, rest) = match msg {
        RpMessage::ReqPages => (None, payload),
        RpMessage::ReqPagesId => {
            let name_len = *payload
                .first()
                .ok_or_else(|| Error::Protocol("empty page request".to_owned()))?
                as usize;
            if payload.len() < 1 + name_len {
                return Err(Error::Protocol("truncated page request name".to_owned()));
            }
            let name = String::from_utf8(payload[1..1 + name_len].to_vec())
                .map_err(|_| Error::Format("block name is not utf-8".to_owned()))?;
            (Some(name), &payload[1 + name_len..])
        }
        other => {
            return Err(Error::Protocol(format!(
                "message {:?} is not a page request",
                other
            )))
        }
    };
    if rest.len() != 12 {
        return Err(Error::Protocol(format!(
            "page request length {} != 12",
            rest.len()
        )));
    }
    let mut offset = [0u8; 8];
    offset.copy_from_slice(&rest[..8]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&rest[8..]);
    Ok(PageRequest {
        block,
        offset: u64::from_be_bytes(offset),
        len: u32::from_be_bytes(len),
    })
}
