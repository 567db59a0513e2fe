// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Big-endian stream framing for the migration wire format.
//!
//! Both directions are error-sticky: once a primitive fails, the first error
//! is latched and every later primitive is a no-op reporting that error. The
//! latch is shared between clones so a fault thread writing the return path
//! observes a failure latched by the main thread before its own write returns.

use std::io;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Cursor;
use std::io::Read;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use sync::Mutex;

use crate::error::Error;
use crate::error::Result;

pub const STREAM_MAGIC: u32 = 0x564d_4947;
pub const STREAM_VERSION: u32 = 3;
/// Recognised and rejected with a distinct error.
pub const STREAM_VERSION_V2: u32 = 2;

/// Sanity cap on length-prefixed buffers (packaged sub-streams, COLO device
/// state). Anything larger is a corrupt or hostile stream.
pub const MAX_BUFFER_SIZE: usize = 1 << 30;

/// Tag byte introducing each unit of the stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SectionType {
    Eof = 0x00,
    Start = 0x01,
    Part = 0x02,
    End = 0x03,
    Full = 0x04,
    Command = 0x05,
}

impl SectionType {
    pub fn from_u8(v: u8) -> Option<SectionType> {
        match v {
            0x00 => Some(SectionType::Eof),
            0x01 => Some(SectionType::Start),
            0x02 => Some(SectionType::Part),
            0x03 => Some(SectionType::End),
            0x04 => Some(SectionType::Full),
            0x05 => Some(SectionType::Command),
            _ => None,
        }
    }
}

#[derive(Default)]
struct LatchInner {
    set: AtomicBool,
    err: Mutex<Option<Error>>,
}

/// Shared sticky error slot. The first latched error wins; `set` is stored
/// with release ordering after the slot is written so readers that observe it
/// with acquire ordering also observe the error value.
#[derive(Clone, Default)]
pub struct ErrorLatch {
    inner: Arc<LatchInner>,
}

impl ErrorLatch {
    pub fn new() -> ErrorLatch {
        ErrorLatch::default()
    }

    pub fn latch(&self, e: Error) {
        let mut slot = self.inner.err.lock();
        if slot.is_none() {
            *slot = Some(e);
            self.inner.set.store(true, Ordering::Release);
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::Acquire)
    }

    /// Returns a copy of the first latched error, if any.
    pub fn get(&self) -> Option<Error> {
        if !self.is_set() {
            return None;
        }
        self.inner.err.lock().as_ref().map(Error::duplicate)
    }

    pub fn check(&self) -> Result<()> {
        match self.get() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Buffered big-endian writer over a boxed transport.
pub struct StreamWriter {
    w: BufWriter<Box<dyn Write + Send>>,
    err: ErrorLatch,
    bytes_written: u64,
    rate_limit: Option<u64>,
    rate_bytes: u64,
}

impl StreamWriter {
    pub fn new(sink: Box<dyn Write + Send>) -> StreamWriter {
        StreamWriter {
            w: BufWriter::new(sink),
            err: ErrorLatch::new(),
            bytes_written: 0,
            rate_limit: None,
            rate_bytes: 0,
        }
    }

    /// An in-memory writer whose bytes can be recovered from the returned
    /// [`BufferChannel`].
    pub fn to_buffer() -> (StreamWriter, BufferChannel) {
        let chan = BufferChannel::new();
        (StreamWriter::new(Box::new(chan.clone())), chan)
    }

    pub fn error_latch(&self) -> ErrorLatch {
        self.err.clone()
    }

    pub fn error(&self) -> Option<Error> {
        self.err.get()
    }

    pub fn set_error(&self, e: Error) {
        self.err.latch(e);
    }

    pub fn check(&self) -> Result<()> {
        self.err.check()
    }

    fn track(&mut self, n: usize) {
        self.bytes_written += n as u64;
        self.rate_bytes += n as u64;
    }

    pub fn put_u8(&mut self, v: u8) {
        if self.err.is_set() {
            return;
        }
        match self.w.write_u8(v) {
            Ok(()) => self.track(1),
            Err(e) => self.err.latch(Error::Io(e)),
        }
    }

    pub fn put_u16(&mut self, v: u16) {
        if self.err.is_set() {
            return;
        }
        match self.w.write_u16::<BigEndian>(v) {
            Ok(()) => self.track(2),
            Err(e) => self.err.latch(Error::Io(e)),
        }
    }

    pub fn put_u32(&mut self, v: u32) {
        if self.err.is_set() {
            return;
        }
        match self.w.write_u32::<BigEndian>(v) {
            Ok(()) => self.track(4),
            Err(e) => self.err.latch(Error::Io(e)),
        }
    }

    pub fn put_u64(&mut self, v: u64) {
        if self.err.is_set() {
            return;
        }
        match self.w.write_u64::<BigEndian>(v) {
            Ok(()) => self.track(8),
            Err(e) => self.err.latch(Error::Io(e)),
        }
    }

    pub fn put_raw(&mut self, buf: &[u8]) {
        if self.err.is_set() {
            return;
        }
        match self.w.write_all(buf) {
            Ok(()) => self.track(buf.len()),
            Err(e) => self.err.latch(Error::Io(e)),
        }
    }

    /// Writes an identifier string with a 1-byte length prefix.
    pub fn put_str8(&mut self, s: &str) {
        if s.len() > u8::MAX as usize {
            self.err
                .latch(Error::Format(format!("identifier too long: {}", s.len())));
            return;
        }
        self.put_u8(s.len() as u8);
        self.put_raw(s.as_bytes());
    }

    /// Writes a byte buffer with a 4-byte length prefix.
    pub fn put_buf32(&mut self, buf: &[u8]) {
        if buf.len() > u32::MAX as usize {
            self.err
                .latch(Error::Format(format!("buffer too long: {}", buf.len())));
            return;
        }
        self.put_u32(buf.len() as u32);
        self.put_raw(buf);
    }

    pub fn put_section_type(&mut self, ty: SectionType) {
        self.put_u8(ty as u8);
    }

    /// Writes the `{magic, version}` file header.
    pub fn write_header(&mut self) {
        self.put_u32(STREAM_MAGIC);
        self.put_u32(STREAM_VERSION);
    }

    pub fn flush(&mut self) -> Result<()> {
        self.err.check()?;
        if let Err(e) = self.w.flush() {
            self.err.latch(Error::Io(e));
        }
        self.err.check()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Caps how many bytes one iterate cycle may write; `None` removes the
    /// cap.
    pub fn set_rate_limit(&mut self, limit: Option<u64>) {
        self.rate_limit = limit;
        self.rate_bytes = 0;
    }

    pub fn rate_limit_exceeded(&self) -> bool {
        match self.rate_limit {
            Some(limit) => self.rate_bytes >= limit,
            None => false,
        }
    }

    /// Opens a new rate-limit accounting window.
    pub fn reset_rate_limit(&mut self) {
        self.rate_bytes = 0;
    }
}

/// Buffered big-endian reader over a boxed transport.
pub struct StreamReader {
    r: BufReader<Box<dyn Read + Send>>,
    err: ErrorLatch,
}

impl StreamReader {
    pub fn new(source: Box<dyn Read + Send>) -> StreamReader {
        StreamReader {
            r: BufReader::new(source),
            err: ErrorLatch::new(),
        }
    }

    /// A synthetic read-only stream over an in-memory buffer, used for
    /// packaged sub-streams and the COLO device-state buffer.
    pub fn from_buffer(buf: Vec<u8>) -> StreamReader {
        StreamReader::new(Box::new(Cursor::new(buf)))
    }

    pub fn error_latch(&self) -> ErrorLatch {
        self.err.clone()
    }

    pub fn error(&self) -> Option<Error> {
        self.err.get()
    }

    pub fn set_error(&self, e: Error) {
        self.err.latch(e);
    }

    fn wrap<T>(&self, res: io::Result<T>) -> Result<T> {
        self.err.check()?;
        match res {
            Ok(v) => Ok(v),
            Err(e) => {
                self.err.latch(Error::Io(e));
                Err(self.err.get().unwrap_or(Error::Memory))
            }
        }
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.err.check()?;
        let res = self.r.read_u8();
        self.wrap(res)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.err.check()?;
        let res = self.r.read_u16::<BigEndian>();
        self.wrap(res)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.err.check()?;
        let res = self.r.read_u32::<BigEndian>();
        self.wrap(res)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.err.check()?;
        let res = self.r.read_u64::<BigEndian>();
        self.wrap(res)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.err.check()?;
        let res = self.r.read_exact(buf);
        self.wrap(res)
    }

    /// Reads an identifier string with a 1-byte length prefix.
    pub fn get_str8(&mut self) -> Result<String> {
        let len = self.get_u8()? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|_| {
            let e = Error::Format("identifier is not utf-8".to_owned());
            self.err.latch(e.duplicate());
            e
        })
    }

    /// Reads a byte buffer with a 4-byte length prefix.
    pub fn get_buf32(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        if len > MAX_BUFFER_SIZE {
            let e = Error::Protocol(format!("buffer length {} too large", len));
            self.err.latch(e.duplicate());
            return Err(e);
        }
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads and validates the `{magic, version}` file header.
    pub fn read_header(&mut self) -> Result<()> {
        let magic = self.get_u32()?;
        if magic != STREAM_MAGIC {
            let e = Error::Format(format!("bad magic {:#010x}", magic));
            self.err.latch(e.duplicate());
            return Err(e);
        }
        let version = self.get_u32()?;
        let e = match version {
            STREAM_VERSION => return Ok(()),
            STREAM_VERSION_V2 => Error::ObsoleteVersion(version),
            _ => Error::UnsupportedVersion(version),
        };
        self.err.latch(e.duplicate());
        Err(e)
    }
}

/// A shared in-memory byte sink. COLO serializes device state into one of
/// these each checkpoint round, then ships the contents in a single burst.
#[derive(Clone, Default)]
pub struct BufferChannel {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl BufferChannel {
    pub fn new() -> BufferChannel {
        BufferChannel::default()
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }

    pub fn reset(&self) {
        self.buf.lock().clear();
    }
}

impl Write for BufferChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
