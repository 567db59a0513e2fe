// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end stream scenarios: header validation, full save/load round
//! trips, command dispatch and packaged sub-streams.

use std::os::unix::net::UnixStream;
use std::sync::Arc;

use migration::command::encode_page_request;
use migration::command::rp_recv;
use migration::command::rp_send;
use migration::command::send_command;
use migration::command::send_packaged;
use migration::command::MigCommand;
use migration::command::RpMessage;
use migration::Error;
use migration::IterateStatus;
use migration::LoadVm;
use migration::MigrateParams;
use migration::RegisterRequest;
use migration::Result;
use migration::SaveVm;
use migration::SectionType;
use migration::StateHandler;
use migration::StateOps;
use migration::StateRegistry;
use migration::StreamReader;
use migration::StreamWriter;
use migration::VmStateDescription;
use migration::VmStateField;
use migration::STREAM_MAGIC;
use migration::STREAM_VERSION;
use migration::STREAM_VERSION_V2;
use sync::Mutex;

/// A device whose whole state is one opaque blob.
struct BlobDevice {
    blob: Vec<u8>,
    loaded: Option<Vec<u8>>,
}

impl BlobDevice {
    fn new(blob: &[u8]) -> Arc<Mutex<BlobDevice>> {
        Arc::new(Mutex::new(BlobDevice {
            blob: blob.to_vec(),
            loaded: None,
        }))
    }
}

impl StateOps for BlobDevice {
    fn save(&mut self, w: &mut StreamWriter) -> Result<()> {
        w.put_raw(&self.blob);
        w.check()
    }

    fn load(&mut self, r: &mut StreamReader, _version_id: u32) -> Result<()> {
        let mut buf = vec![0u8; self.blob.len()];
        r.read_exact(&mut buf)?;
        self.loaded = Some(buf);
        Ok(())
    }
}

/// An iterative producer in the shape of a RAM migrator. Every blob is a
/// record sequence terminated by a zero tag, so one `load` call consumes
/// exactly one section regardless of phase: tag 2 announces the page count
/// (setup), tag 1 carries one page.
struct PagedDevice {
    pages: Vec<[u8; 8]>,
    cursor: usize,
    announced: u32,
    received: Vec<(u32, [u8; 8])>,
    cancelled: bool,
}

impl PagedDevice {
    fn new(pages: Vec<[u8; 8]>) -> Arc<Mutex<PagedDevice>> {
        Arc::new(Mutex::new(PagedDevice {
            pages,
            cursor: 0,
            announced: 0,
            received: Vec::new(),
            cancelled: false,
        }))
    }
}

impl StateOps for PagedDevice {
    fn has_full_state(&self) -> bool {
        false
    }

    fn is_iterative(&self) -> bool {
        true
    }

    fn live_setup(&mut self, w: &mut StreamWriter) -> Result<()> {
        w.put_u8(2);
        w.put_u32(self.pages.len() as u32);
        w.put_u8(0);
        w.check()
    }

    fn live_iterate(&mut self, w: &mut StreamWriter) -> Result<IterateStatus> {
        if self.cursor < self.pages.len() {
            w.put_u8(1);
            w.put_u32(self.cursor as u32);
            w.put_raw(&self.pages[self.cursor]);
            self.cursor += 1;
        }
        w.put_u8(0);
        w.check()?;
        Ok(if self.cursor < self.pages.len() {
            IterateStatus::Again
        } else {
            IterateStatus::Done
        })
    }

    fn live_complete(&mut self, w: &mut StreamWriter) -> Result<()> {
        w.put_u8(0);
        w.check()
    }

    fn load(&mut self, r: &mut StreamReader, _version_id: u32) -> Result<()> {
        loop {
            match r.get_u8()? {
                0 => return Ok(()),
                1 => {
                    let idx = r.get_u32()?;
                    let mut page = [0u8; 8];
                    r.read_exact(&mut page)?;
                    self.received.push((idx, page));
                }
                2 => {
                    self.announced = r.get_u32()?;
                }
                other => {
                    return Err(Error::Format(format!("bad page tag {:#04x}", other)));
                }
            }
        }
    }

    fn pending(&self, _max_size: u64) -> migration::PendingBytes {
        migration::PendingBytes {
            precopy_only: ((self.pages.len() - self.cursor) * 14) as u64,
            postcopy: 0,
        }
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }
}

impl PagedDevice {
    fn register(reg: &mut StateRegistry, dev: &Arc<Mutex<PagedDevice>>) {
        reg.register(RegisterRequest::new(
            "ram",
            Some(0),
            4,
            StateHandler::Ops(dev.clone()),
        ))
        .unwrap();
    }
}

fn header_bytes() -> Vec<u8> {
    let mut v = STREAM_MAGIC.to_be_bytes().to_vec();
    v.extend_from_slice(&STREAM_VERSION.to_be_bytes());
    v
}

#[test]
fn bad_magic_rejected() {
    let reg = StateRegistry::new();
    let mut lv = LoadVm::new(&reg);
    let mut r = StreamReader::from_buffer(vec![0, 0, 0, 0, 0, 0, 0, 1]);
    assert!(matches!(lv.load(&mut r), Err(Error::Format(_))));
}

#[test]
fn obsolete_v2_rejected() {
    let reg = StateRegistry::new();
    let mut lv = LoadVm::new(&reg);
    let mut bytes = STREAM_MAGIC.to_be_bytes().to_vec();
    bytes.extend_from_slice(&STREAM_VERSION_V2.to_be_bytes());
    let mut r = StreamReader::from_buffer(bytes);
    assert!(matches!(
        lv.load(&mut r),
        Err(Error::ObsoleteVersion(STREAM_VERSION_V2))
    ));
}

#[test]
fn unsupported_version_rejected() {
    let reg = StateRegistry::new();
    let mut lv = LoadVm::new(&reg);
    let mut bytes = STREAM_MAGIC.to_be_bytes().to_vec();
    bytes.extend_from_slice(&99u32.to_be_bytes());
    let mut r = StreamReader::from_buffer(bytes);
    assert!(matches!(lv.load(&mut r), Err(Error::UnsupportedVersion(99))));
}

#[test]
fn single_device_round_trip() {
    let mut src_reg = StateRegistry::new();
    let src_dev = BlobDevice::new(&[0xde, 0xad, 0xbe, 0xef]);
    src_reg
        .register(RegisterRequest::new(
            "dev",
            Some(0),
            3,
            StateHandler::Ops(src_dev),
        ))
        .unwrap();

    let (mut w, chan) = StreamWriter::to_buffer();
    SaveVm::save(&src_reg, &mut w, &MigrateParams::default()).unwrap();
    let bytes = chan.contents();

    // The stream leads with {magic, version} and ends with the EOF marker.
    assert_eq!(&bytes[..8], header_bytes().as_slice());
    assert_eq!(*bytes.last().unwrap(), SectionType::Eof as u8);

    let mut dst_reg = StateRegistry::new();
    let dst_dev = BlobDevice::new(&[0, 0, 0, 0]);
    dst_reg
        .register(RegisterRequest::new(
            "dev",
            Some(0),
            3,
            StateHandler::Ops(dst_dev.clone()),
        ))
        .unwrap();

    let mut lv = LoadVm::new(&dst_reg);
    let mut r = StreamReader::from_buffer(bytes);
    lv.load(&mut r).unwrap();
    assert_eq!(
        dst_dev.lock().loaded.as_deref(),
        Some(&[0xde, 0xad, 0xbe, 0xef][..])
    );
}

#[test]
fn unknown_section_rejected() {
    let reg = StateRegistry::new();
    let mut bytes = header_bytes();
    bytes.push(SectionType::Full as u8);
    bytes.extend_from_slice(&7u32.to_be_bytes()); // section id
    bytes.push(5); // idstr length
    bytes.extend_from_slice(b"ghost");
    bytes.extend_from_slice(&0u32.to_be_bytes()); // instance
    bytes.extend_from_slice(&1u32.to_be_bytes()); // version

    let mut lv = LoadVm::new(&reg);
    let mut r = StreamReader::from_buffer(bytes);
    assert!(matches!(lv.load(&mut r), Err(Error::UnknownSection(_))));
}

#[test]
fn part_for_unknown_section_id_rejected() {
    let reg = StateRegistry::new();
    let mut bytes = header_bytes();
    bytes.push(SectionType::Part as u8);
    bytes.extend_from_slice(&42u32.to_be_bytes());

    let mut lv = LoadVm::new(&reg);
    let mut r = StreamReader::from_buffer(bytes);
    assert!(matches!(lv.load(&mut r), Err(Error::UnknownSection(_))));
}

#[test]
fn newer_wire_version_rejected() {
    let mut src_reg = StateRegistry::new();
    let dev = BlobDevice::new(&[]);
    src_reg
        .register(RegisterRequest::new(
            "dev",
            Some(0),
            2,
            StateHandler::Ops(dev),
        ))
        .unwrap();

    let mut bytes = header_bytes();
    bytes.push(SectionType::Full as u8);
    bytes.extend_from_slice(&0u32.to_be_bytes());
    bytes.push(3);
    bytes.extend_from_slice(b"dev");
    bytes.extend_from_slice(&0u32.to_be_bytes());
    bytes.extend_from_slice(&3u32.to_be_bytes()); // newer than registered v2

    let mut lv = LoadVm::new(&src_reg);
    let mut r = StreamReader::from_buffer(bytes);
    assert!(matches!(lv.load(&mut r), Err(Error::UnsupportedVersion(3))));
}

#[derive(Default, Debug, PartialEq, Clone)]
struct RtcState {
    seconds: u64,
    alarm: u32,
}

fn rtc_desc() -> VmStateDescription {
    VmStateDescription {
        name: "rtc",
        version_id: 1,
        minimum_version_id: 1,
        fields: vec![
            VmStateField::u64("seconds", 1, |s: &RtcState| s.seconds, |s, v| s.seconds = v),
            VmStateField::u32("alarm", 1, |s: &RtcState| s.alarm, |s, v| s.alarm = v),
        ],
    }
}

#[test]
fn mixed_entries_round_trip() {
    // Source: an iterative RAM-like entry, a schema entry and a blob entry.
    let mut src_reg = StateRegistry::new();
    let src_ram = PagedDevice::new(vec![*b"pagezero", *b"page one", *b"page two"]);
    PagedDevice::register(&mut src_reg, &src_ram);
    let src_rtc: Arc<Mutex<dyn std::any::Any + Send>> = Arc::new(Mutex::new(RtcState {
        seconds: 88,
        alarm: 13,
    }));
    src_reg
        .register(RegisterRequest::new(
            "rtc",
            Some(0),
            1,
            StateHandler::Schema {
                desc: Arc::new(rtc_desc()),
                state: src_rtc,
            },
        ))
        .unwrap();
    let src_blob = BlobDevice::new(b"serialcfg");
    src_reg
        .register(RegisterRequest::new(
            "serial",
            None,
            1,
            StateHandler::Ops(src_blob),
        ))
        .unwrap();

    let (mut w, chan) = StreamWriter::to_buffer();
    SaveVm::save(&src_reg, &mut w, &MigrateParams::default()).unwrap();

    // Destination mirrors the registrations.
    let mut dst_reg = StateRegistry::new();
    let dst_ram = PagedDevice::new(vec![]);
    PagedDevice::register(&mut dst_reg, &dst_ram);
    let dst_rtc_inner = Arc::new(Mutex::new(RtcState::default()));
    let dst_rtc: Arc<Mutex<dyn std::any::Any + Send>> = dst_rtc_inner.clone();
    dst_reg
        .register(RegisterRequest::new(
            "rtc",
            Some(0),
            1,
            StateHandler::Schema {
                desc: Arc::new(rtc_desc()),
                state: dst_rtc,
            },
        ))
        .unwrap();
    let dst_blob = BlobDevice::new(&[0; 9]);
    dst_reg
        .register(RegisterRequest::new(
            "serial",
            None,
            1,
            StateHandler::Ops(dst_blob.clone()),
        ))
        .unwrap();

    let mut lv = LoadVm::new(&dst_reg);
    let mut r = StreamReader::from_buffer(chan.contents());
    lv.load(&mut r).unwrap();

    let ram = dst_ram.lock();
    assert_eq!(ram.announced, 3);
    assert_eq!(ram.received.len(), 3);
    assert_eq!(ram.received[0], (0, *b"pagezero"));
    assert_eq!(ram.received[2], (2, *b"page two"));
    drop(ram);
    assert_eq!(
        *dst_rtc_inner.lock(),
        RtcState {
            seconds: 88,
            alarm: 13,
        }
    );
    assert_eq!(dst_blob.lock().loaded.as_deref(), Some(&b"serialcfg"[..]));
}

#[test]
fn iterate_defers_when_rate_limited() {
    let mut reg = StateRegistry::new();
    let ram = PagedDevice::new(vec![*b"pagezero", *b"page one", *b"page two"]);
    PagedDevice::register(&mut reg, &ram);

    let mut sv = SaveVm::new(&reg).unwrap();
    let (mut w, _chan) = StreamWriter::to_buffer();
    sv.begin(&mut w, &MigrateParams::default()).unwrap();
    assert_eq!(sv.pending(0).total(), 3 * 14);

    // One page fills the window; the next pass defers without writing.
    w.set_rate_limit(Some(1));
    assert_eq!(sv.iterate(&mut w).unwrap(), IterateStatus::Again);
    let written = w.bytes_written();
    assert_eq!(sv.iterate(&mut w).unwrap(), IterateStatus::Again);
    assert_eq!(w.bytes_written(), written);

    w.set_rate_limit(None);
    loop {
        if sv.iterate(&mut w).unwrap() == IterateStatus::Done {
            break;
        }
    }
    assert_eq!(sv.pending(0).total(), 0);
    sv.complete_precopy(&mut w, false).unwrap();
}

#[test]
fn cancel_reaches_every_entry() {
    let mut reg = StateRegistry::new();
    let ram = PagedDevice::new(vec![*b"pagezero"]);
    PagedDevice::register(&mut reg, &ram);

    let mut sv = SaveVm::new(&reg).unwrap();
    sv.cancel();
    assert!(ram.lock().cancelled);
}

#[test]
fn reqack_echoed_on_return_path() {
    let (src_sock, dst_sock) = UnixStream::pair().unwrap();

    let mut w = StreamWriter::new(Box::new(src_sock.try_clone().unwrap()));
    w.write_header();
    send_command(&mut w, MigCommand::OpenReturnPath, &[]).unwrap();
    send_command(&mut w, MigCommand::ReqAck, &0xfeed_f00du32.to_be_bytes()).unwrap();
    w.put_section_type(SectionType::Eof);
    w.flush().unwrap();

    let reg = StateRegistry::new();
    let mut lv = LoadVm::new(&reg);
    let rp_sock = dst_sock.try_clone().unwrap();
    lv.set_return_path_opener(Box::new(move || {
        Ok(Box::new(rp_sock.try_clone()?) as Box<dyn std::io::Write + Send>)
    }));
    let mut r = StreamReader::new(Box::new(dst_sock));
    lv.load(&mut r).unwrap();

    let mut rp = StreamReader::new(Box::new(src_sock));
    let (msg, payload) = rp_recv(&mut rp).unwrap();
    assert_eq!(msg, RpMessage::Ack);
    assert_eq!(payload, 0xfeed_f00du32.to_be_bytes());
}

#[test]
fn reqack_without_return_path_rejected() {
    let reg = StateRegistry::new();
    let mut lv = LoadVm::new(&reg);

    let (mut w, chan) = StreamWriter::to_buffer();
    w.write_header();
    send_command(&mut w, MigCommand::ReqAck, &1u32.to_be_bytes()).unwrap();
    let mut r = StreamReader::from_buffer(chan.contents());
    assert!(matches!(lv.load(&mut r), Err(Error::Protocol(_))));
}

#[test]
fn packaged_substream_loads_sections() {
    // The packaged payload is itself a headerless section stream.
    let mut src_reg = StateRegistry::new();
    let src_dev = BlobDevice::new(b"pkg");
    src_reg
        .register(RegisterRequest::new(
            "dev",
            Some(0),
            1,
            StateHandler::Ops(src_dev),
        ))
        .unwrap();
    let (mut inner_w, inner_chan) = StreamWriter::to_buffer();
    let mut sv = SaveVm::new(&src_reg).unwrap();
    sv.save_device_state(&mut inner_w).unwrap();

    let (mut w, chan) = StreamWriter::to_buffer();
    w.write_header();
    send_packaged(&mut w, &inner_chan.contents()).unwrap();
    w.put_section_type(SectionType::Eof);
    w.flush().unwrap();

    let mut dst_reg = StateRegistry::new();
    let dst_dev = BlobDevice::new(&[0; 3]);
    dst_reg
        .register(RegisterRequest::new(
            "dev",
            Some(0),
            1,
            StateHandler::Ops(dst_dev.clone()),
        ))
        .unwrap();
    let mut lv = LoadVm::new(&dst_reg);
    let mut r = StreamReader::from_buffer(chan.contents());
    lv.load(&mut r).unwrap();
    assert_eq!(dst_dev.lock().loaded.as_deref(), Some(&b"pkg"[..]));
}

#[test]
fn blocked_device_stops_save() {
    struct Pinned;
    impl StateOps for Pinned {
        fn blocked_reason(&self) -> Option<String> {
            Some("assigned host device".to_owned())
        }
    }

    let mut reg = StateRegistry::new();
    reg.register(RegisterRequest::new(
        "vfio",
        Some(0),
        1,
        StateHandler::Ops(Arc::new(Mutex::new(Pinned))),
    ))
    .unwrap();

    assert!(matches!(SaveVm::new(&reg), Err(Error::Blocked(_))));
}

#[test]
fn shut_message_carries_error_indicator() {
    let (mut w, chan) = StreamWriter::to_buffer();
    rp_send(&mut w, RpMessage::Shut, &1u32.to_be_bytes()).unwrap();
    let mut r = StreamReader::from_buffer(chan.contents());
    let (msg, payload) = rp_recv(&mut r).unwrap();
    assert_eq!(msg, RpMessage::Shut);
    assert_eq!(u32::from_be_bytes(payload.try_into().unwrap()), 1);
}

#[test]
fn page_request_name_elision() {
    let (msg, _payload) = encode_page_request(Some("pc.ram"), 0, 4096);
    assert_eq!(msg, RpMessage::ReqPagesId);
    let (msg, payload) = encode_page_request(None, 4096, 4096);
    assert_eq!(msg, RpMessage::ReqPages);
    assert_eq!(payload.len(), 12);
}
