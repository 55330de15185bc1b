// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 brotherd developers

//! Scan-session protocol engine.
//!
//! One [`Session`] drives a device through the proprietary handshake on TCP
//! port 54921: welcome, two parameter exchanges, then a stream of chunked
//! page data terminated by a job-end marker. Each state runs as one step and
//! returns the next state, so the owning task can interleave command
//! processing between steps.
//!
//! ```text
//! Connect -> ExchangeParams1 -> ExchangeParams2 -> AwaitPage
//!                                                      |
//!                             +------------------- ProcessHeader
//!                             |   chunk: -> PagePayload -> ProcessHeader
//!                             |   page end: -> AwaitPage
//!                             |   job end (0x80): -> Paused
//! ```

use crate::channel::hook::{self, HookContext};
use crate::channel::params::{ScanParams, EXCHANGE1_WHITELIST, EXCHANGE2_WHITELIST, MAX_VALUE_LEN};
use crate::config::{DeviceConfig, ItemConfig, ScanFunc};
use crate::error::{Error, Result};
use crate::transport::{Conn, ConnKind};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// TCP port the scanner listens on for scan sessions.
pub const SCAN_PORT: u16 = 54921;

/// Page-data header length (chunk length field excluded).
const PAGE_HEADER_SIZE: usize = 10;

/// Chunk header: page header plus the 2-byte little-endian payload length.
const CHUNK_HEADER_SIZE: usize = 12;

/// Largest chunk (header included) the firmware emits.
const CHUNK_MAX_SIZE: usize = 0x10000;

/// `progress` header field units: 1/4096 of the page.
const CHUNK_MAX_PROGRESS: u32 = 0x1000;

/// Magic value in every page-data header.
const HEADER_MAGIC: u16 = 0x0007;

/// Terminates every daemon-to-device message; alone on the wire it is the
/// device's job-end marker.
const MSG_END: u8 = 0x80;

/// ESC 'K' LF 0x80: start a session in button mode.
const GREETING_BUTTON: [u8; 4] = [0x1B, 0x4B, 0x0A, MSG_END];

/// ESC 'Q' LF 0x80: manual-scan variant of the greeting.
#[allow(dead_code)]
const GREETING_MANUAL: [u8; 4] = [0x1B, 0x51, 0x0A, MSG_END];

const WELCOME_TIMEOUT: Duration = Duration::from_secs(3);
const EXCHANGE1_TIMEOUT: Duration = Duration::from_secs(2);
const EXCHANGE2_TIMEOUT: Duration = Duration::from_secs(3);

/// Next state-machine transition to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Paused,
    Connect,
    ExchangeParams1,
    ExchangeParams2,
    AwaitPage,
    ProcessHeader,
    PagePayload,
}

/// Image encoding announced by the chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageFormat {
    Raw,
    Rle,
    Jpeg,
    Unknown,
}

impl PageFormat {
    fn from_header_id(id: u8) -> PageFormat {
        match id {
            0x40 => PageFormat::Raw,
            0x42 => PageFormat::Rle,
            0x64 => PageFormat::Jpeg,
            _ => PageFormat::Unknown,
        }
    }

    fn extension(self) -> &'static str {
        match self {
            PageFormat::Raw => "raw",
            PageFormat::Rle => "rle",
            PageFormat::Jpeg => "jpeg",
            PageFormat::Unknown => "unk",
        }
    }
}

/// Parsed page-data header.
#[derive(Debug, Clone, Copy)]
struct PacketHeader {
    id: u8,
    magic: u16,
    page_id: u16,
    progress: u16,
}

impl PacketHeader {
    fn parse(buf: &[u8]) -> PacketHeader {
        PacketHeader {
            id: buf[0],
            magic: u16::from_le_bytes([buf[1], buf[2]]),
            page_id: u16::from_le_bytes([buf[3], buf[4]]),
            progress: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }
}

/// Page geometry captured from the second parameter exchange, exported to
/// the hook environment.
#[derive(Debug, Clone, Copy, Default)]
struct Geometry {
    xdpi: i64,
    ydpi: i64,
    width: i64,
    height: i64,
}

/// Per-device protocol engine state.
pub(crate) struct Session {
    conn: Conn,
    device_ip: Ipv4Addr,
    target: SocketAddrV4,
    item: Option<Arc<ItemConfig>>,
    params: ScanParams,
    /// Current page id; pages within one session count 1, 2, 3, …
    page_id: u16,
    remaining_chunk_bytes: usize,
    format: PageFormat,
    tempfile: Option<File>,
    /// Zero-based page-file counter; runs across sessions.
    scanned_pages: u32,
    geometry: Geometry,
    page_init_timeout: Duration,
    page_finish_timeout: Duration,
    /// One welcome-phase reset is retried before giving up.
    reset_retried: bool,
    /// Directory receiving `scan<N>.<fmt>` files.
    output_dir: PathBuf,
}

impl Session {
    pub(crate) fn new(device: &DeviceConfig) -> Result<Session> {
        let conn = Conn::open(ConnKind::Tcp, device.timeout)?;
        Ok(Session {
            conn,
            device_ip: device.ip,
            target: SocketAddrV4::new(device.ip, SCAN_PORT),
            item: None,
            params: ScanParams::new(),
            page_id: 0,
            remaining_chunk_bytes: 0,
            format: PageFormat::Unknown,
            tempfile: None,
            scanned_pages: 0,
            geometry: Geometry::default(),
            page_init_timeout: Duration::from_secs(10),
            page_finish_timeout: Duration::from_secs(5),
            reset_retried: false,
            output_dir: PathBuf::from("."),
        })
    }

    /// Bind an item to the channel: copy its parameter template and
    /// timeouts into the working state.
    pub(crate) fn load_item(&mut self, item: Arc<ItemConfig>) {
        self.params = item.params.clone();
        self.page_init_timeout = item.page_init_timeout;
        self.page_finish_timeout = item.page_finish_timeout;
        self.item = Some(item);
    }

    pub(crate) fn has_item(&self) -> bool {
        self.item.is_some()
    }

    /// Reset per-session state before a fresh connect.
    pub(crate) fn begin(&mut self) {
        self.page_id = 0;
        self.remaining_chunk_bytes = 0;
        self.reset_retried = false;
    }

    /// Drop any in-progress page. Called on every failure path before the
    /// channel pauses; the unlinked tempfile disappears with its handle.
    pub(crate) fn abort(&mut self) {
        self.tempfile = None;
        self.remaining_chunk_bytes = 0;
    }

    pub(crate) fn device_ip(&self) -> Ipv4Addr {
        self.device_ip
    }

    /// Point the engine at a loopback endpoint and a scratch directory.
    #[cfg(test)]
    pub(crate) fn redirect_for_test(&mut self, target: SocketAddrV4, output_dir: PathBuf) {
        self.target = target;
        self.output_dir = output_dir;
    }

    /// Run one state-machine step.
    pub(crate) fn dispatch(&mut self, step: Step) -> Result<Step> {
        match step {
            Step::Paused => Ok(Step::Paused),
            Step::Connect => self.connect(),
            Step::ExchangeParams1 => self.exchange_params1(),
            Step::ExchangeParams2 => self.exchange_params2(),
            Step::AwaitPage => self.await_page(),
            Step::ProcessHeader => self.process_header(),
            Step::PagePayload => self.page_payload(),
        }
    }

    // ===== Connect =====

    fn connect(&mut self) -> Result<Step> {
        match self.try_connect() {
            Ok(next) => {
                self.reset_retried = false;
                Ok(next)
            }
            Err(Error::Io(err)) if !self.reset_retried && is_reset(&err) => {
                self.reset_retried = true;
                log::warn!(
                    "[channel {}] connection dropped during welcome ({}), retrying once",
                    self.device_ip,
                    err
                );
                Ok(Step::Connect)
            }
            Err(err) => Err(err),
        }
    }

    fn try_connect(&mut self) -> Result<Step> {
        self.conn.reconnect(self.target)?;
        // Some devices track the peer port across sessions; keep ours stable.
        self.conn.pin_local_port()?;

        if !self.conn.poll(WELCOME_TIMEOUT)? {
            return Err(Error::Timeout);
        }
        let mut buf = [0u8; 128];
        let n = self.conn.receive(&mut buf)?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "device closed the connection before the welcome message",
            )));
        }
        if buf[0] != b'+' {
            return Err(Error::protocol(format!(
                "invalid welcome message (first byte 0x{:02x})",
                buf[0]
            )));
        }

        self.conn.send(&GREETING_BUTTON)?;
        Ok(Step::ExchangeParams1)
    }

    // ===== Parameter exchanges =====

    fn exchange_params1(&mut self) -> Result<Step> {
        if !self.conn.poll(EXCHANGE1_TIMEOUT)? {
            return Err(Error::Timeout);
        }
        let mut buf = [0u8; 2048];
        let n = self.conn.receive(&mut buf)?;
        let msg = &buf[..n];

        if msg == [0xD0] {
            // The scanner has no preferred parameters; ours go out as-is.
            log::debug!(
                "[channel {}] device sent no scan parameters, using item defaults",
                self.device_ip
            );
        } else {
            if n < 5 || msg[0] != 0x30 {
                return Err(Error::protocol(format!(
                    "invalid initial exchange params msg (first byte 0x{:02x}, {} bytes)",
                    msg.first().copied().unwrap_or(0),
                    n
                )));
            }
            // 0x15 or 0x55; meaning unresolved, kept visible for diagnostics.
            log::debug!(
                "[channel {}] exchange params mode byte 0x{:02x}",
                self.device_ip,
                msg[1]
            );
            if msg[n - 2] != 0x0A {
                return Err(Error::protocol(
                    "invalid initial exchange params msg (missing record terminator)",
                ));
            }
            if msg[n - 1] != MSG_END {
                return Err(Error::protocol(
                    "invalid initial exchange params msg (missing message terminator)",
                ));
            }

            // Records run up to the message terminator; msg[n-2] is the last
            // record's own 0x0A, already validated above.
            self.params.parse_records(&msg[3..n - 1])?;
            self.params.normalize_resolution()?;

            let func = self.params.get(b'F').unwrap_or("");
            if ScanFunc::parse(func).is_none() {
                return Err(Error::protocol(format!("invalid scan function '{}'", func)));
            }
        }

        let mut out = vec![0x1B, 0x49, 0x0A];
        self.params.serialize(Some(EXCHANGE1_WHITELIST), &mut out);
        out.push(MSG_END);
        self.conn.send(&out)?;

        Ok(Step::ExchangeParams2)
    }

    fn exchange_params2(&mut self) -> Result<Step> {
        if !self.conn.poll(EXCHANGE2_TIMEOUT)? {
            return Err(Error::Timeout);
        }
        let mut buf = [0u8; 2048];
        let n = self.conn.receive(&mut buf)?;
        let msg = &buf[..n];

        if n < 4 || msg[0] != 0x00 || msg[2] != 0x00 {
            return Err(Error::protocol("invalid second exchange params msg (header)"));
        }
        let payload_len = msg[1] as usize;
        // Some firmware terminates the payload with a NUL on the wire, some
        // relies on the receiver's zeroed buffer; accept both.
        if 3 + payload_len > n {
            return Err(Error::protocol(
                "invalid second exchange params msg (length field)",
            ));
        }
        if n > 3 + payload_len && msg[3 + payload_len] != 0x00 {
            return Err(Error::protocol(
                "invalid second exchange params msg (missing terminator)",
            ));
        }

        let payload = std::str::from_utf8(&msg[3..3 + payload_len])
            .map_err(|_| Error::protocol("invalid second exchange params msg (not ASCII)"))?;
        let mut values = [0i64; 7];
        let mut count = 0;
        for piece in payload.split(',') {
            if count == values.len() {
                return Err(Error::protocol("second exchange params msg is too long"));
            }
            values[count] = piece
                .parse::<i64>()
                .map_err(|_| Error::protocol("invalid second exchange params msg (values)"))?;
            count += 1;
        }
        if count != values.len() {
            return Err(Error::protocol("second exchange params msg is too short"));
        }

        self.geometry = Geometry {
            xdpi: values[0],
            ydpi: values[1],
            width: values[4],
            height: values[6],
        };

        let device_res = format!("{},{}", self.geometry.xdpi, self.geometry.ydpi);
        if device_res.len() > MAX_VALUE_LEN {
            return Err(Error::protocol(format!("invalid resolution '{}'", device_res)));
        }
        if self.params.get(b'R') != Some(device_res.as_str()) {
            log::info!(
                "[channel {}] scanner does not support {} dpi; {} will be used instead",
                self.device_ip,
                self.params.get(b'R').unwrap_or("<unset>"),
                device_res
            );
            self.params.set(b'R', &device_res)?;
        }

        let crop = format!("0,0,{},{}", self.geometry.width, self.geometry.height);
        if crop.len() > MAX_VALUE_LEN {
            return Err(Error::protocol(format!("invalid page geometry '{}'", crop)));
        }
        self.params.set(b'A', &crop)?;

        let mut out = vec![0x1B, 0x58, 0x0A];
        self.params.serialize(Some(EXCHANGE2_WHITELIST), &mut out);
        out.push(MSG_END);
        self.conn.send(&out)?;

        Ok(Step::AwaitPage)
    }

    // ===== Page transfer =====

    fn await_page(&mut self) -> Result<Step> {
        if self.conn.buffered() == 0 {
            let ready = match self.conn.poll(self.page_init_timeout) {
                Ok(ready) => ready,
                Err(err) => {
                    log::warn!("[channel {}] wait for page failed: {}", self.device_ip, err);
                    false
                }
            };
            if !ready {
                // Normal end of a session with nothing (left) in the feeder.
                log::info!("[channel {}] going to sleep", self.device_ip);
                return Ok(Step::Paused);
            }
        }

        self.tempfile = Some(tempfile::tempfile()?);
        self.remaining_chunk_bytes = 0;
        Ok(Step::ProcessHeader)
    }

    fn process_header(&mut self) -> Result<Step> {
        self.conn.fill_buffer(1, self.page_finish_timeout)?;
        if self.conn.peek(1)?[0] == MSG_END {
            self.conn.read(1)?;
            return self.job_end();
        }

        if let Err(err) = self.conn.fill_buffer(PAGE_HEADER_SIZE, self.page_finish_timeout) {
            // A lone non-0x80 byte is the firmware's way of reporting failure.
            if err.is_timeout() && self.conn.buffered() == 1 {
                let code = self.conn.peek(1)?[0];
                return Err(Error::protocol(format!(
                    "device unavailable (error code {})",
                    code
                )));
            }
            return Err(err);
        }
        let header = PacketHeader::parse(self.conn.peek(PAGE_HEADER_SIZE)?);

        if header.magic != HEADER_MAGIC {
            return Err(Error::protocol(format!(
                "invalid header magic number ({:#06x} != 0x0007)",
                header.magic
            )));
        }

        match header.id {
            0x40 | 0x42 | 0x64 => self.chunk_header(header),
            0x82 => {
                self.conn.read(PAGE_HEADER_SIZE)?;
                self.page_end(header)
            }
            other => Err(Error::protocol(format!(
                "received unsupported header (id = {:#04x})",
                other
            ))),
        }
    }

    fn accept_page_id(&mut self, page_id: u16) -> Result<()> {
        if page_id == self.page_id.wrapping_add(1) {
            self.page_id = page_id;
            log::info!("[channel {}] now scanning page id {}", self.device_ip, page_id);
            Ok(())
        } else if page_id == self.page_id {
            // Another chunk of the current page.
            Ok(())
        } else {
            Err(Error::protocol(format!(
                "packet page_id mismatch (packet {} != local {})",
                page_id, self.page_id
            )))
        }
    }

    fn chunk_header(&mut self, header: PacketHeader) -> Result<Step> {
        self.conn.fill_buffer(CHUNK_HEADER_SIZE, self.page_finish_timeout)?;
        let chunk_len = {
            let bytes = self.conn.read(CHUNK_HEADER_SIZE)?;
            u16::from_le_bytes([bytes[10], bytes[11]]) as usize
        };

        self.accept_page_id(header.page_id)?;

        if CHUNK_HEADER_SIZE + chunk_len > CHUNK_MAX_SIZE {
            return Err(Error::protocol(format!("invalid chunk size {}", chunk_len)));
        }

        let percent = u32::from(header.progress) * 100 / CHUNK_MAX_PROGRESS;
        log::debug!(
            "[channel {}] receiving page {} data: {}%",
            self.device_ip,
            header.page_id,
            percent
        );

        self.format = PageFormat::from_header_id(header.id);
        self.remaining_chunk_bytes = chunk_len;
        Ok(Step::PagePayload)
    }

    fn page_payload(&mut self) -> Result<Step> {
        if self.remaining_chunk_bytes > 0 {
            self.conn.fill_buffer(1, self.page_finish_timeout)?;
            let take = self.conn.buffered().min(self.remaining_chunk_bytes);
            let tempfile = self
                .tempfile
                .as_mut()
                .ok_or(Error::InvalidState("page data without an open page"))?;
            let data = self.conn.read(take)?;
            tempfile.write_all(data)?;
            self.remaining_chunk_bytes -= take;
        }

        if self.remaining_chunk_bytes == 0 {
            Ok(Step::ProcessHeader)
        } else {
            Ok(Step::PagePayload)
        }
    }

    fn page_end(&mut self, header: PacketHeader) -> Result<Step> {
        if header.page_id != self.page_id {
            return Err(Error::protocol(format!(
                "packet page_id mismatch (packet {} != local {})",
                header.page_id, self.page_id
            )));
        }

        let mut tempfile = self
            .tempfile
            .take()
            .ok_or(Error::InvalidState("page end without an open page"))?;
        let filename = format!("scan{}.{}", self.scanned_pages, self.format.extension());
        self.scanned_pages += 1;

        tempfile.seek(SeekFrom::Start(0))?;
        let mut dest = File::create(self.output_dir.join(&filename))?;
        std::io::copy(&mut tempfile, &mut dest)?;

        log::info!(
            "[channel {}] successfully received page {} ({})",
            self.device_ip,
            header.page_id,
            filename
        );

        self.invoke_hook(Some(&filename))?;
        Ok(Step::AwaitPage)
    }

    fn job_end(&mut self) -> Result<Step> {
        // The page opened by await_page never produced data; discard it.
        self.tempfile = None;
        log::info!(
            "[channel {}] scan job complete ({} page(s) so far)",
            self.device_ip,
            self.scanned_pages
        );
        self.invoke_hook(None)?;
        Ok(Step::Paused)
    }

    fn invoke_hook(&self, filename: Option<&str>) -> Result<()> {
        let item = self
            .item
            .as_ref()
            .ok_or(Error::InvalidState("session has no item bound"))?;
        let command = match &item.scan_command {
            Some(command) => command,
            None => return Ok(()),
        };
        hook::run(
            command,
            &HookContext {
                xdpi: self.geometry.xdpi,
                ydpi: self.geometry.ydpi,
                width: self.geometry.width,
                height: self.geometry.height,
                page: self.page_id,
                device_ip: self.device_ip,
                hostname: &item.hostname,
                func: item.scan_func,
                filename,
            },
        )
    }
}

/// Welcome-phase failures worth one silent retry: the device aborted the
/// previous session's socket and needs a fresh connection.
fn is_reset(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::io::Read as _;
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::thread;

    /// Matches the device pacing the chunk-partition scenarios rely on.
    const MSG_DELAY: Duration = Duration::from_millis(2);

    const WELCOME: &[u8] = b"+200\x00OK";
    const EXCHANGE1_MSG: &[u8] = b"\x30\x14\x00F=FILE\nD=SIN\nE=SHO\n\x80";
    const EXCHANGE1_REPLY: &[u8] = b"\x1bI\nD=SIN\nM=CGRAY\nR=300,300\n\x80";
    const EXCHANGE2_MSG: &[u8] = b"\x00\x16\x00300,300,1,209,2480,0,0";
    const EXCHANGE2_REPLY: &[u8] =
        b"\x1bX\nA=0,0,2480,0\nB=50\nC=JPEG\nD=SIN\nG=1\nL=128\nM=CGRAY\nN=50\nR=300,300\n\x80";

    /// RLE chunk header: page 1, 6 payload bytes.
    const RLE_HEADER: &[u8] = b"\x42\x07\x00\x01\x00\x84\x00\x00\x00\x00\x06\x00";
    const RLE_PAYLOAD: &[u8] = b"\x81\x00\x81\x00\xcb\x00";
    const PAGE1_END: &[u8] = b"\x82\x07\x00\x01\x00\x84\x00\x00\x00\x00";
    const PAGE2_EMPTY_CHUNK: &[u8] = b"\x42\x07\x00\x02\x00\x84\x00\x00\x00\x00\x00\x00";
    const PAGE2_END: &[u8] = b"\x82\x07\x00\x02\x00\x84\x00\x00\x00\x00";

    struct Harness {
        session: Session,
        stream: TcpStream,
        outdir: tempfile::TempDir,
    }

    fn build_session(extra_config: &str) -> (Session, TcpListener, tempfile::TempDir) {
        let text = format!(
            "ip 127.0.0.1\npreset default FILE\nnetwork.page.init.timeout 1\n{}",
            extra_config
        );
        let config = Config::parse(&text).expect("config");
        let device = &config.devices[0];

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = match listener.local_addr().expect("addr") {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => unreachable!(),
        };

        let outdir = tempfile::tempdir().expect("tempdir");
        let mut session = Session::new(device).expect("session");
        session.target = addr;
        session.output_dir = outdir.path().to_path_buf();
        session.load_item(Arc::clone(&device.items[0]));
        (session, listener, outdir)
    }

    /// Drive Connect against a scripted accept, returning the server-side
    /// stream with the handshake already verified.
    fn connect(session: &mut Session, listener: &TcpListener) -> TcpStream {
        session.begin();
        let accepted = {
            let listener = listener.try_clone().expect("clone listener");
            thread::spawn(move || {
                let (mut stream, _) = listener.accept().expect("accept");
                stream.write_all(WELCOME).expect("welcome");
                stream
            })
        };
        assert_eq!(
            session.dispatch(Step::Connect).expect("connect"),
            Step::ExchangeParams1
        );
        let mut stream = accepted.join().expect("join");

        let mut greeting = [0u8; 4];
        stream.read_exact(&mut greeting).expect("greeting");
        assert_eq!(greeting, GREETING_BUTTON);
        stream
    }

    fn exchange_params(session: &mut Session, stream: &mut TcpStream) {
        stream.write_all(EXCHANGE1_MSG).expect("write");
        assert_eq!(
            session.dispatch(Step::ExchangeParams1).expect("exchange1"),
            Step::ExchangeParams2
        );
        let mut reply = vec![0u8; EXCHANGE1_REPLY.len()];
        stream.read_exact(&mut reply).expect("reply");
        assert_eq!(reply, EXCHANGE1_REPLY);

        stream.write_all(EXCHANGE2_MSG).expect("write");
        assert_eq!(
            session.dispatch(Step::ExchangeParams2).expect("exchange2"),
            Step::AwaitPage
        );
        let mut reply = vec![0u8; EXCHANGE2_REPLY.len()];
        stream.read_exact(&mut reply).expect("reply");
        assert_eq!(reply, EXCHANGE2_REPLY);
    }

    fn harness(extra_config: &str) -> Harness {
        let (mut session, listener, outdir) = build_session(extra_config);
        let mut stream = connect(&mut session, &listener);
        exchange_params(&mut session, &mut stream);
        Harness {
            session,
            stream,
            outdir,
        }
    }

    fn write_later(stream: &TcpStream, data: &[u8]) -> thread::JoinHandle<()> {
        let mut stream = stream.try_clone().expect("clone stream");
        let data = data.to_vec();
        thread::spawn(move || {
            thread::sleep(MSG_DELAY);
            stream.write_all(&data).expect("delayed write");
        })
    }

    #[test]
    fn happy_path_single_jpeg_page() {
        let mut h = harness("");
        let hooklog = h.outdir.path().join("hooklog.txt");

        // Re-bind the item with a hook that records each invocation.
        {
            let command = format!(
                "echo \"${{SCANNER_FILENAME-jobend}} $SCANNER_XDPI x$SCANNER_WIDTH\" >> {}",
                hooklog.display()
            );
            let mut item = (*h.session.item.clone().expect("item")).clone();
            item.scan_command = Some(command);
            h.session.item = Some(Arc::new(item));
        }

        let jpeg_header = b"\x64\x07\x00\x01\x00\x84\x00\x00\x00\x00\x06\x00";
        let payload = b"jpeg!!";

        h.stream.write_all(jpeg_header).expect("write");
        h.stream.write_all(payload).expect("write");
        h.stream.write_all(PAGE1_END).expect("write");
        h.stream.write_all(&[0x80]).expect("write");

        assert_eq!(h.session.dispatch(Step::AwaitPage).expect("await"), Step::ProcessHeader);
        assert_eq!(
            h.session.dispatch(Step::ProcessHeader).expect("header"),
            Step::PagePayload
        );
        assert_eq!(h.session.remaining_chunk_bytes, 6);
        assert_eq!(
            h.session.dispatch(Step::PagePayload).expect("payload"),
            Step::ProcessHeader
        );
        assert_eq!(h.session.remaining_chunk_bytes, 0);
        assert_eq!(
            h.session.dispatch(Step::ProcessHeader).expect("page end"),
            Step::AwaitPage
        );
        assert_eq!(
            h.session.dispatch(Step::AwaitPage).expect("await"),
            Step::ProcessHeader
        );
        assert_eq!(
            h.session.dispatch(Step::ProcessHeader).expect("job end"),
            Step::Paused
        );

        let page = std::fs::read(h.outdir.path().join("scan0.jpeg")).expect("page file");
        assert_eq!(page, payload);

        // One per-page hook invocation with a filename, one job-end without.
        let log = std::fs::read_to_string(&hooklog).expect("hook log");
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines, vec!["scan0.jpeg 300 x2480", "jobend 300 x2480"]);
    }

    #[test]
    fn chunk_boundary_stress() {
        let mut h = harness("");

        // Whole chunk in one segment.
        h.stream.write_all(RLE_HEADER).expect("write");
        h.stream.write_all(RLE_PAYLOAD).expect("write");
        assert_eq!(h.session.dispatch(Step::AwaitPage).expect("await"), Step::ProcessHeader);
        assert_eq!(
            h.session.dispatch(Step::ProcessHeader).expect("header"),
            Step::PagePayload
        );
        assert_eq!(h.session.remaining_chunk_bytes, 6);
        h.session.dispatch(Step::PagePayload).expect("payload");
        assert_eq!(h.session.remaining_chunk_bytes, 0);
        let mut chunks_written = 1;

        // Header alone, then the payload.
        h.stream.write_all(RLE_HEADER).expect("write");
        h.session.dispatch(Step::ProcessHeader).expect("header");
        assert_eq!(h.session.remaining_chunk_bytes, 6);
        h.stream.write_all(RLE_PAYLOAD).expect("write");
        h.session.dispatch(Step::PagePayload).expect("payload");
        assert_eq!(h.session.remaining_chunk_bytes, 0);
        chunks_written += 1;

        // Header plus one payload byte, then the rest.
        h.stream.write_all(RLE_HEADER).expect("write");
        h.stream.write_all(&RLE_PAYLOAD[..1]).expect("write");
        h.session.dispatch(Step::ProcessHeader).expect("header");
        assert_eq!(h.session.remaining_chunk_bytes, 6);
        h.session.dispatch(Step::PagePayload).expect("payload");
        assert_eq!(h.session.remaining_chunk_bytes, 5);
        h.stream.write_all(&RLE_PAYLOAD[1..]).expect("write");
        h.session.dispatch(Step::PagePayload).expect("payload");
        assert_eq!(h.session.remaining_chunk_bytes, 0);
        chunks_written += 1;

        // Split the header at every interesting offset; the delayed second
        // half forces the engine to poll mid-header.
        for partition in [1usize, 2, 6, 10, 11, 12] {
            h.stream.write_all(&RLE_HEADER[..partition]).expect("write");
            let pending = write_later(&h.stream, &RLE_HEADER[partition..]);
            h.session.dispatch(Step::ProcessHeader).expect("split header");
            pending.join().expect("join");
            assert_eq!(h.session.remaining_chunk_bytes, 6, "partition {partition}");
            h.stream.write_all(RLE_PAYLOAD).expect("write");
            h.session.dispatch(Step::PagePayload).expect("payload");
            assert_eq!(h.session.remaining_chunk_bytes, 0);
            chunks_written += 1;
        }

        h.stream.write_all(RLE_HEADER).expect("write");
        h.session.dispatch(Step::ProcessHeader).expect("header");
        assert_eq!(h.session.remaining_chunk_bytes, 6);

        // Payload glued to the front of the next (partial) header.
        for partition in [0usize, 1, 2, 6, 10, 11, 12] {
            let mut glued = RLE_PAYLOAD.to_vec();
            glued.extend_from_slice(&RLE_HEADER[..partition]);
            h.stream.write_all(&glued).expect("write");
            h.session.dispatch(Step::PagePayload).expect("payload");
            assert_eq!(h.session.remaining_chunk_bytes, 0, "partition {partition}");
            chunks_written += 1;

            let pending = write_later(&h.stream, &RLE_HEADER[partition..]);
            h.session.dispatch(Step::ProcessHeader).expect("split header");
            pending.join().expect("join");
            assert_eq!(h.session.remaining_chunk_bytes, 6);
        }
        h.stream.write_all(RLE_PAYLOAD).expect("write");
        h.session.dispatch(Step::PagePayload).expect("payload");
        assert_eq!(h.session.remaining_chunk_bytes, 0);
        chunks_written += 1;

        // Page 1 ends; page 2 is a single empty chunk; then job end.
        h.stream.write_all(PAGE1_END).expect("write");
        assert_eq!(
            h.session.dispatch(Step::ProcessHeader).expect("page end"),
            Step::AwaitPage
        );
        h.stream.write_all(PAGE2_EMPTY_CHUNK).expect("write");
        assert_eq!(
            h.session.dispatch(Step::AwaitPage).expect("await"),
            Step::ProcessHeader
        );
        assert_eq!(
            h.session.dispatch(Step::ProcessHeader).expect("header"),
            Step::PagePayload
        );
        h.stream.write_all(PAGE2_END).expect("write");
        assert_eq!(
            h.session.dispatch(Step::PagePayload).expect("payload"),
            Step::ProcessHeader
        );
        assert_eq!(
            h.session.dispatch(Step::ProcessHeader).expect("page end"),
            Step::AwaitPage
        );
        h.stream.write_all(&[0x80]).expect("write");
        assert_eq!(
            h.session.dispatch(Step::AwaitPage).expect("await"),
            Step::ProcessHeader
        );
        assert_eq!(
            h.session.dispatch(Step::ProcessHeader).expect("job end"),
            Step::Paused
        );

        // Every payload byte of page 1 landed in scan0.rle, in order.
        let page1 = std::fs::read(h.outdir.path().join("scan0.rle")).expect("page 1");
        assert_eq!(page1.len(), chunks_written * RLE_PAYLOAD.len());
        for chunk in page1.chunks(RLE_PAYLOAD.len()) {
            assert_eq!(chunk, RLE_PAYLOAD);
        }

        // The empty page produced a zero-byte file.
        let page2 = std::fs::read(h.outdir.path().join("scan1.rle")).expect("page 2");
        assert!(page2.is_empty());
    }

    #[test]
    fn unsupported_dpi_is_replaced_by_the_device_value() {
        let (mut session, listener, _outdir) = build_session("scan.param R 600,600\n");
        let mut stream = connect(&mut session, &listener);

        stream.write_all(EXCHANGE1_MSG).expect("write");
        session.dispatch(Step::ExchangeParams1).expect("exchange1");
        let mut reply = vec![0u8; b"\x1bI\nD=SIN\nM=CGRAY\nR=600,600\n\x80".len()];
        stream.read_exact(&mut reply).expect("reply");
        assert_eq!(reply, b"\x1bI\nD=SIN\nM=CGRAY\nR=600,600\n\x80");

        // The device answers with 300x300: the working R is overwritten and
        // the second reply advertises the device's value.
        stream.write_all(EXCHANGE2_MSG).expect("write");
        session.dispatch(Step::ExchangeParams2).expect("exchange2");
        let mut reply = vec![0u8; EXCHANGE2_REPLY.len()];
        stream.read_exact(&mut reply).expect("reply");
        assert_eq!(reply, EXCHANGE2_REPLY);
        assert_eq!(session.params.get(b'R'), Some("300,300"));
    }

    #[test]
    fn short_d0_reply_keeps_item_defaults() {
        let (mut session, listener, _outdir) = build_session("");
        let mut stream = connect(&mut session, &listener);

        stream.write_all(&[0xD0]).expect("write");
        assert_eq!(
            session.dispatch(Step::ExchangeParams1).expect("exchange1"),
            Step::ExchangeParams2
        );
        let mut reply = vec![0u8; EXCHANGE1_REPLY.len()];
        stream.read_exact(&mut reply).expect("reply");
        assert_eq!(reply, EXCHANGE1_REPLY);
    }

    #[test]
    fn invalid_welcome_is_a_protocol_error() {
        let (mut session, listener, _outdir) = build_session("");
        session.begin();
        let accepted = {
            let listener = listener.try_clone().expect("clone");
            thread::spawn(move || {
                let (mut stream, _) = listener.accept().expect("accept");
                stream.write_all(b"-ERR").expect("write");
                stream
            })
        };
        let err = session.dispatch(Step::Connect).expect_err("bad welcome");
        assert!(matches!(err, Error::Protocol(_)));
        drop(accepted.join().expect("join"));
    }

    #[test]
    fn welcome_reset_is_retried_once() {
        let (mut session, listener, _outdir) = build_session("");
        session.begin();

        // First accept drops the connection before the welcome message.
        let dropper = {
            let listener = listener.try_clone().expect("clone");
            thread::spawn(move || {
                let (stream, _) = listener.accept().expect("accept");
                drop(stream);
            })
        };
        assert_eq!(session.dispatch(Step::Connect).expect("retry"), Step::Connect);
        dropper.join().expect("join");

        // Second drop is surfaced as a failure.
        let dropper = {
            let listener = listener.try_clone().expect("clone");
            thread::spawn(move || {
                let (stream, _) = listener.accept().expect("accept");
                drop(stream);
            })
        };
        assert!(session.dispatch(Step::Connect).is_err());
        dropper.join().expect("join");
    }

    #[test]
    fn bad_header_magic_is_a_protocol_error() {
        let mut h = harness("");
        h.stream
            .write_all(b"\x42\x15\x00\x01\x00\x84\x00\x00\x00\x00\x06\x00")
            .expect("write");
        assert_eq!(h.session.dispatch(Step::AwaitPage).expect("await"), Step::ProcessHeader);
        let err = h
            .session
            .dispatch(Step::ProcessHeader)
            .expect_err("bad magic");
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn page_id_regression_is_a_protocol_error() {
        let mut h = harness("");

        h.stream.write_all(RLE_HEADER).expect("write");
        h.stream.write_all(RLE_PAYLOAD).expect("write");
        assert_eq!(h.session.dispatch(Step::AwaitPage).expect("await"), Step::ProcessHeader);
        h.session.dispatch(Step::ProcessHeader).expect("header");
        h.session.dispatch(Step::PagePayload).expect("payload");

        // A chunk that skips ahead to page 3 violates the monotone-id rule.
        h.stream
            .write_all(b"\x42\x07\x00\x03\x00\x84\x00\x00\x00\x00\x06\x00")
            .expect("write");
        let err = h
            .session
            .dispatch(Step::ProcessHeader)
            .expect_err("page skip");
        assert!(err.to_string().contains("page_id mismatch"));
    }

    #[test]
    fn await_page_timeout_is_not_an_error() {
        // Override the deadline to zero so the poll expires immediately.
        let mut h = harness("network.page.init.timeout 0\n");
        assert_eq!(h.session.dispatch(Step::AwaitPage).expect("await"), Step::Paused);
        assert!(h.session.tempfile.is_none());
    }
}
