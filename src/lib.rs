//! Host side of the STK500-style serial bootloader found on megaTinyNrf
//! targets.
//!
//! The device speaks a stripped-down STK500 dialect: every command is an
//! opcode, an optional payload and a space terminator, and every command is
//! answered by a two-byte status (`0x14 0x10` for OK, `0x14 0x11` for a
//! failure the device noticed). There is no length framing on the wire, so
//! everything here is strictly request/response.

use std::{
    borrow::Cow,
    io::{ErrorKind, Read, Write},
    time::Duration,
};

use enum_map::EnumMap;
use log::{debug, info, trace, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serialport::{DataBits, Parity, SerialPort, StopBits};
use thiserror::Error;

pub mod crc;
pub mod ihex;

/// Largest chunk written under a single load-address command.
pub const PAGE_SIZE: usize = 64;

const SYNC_ATTEMPTS: usize = 5;

const EOP: u8 = b' ';
const INSYNC: u8 = 0x14;
const OK: u8 = 0x10;
const FAILED: u8 = 0x11;
const PROMPT: u8 = b'>';

/// Parameter numbers understood by `GetParameter`.
pub const SW_MAJOR: u8 = 0x81;
pub const SW_MINOR: u8 = 0x82;

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum Cmd {
    GetSync = 0x30,
    GetParameter = 0x41,
    LeaveProgMode = 0x51,
    LoadAddress = 0x55,
    ProgPage = 0x64,
    ReadSign = 0x75,
}

/// Outcome of one command, as seen by the host.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Status {
    Ack,
    Fail,
    NoResponse,
    Garbled,
}

impl Status {
    pub fn decode(response: &[u8]) -> Self {
        match response {
            [] => Status::NoResponse,
            [INSYNC, OK] => Status::Ack,
            [INSYNC, FAILED] => Status::Fail,
            _ => Status::Garbled,
        }
    }
}

/// Target memory regions, keyed by bits 16 and up of an image address.
#[derive(Copy, Clone, Debug, Eq, PartialEq, enum_map::Enum)]
pub enum Region {
    Program,
    Eeprom,
    Fuses,
    UserSignatures,
    Unknown,
}

impl Region {
    pub fn classify(address: u32) -> Self {
        match address >> 16 {
            0x00 => Region::Program,
            0x81 => Region::Eeprom,
            0x82 => Region::Fuses,
            0x85 => Region::UserSignatures,
            _ => Region::Unknown,
        }
    }

    /// Memory type letter sent with each page, or `None` if the region must
    /// not be written.
    pub fn letter(self) -> Option<u8> {
        match self {
            Region::Program => Some(b'F'),
            Region::Eeprom => Some(b'E'),
            Region::UserSignatures => Some(b'U'),
            Region::Fuses | Region::Unknown => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Region::Program => "program memory",
            Region::Eeprom => "EEPROM",
            Region::Fuses => "fuses",
            Region::UserSignatures => "user signatures",
            Region::Unknown => "unknown",
        }
    }
}

/// A contiguous run of image bytes starting at `start`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    pub start: u32,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn new(start: u32, data: Vec<u8>) -> Self {
        Segment { start, data }
    }
}

/// Splits `data` into `(address, page)` pairs of at most `PAGE_SIZE` bytes.
pub fn pages(start: u32, data: &[u8]) -> impl Iterator<Item = (u32, &[u8])> + '_ {
    data.chunks(PAGE_SIZE)
        .enumerate()
        .map(move |(i, page)| (start.wrapping_add((i * PAGE_SIZE) as u32), page))
}

/// Receives progress while a region is written.
pub trait Progress {
    fn start(&mut self, region: Region, total: usize);
    fn advance(&mut self, written: usize);
    fn finish(&mut self);
}

impl Progress for () {
    fn start(&mut self, _region: Region, _total: usize) {}
    fn advance(&mut self, _written: usize) {}
    fn finish(&mut self) {}
}

/// Byte-stream link to the device.
///
/// Reads are expected to give up with `ErrorKind::TimedOut` (or return 0)
/// once the link's read timeout expires.
pub trait Transport: Read + Write {
    fn bytes_available(&mut self) -> Result<usize, Error>;
}

impl Transport for Box<dyn SerialPort> {
    fn bytes_available(&mut self) -> Result<usize, Error> {
        Ok(self.bytes_to_read()? as usize)
    }
}

/// Opens `path` with the line settings the bootloader expects (8E1).
pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn SerialPort>, Error> {
    let port = serialport::new(path, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::Even)
        .stop_bits(StopBits::One)
        .timeout(timeout)
        .open()?;
    Ok(port)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    Connected,
    Programming,
    Closed,
}

/// Bytes handled per region by `Stk500::flash`.
#[derive(Clone, Debug, Default)]
pub struct Summary {
    pub written: EnumMap<Region, usize>,
    pub skipped: EnumMap<Region, usize>,
}

pub struct Stk500<T> {
    port: T,
    verbose: bool,
    state: State,
}

impl<T: Transport> Stk500<T> {
    pub fn new(port: T, verbose: bool) -> Self {
        Stk500 {
            port,
            verbose,
            state: State::Idle,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn into_inner(self) -> T {
        self.port
    }

    /// Probes the device until it answers in sync.
    ///
    /// Anything the device had queued from an earlier session is read off
    /// and discarded; only the last status seen after each probe counts.
    pub fn connect(&mut self) -> Result<(), Error> {
        let probe = [Cmd::GetSync as u8];
        self.write_frame(&[&probe])?;
        for attempt in 1..=SYNC_ATTEMPTS {
            self.write_frame(&[&probe])?;
            let response = self.last_status()?;
            match Status::decode(&response) {
                Status::Ack => {
                    info!("connected to device");
                    self.state = State::Connected;
                    return Ok(());
                }
                Status::Fail => return Err(Error::SyncError),
                Status::NoResponse => return Err(Error::NoResponse),
                Status::Garbled => {
                    debug!("sync attempt {attempt}: got {response:02x?}");
                }
            }
        }
        Err(Error::UnexpectedResponse)
    }

    fn last_status(&mut self) -> Result<Vec<u8>, Error> {
        let mut last = Vec::with_capacity(2);
        let mut cruft = 0_usize;
        loop {
            last.clear();
            if let Some(byte) = self.read_byte()? {
                last.push(byte);
                if byte == INSYNC {
                    last.extend(self.read_byte()?);
                }
            }
            if self.port.bytes_available()? == 0 {
                break;
            }
            cruft += last.len();
        }
        if cruft > 0 {
            debug!("{cruft} bytes drained ahead of sync response");
        }
        Ok(last)
    }

    /// Sends one framed command and waits for its status.
    pub fn send(&mut self, parts: &[&[u8]]) -> Result<(), Error> {
        self.write_frame(parts)?;
        let response = self.read_up_to(2)?;
        match Status::decode(&response) {
            Status::Ack => Ok(()),
            Status::Fail => Err(Error::ProgrammingFailed),
            Status::NoResponse | Status::Garbled => Err(Error::CommunicationError(response)),
        }
    }

    /// Sends a framed command whose answer carries `len` bytes between the
    /// in-sync marker and the status.
    fn query(&mut self, parts: &[&[u8]], len: usize) -> Result<Vec<u8>, Error> {
        self.write_frame(parts)?;
        let response = self.read_up_to(len + 2)?;
        match response.as_slice() {
            [INSYNC, payload @ .., OK] if payload.len() == len => Ok(payload.to_vec()),
            [INSYNC, payload @ .., FAILED] if payload.len() == len => Err(Error::ProgrammingFailed),
            _ => Err(Error::CommunicationError(response)),
        }
    }

    pub fn get_parameter(&mut self, which: u8) -> Result<u8, Error> {
        let value = self
            .query(&[&[Cmd::GetParameter as u8, which]], 1)
            .with_context(|| format!("failed to read parameter {which:#x}"))?;
        Ok(value[0])
    }

    pub fn bootloader_version(&mut self) -> Result<(u8, u8), Error> {
        Ok((self.get_parameter(SW_MAJOR)?, self.get_parameter(SW_MINOR)?))
    }

    pub fn read_signature(&mut self) -> Result<[u8; 3], Error> {
        let sig = self
            .query(&[&[Cmd::ReadSign as u8]], 3)
            .context("failed to read device signature")?;
        Ok([sig[0], sig[1], sig[2]])
    }

    /// Sends a line to the device's text console and collects its reply up
    /// to the `\n>` prompt. The prompt itself is not returned.
    pub fn send_command(&mut self, line: &str) -> Result<String, Error> {
        self.ensure_open()?;
        debug!("-> {line:?}");
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()?;

        let mut reply = Vec::new();
        loop {
            let Some(byte) = self.read_byte()? else {
                return Err(Error::CommunicationError(reply));
            };
            if byte == PROMPT && reply.last() == Some(&b'\n') {
                break;
            }
            if self.verbose {
                let mut out = std::io::stdout().lock();
                out.write_all(&[byte])?;
                out.flush()?;
            }
            reply.push(byte);
        }
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    /// Writes `data` to the region `start` falls in, one page at a time.
    ///
    /// Returns the number of bytes written, which is 0 for regions that are
    /// skipped.
    pub fn program(&mut self, start: u32, data: &[u8], progress: &mut impl Progress) -> Result<usize, Error> {
        let region = Region::classify(start);
        let Some(letter) = region.letter() else {
            if region == Region::Fuses {
                warn!("skipping fuses segment");
            } else {
                let end = start.wrapping_add(data.len() as u32);
                warn!("unknown segment {start:#010x}-{end:#010x}, skipping");
            }
            return Ok(0);
        };

        self.state = State::Programming;
        progress.start(region, data.len());
        for (addr, page) in pages(start, data) {
            context_scope(
                || {
                    self.send(&[&[Cmd::LoadAddress as u8, addr as u8, (addr >> 8) as u8]])?;
                    self.send(&[&[Cmd::ProgPage as u8, 0, page.len() as u8], &[letter], page])
                },
                || format!("writing {} page at {addr:#06x}", region.name()),
            )?;
            progress.advance(page.len());
        }
        progress.finish();
        Ok(data.len())
    }

    /// Runs a whole programming session: sync, every segment in order, then
    /// quit. The quit is attempted exactly once, error or not.
    pub fn flash(&mut self, segments: &[Segment], progress: &mut impl Progress) -> Result<Summary, Error> {
        let mut session = scopeguard::guard(self, |session| {
            if let Err(e) = session.close() {
                warn!("failed to close session: {e}");
            }
        });

        session.connect()?;
        let mut summary = Summary::default();
        for segment in segments {
            let region = Region::classify(segment.start);
            let n = session.program(segment.start, &segment.data, progress)?;
            if region.letter().is_some() {
                summary.written[region] += n;
            } else {
                summary.skipped[region] += segment.data.len();
            }
        }

        let session = scopeguard::ScopeGuard::into_inner(session);
        session.close()?;
        Ok(summary)
    }

    /// Tells the device to leave programming mode. Only the first call does
    /// anything.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.state == State::Closed {
            return Ok(());
        }
        let result = self
            .send(&[&[Cmd::LeaveProgMode as u8]])
            .context("failed to leave programming mode");
        self.state = State::Closed;
        result
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.state == State::Closed {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn write_frame(&mut self, parts: &[&[u8]]) -> Result<(), Error> {
        self.ensure_open()?;
        if let Some(cmd) = parts.first().and_then(|p| p.first()).and_then(|&op| Cmd::from_u8(op)) {
            debug!("-> {cmd:?}");
        }
        for part in parts {
            trace!("-> {part:02x?}");
            self.port.write_all(part)?;
        }
        self.port.write_all(&[EOP])?;
        self.port.flush()?;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<Option<u8>, Error> {
        let mut byte = 0;
        match self.port.read(std::slice::from_mut(&mut byte)) {
            Ok(0) => Ok(None),
            Ok(_) => {
                trace!("<- {byte:#04x}");
                Ok(Some(byte))
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_up_to(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        let mut response = Vec::with_capacity(n);
        while response.len() < n {
            match self.read_byte()? {
                Some(byte) => response.push(byte),
                None => break,
            }
        }
        Ok(response)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no response from device")]
    NoResponse,
    #[error("device reported an error while syncing")]
    SyncError,
    #[error("unexpected response while syncing")]
    UnexpectedResponse,
    #[error("device reported a programming failure")]
    ProgrammingFailed,
    #[error("communication error, got {0:02x?}")]
    CommunicationError(Vec<u8>),
    #[error("session already closed")]
    Closed,
    #[error("bad hex record on line {line}: {reason}")]
    Image {
        line: usize,
        reason: Cow<'static, str>,
    },
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("serial port configuration error")]
    Ser(#[from] serialport::Error),

    #[error("{0}")]
    Context(Cow<'static, str>, #[source] Box<Self>),
}

impl Error {
    /// The error underneath any context layers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context(_, inner) => inner.root(),
            e => e,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.root() {
            Error::NoResponse => "NoResponse",
            Error::SyncError => "SyncError",
            Error::UnexpectedResponse => "UnexpectedResponse",
            Error::ProgrammingFailed => "ProgrammingFailed",
            Error::CommunicationError(_) => "CommunicationError",
            Error::Closed => "SessionClosed",
            Error::Image { .. } => "ImageError",
            Error::Io(_) => "IoError",
            Error::Ser(_) => "SerialError",
            Error::Context(..) => "Error",
        }
    }
}

pub trait ResultExt {
    type Ok;
    fn context(self, info: impl Into<Cow<'static, str>>) -> Result<Self::Ok, Error>;
    fn with_context<M>(self, f: impl FnOnce() -> M) -> Result<Self::Ok, Error>
        where M: Into<Cow<'static, str>>;
}

impl<T, E> ResultExt for Result<T, E>
    where E: Into<Error>,
{
    type Ok = T;

    fn context(self, info: impl Into<Cow<'static, str>>) -> Result<T, Error> {
        self.map_err(|e| Error::Context(info.into(), Box::new(e.into())))
    }

    fn with_context<M>(self, f: impl FnOnce() -> M) -> Result<T, Error>
        where M: Into<Cow<'static, str>>
    {
        self.map_err(|e| Error::Context(f().into(), Box::new(e.into())))
    }
}

fn context_scope<T, C>(
    body: impl FnOnce() -> Result<T, Error>,
    context_provider: impl FnOnce() -> C,
) -> Result<T, Error>
    where C: Into<Cow<'static, str>>,
{
    body().with_context(context_provider)
}
