//! Intel HEX images.
//!
//! Only what the programmer and the CRC patcher need: data, EOF, extended
//! segment/linear address and start address records. Bytes are kept sparse,
//! keyed by absolute address, so holes in the image stay holes when the file
//! is written back.

use std::{collections::BTreeMap, fmt::Write as _, path::Path};

use crate::{Error, ResultExt, Segment};

const DATA: u8 = 0x00;
const EOF: u8 = 0x01;
const EXT_SEGMENT: u8 = 0x02;
const START_SEGMENT: u8 = 0x03;
const EXT_LINEAR: u8 = 0x04;
const START_LINEAR: u8 = 0x05;

const BYTES_PER_RECORD: usize = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StartAddress {
    Segment { cs: u16, ip: u16 },
    Linear(u32),
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HexFile {
    bytes: BTreeMap<u32, u8>,
    start: Option<StartAddress>,
}

impl HexFile {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text)
            .with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut hex = HexFile::default();
        let mut base = 0_u32;

        for (i, line) in text.lines().enumerate() {
            let line_no = i + 1;
            let bad = |reason: &'static str| Error::Image { line: line_no, reason: reason.into() };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let digits = line.strip_prefix(':').ok_or_else(|| bad("missing ':'"))?;
            let record = decode_hex(digits).ok_or_else(|| bad("invalid hex digits"))?;
            if record.len() < 5 {
                return Err(bad("record too short"));
            }
            let len = usize::from(record[0]);
            if record.len() != len + 5 {
                return Err(bad("length does not match byte count"));
            }
            if record.iter().fold(0_u8, |sum, b| sum.wrapping_add(*b)) != 0 {
                return Err(bad("checksum mismatch"));
            }

            let offset = u16::from_be_bytes([record[1], record[2]]);
            let payload = &record[4..4 + len];
            match record[3] {
                DATA => {
                    for (j, &byte) in payload.iter().enumerate() {
                        let addr = base.wrapping_add(u32::from(offset.wrapping_add(j as u16)));
                        hex.bytes.insert(addr, byte);
                    }
                }
                EOF => break,
                EXT_SEGMENT => {
                    let [hi, lo] = <[u8; 2]>::try_from(payload).map_err(|_| bad("bad segment address"))?;
                    base = u32::from(u16::from_be_bytes([hi, lo])) << 4;
                }
                EXT_LINEAR => {
                    let [hi, lo] = <[u8; 2]>::try_from(payload).map_err(|_| bad("bad linear address"))?;
                    base = u32::from(u16::from_be_bytes([hi, lo])) << 16;
                }
                START_SEGMENT => {
                    let [a, b, c, d] = <[u8; 4]>::try_from(payload).map_err(|_| bad("bad start address"))?;
                    hex.start = Some(StartAddress::Segment {
                        cs: u16::from_be_bytes([a, b]),
                        ip: u16::from_be_bytes([c, d]),
                    });
                }
                START_LINEAR => {
                    let addr = <[u8; 4]>::try_from(payload).map_err(|_| bad("bad start address"))?;
                    hex.start = Some(StartAddress::Linear(u32::from_be_bytes(addr)));
                }
                _ => return Err(bad("unknown record type")),
            }
        }

        Ok(hex)
    }

    pub fn get(&self, addr: u32) -> Option<u8> {
        self.bytes.get(&addr).copied()
    }

    pub fn set(&mut self, addr: u32, byte: u8) {
        self.bytes.insert(addr, byte);
    }

    pub fn start_address(&self) -> Option<StartAddress> {
        self.start
    }

    /// Contiguous occupied ranges as `(start, end)`, end exclusive.
    pub fn segments(&self) -> Vec<(u32, u64)> {
        let mut ranges: Vec<(u32, u64)> = Vec::new();
        for &addr in self.bytes.keys() {
            match ranges.last_mut() {
                Some((_, end)) if *end == u64::from(addr) => *end += 1,
                _ => ranges.push((addr, u64::from(addr) + 1)),
            }
        }
        ranges
    }

    /// `size` bytes starting at `start`, with holes filled with `pad`.
    pub fn to_bin(&self, start: u32, size: usize, pad: u8) -> Vec<u8> {
        (0..size)
            .map(|i| self.get(start.wrapping_add(i as u32)).unwrap_or(pad))
            .collect()
    }

    pub fn data_segments(&self) -> Vec<Segment> {
        self.segments()
            .into_iter()
            .map(|(start, end)| {
                let data = self.bytes.range(start..).take((end - u64::from(start)) as usize).map(|(_, b)| *b).collect();
                Segment::new(start, data)
            })
            .collect()
    }

    pub fn to_hex_string(&self) -> String {
        let mut out = String::new();
        let mut upper = 0_u16;

        if let Some(start) = self.start {
            match start {
                StartAddress::Segment { cs, ip } => {
                    let [a, b] = cs.to_be_bytes();
                    let [c, d] = ip.to_be_bytes();
                    push_record(&mut out, 0, START_SEGMENT, &[a, b, c, d]);
                }
                StartAddress::Linear(addr) => {
                    push_record(&mut out, 0, START_LINEAR, &addr.to_be_bytes());
                }
            }
        }

        for segment in self.data_segments() {
            let mut addr = segment.start;
            let mut rest = segment.data.as_slice();
            while !rest.is_empty() {
                let hi = (addr >> 16) as u16;
                if hi != upper {
                    push_record(&mut out, 0, EXT_LINEAR, &hi.to_be_bytes());
                    upper = hi;
                }
                // records never straddle a 64K boundary
                let room = 0x1_0000 - (addr & 0xFFFF) as usize;
                let n = rest.len().min(BYTES_PER_RECORD).min(room);
                push_record(&mut out, addr as u16, DATA, &rest[..n]);
                rest = &rest[n..];
                addr = addr.wrapping_add(n as u32);
            }
        }

        push_record(&mut out, 0, EOF, &[]);
        out
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        std::fs::write(path, self.to_hex_string())
            .with_context(|| format!("writing {}", path.display()))
    }
}

fn push_record(out: &mut String, offset: u16, kind: u8, payload: &[u8]) {
    let [hi, lo] = offset.to_be_bytes();
    let mut record = vec![payload.len() as u8, hi, lo, kind];
    record.extend_from_slice(payload);
    let checksum = record.iter().fold(0_u8, |sum, b| sum.wrapping_add(*b)).wrapping_neg();
    record.push(checksum);

    out.push(':');
    for byte in record {
        let _ = write!(out, "{byte:02X}");
    }
    out.push('\n');
}

fn decode_hex(digits: &str) -> Option<Vec<u8>> {
    if digits.len() % 2 != 0 || !digits.is_ascii() {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMAGE: &str = "\
:020000040000FA
:10000000000102030405060708090A0B0C0D0E0F78
:0400100010111213A6
:02000004008179
:02000000AABB99
:00000001FF
";

    #[test]
    fn parses_data_and_extended_addresses() {
        let hex = HexFile::parse(IMAGE).unwrap();
        assert_eq!(hex.segments(), vec![(0x0000, 0x0014), (0x0081_0000, 0x0081_0002)]);
        assert_eq!(hex.get(0x13), Some(0x13));
        assert_eq!(hex.get(0x14), None);
        assert_eq!(hex.get(0x0081_0001), Some(0xBB));

        let segments = hex.data_segments();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].start, 0);
        assert_eq!(segments[0].data, (0..0x14).collect::<Vec<u8>>());
        assert_eq!(segments[1], Segment::new(0x0081_0000, vec![0xAA, 0xBB]));
    }

    #[test]
    fn rejects_malformed_records() {
        match HexFile::parse(":020000040000FA\n:0400100010111213FF\n").unwrap_err() {
            Error::Image { line, .. } => assert_eq!(line, 2),
            e => panic!("unexpected error {e:?}"),
        }
        assert!(HexFile::parse("0400100010111213A6\n").is_err());
        assert!(HexFile::parse(":0500100010111213A6\n").is_err());
        assert!(HexFile::parse(":0400100010111213A\n").is_err());
        assert!(HexFile::parse(":00000007F9\n").is_err());
    }

    #[test]
    fn to_bin_pads_holes() {
        let hex = HexFile::parse(IMAGE).unwrap();
        assert_eq!(hex.to_bin(0x12, 4, 0xFF), vec![0x12, 0x13, 0xFF, 0xFF]);
    }

    #[test]
    fn written_file_reads_back() {
        let mut hex = HexFile::parse(IMAGE).unwrap();
        hex.set(0xFE, 0x12);
        hex.set(0xFF, 0x34);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.hex");
        hex.save(&path).unwrap();
        assert_eq!(HexFile::load(&path).unwrap(), hex);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains(":02000004008179\n"));
        assert!(text.ends_with(":00000001FF\n"));
    }

    #[test]
    fn records_split_at_64k_boundary() {
        let mut hex = HexFile::default();
        for i in 0..4 {
            hex.set(0xFFFE + i, i as u8);
        }
        let text = hex.to_hex_string();
        assert_eq!(
            text.lines().collect::<Vec<_>>(),
            vec![":02FFFE00000100", ":020000040001F9", ":020000000203F9", ":00000001FF"],
        );
        assert_eq!(HexFile::parse(&text).unwrap(), hex);
    }

    #[test]
    fn keeps_start_address() {
        let hex = HexFile::parse(":0400000500001234B1\n:00000001FF\n").unwrap();
        assert_eq!(hex.start_address(), Some(StartAddress::Linear(0x1234)));
        assert!(hex.to_hex_string().starts_with(":0400000500001234B1\n"));
    }
}
