//! CRC-16/CCITT stamping for bootloader images.
//!
//! The bootloader checks its own first page against a CRC stored inside
//! that page. Older images keep it in the last two bytes of the page, XORed
//! with `FINAL_XOR`. Newer ones reserve a `0xCC 0xCC` placeholder anywhere
//! in the page, and the placeholder is replaced with whatever two bytes make
//! the CRC of the whole page come out to a fixed value.

use log::debug;

use crate::ihex::HexFile;

pub const POLY: u32 = 0x1_1021;
pub const INIT: u16 = 0xFFFF;
pub const FINAL_XOR: u16 = 0x84CF;

/// Where the fixed-offset layout stores its CRC (high byte first).
pub const FIXED_OFFSET: u32 = 0xFE;

pub const SENTINEL: [u8; 2] = [0xCC, 0xCC];

/// MSB-first CRC over `data`, starting from `crc`.
pub fn crc16(data: &[u8], crc: u16) -> u16 {
    let mut crc = u32::from(crc);
    for &byte in data {
        crc ^= u32::from(byte) << 8;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x1_0000 != 0 {
                crc ^= POLY;
            }
        }
    }
    crc as u16
}

/// Runs `crc16` backwards: given the register value after `data`, returns
/// the value it must have held before.
pub fn crc16_reverse(data: &[u8], crc: u16) -> u16 {
    let mut crc = u32::from(crc);
    for &byte in data.iter().rev() {
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc ^= POLY;
            }
            crc >>= 1;
        }
        crc ^= u32::from(byte) << 8;
    }
    crc as u16
}

/// Finds the two bytes (big-endian) that, placed at `pos`, make the CRC of
/// all of `buffer` equal `desired`. Whatever currently sits at `pos` is
/// ignored.
pub fn fix_crc16_pos(buffer: &[u8], pos: usize, desired: u16) -> u16 {
    let head = buffer.get(..pos).unwrap_or(buffer);
    let tail = buffer.get(pos + 2..).unwrap_or_default();

    let mut chain = crc16(head, INIT).to_be_bytes().to_vec();
    chain.extend_from_slice(tail);
    crc16_reverse(&chain, desired)
}

/// Stamps the fixed-offset CRC into `hex` and returns it.
pub fn stamp_fixed(hex: &mut HexFile) -> u16 {
    let data = hex.to_bin(0, FIXED_OFFSET as usize, 0xFF);
    let crc = crc16(&data, INIT) ^ FINAL_XOR;
    let [hi, lo] = crc.to_be_bytes();
    hex.set(FIXED_OFFSET, hi);
    hex.set(FIXED_OFFSET + 1, lo);
    crc
}

/// Replaces the first sentinel within the first `size` bytes of `hex` so the
/// CRC over those bytes becomes `target`. Returns `None`, leaving `hex`
/// alone, if there is no sentinel.
pub fn stamp_sentinel(hex: &mut HexFile, size: usize, target: u16) -> Option<u16> {
    let data = hex.to_bin(0, size, 0xFF);
    let offset = data.windows(2).position(|w| w == SENTINEL)?;
    debug!("sentinel found at offset {offset:#x}");

    let crc = fix_crc16_pos(&data, offset, target);
    let [hi, lo] = crc.to_be_bytes();
    hex.set(offset as u32, hi);
    hex.set(offset as u32 + 1, lo);
    Some(crc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_init() {
        assert_eq!(crc16(&[], INIT), 0xFFFF);
        assert_eq!(crc16_reverse(&[], 0x1234), 0x1234);
    }

    #[test]
    fn golden_values() {
        assert_eq!(crc16(b"123456789", INIT), 0x29B1);
        assert_eq!(crc16(b"123456789", INIT) ^ FINAL_XOR, 0xAD7E);
    }

    #[test]
    fn reverse_undoes_forward() {
        let data = b"megaTinyNrf bootloader";
        for start in [0x0000, 0xFFFF, 0x1D0F] {
            let end = crc16(data, start);
            assert_eq!(crc16_reverse(data, end), start);
        }
    }

    #[test]
    fn fixed_value_makes_whole_buffer_hit_target() {
        let mut buffer: Vec<u8> = (0..=255).map(|i: u32| (i * 7 + 3) as u8).collect();
        let pos = 0x42;
        buffer[pos..pos + 2].copy_from_slice(&SENTINEL);

        for target in [0xFFFF, 0x0000, 0xBEEF] {
            let fix = fix_crc16_pos(&buffer, pos, target);
            let mut patched = buffer.clone();
            patched[pos..pos + 2].copy_from_slice(&fix.to_be_bytes());
            assert_eq!(crc16(&patched, INIT), target);
        }
    }

    #[test]
    fn fixed_value_at_buffer_edges() {
        let buffer = [0xCC, 0xCC, 1, 2, 3, 4, 0xCC, 0xCC];
        for pos in [0, 6] {
            let fix = fix_crc16_pos(&buffer, pos, 0xFFFF);
            let mut patched = buffer;
            patched[pos..pos + 2].copy_from_slice(&fix.to_be_bytes());
            assert_eq!(crc16(&patched, INIT), 0xFFFF);
        }
    }

    #[test]
    fn stamps_fixed_offset() {
        let mut hex = HexFile::default();
        for addr in 0..0x40 {
            hex.set(addr, addr as u8);
        }
        let crc = stamp_fixed(&mut hex);

        let expected = crc16(&hex.to_bin(0, 0xFE, 0xFF), INIT) ^ FINAL_XOR;
        assert_eq!(crc, expected);
        assert_eq!(hex.get(0xFE), Some((crc >> 8) as u8));
        assert_eq!(hex.get(0xFF), Some(crc as u8));
    }

    #[test]
    fn stamps_sentinel() {
        let mut hex = HexFile::default();
        for addr in 0..0x80 {
            hex.set(addr, (addr * 3) as u8);
        }
        hex.set(0x10, 0xCC);
        hex.set(0x11, 0xCC);

        let crc = stamp_sentinel(&mut hex, 0x100, 0xFFFF).unwrap();
        assert_eq!(hex.get(0x10), Some((crc >> 8) as u8));
        assert_eq!(hex.get(0x11), Some(crc as u8));
        assert_eq!(crc16(&hex.to_bin(0, 0x100, 0xFF), INIT), 0xFFFF);
    }

    #[test]
    fn no_sentinel_leaves_image_alone() {
        let mut hex = HexFile::default();
        hex.set(0, 0xCC);
        hex.set(2, 0xCC);
        let before = hex.clone();
        assert_eq!(stamp_sentinel(&mut hex, 0x100, 0xFFFF), None);
        assert_eq!(hex, before);
    }
}
