//! Stamps the self-check CRC into a bootloader's Intel HEX image, in place.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use nrfstk::{crc, ihex::HexFile};

/// Bootloader CRC patcher.
///
/// By default, looks for a `0xCC 0xCC` placeholder in the checked window and
/// replaces it so the CRC of the whole window equals `--target`. With
/// `--fixed`, stores the CRC of the first 0xFE bytes (XOR 0x84CF) at
/// 0xFE/0xFF instead.
#[derive(Debug, Parser)]
#[clap(version)]
struct PatchCrc {
    /// Intel HEX file to patch.
    filename: PathBuf,
    /// Use the fixed-offset layout.
    #[clap(long)]
    fixed: bool,
    /// Size of the checked window, starting at address 0.
    #[clap(long, default_value = "0x100", value_parser = parse_int::parse::<usize>)]
    size: usize,
    /// CRC the whole window must come out to.
    #[clap(long, default_value = "0xFFFF", value_parser = parse_int::parse::<u16>)]
    target: u16,
}

fn main() -> Result<()> {
    let args = PatchCrc::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .init();

    let is_hex = args.filename.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("hex"));
    if !is_hex {
        println!("Not a .hex file?");
        return Ok(());
    }

    let mut image = HexFile::load(&args.filename)?;
    let crc = if args.fixed {
        crc::stamp_fixed(&mut image)
    } else {
        match crc::stamp_sentinel(&mut image, args.size, args.target) {
            Some(crc) => crc,
            None => {
                println!("no CRC placeholder in the first {:#x} bytes, leaving file alone", args.size);
                return Ok(());
            }
        }
    };

    println!("Patching with CRC of {crc:04X}");
    image.save(&args.filename)?;
    Ok(())
}
