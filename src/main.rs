//! A command-line programmer for megaTinyNrf targets running the serial
//! bootloader.
//!
//! Besides flashing an Intel HEX image, it can talk to the radio bridge's
//! text console to pick the remote device (`--id`) or give it a new radio
//! address (`--setid`) before programming starts.

use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use nrfstk::{ihex::HexFile, Progress, Region, Stk500};

/// Programs flash, EEPROM and user signatures over the serial bootloader.
///
/// Fuse segments in the image are never written; segments in address ranges
/// the bootloader doesn't know about are skipped with a warning.
#[derive(Debug, Parser)]
#[clap(version)]
struct Programmer {
    /// Serial port to use (Windows: COMx | *nix: /dev/ttyX).
    #[clap(long, short)]
    comport: String,
    #[clap(long, short, default_value_t = 500_000)]
    baudrate: u32,
    /// Intel HEX file to flash.
    #[clap(long, short)]
    flash: Option<PathBuf>,
    /// Remote radio ID to talk to.
    #[clap(long, short)]
    id: Option<String>,
    /// Reprogram the remote radio ID.
    #[clap(long, short)]
    setid: Option<String>,
    /// Serial read timeout, in milliseconds.
    #[clap(long, short, default_value_t = 5000, value_parser = parse_int::parse::<u64>)]
    timeout: u64,
    /// Print the device signature and bootloader version after syncing.
    #[clap(long)]
    info: bool,
    #[clap(long, short)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Programmer::parse();

    let filter = if args.verbose { "nrfstk=debug" } else { "nrfstk=info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(filter))
        .format_timestamp(None)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let kind = e.chain()
                .find_map(|cause| cause.downcast_ref::<nrfstk::Error>())
                .map_or("Error", nrfstk::Error::kind);
            eprintln!("{kind}: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Programmer) -> Result<()> {
    let port = nrfstk::open(&args.comport, args.baudrate, Duration::from_millis(args.timeout))
        .with_context(|| format!("opening serial port {}", args.comport))?;
    let mut boot = Stk500::new(port, args.verbose);

    if let Some(id) = &args.id {
        boot.send_command("*cfg")?;
        boot.send_command(&format!("id {id}"))
            .with_context(|| format!("selecting remote {id}"))?;
    }
    if let Some(setid) = &args.setid {
        if args.id.is_none() {
            boot.send_command("*cfg")?;
        }
        boot.send_command(&format!("setid {setid}"))
            .with_context(|| format!("setting remote ID to {setid}"))?;
    }

    if args.info {
        boot.connect()
            .with_context(|| format!("syncing with device on {}", args.comport))?;
        let [a, b, c] = boot.read_signature()?;
        let (major, minor) = boot.bootloader_version()?;
        println!("Device signature: {a:02x} {b:02x} {c:02x}");
        println!("Bootloader version: {major}.{minor}");
    }

    if let Some(path) = &args.flash {
        let image = HexFile::load(path)?;
        let segments = image.data_segments();

        let summary = boot.flash(&segments, &mut Bars::default())
            .with_context(|| format!("programming device on {}", args.comport))?;
        if args.verbose {
            for (region, &n) in &summary.written {
                if n > 0 {
                    println!("{}: {n} bytes", region.name());
                }
            }
        }
        println!("Done!");
    } else if args.info {
        boot.close()?;
    }

    Ok(())
}

/// One progress bar per region being written.
#[derive(Default)]
struct Bars(Option<ProgressBar>);

impl Progress for Bars {
    fn start(&mut self, region: Region, total: usize) {
        let bar = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::with_template("Writing {msg} {pos}/{len} bytes {wide_bar}") {
            bar.set_style(style);
        }
        bar.set_message(region.name());
        self.0 = Some(bar);
    }

    fn advance(&mut self, written: usize) {
        if let Some(bar) = &self.0 {
            bar.inc(written as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.0.take() {
            bar.finish();
        }
    }
}
