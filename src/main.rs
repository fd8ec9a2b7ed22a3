//! Monitor: builds the default machine, loads a flat guest image and runs it.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::info;

use mips32_sim::bus::{Ram, BRAM_BASE, BRAM_SIZE, DDR_BASE, DDR_SIZE};
use mips32_sim::{Fatal, Machine};

#[derive(Parser)]
#[command(name = "mips32-sim", about = "MIPS32 (4Kc-class) system simulator")]
struct Args {
    /// Flat binary image, loaded at the entry address.
    #[arg(short, long)]
    image: PathBuf,

    /// Entry point (virtual address).
    #[arg(short, long, default_value = "0xbfc00000", value_parser = parse_vaddr)]
    entry: u32,

    /// Stop after this many instructions instead of running to completion.
    #[arg(short = 'n', long)]
    steps: Option<u64>,
}

fn parse_vaddr(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

/// kseg0/kseg1 virtual-to-physical; mapped-segment entry points are not
/// supported by the flat loader.
fn unmapped_paddr(vaddr: u32) -> Option<u32> {
    (0x8000_0000..0xC000_0000)
        .contains(&vaddr)
        .then(|| vaddr & 0x1FFF_FFFF)
}

fn setup(m: &mut Machine, load_paddr: u32, image: &[u8]) -> Result<(), Fatal> {
    m.bus.register(
        "ddr",
        DDR_BASE,
        DDR_BASE + DDR_SIZE,
        Box::new(Ram::new(DDR_SIZE as usize)),
    )?;
    m.bus.register(
        "bram",
        BRAM_BASE,
        BRAM_BASE + BRAM_SIZE,
        Box::new(Ram::new(BRAM_SIZE as usize)),
    )?;
    m.bus.load(load_paddr, image)
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let image = match std::fs::read(&args.image) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("cannot read image {}: {e}", args.image.display());
            return ExitCode::FAILURE;
        }
    };
    let Some(load_paddr) = unmapped_paddr(args.entry) else {
        eprintln!("entry {:#010x} is not in kseg0/kseg1", args.entry);
        return ExitCode::FAILURE;
    };

    let mut m = Machine::new(args.entry);
    if let Err(e) = setup(&mut m, load_paddr, &image) {
        eprintln!("machine setup failed: {e}");
        return ExitCode::FAILURE;
    }
    info!(
        "loaded {} bytes at {:#010x}, entry {:#010x}",
        image.len(),
        load_paddr,
        args.entry
    );

    match m.run(args.steps.unwrap_or(u64::MAX)) {
        Ok(state) => {
            info!("simulation left the running state: {state:?}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}
