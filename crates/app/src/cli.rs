use std::path::PathBuf;

use clap::{Args, Parser, ValueEnum};
use cpucore::cores::CpuCoreKind;

/// Execution backends selectable from the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Core {
    Interpreter,
    Cached,
    Jit,
}

impl Core {
    pub fn kind(self) -> CpuCoreKind {
        match self {
            Core::Interpreter => CpuCoreKind::Interpreter,
            Core::Cached => CpuCoreKind::CachedInterpreter,
            // falls back to the default core when the host has no JIT
            Core::Jit => CpuCoreKind::host_jit().unwrap_or(CpuCoreKind::Jit64),
        }
    }
}

#[derive(Args, Debug)]
pub struct JitConfig {
    /// Maximum number of instructions per block
    #[arg(visible_alias("ipb"), long, default_value_t = 128)]
    pub instr_per_block: u32,
    /// Whether to skip idle loops
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub idle_skipping: bool,
}

/// Parses a number, in hex when prefixed with `0x`.
fn parse_u32(s: &str) -> Result<u32, String> {
    let result = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };

    result.map_err(|e| e.to_string())
}

/// Headless runner for the Gekko/Broadway CPU core
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Path to a raw binary to load into memory
    pub binary: PathBuf,
    /// Address the binary is loaded at
    #[arg(long, value_parser = parse_u32, default_value = "0x3100")]
    pub load: u32,
    /// Address execution starts at. Defaults to the load address
    #[arg(long, value_parser = parse_u32)]
    pub entry: Option<u32>,
    /// How many cycles to run for
    #[arg(short, long, default_value_t = 486_000_000)]
    pub cycles: u64,
    /// Execution backend
    #[arg(long, value_enum, default_value_t = Core::Cached)]
    pub core: Core,
    #[command(flatten)]
    pub jit: JitConfig,
    /// Whether to emulate a Wii (Broadway) instead of a GameCube (Gekko)
    #[arg(long, default_value_t = false)]
    pub wii: bool,
    /// Whether to emulate the data cache
    #[arg(long, default_value_t = false)]
    pub dcache: bool,
    /// Whether to emulate page table translation
    #[arg(long, default_value_t = false)]
    pub mmu: bool,
    /// Whether to bypass the emulated instruction cache
    #[arg(long, default_value_t = false)]
    pub no_icache: bool,
    /// Maximum length of a scheduler slice, in cycles
    #[arg(long)]
    pub max_slice: Option<u32>,
    /// Addresses to break at. Enables debugging
    #[arg(short, long, value_parser = parse_u32)]
    pub breakpoint: Vec<u32>,
    /// Path to write a save state to once execution stops
    #[arg(long)]
    pub save_state: Option<PathBuf>,
    /// Path to a save state to restore before running
    #[arg(long)]
    pub load_state: Option<PathBuf>,
    /// Path to a log file
    #[arg(long)]
    pub log: Option<PathBuf>,
}
