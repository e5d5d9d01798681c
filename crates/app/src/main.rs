mod cli;

use std::path::Path;

use bytesize::ByteSize;
use clap::Parser;
use cores::Provider;
use cpucore::modules::Modules;
use cpucore::state::StateError;
use cpucore::system::debug::Breakpoint;
use cpucore::system;
use cpucore::{Address, PowerPc};
use easyerr::{Error, ResultExt};
use eyre_pretty::eyre::Result;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Io { source: std::io::Error },
    #[error("binary of {size} bytes does not fit in memory at {addr:08X}")]
    Unmapped { addr: u32, size: usize },
    #[error(transparent)]
    State { source: StateError },
}

fn load_binary(ppc: &mut PowerPc, path: &Path, addr: u32) -> Result<(), LoadError> {
    let binary = std::fs::read(path).context(LoadErrorCtx::Io)?;
    if !ppc.sys.mem.write(Address(addr), &binary) {
        return Err(LoadError::Unmapped {
            addr,
            size: binary.len(),
        });
    }

    tracing::info!(
        "loaded {} ({}) at {addr:08X}",
        path.display(),
        ByteSize(binary.len() as u64)
    );

    Ok(())
}

fn load_state(ppc: &mut PowerPc, path: &Path) -> Result<(), LoadError> {
    let data = std::fs::read(path).context(LoadErrorCtx::Io)?;
    ppc.load_state(data).context(LoadErrorCtx::State)?;
    tracing::info!("restored state from {}", path.display());

    Ok(())
}

fn save_state(ppc: &mut PowerPc, path: &Path) -> Result<(), LoadError> {
    let data = ppc.save_state().context(LoadErrorCtx::State)?;
    std::fs::write(path, &data).context(LoadErrorCtx::Io)?;
    tracing::info!("saved {} of state to {}", ByteSize(data.len() as u64), path.display());

    Ok(())
}

fn setup_tracing(log: Option<&Path>) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let (file_layer, guard) = match log {
        Some(path) => {
            let file = std::fs::File::options()
                .truncate(true)
                .create(true)
                .write(true)
                .open(path)?;

            let (file_nb, guard) = tracing_appender::non_blocking(file);
            (
                Some(fmt::layer().with_writer(file_nb).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or(EnvFilter::new("app=info,cpucore=info,cores=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(env_filter)
        .init();

    Ok(guard)
}

fn main() -> Result<()> {
    eyre_pretty::install()?;
    let cfg = cli::Config::parse();
    let _tracing_guard = setup_tracing(cfg.log.as_deref())?;

    let mut config = system::Config {
        is_wii: cfg.wii,
        cpu_core: cfg.core.kind(),
        enable_dcache: cfg.dcache,
        enable_debugging: !cfg.breakpoint.is_empty(),
        mmu: cfg.mmu,
        icache: !cfg.no_icache,
        ..Default::default()
    };

    if let Some(max_slice) = cfg.max_slice {
        config.max_slice = max_slice;
    }

    let provider = Provider::new(cores::jit::Config {
        instr_per_block: cfg.jit.instr_per_block,
        idle_skipping: cfg.jit.idle_skipping,
    });

    let mut ppc = PowerPc::new(config, Modules::default(), Box::new(provider));
    ppc.init();

    load_binary(&mut ppc, &cfg.binary, cfg.load)?;
    ppc.sys.cpu.pc = Address(cfg.entry.unwrap_or(cfg.load));
    ppc.sys.cpu.npc = ppc.sys.cpu.pc;

    if let Some(path) = &cfg.load_state {
        load_state(&mut ppc, path)?;
    }

    for &addr in &cfg.breakpoint {
        ppc.sys.debug.add_breakpoint(Breakpoint::new(Address(addr)));
    }

    tracing::info!(core = ppc.core_name(), cycles = cfg.cycles, "running");

    let start = ppc.sys.ticks();
    ppc.run_for(cfg.cycles);
    let executed = ppc.sys.ticks() - start;

    let pc = ppc.sys.cpu.pc;
    if executed < cfg.cycles {
        tracing::info!("stopped at {pc} after {executed} cycles");
    } else {
        tracing::info!("ran for {executed} cycles, now at {pc}");
    }

    println!("{}", ppc.sys.dump_registers());

    if let Some(path) = &cfg.save_state {
        save_state(&mut ppc, path)?;
    }

    ppc.shutdown();
    Ok(())
}
