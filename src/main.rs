use std::path::PathBuf;
use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{ fmt, prelude::*, EnvFilter };
use bloch_sim::{
    config::RunConfig,
    driver::sbe_solver,
    output::NpzSink,
    system::System,
};

#[derive(Parser, Debug)]
#[command(name = "bloch-sim", about = "Semiconductor Bloch equation solver")]
struct Cli {
    /// Path to a TOML parameter file
    #[arg(short, long)]
    config: PathBuf,
    /// Output directory
    #[arg(short, long, default_value = "output")]
    outdir: PathBuf,
    /// Number of thread ranks (ignored under MPI)
    #[arg(short = 'n', long, default_value_t = 1)]
    ranks: usize,
    /// Default log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = RunConfig::load(&cli.config)
        .with_context(|| format!("reading {}", cli.config.display()))?;
    let system = System::from_config(&config.model)?;
    info!(
        "{} combinations, {} system with {} bands",
        config.n_combinations(), system.label(), system.n_bands(),
    );
    run(&cli, &config, &system)
}

#[cfg(not(feature = "mpi"))]
fn run(cli: &Cli, config: &RunConfig, system: &System) -> anyhow::Result<()> {
    use bloch_sim::group::LocalGroup;
    let sink = NpzSink::new(&cli.outdir)?;
    let results = LocalGroup::run(cli.ranks, |world| {
        sbe_solver(system, config, &world, &mut sink.clone())
    });
    for res in results.into_iter() {
        res?;
    }
    info!("done");
    Ok(())
}

#[cfg(feature = "mpi")]
fn run(cli: &Cli, config: &RunConfig, system: &System) -> anyhow::Result<()> {
    use mpi::traits::Communicator;
    use bloch_sim::group::{ MpiGroup, ProcessGroup };
    let universe = mpi::initialize()
        .context("MPI was already initialized")?;
    let world = MpiGroup::new(universe.world());
    let sink = NpzSink::new(&cli.outdir);
    if world.any(sink.is_err()) {
        sink?;
        anyhow::bail!("output directory unavailable on another rank");
    }
    let mut sink = sink?;
    sbe_solver(system, config, &world, &mut sink)?;
    if universe.world().rank() == 0 { info!("done"); }
    Ok(())
}
