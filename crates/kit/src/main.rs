//! chainkit command line entry point

use chainkit::commands::{Commands, GlobalOpts};
use clap::Parser;
use color_eyre::{Report, Result};

/// Model and verify libvirt disk backing chains.
///
/// chainkit resolves expected-chain expressions, simulates block
/// commit/pull/copy, and checks the result against the domain XML and
/// `qemu-img info --backing-chain`.
#[derive(Parser)]
#[command(name = "chainkit", version)]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,

    #[command(subcommand)]
    command: Commands,
}

/// Install and configure the tracing/logging system.
///
/// Logs are filtered by the RUST_LOG environment variable, defaulting to
/// 'info', and written to stderr.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    cli.command.run(&cli.global)?;
    Ok(())
}
