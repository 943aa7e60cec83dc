use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use rust_vical::io::Config;
use rust_vical::sim;

/// Offline simulation driver for the calibration EKF.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Input YAML configuration file.
    config: PathBuf,
    /// Output directory for data logs.
    out_dir: PathBuf,
}

fn log_level(debug_log_level: u8) -> tracing::Level {
    match debug_log_level {
        0 | 1 => tracing::Level::ERROR,
        2 => tracing::Level::WARN,
        3 => tracing::Level::INFO,
        4 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error:#}");
            std::process::exit(-1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(log_level(config.debug_log_level).into()),
        )
        .init();

    if let Err(validation) = config.validate() {
        error!(%validation, "configuration rejected");
        eprintln!("Configuration Error: {validation}");
        std::process::exit(-1);
    }

    let body = sim::run(&config, &args.out_dir)?;
    info!(
        position = %body.position.transpose(),
        velocity = %body.velocity.transpose(),
        "final body estimate"
    );
    Ok(())
}
