//! knockd — stealth port-knocking daemon.
//!
//! Authentication is a sequence of UDP datagrams whose destination ports are
//! derived from a shared secret and the wall clock; a completed sequence runs
//! an operator-configured action for the source address. Run
//! `knockd --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod knock;
mod server;

use cli::{Cli, Commands, GenerateArtifact};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            let config = config::DaemonConfig::load(config.as_deref())?;
            server::run(&config)?;
        }
        Commands::Generate { artifact } => match artifact {
            GenerateArtifact::Secret => {
                println!("{}", knock_engine::otp::generate_secret());
            }
            GenerateArtifact::Defaultconfig => {
                let config = config::DaemonConfig::default();
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        },
        Commands::Knock {
            host,
            secret,
            max_jitter,
        } => {
            knock::run(&host, &secret, max_jitter)?;
        }
    }

    Ok(())
}
