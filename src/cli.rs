//! CLI definitions for knockd.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "knockd",
    version,
    about = "Stealth port knocking with one-time sequences\n\nNo listening ports: clients authenticate by hitting a secret, clock-derived sequence of UDP ports, and the daemon opens access for them.",
    long_about = None
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the knock server on the configured interface
    Server {
        /// Path to knockd.json (default: search common locations)
        config: Option<PathBuf>,
    },

    /// Generate configuration artifacts
    Generate {
        #[clap(subcommand)]
        artifact: GenerateArtifact,
    },

    /// Send an authenticated knock sequence to a server
    Knock {
        /// Server hostname or address
        host: String,

        /// Path to the shared secret file
        #[clap(long, default_value = "knock.secret")]
        secret: PathBuf,

        /// Inter-packet delay in milliseconds
        #[clap(long = "maxjitter", default_value = "200", value_parser = clap::value_parser!(u64).range(1..=1500))]
        max_jitter: u64,
    },
}

#[derive(Subcommand)]
pub enum GenerateArtifact {
    /// Print a fresh base32 shared secret to stdout
    Secret,

    /// Print the default configuration document to stdout
    Defaultconfig,
}
