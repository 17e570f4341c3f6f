//! Command line interface.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run commands in a pseudo-terminal owned by a local daemon"
)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Override the rendezvous socket directory
    #[arg(long, global = true, value_name = "DIR")]
    pub socket_dir: Option<PathBuf>,

    /// Session setup deadline in seconds (dial, channel handshake)
    #[arg(long, global = true, default_value_t = 10, value_name = "SECS")]
    pub handshake_timeout: u64,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the daemon that owns the pseudo-terminals
    Serve,
    /// Execute a command on the daemon, attached to this terminal
    Exec {
        /// The command and its arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }
}
