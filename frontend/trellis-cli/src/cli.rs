use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "trellis", about = "Trellis pipeline trigger engine")]
pub struct Cli {
    /// TOML config file. Defaults apply when omitted.
    #[arg(long, env = "TRELLIS_CONFIG")]
    pub config: Option<String>,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run every stage until interrupted.
    Run {
        /// Records to ingest before serving.
        #[arg(long)]
        ingest: Option<String>,
    },
    /// Ingest records from a YAML or JSON file and run to a fixed point.
    Ingest { file: String },
    /// List registered triggers.
    Rules,
    /// List task templates.
    Tasks,
    /// Check the config and exit.
    Validate,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
