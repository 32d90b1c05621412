use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "edgeflow")]
#[command(about = "Inspect edgeflow engine configuration and workflow event logs")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("EDGEFLOW_GIT_SHA"), ")"))]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Parse and validate an engine configuration file
    ValidateConfig {
        path: PathBuf,

        /// Print the effective configuration, defaults included
        #[arg(long)]
        print: bool,
    },

    /// Rebuild workflow state from a file-backed event log
    Replay {
        /// Directory holding the `.jsonl` event streams
        #[arg(long)]
        dir: PathBuf,

        /// Workflow to replay; lists every workflow when omitted
        #[arg(short, long)]
        workflow: Option<String>,

        /// Print each recorded event before the snapshot
        #[arg(long)]
        events: bool,
    },
}
