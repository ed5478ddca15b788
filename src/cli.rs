//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "siemcor", about = "Correlation and response engine", version)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "siemcor.toml")]
    pub config: PathBuf,

    /// Force debug-level logging regardless of config or RUST_LOG
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one correlation cycle over a batch of events
    Cycle {
        /// JSON file holding an array of events
        #[arg(long)]
        events: PathBuf,
        /// JSON file holding an array of indicators to load first
        #[arg(long)]
        intel: Option<PathBuf>,
        /// JSON file holding an array of rule definitions to load
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Also seed the built-in rule library
        #[arg(long)]
        seed_defaults: bool,
    },
    /// Print the built-in rule library as JSON
    ShowDefaults,
    /// Print the effective configuration
    CheckConfig,
}
