//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{HistoryCommand, ImageCommand, PlanCommand, RunCommand, ValidateCommand};
use std::ffi::OsString;
use std::path::PathBuf;

/// Build the docs image and publish the documentation site
#[derive(Debug, Parser, Clone)]
#[command(name = "docs-pipeline")]
#[command(version)]
#[command(about = "Image build and documentation publishing pipeline", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to pipeline configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "DOCS_PIPELINE_CONFIG",
        default_value = "pipeline.yaml"
    )]
    pub config: PathBuf,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Build the docs site for a trigger and publish it
    Run(RunCommand),

    /// Build and tag the runtime image
    Image(ImageCommand),

    /// Validate a pipeline configuration
    Validate(ValidateCommand),

    /// Print the rendered steps of both workflows
    Plan(PlanCommand),

    /// Show run history
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
