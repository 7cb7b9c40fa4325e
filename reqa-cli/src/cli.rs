use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Requirement quality analysis")]
pub struct Cli {
    /// Path to the requirement set
    #[clap(long, default_value = "requirements.yaml")]
    pub file: PathBuf,

    /// Engine configuration file (defaults to <config_dir>/reqa/config.yaml)
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[clap(long, short = 'v')]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Analyze requirement quality
    Analyze {
        /// Requirement to analyze (repeatable; all when omitted)
        #[clap(long)]
        id: Vec<String>,

        /// RAG workspace context (project name)
        #[clap(long)]
        workspace: Option<String>,

        /// Skip the RAG server and prompt the model directly
        #[clap(long)]
        no_rag: bool,

        /// Print analyses as JSON
        #[clap(long)]
        json: bool,

        /// Do not write analyses back to the requirement set
        #[clap(long)]
        no_save: bool,
    },

    /// Print the prompt for a model outside the engine
    Prompt {
        /// The requirement to build the prompt for
        #[clap(long)]
        id: String,
    },

    /// Derive testable capabilities and report coverage gaps
    Derive {
        /// Requirements derived in parallel (configuration value when omitted)
        #[clap(long)]
        concurrency: Option<usize>,
    },

    /// Validate the testing workflow of the requirement set
    Validate,

    /// Check the RAG server
    Health,
}
