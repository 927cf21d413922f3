use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod config;
pub mod init;
pub mod run;
pub mod send;

use config::ConfigArgs;
use run::RunArgs;
use send::SendArgs;

use jarvis::config::ConfigManager;

#[derive(Parser, Debug)]
#[command(
    name = "jarvis",
    about = "Hub that runs and connects Jarvis protocols",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the hub until Ctrl-C
    Run(RunArgs),

    /// Create the directory layout under the root
    Init,

    /// Manage settings in `<root>/config/.env`
    Config(ConfigArgs),

    /// Append an envelope to the external→hub comms file
    Send(SendArgs),
}

#[derive(Clone, Debug)]
pub struct CliContext {
    pub root: PathBuf,
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(root: PathBuf, config_manager: ConfigManager) -> Self {
        Self { root, config_manager }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Init => init::execute(context).await,
        Commands::Config(args) => config::execute(args, context).await,
        Commands::Send(args) => send::execute(args, context).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default_runtime())
}
