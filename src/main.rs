mod cli;

use clap::Parser;
use cli::{Cli, CliContext, default_command, execute};
use jarvis::config::{ConfigManager, EnvConfigManager, resolve_root_dir};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();
    let config_manager = ConfigManager(EnvConfigManager::new(root.join("config").join(".env")));
    let context = CliContext::new(root, config_manager);

    execute(&context, cli.command.unwrap_or_else(default_command)).await
}
