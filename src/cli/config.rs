use clap::{Args, Subcommand};

use super::CliContext;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    Add { key: String, value: String },
    Update { key: String, value: String },
    Delete { key: String },
}

pub async fn execute(args: ConfigArgs, context: &CliContext) -> anyhow::Result<()> {
    let settings = &context.config_manager.0;
    match args.command {
        ConfigCommands::Add { key, value } => {
            if settings.get(&key).await.is_some() {
                println!("`{key}` already set, updating it.");
            }
            settings.set(&key, &value).await?;
            println!("✅ `{key}` added.");
        }
        ConfigCommands::Update { key, value } => {
            settings.set(&key, &value).await?;
            println!("✅ `{key}` updated.");
        }
        ConfigCommands::Delete { key } => {
            settings.del(&key).await;
            println!("✅ `{key}` removed.");
        }
    }
    Ok(())
}
