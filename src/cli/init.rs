use std::fs;

use anyhow::Context;
use jarvis::comms::CommsSurface;

use super::CliContext;

const LAYOUT: [&str; 5] = ["config", "logs", "protocols", "channels", "comms"];

pub async fn execute(context: &CliContext) -> anyhow::Result<()> {
    let root = &context.root;
    for dir in LAYOUT {
        let path = root.join(dir);
        fs::create_dir_all(&path).with_context(|| format!("failed to create {}", path.display()))?;
    }

    let env_file = root.join("config/.env");
    if env_file.exists() {
        println!("Keeping {}", env_file.display());
    } else {
        fs::write(&env_file, "")
            .with_context(|| format!("failed to write {}", env_file.display()))?;
        println!("Created {}", env_file.display());
    }

    CommsSurface::new(root.join("comms")).ensure().await?;
    println!("Jarvis initialised at {}. Start it with `jarvis run`.", root.display());
    Ok(())
}
