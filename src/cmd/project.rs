//! Project setup commands: `studio init`, `studio stages`.

use anyhow::Result;

use brand_studio::config::init_studio_dir;
use brand_studio::studio::models::RunMode;
use brand_studio::studio::registry;

pub fn cmd_init(project_dir: &std::path::Path) -> Result<()> {
    let result = init_studio_dir(project_dir)?;

    if result.created {
        println!("Initialized brand studio at {}", result.studio_dir.display());
        println!();
        println!("Created:");
        println!("  .studio/");
        println!("  └── studio.toml   # server, storage, tools and clients");
        println!();
        println!("Next steps:");
        println!("  1. Add your clients and tool commands to studio.toml");
        println!("  2. Run `studio config validate`");
        println!("  3. Run `studio serve`");
    } else {
        println!(
            "Brand studio already initialized at {}",
            result.studio_dir.display()
        );
        println!("Existing {} left unchanged.", result.config_file.display());
    }

    Ok(())
}

pub fn cmd_stages(mode: &str) -> Result<()> {
    let mode: RunMode = mode.parse()?;
    println!("Stages for {} mode:", mode);
    for (i, stage) in registry::stages_for(mode).iter().enumerate() {
        println!("  {}. {} ({})", i + 1, stage.label, stage.id);
    }
    Ok(())
}
