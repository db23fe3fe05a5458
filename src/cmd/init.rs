//! Workspace bootstrap: `trilha init`.

use std::path::Path;

use anyhow::{Context, Result};
use trilha::config::{TrilhaConfig, starter_config};
use trilha::pipeline::db::PipelineDb;

/// Write a starter config at `config_path` and create the database it names.
pub fn cmd_init(config_path: &Path, db_path: Option<&Path>, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists. Use --force to overwrite it.",
            config_path.display()
        );
    }
    if let Some(parent) = config_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = starter_config();
    std::fs::write(config_path, &content)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    let mut config = TrilhaConfig::parse(&content)?;
    config.apply_env()?;
    if let Some(path) = db_path {
        config.server.db_path = path.to_path_buf();
    }
    let db_path = &config.server.db_path;
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    PipelineDb::new(db_path)
        .with_context(|| format!("Failed to initialize database {}", db_path.display()))?;

    println!("Wrote {}", config_path.display());
    println!("Pipeline database initialized at {}", db_path.display());
    Ok(())
}
