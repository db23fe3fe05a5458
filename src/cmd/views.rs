//! Board view listing: `trilha views`.

use anyhow::Result;
use trilha::config::TrilhaConfig;

pub fn cmd_views(config: &TrilhaConfig) -> Result<()> {
    for view in config.views() {
        let statuses: Vec<&str> = view.statuses.iter().map(|s| s.as_str()).collect();
        println!("{:<20} {:<24} {}", view.name, view.label, statuses.join(", "));
    }
    Ok(())
}
