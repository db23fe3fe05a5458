//! HTTP + board feed server: `trilha serve`.

use anyhow::{Result, bail};
use trilha::config::TrilhaConfig;

/// Refuses to start on a config that `trilha config validate` would reject.
pub async fn cmd_serve(config: TrilhaConfig) -> Result<()> {
    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            tracing::error!(target: "trilha::config", "{}", problem);
        }
        bail!(
            "Refusing to start with {} config problem(s): {}",
            problems.len(),
            problems.join("; ")
        );
    }
    trilha::server::start_server(config).await
}
