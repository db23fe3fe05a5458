//! Offline case inspection: `trilha pendencies`, `trilha export`.

use std::path::Path;

use anyhow::{Context, Result};
use trilha::config::TrilhaConfig;
use trilha::pipeline::collaborators::ExportSection;
use trilha::pipeline::pendency::{PendencyCounts, compute_pendencies};
use trilha::server::open_services;

pub async fn cmd_pendencies(config: &TrilhaConfig, case_id: &str, json: bool) -> Result<()> {
    let services = open_services(config)?;
    let case = services.store.get(case_id).await?;
    let sessions = services.ledger.list_by_case(case_id).await?;
    let pendencies = compute_pendencies(
        &case,
        &sessions,
        services.clock.local_now(),
        &services.settings.pendency,
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&pendencies)?);
        return Ok(());
    }

    let counts = PendencyCounts::of(&pendencies);
    println!(
        "{} ({}): {} error(s), {} warning(s), {} info",
        case.patient.name,
        case.status.label(),
        counts.error,
        counts.warning,
        counts.info
    );
    for pendency in &pendencies {
        println!("  [{:?}] {}", pendency.severity, pendency.message);
    }
    Ok(())
}

pub async fn cmd_export(
    config: &TrilhaConfig,
    case_id: &str,
    sections: Option<&str>,
    output: Option<&Path>,
) -> Result<()> {
    let sections: Vec<ExportSection> = match sections {
        None => ExportSection::ALL.to_vec(),
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<ExportSection>())
            .collect::<Result<_, _>>()
            .map_err(anyhow::Error::msg)?,
    };

    let services = open_services(config)?;
    let case = services.store.get(case_id).await?;
    let sessions = services.ledger.list_by_case(case_id).await?;
    let bytes = services.exporter.export(&case, &sessions, &sections)?;

    match output {
        Some(path) => {
            std::fs::write(path, &bytes)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Exported case {} to {}", case_id, path.display());
        }
        None => println!("{}", String::from_utf8_lossy(&bytes)),
    }
    Ok(())
}
