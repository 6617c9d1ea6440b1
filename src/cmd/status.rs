//! Stored-results overview: `trajqm status`.

use anyhow::{Context, Result};
use std::path::Path;
use trajqm::store::{ArtifactStore, FrameKeys};

use super::load_config;

fn mark(present: bool) -> &'static str {
    if present { "yes" } else { "-" }
}

pub fn cmd_status(input: &Path) -> Result<()> {
    let config = load_config(input)?;
    let (geometries, _) = config
        .read_inputs()
        .context("Failed to read trajectory inputs")?;

    println!();
    println!("Project: {} ({})", config.project_name, config.package_name);
    println!("Store:   {}", config.store_path.display());

    if !config.store_path.exists() {
        println!();
        println!(
            "No results stored yet. Run 'trajqm run -i {}' to compute {} frames.",
            input.display(),
            geometries.len()
        );
        println!();
        return Ok(());
    }

    let store = config
        .open_store()
        .with_context(|| format!("Failed to open store {}", config.store_path.display()))?;

    println!();
    println!("{:<12} {:<8} {:<8} Done", "Point", "Energy", "Orbitals");
    println!("{:<12} {:<8} {:<8} ----", "------------", "------", "--------");

    let mut done = 0;
    for j in 0..geometries.len() {
        let point = config.enumerate_from + j;
        let keys = FrameKeys::for_point(&config.project_name, &config.package_name, point)?;
        let energy = store.exists(std::slice::from_ref(&keys.energy))?;
        let orbitals = store.exists(&keys.orbitals.to_vec())?;
        let complete = store.exists(&keys.skip_predicate(config.compute_orbitals))?;
        if complete {
            done += 1;
        }
        println!(
            "{:<12} {:<8} {:<8} {}",
            format!("point_{point}"),
            mark(energy),
            mark(orbitals),
            mark(complete)
        );
    }

    let stored = store.keys(&config.project_name)?.len();
    println!();
    println!(
        "{} of {} frames done ({} keys stored under '{}')",
        done,
        geometries.len(),
        stored,
        config.project_name
    );
    println!();
    Ok(())
}
