//! Input checks: `trajqm validate`.

use anyhow::{Context, Result};
use std::path::Path;
use trajqm::trajectory::point_range;

use super::load_config;

pub fn cmd_validate(input: &Path) -> Result<()> {
    let config = load_config(input)?;
    let (geometries, cells) = config
        .read_inputs()
        .context("Failed to read trajectory inputs")?;

    let pipeline = config.pipeline_config();
    pipeline
        .validate_restart_points(geometries.len())
        .context("Invalid calc_new_wf_guess_on_points")?;

    let points = point_range(config.enumerate_from, geometries.len())?;
    let (first, last) = (points.start, points.end.saturating_sub(1).max(points.start));
    println!();
    println!("Input:      {}", input.display());
    println!(
        "Trajectory: {} ({} frames, points {}..={})",
        config.path_traj_xyz.display(),
        geometries.len(),
        first,
        last
    );
    if let Some(table) = &cells {
        println!("Cells:      {} rows", table.len());
    }
    match &pipeline.restart_points {
        Some(points) => {
            let points: Vec<String> = points.iter().map(ToString::to_string).collect();
            println!("Restarts:   [{}]", points.join(", "));
        }
        None => println!("Restarts:   not configured"),
    }
    println!("Solver:     {}", config.solver.program);

    let warnings = config.warnings();
    if !warnings.is_empty() {
        println!();
        for warning in &warnings {
            println!("warning: {}", warning);
        }
    }
    println!();
    println!("Input is valid.");
    Ok(())
}
