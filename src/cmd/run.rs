//! Pipeline execution: `trajqm run`.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;
use trajqm::pipeline::{ArtifactSource, FrameEvent, PipelineOrchestrator, PipelineReport};
use trajqm::solver::{CommandSolver, Solver};
use trajqm::store::ArtifactStore;

use super::load_config;

const EVENT_BUFFER: usize = 256;

fn print_event(event: &FrameEvent) {
    match event {
        FrameEvent::Rejected { point, warnings } => {
            println!("  point_{point}: rejected ({})", warnings.join("; "));
        }
        FrameEvent::Accepted { point, attempts } if *attempts > 1 => {
            println!("  point_{point}: accepted after {attempts} attempts");
        }
        FrameEvent::Persisted { point, energy } => {
            println!("  point_{point}: stored, energy {energy:.10}");
        }
        FrameEvent::Failed { point, error } => {
            println!("  point_{point}: FAILED: {error}");
        }
        _ => {}
    }
}

fn print_report(report: &PipelineReport) {
    let summary = &report.summary;
    println!();
    println!("{:<12} {:<10} Energy key", "Point", "Source");
    println!("{:<12} {:<10} ----------", "------------", "----------");
    for outcome in &report.outcomes {
        let label = format!("point_{}", outcome.point);
        match &outcome.result {
            Ok(artifacts) => {
                let source = match artifacts.source {
                    ArtifactSource::Cached => "cached",
                    ArtifactSource::Computed => "computed",
                };
                println!("{:<12} {:<10} {}", label, source, artifacts.energy);
            }
            Err(e) => println!("{:<12} {:<10} {}", label, "failed", e),
        }
    }
    println!();
    println!(
        "{} frames: {} cached, {} computed, {} failed in {:.1}s",
        summary.total,
        summary.cached,
        summary.computed,
        summary.failed,
        summary.duration.as_secs_f64()
    );
    if !summary.restart_points.is_empty() {
        let points: Vec<String> = summary
            .restart_points
            .iter()
            .map(ToString::to_string)
            .collect();
        println!("Restart points: {}", points.join(", "));
    }
}

pub async fn cmd_run(
    input: &Path,
    max_parallel: Option<usize>,
    ignore_warnings: bool,
    events_json: bool,
) -> Result<()> {
    let config = load_config(input)?.with_overrides(max_parallel, ignore_warnings);
    for remark in config.warnings() {
        warn!("{}", remark);
    }

    let frames = config
        .build_frames()
        .context("Failed to prepare trajectory frames")?;
    let frame_count = frames.len();
    let store: Arc<dyn ArtifactStore> = Arc::new(
        config
            .open_store()
            .with_context(|| format!("Failed to open store {}", config.store_path.display()))?,
    );
    let solver: Arc<dyn Solver> = Arc::new(CommandSolver::new(config.solver.clone()));

    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if events_json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "Failed to serialize event"),
                }
            } else {
                print_event(&event);
            }
        }
    });

    let orchestrator = PipelineOrchestrator::new(config.pipeline_config(), store, solver)
        .with_event_channel(tx);
    let pending = orchestrator
        .run(frames)
        .await
        .context("Failed to schedule trajectory frames")?;
    if !events_json {
        println!(
            "Computing {} of {} trajectory frames (max {} solver jobs at once)",
            pending.running(),
            frame_count,
            config.max_parallel
        );
    }
    let report = pending.join().await;

    // Closing the last sender ends the printer.
    drop(orchestrator);
    printer.await.ok();

    if !events_json {
        print_report(&report);
    }

    let failed = report.summary.failed;
    if failed > 0 {
        anyhow::bail!(
            "{} of {} frames failed; rerun to retry them",
            failed,
            report.summary.total
        );
    }
    Ok(())
}
