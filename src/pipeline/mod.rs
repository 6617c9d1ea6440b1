//! Per-frame job pipeline.
//!
//! For an ordered trajectory the pipeline decides, frame by frame, whether
//! to serve stored results, compute from scratch, or warm-start from the
//! previous frame's solution; validates every solver run; retries a
//! non-converged frame once with a fresh guess; and persists accepted
//! results exactly once.
//!
//! ## Module Structure
//!
//! - `guess`: the forward-threaded warm-start chain
//! - `job`: cache checks, restart policy and job descriptors
//! - `executor`: submit, validate, single corrective retry
//! - `persist`: writes accepted results to the artifact store
//! - `state`: per-frame outcomes, summary and events
//! - `orchestrator`: walks frames and spawns the dependency graph
//!
//! ## Example
//!
//! ```ignore
//! let orchestrator = PipelineOrchestrator::new(config, store, solver);
//! let pending = orchestrator.run(frames).await?;
//! let result = pending.join().await.into_result()?;
//! ```

pub mod executor;
pub mod guess;
pub mod job;
pub mod orchestrator;
pub mod persist;
pub mod state;

pub use executor::{AcceptedFrame, ValidatingExecutor, ValidationOutcome, validate_output};
pub use guess::GuessChain;
pub use job::{FrameJobBuilder, FramePlan, JobDescriptor, JobRole, RestartPoints};
pub use orchestrator::{PendingResults, PipelineOrchestrator};
pub use persist::persist_frame;
pub use state::{
    ArtifactSource, FrameArtifacts, FrameEvent, FrameOutcome, PipelineReport, PipelineResult,
    PipelineSummary,
};

use crate::errors::PipelineError;
use crate::settings::SolverSettings;
use crate::trajectory::point_range;
use std::collections::BTreeSet;

/// Policy and settings shared by every frame of one run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub project: String,
    pub package: String,
    /// Point number of the first trajectory frame.
    pub enumerate_from: usize,
    /// Points that always compute a fresh guess. `None` means the policy is
    /// not configured at all, so the first computed frame runs without one.
    pub restart_points: Option<BTreeSet<usize>>,
    pub compute_orbitals: bool,
    /// Accept results even when the solver reports SCF non-convergence.
    pub ignore_warnings: bool,
    /// Maximum concurrent solver invocations.
    pub max_parallel: usize,
    pub settings_main: SolverSettings,
    pub settings_guess: SolverSettings,
}

impl PipelineConfig {
    pub fn new(
        project: impl Into<String>,
        package: impl Into<String>,
        settings_main: SolverSettings,
        settings_guess: SolverSettings,
    ) -> Self {
        Self {
            project: project.into(),
            package: package.into(),
            enumerate_from: 0,
            restart_points: None,
            compute_orbitals: true,
            ignore_warnings: false,
            max_parallel: 4,
            settings_main,
            settings_guess,
        }
    }

    pub fn with_enumerate_from(mut self, enumerate_from: usize) -> Self {
        self.enumerate_from = enumerate_from;
        self
    }

    pub fn with_restart_points(mut self, points: impl IntoIterator<Item = usize>) -> Self {
        self.restart_points = Some(points.into_iter().collect());
        self
    }

    pub fn with_compute_orbitals(mut self, compute_orbitals: bool) -> Self {
        self.compute_orbitals = compute_orbitals;
        self
    }

    pub fn with_ignore_warnings(mut self, ignore_warnings: bool) -> Self {
        self.ignore_warnings = ignore_warnings;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Every restart point must name one of the `frame_count` points.
    pub fn validate_restart_points(&self, frame_count: usize) -> Result<(), PipelineError> {
        let range = point_range(self.enumerate_from, frame_count)?;
        let Some(points) = &self.restart_points else {
            return Ok(());
        };
        let (first, end) = (range.start, range.end);
        if let Some(bad) = points.iter().find(|&&p| !range.contains(&p)) {
            return Err(PipelineError::Configuration(format!(
                "restart point {bad} is outside the trajectory points [{first}, {end})"
            )));
        }
        Ok(())
    }
}
