//! Submission, validation and the single corrective retry.
//!
//! ```text
//! Submitted -> Completed -> Accepted
//!                        -> Rejected -> Resubmitted (fresh guess) -> Submitted
//! ```
//!
//! A frame is resubmitted at most once. Its second rejection is a terminal
//! [`PipelineError::ConvergenceFailure`] for that frame only.

use super::job::{FrameJobBuilder, JobDescriptor};
use super::state::{EventSink, FrameEvent};
use crate::errors::PipelineError;
use crate::solver::{GuessHandle, Solver, SolverOutput};
use crate::trajectory::Frame;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Main-job submissions allowed per frame.
const MAX_ATTEMPTS: u32 = 2;

/// Scratch orbital logs written next to the solver output.
const ORBITAL_LOG_PATTERN: &str = "mo*MOLog";

/// Verdict on a completed main job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Accepted,
    NeedsGuessRetry { warnings: Vec<String> },
}

/// Inspect a solver result for SCF non-convergence.
pub fn validate_output(output: &SolverOutput, ignore_warnings: bool) -> ValidationOutcome {
    if ignore_warnings {
        return ValidationOutcome::Accepted;
    }
    let warnings = output.scf_warnings();
    if warnings.is_empty() {
        ValidationOutcome::Accepted
    } else {
        ValidationOutcome::NeedsGuessRetry { warnings }
    }
}

/// A main job whose result passed validation.
#[derive(Debug, Clone)]
pub struct AcceptedFrame {
    pub point: usize,
    pub output: SolverOutput,
    /// Main-job submissions it took (1 or 2).
    pub attempts: u32,
}

impl AcceptedFrame {
    pub fn guess_handle(&self) -> GuessHandle {
        self.output.guess_handle(self.point)
    }
}

/// Remove the solver's orbital logs from `work_dir`.
///
/// Failures, including finding nothing to remove, are logged and ignored.
pub fn remove_orbital_logs(work_dir: &Path) {
    let pattern = format!(
        "{}/{}",
        glob::Pattern::escape(&work_dir.to_string_lossy()),
        ORBITAL_LOG_PATTERN
    );
    let paths = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(e) => {
            warn!(dir = %work_dir.display(), error = %e, "Invalid orbital log pattern");
            return;
        }
    };

    let mut removed = 0;
    for entry in paths {
        match entry.map_err(std::io::Error::from).and_then(|path| {
            std::fs::remove_file(&path)?;
            Ok(path)
        }) {
            Ok(path) => {
                debug!(path = %path.display(), "Removed orbital log");
                removed += 1;
            }
            Err(e) => warn!(dir = %work_dir.display(), error = %e, "Failed to remove orbital log"),
        }
    }
    if removed == 0 {
        warn!(dir = %work_dir.display(), "There is no orbital log file to remove");
    }
}

/// Runs jobs through the solver and validates main-job results.
pub struct ValidatingExecutor {
    solver: Arc<dyn Solver>,
    builder: FrameJobBuilder,
    permits: Arc<Semaphore>,
    events: EventSink,
}

impl ValidatingExecutor {
    pub fn new(solver: Arc<dyn Solver>, builder: FrameJobBuilder) -> Self {
        let permits = Arc::new(Semaphore::new(builder.config().max_parallel.max(1)));
        Self {
            solver,
            builder,
            permits,
            events: EventSink::default(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Run one job, holding a solver permit only for the call itself.
    pub async fn submit(&self, job: &JobDescriptor) -> Result<SolverOutput, PipelineError> {
        self.events
            .emit(FrameEvent::Submitted {
                point: job.point,
                role: job.role,
                corrective: job.corrective,
            })
            .await;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| PipelineError::TaskFailed {
                point: job.point,
                message: e.to_string(),
            })?;
        debug!(point = job.point, job = %job.job_name, "Submitting job");

        self.solver
            .run(job)
            .await
            .map_err(|source| PipelineError::SolverFailure {
                point: job.point,
                source,
            })
    }

    /// Run a guess-only job. Its output is not validated.
    async fn fresh_guess(&self, frame: &Frame, corrective: bool) -> Result<GuessHandle, PipelineError> {
        let job = self.builder.guess_job(frame, corrective);
        let output = self.submit(&job).await?;
        Ok(output.guess_handle(frame.point))
    }

    /// Compute `frame` until a main job is accepted or the retry is spent.
    ///
    /// With `fresh_guess` set a guess-only job runs first; otherwise the main
    /// job is warm-started from `upstream` (if any).
    pub async fn compute_frame(
        &self,
        frame: &Frame,
        fresh_guess: bool,
        upstream: Option<GuessHandle>,
    ) -> Result<AcceptedFrame, PipelineError> {
        let ignore_warnings = self.builder.config().ignore_warnings;
        let mut guess = if fresh_guess {
            Some(self.fresh_guess(frame, false).await?)
        } else {
            upstream
        };

        let mut attempt = 1;
        loop {
            let corrective = attempt > 1;
            let job = self.builder.main_job(frame, guess.take(), corrective);
            let output = self.submit(&job).await?;

            match validate_output(&output, ignore_warnings) {
                ValidationOutcome::Accepted => {
                    remove_orbital_logs(&frame.work_dir);
                    self.events
                        .emit(FrameEvent::Accepted {
                            point: frame.point,
                            attempts: attempt,
                        })
                        .await;
                    return Ok(AcceptedFrame {
                        point: frame.point,
                        output,
                        attempts: attempt,
                    });
                }
                ValidationOutcome::NeedsGuessRetry { warnings } => {
                    remove_orbital_logs(&frame.work_dir);
                    self.events
                        .emit(FrameEvent::Rejected {
                            point: frame.point,
                            warnings: warnings.clone(),
                        })
                        .await;

                    if attempt >= MAX_ATTEMPTS {
                        return Err(PipelineError::ConvergenceFailure {
                            point: frame.point,
                            attempts: attempt,
                            warnings,
                        });
                    }

                    warn!(point = frame.point, ?warnings, "SCF did not converge");
                    info!(
                        "Job point_{} is going to be recomputed with a new guess",
                        frame.point
                    );
                    self.builder.restart_points().insert(frame.point);
                    guess = Some(self.fresh_guess(frame, true).await?);
                    attempt += 1;
                }
            }
        }
    }
}
