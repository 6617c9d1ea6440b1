//! Walks the trajectory and spawns one task per computing frame.
//!
//! The walk itself is sequential and cheap: it plans each frame against the
//! store and threads a pending guess through the [`GuessChain`]. The
//! expensive work runs in spawned tasks, linked only where a frame consumes
//! the previous computing frame's warm-start. Restart points start new
//! chains, so the segments between them run concurrently.

use super::PipelineConfig;
use super::executor::ValidatingExecutor;
use super::guess::GuessChain;
use super::job::{FrameJobBuilder, FramePlan, RestartPoints};
use super::persist::persist_frame;
use super::state::{
    EventSink, ExecutionTimer, FrameArtifacts, FrameEvent, FrameOutcome, PipelineReport,
    PipelineSummary,
};
use crate::errors::PipelineError;
use crate::solver::{GuessHandle, Solver};
use crate::store::{ArtifactStore, FrameKeys};
use crate::trajectory::Frame;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Accepted warm-start of an upstream frame; `None` if that frame failed.
type PendingGuess = Shared<BoxFuture<'static, Option<GuessHandle>>>;

enum FrameSlot {
    Ready(FrameOutcome),
    Running {
        point: usize,
        handle: JoinHandle<Result<FrameArtifacts, PipelineError>>,
    },
}

/// Handle over every frame of a run, joined in frame order.
pub struct PendingResults {
    slots: Vec<FrameSlot>,
    restart: RestartPoints,
    timer: ExecutionTimer,
}

impl PendingResults {
    /// Number of frames that spawned a task.
    pub fn running(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, FrameSlot::Running { .. }))
            .count()
    }

    /// Wait for every frame. A failed frame never cancels its siblings.
    pub async fn join(self) -> PipelineReport {
        let mut summary = PipelineSummary::new(self.slots.len());
        let mut outcomes = Vec::with_capacity(self.slots.len());

        for slot in self.slots {
            let outcome = match slot {
                FrameSlot::Ready(outcome) => outcome,
                FrameSlot::Running { point, handle } => FrameOutcome {
                    point,
                    result: handle.await.unwrap_or_else(|e| {
                        Err(PipelineError::TaskFailed {
                            point,
                            message: e.to_string(),
                        })
                    }),
                },
            };
            summary.add_outcome(&outcome);
            outcomes.push(outcome);
        }

        summary.restart_points = self.restart.snapshot();
        summary.duration = self.timer.elapsed();
        PipelineReport { outcomes, summary }
    }
}

/// Composes planning, execution and persistence over a whole trajectory.
pub struct PipelineOrchestrator {
    config: Arc<PipelineConfig>,
    store: Arc<dyn ArtifactStore>,
    solver: Arc<dyn Solver>,
    events: EventSink,
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ArtifactStore>,
        solver: Arc<dyn Solver>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            solver,
            events: EventSink::default(),
        }
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<FrameEvent>) -> Self {
        self.events = EventSink::new(Some(tx));
        self
    }

    /// Plan every frame and spawn the computing ones.
    ///
    /// Returns once all tasks are spawned; call [`PendingResults::join`] to
    /// wait for them. Fails before spawning anything if the restart points
    /// are invalid.
    pub async fn run(&self, frames: Vec<Frame>) -> Result<PendingResults, PipelineError> {
        let timer = ExecutionTimer::start();
        let restart = RestartPoints::new(self.config.restart_points.as_ref());
        let builder = FrameJobBuilder::new(self.config.clone(), self.store.clone(), restart.clone());
        builder.validate_restart_points(&frames)?;

        let executor = Arc::new(
            ValidatingExecutor::new(self.solver.clone(), builder.clone())
                .with_events(self.events.clone()),
        );

        let mut chain: GuessChain<PendingGuess> = GuessChain::new();
        let mut slots = Vec::with_capacity(frames.len());

        for frame in frames {
            let point = frame.point;
            let has_prior = chain.current().is_some();
            let plan = {
                let builder = builder.clone();
                let frame = frame.clone();
                tokio::task::spawn_blocking(move || builder.plan(&frame, has_prior))
                    .await
                    .map_err(|e| PipelineError::TaskFailed {
                        point,
                        message: e.to_string(),
                    })??
            };

            match plan {
                FramePlan::Cached(artifacts) => {
                    info!("point_{} has already been calculated", point);
                    self.events.emit(FrameEvent::Cached { point }).await;
                    slots.push(FrameSlot::Ready(FrameOutcome {
                        point,
                        result: Ok(artifacts),
                    }));
                }
                FramePlan::Compute { fresh_guess } => {
                    info!("point_{} has been scheduled", point);
                    self.events
                        .emit(FrameEvent::Scheduled { point, fresh_guess })
                        .await;

                    let upstream = if fresh_guess {
                        None
                    } else {
                        chain.current().cloned()
                    };
                    let keys = builder.keys(&frame)?;
                    let (guess_tx, guess_rx) = oneshot::channel();
                    chain.advance(guess_rx.map(Result::ok).boxed().shared());

                    let task = FrameTask {
                        frame,
                        keys,
                        fresh_guess,
                        upstream,
                        guess_tx,
                        executor: executor.clone(),
                        store: self.store.clone(),
                        compute_orbitals: self.config.compute_orbitals,
                        events: self.events.clone(),
                    };
                    slots.push(FrameSlot::Running {
                        point,
                        handle: tokio::spawn(task.run()),
                    });
                }
            }
        }

        Ok(PendingResults {
            slots,
            restart,
            timer,
        })
    }
}

/// Everything one spawned frame needs.
struct FrameTask {
    frame: Frame,
    keys: FrameKeys,
    fresh_guess: bool,
    upstream: Option<PendingGuess>,
    guess_tx: oneshot::Sender<GuessHandle>,
    executor: Arc<ValidatingExecutor>,
    store: Arc<dyn ArtifactStore>,
    compute_orbitals: bool,
    events: EventSink,
}

impl FrameTask {
    async fn run(self) -> Result<FrameArtifacts, PipelineError> {
        let point = self.frame.point;
        let events = self.events.clone();
        let result = self.compute().await;
        if let Err(ref e) = result {
            error!(point, error = %e, "Frame failed");
            events
                .emit(FrameEvent::Failed {
                    point,
                    error: e.to_string(),
                })
                .await;
        }
        result
    }

    async fn compute(self) -> Result<FrameArtifacts, PipelineError> {
        let point = self.frame.point;
        let mut fresh_guess = self.fresh_guess;

        // Waiting on the upstream frame holds no solver permit.
        let upstream = match self.upstream {
            Some(pending) => match pending.await {
                Some(handle) => Some(handle),
                None => {
                    warn!(point, "Upstream frame failed, computing a fresh guess");
                    fresh_guess = true;
                    None
                }
            },
            None => None,
        };

        let accepted = self
            .executor
            .compute_frame(&self.frame, fresh_guess, upstream)
            .await?;

        // Dependents only ever see an accepted guess. A dropped receiver
        // means no later frame chains from this one.
        let _ = self.guess_tx.send(accepted.guess_handle());

        let artifacts = persist_frame(
            self.store,
            self.keys,
            point,
            &accepted.output,
            self.compute_orbitals,
        )
        .await?;

        self.events
            .emit(FrameEvent::Persisted {
                point,
                energy: accepted.output.energy,
            })
            .await;
        Ok(artifacts)
    }
}
