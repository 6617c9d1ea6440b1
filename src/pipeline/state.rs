//! Per-frame outcomes, run summary and progress events.

use super::job::JobRole;
use crate::errors::PipelineError;
use crate::store::{ArtifactKey, MoKeys};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Where a frame's results came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    Cached,
    Computed,
}

/// Stored keys of one finished frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameArtifacts {
    pub point: usize,
    pub energy: ArtifactKey,
    /// Present iff orbitals are persisted for this run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orbitals: Option<MoKeys>,
    pub source: ArtifactSource,
}

/// Final state of one frame.
#[derive(Debug)]
pub struct FrameOutcome {
    pub point: usize,
    pub result: Result<FrameArtifacts, PipelineError>,
}

impl FrameOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Counts and timing of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub total: usize,
    pub cached: usize,
    pub computed: usize,
    pub failed: usize,
    /// Restart points in effect at the end of the run, including frames
    /// that were rejected once.
    pub restart_points: BTreeSet<usize>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl PipelineSummary {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn add_outcome(&mut self, outcome: &FrameOutcome) {
        match &outcome.result {
            Ok(artifacts) => match artifacts.source {
                ArtifactSource::Cached => self.cached += 1,
                ArtifactSource::Computed => self.computed += 1,
            },
            Err(_) => self.failed += 1,
        }
    }

    pub fn all_success(&self) -> bool {
        self.failed == 0 && self.cached + self.computed == self.total
    }
}

/// The two ordered key sequences handed to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// One entry per frame; `None` when orbitals are not persisted.
    pub orbitals: Vec<Option<MoKeys>>,
    pub energies: Vec<ArtifactKey>,
}

/// Everything a joined run produced, in frame order.
#[derive(Debug)]
pub struct PipelineReport {
    pub outcomes: Vec<FrameOutcome>,
    pub summary: PipelineSummary,
}

impl PipelineReport {
    pub fn failures(&self) -> impl Iterator<Item = (usize, &PipelineError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.point, e)))
    }

    /// Collapse into the ordered key sequences, or the first frame error.
    pub fn into_result(self) -> Result<PipelineResult, PipelineError> {
        let mut orbitals = Vec::with_capacity(self.outcomes.len());
        let mut energies = Vec::with_capacity(self.outcomes.len());
        for outcome in self.outcomes {
            let artifacts = outcome.result?;
            orbitals.push(artifacts.orbitals);
            energies.push(artifacts.energy);
        }
        Ok(PipelineResult { orbitals, energies })
    }
}

/// Progress events emitted while the pipeline runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameEvent {
    /// Results were already stored.
    Cached { point: usize },
    /// A task was spawned for the frame.
    Scheduled { point: usize, fresh_guess: bool },
    /// A job was handed to the solver.
    Submitted {
        point: usize,
        role: JobRole,
        corrective: bool,
    },
    /// The solver reported SCF non-convergence.
    Rejected { point: usize, warnings: Vec<String> },
    Accepted { point: usize, attempts: u32 },
    Persisted { point: usize, energy: f64 },
    Failed { point: usize, error: String },
}

/// Optional event channel shared by the orchestrator and its tasks.
///
/// Sends wait for channel capacity, so a receiver must keep draining.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<FrameEvent>>,
}

impl EventSink {
    pub fn new(tx: Option<mpsc::Sender<FrameEvent>>) -> Self {
        Self { tx }
    }

    pub async fn emit(&self, event: FrameEvent) {
        if let Some(ref tx) = self.tx {
            tx.send(event).await.ok();
        }
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Durations as whole milliseconds, saturating at `u64::MAX`.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FrameKeys;

    fn artifacts(point: usize, source: ArtifactSource) -> FrameArtifacts {
        let keys = FrameKeys::for_point("p", "cp2k", point).unwrap();
        FrameArtifacts {
            point,
            energy: keys.energy,
            orbitals: Some(keys.orbitals),
            source,
        }
    }

    #[test]
    fn summary_counts_sources_and_failures() {
        let outcomes = [
            FrameOutcome {
                point: 0,
                result: Ok(artifacts(0, ArtifactSource::Cached)),
            },
            FrameOutcome {
                point: 1,
                result: Ok(artifacts(1, ArtifactSource::Computed)),
            },
            FrameOutcome {
                point: 2,
                result: Err(PipelineError::ConvergenceFailure {
                    point: 2,
                    attempts: 2,
                    warnings: vec![],
                }),
            },
        ];
        let mut summary = PipelineSummary::new(3);
        for outcome in &outcomes {
            summary.add_outcome(outcome);
        }
        assert_eq!((summary.cached, summary.computed, summary.failed), (1, 1, 1));
        assert!(!summary.all_success());
    }

    #[test]
    fn into_result_preserves_order() {
        let report = PipelineReport {
            outcomes: (0..3)
                .map(|k| FrameOutcome {
                    point: k,
                    result: Ok(artifacts(k, ArtifactSource::Computed)),
                })
                .collect(),
            summary: PipelineSummary::new(3),
        };
        let result = report.into_result().unwrap();
        let energies: Vec<_> = result.energies.iter().map(|k| k.as_str().to_string()).collect();
        assert_eq!(
            energies,
            vec![
                "p/point_0/cp2k/mo/energy",
                "p/point_1/cp2k/mo/energy",
                "p/point_2/cp2k/mo/energy"
            ]
        );
        assert!(result.orbitals.iter().all(Option::is_some));
    }

    #[test]
    fn into_result_surfaces_first_failure() {
        let report = PipelineReport {
            outcomes: vec![
                FrameOutcome {
                    point: 0,
                    result: Ok(artifacts(0, ArtifactSource::Computed)),
                },
                FrameOutcome {
                    point: 1,
                    result: Err(PipelineError::TaskFailed {
                        point: 1,
                        message: "panicked".into(),
                    }),
                },
            ],
            summary: PipelineSummary::new(2),
        };
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.into_result().unwrap_err().point(), Some(1));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = FrameEvent::Submitted {
            point: 4,
            role: JobRole::Guess,
            corrective: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"submitted""#));
        assert!(json.contains(r#""role":"guess""#));

        let summary = PipelineSummary {
            duration: Duration::from_millis(1500),
            ..PipelineSummary::new(2)
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["duration"], 1500);
    }

    #[test]
    fn oversized_duration_saturates() {
        let summary = PipelineSummary {
            duration: Duration::MAX,
            ..PipelineSummary::new(0)
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["duration"], u64::MAX);

        let back: PipelineSummary = serde_json::from_value(json).unwrap();
        assert_eq!(back.duration, Duration::from_millis(u64::MAX));
    }
}
