//! Skip, fresh-guess and warm-start decisions for one frame.

use super::PipelineConfig;
use super::guess::GuessChain;
use super::state::{ArtifactSource, FrameArtifacts};
use crate::errors::PipelineError;
use crate::settings::SolverSettings;
use crate::solver::GuessHandle;
use crate::store::{ArtifactStore, FrameKeys};
use crate::trajectory::{Frame, Geometry, JobFiles};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Which kind of solver run a descriptor asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRole {
    /// Produces a warm-start only; its result is never validated or stored.
    Guess,
    Main,
}

impl JobRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Guess => "guess",
            Self::Main => "main",
        }
    }
}

/// Everything one solver invocation needs. Handed to the solver as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_name: String,
    pub point: usize,
    pub role: JobRole,
    pub settings: SolverSettings,
    pub geometry: Geometry,
    pub work_dir: PathBuf,
    pub files: JobFiles,
    /// Warm-start to read, if any.
    pub guess: Option<GuessHandle>,
    /// Issued after the frame's first result was rejected.
    pub corrective: bool,
}

impl JobDescriptor {
    pub fn new(
        frame: &Frame,
        role: JobRole,
        settings: SolverSettings,
        guess: Option<GuessHandle>,
        corrective: bool,
    ) -> Self {
        let job_name = match role {
            JobRole::Guess => format!("guess_point_{}", frame.point),
            JobRole::Main => format!("point_{}", frame.point),
        };
        Self {
            job_name,
            point: frame.point,
            role,
            settings,
            geometry: frame.geometry.clone(),
            work_dir: frame.work_dir.clone(),
            files: frame.files.clone(),
            guess,
            corrective,
        }
    }
}

/// Outcome of planning one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FramePlan {
    /// Results are already stored; nothing is submitted.
    Cached(FrameArtifacts),
    /// The frame must be computed, first producing a brand-new guess when
    /// `fresh_guess` is set.
    Compute { fresh_guess: bool },
}

/// Restart points shared between the planner and the executor.
///
/// Rejected frames are added at run time.
#[derive(Debug, Clone, Default)]
pub struct RestartPoints {
    configured: bool,
    points: Arc<Mutex<BTreeSet<usize>>>,
}

impl RestartPoints {
    pub fn new(points: Option<&BTreeSet<usize>>) -> Self {
        Self {
            configured: points.is_some(),
            points: Arc::new(Mutex::new(points.cloned().unwrap_or_default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<usize>> {
        self.points.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True once a restart policy exists, either configured up front or
    /// created by a rejected frame.
    pub fn is_configured(&self) -> bool {
        self.configured || !self.lock().is_empty()
    }

    pub fn contains(&self, point: usize) -> bool {
        self.lock().contains(&point)
    }

    pub fn insert(&self, point: usize) {
        self.lock().insert(point);
    }

    pub fn snapshot(&self) -> BTreeSet<usize> {
        self.lock().clone()
    }
}

/// Plans frames and builds their job descriptors.
#[derive(Clone)]
pub struct FrameJobBuilder {
    config: Arc<PipelineConfig>,
    store: Arc<dyn ArtifactStore>,
    restart: RestartPoints,
}

impl FrameJobBuilder {
    pub fn new(
        config: Arc<PipelineConfig>,
        store: Arc<dyn ArtifactStore>,
        restart: RestartPoints,
    ) -> Self {
        Self {
            config,
            store,
            restart,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn restart_points(&self) -> &RestartPoints {
        &self.restart
    }

    pub fn keys(&self, frame: &Frame) -> Result<FrameKeys, PipelineError> {
        Ok(FrameKeys::for_point(
            &self.config.project,
            &self.config.package,
            frame.point,
        )?)
    }

    /// Reject restart points outside `[enumerate_from, enumerate_from + N)`.
    pub fn validate_restart_points(&self, frames: &[Frame]) -> Result<(), PipelineError> {
        self.config.validate_restart_points(frames.len())
    }

    /// Plan `frame` given the current state of the guess chain.
    pub fn build<H>(&self, frame: &Frame, chain: &GuessChain<H>) -> Result<FramePlan, PipelineError> {
        self.plan(frame, chain.current().is_some())
    }

    /// Plan `frame`; `has_prior_guess` says whether an earlier frame will
    /// hand over a warm-start.
    ///
    /// Performs a blocking store lookup.
    pub fn plan(&self, frame: &Frame, has_prior_guess: bool) -> Result<FramePlan, PipelineError> {
        let keys = self.keys(frame)?;
        let compute_orbitals = self.config.compute_orbitals;

        if self.store.exists(&keys.skip_predicate(compute_orbitals))? {
            return Ok(FramePlan::Cached(FrameArtifacts {
                point: frame.point,
                energy: keys.energy,
                orbitals: compute_orbitals.then_some(keys.orbitals),
                source: ArtifactSource::Cached,
            }));
        }

        let fresh_guess = self.restart.contains(frame.point)
            || (self.restart.is_configured() && !has_prior_guess);
        Ok(FramePlan::Compute { fresh_guess })
    }

    fn resolve(&self, settings: &SolverSettings, frame: &Frame) -> SolverSettings {
        settings.with_cell_override(frame.cell.as_ref())
    }

    /// Guess-only job: guess settings, no warm-start.
    pub fn guess_job(&self, frame: &Frame, corrective: bool) -> JobDescriptor {
        let settings = self.resolve(&self.config.settings_guess, frame);
        JobDescriptor::new(frame, JobRole::Guess, settings, None, corrective)
    }

    /// Main job: main settings, warm-started from `guess` when given.
    pub fn main_job(
        &self,
        frame: &Frame,
        guess: Option<GuessHandle>,
        corrective: bool,
    ) -> JobDescriptor {
        let settings = self.resolve(&self.config.settings_main, frame);
        JobDescriptor::new(frame, JobRole::Main, settings, guess, corrective)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::CellParameters;
    use crate::store::{ArtifactValue, MemoryStore, NdArray};

    fn settings(basis: &str) -> SolverSettings {
        serde_yaml::from_str(&format!("basis: {basis}\npotential: GTH\ncell_parameters: 20.0\ncell_angles: [90, 90, 90]\n"))
            .unwrap()
    }

    fn frames(n: usize, enumerate_from: usize) -> Vec<Frame> {
        (0..n)
            .map(|j| {
                let k = j + enumerate_from;
                Frame::new(j, enumerate_from, Geometry::default(), PathBuf::from(format!("/w/point_{k}")))
            })
            .collect()
    }

    fn setup(config: PipelineConfig) -> (FrameJobBuilder, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let restart = RestartPoints::new(config.restart_points.as_ref());
        let builder = FrameJobBuilder::new(Arc::new(config), store.clone(), restart);
        (builder, store)
    }

    fn config() -> PipelineConfig {
        PipelineConfig::new("proj", "cp2k", settings("main"), settings("guess"))
    }

    #[test]
    fn cached_frame_returns_stored_keys() {
        let (builder, store) = setup(config());
        let frame = &frames(1, 0)[0];
        let keys = builder.keys(frame).unwrap();
        for key in keys.orbitals.to_vec() {
            store
                .write(&key, &ArtifactValue::Array(NdArray::vector(vec![0.0])))
                .unwrap();
        }
        store.write(&keys.energy, &ArtifactValue::Scalar(-1.0)).unwrap();

        let chain: GuessChain<()> = GuessChain::new();
        match builder.build(frame, &chain).unwrap() {
            FramePlan::Cached(artifacts) => {
                assert_eq!(artifacts.energy, keys.energy);
                assert_eq!(artifacts.orbitals, Some(keys.orbitals));
                assert_eq!(artifacts.source, ArtifactSource::Cached);
            }
            other => panic!("Expected cached plan, got {other:?}"),
        }
    }

    #[test]
    fn energy_only_frames_check_the_energy_key() {
        let (builder, store) = setup(config().with_compute_orbitals(false));
        let frame = &frames(1, 0)[0];
        let keys = builder.keys(frame).unwrap();
        store.write(&keys.energy, &ArtifactValue::Scalar(-1.0)).unwrap();

        match builder.plan(frame, false).unwrap() {
            FramePlan::Cached(artifacts) => assert!(artifacts.orbitals.is_none()),
            other => panic!("Expected cached plan, got {other:?}"),
        }
    }

    #[test]
    fn partial_orbitals_force_recompute() {
        let (builder, store) = setup(config());
        let frame = &frames(1, 0)[0];
        let keys = builder.keys(frame).unwrap();
        store
            .write(&keys.orbitals.eigenvalues, &ArtifactValue::Scalar(0.0))
            .unwrap();
        store.write(&keys.energy, &ArtifactValue::Scalar(0.0)).unwrap();

        assert_eq!(
            builder.plan(frame, true).unwrap(),
            FramePlan::Compute { fresh_guess: false }
        );
    }

    #[test]
    fn orbitals_without_energy_force_recompute() {
        let (builder, store) = setup(config());
        let frame = &frames(1, 0)[0];
        let keys = builder.keys(frame).unwrap();
        for key in keys.orbitals.to_vec() {
            store
                .write(&key, &ArtifactValue::Array(NdArray::vector(vec![0.0])))
                .unwrap();
        }

        assert_eq!(
            builder.plan(frame, false).unwrap(),
            FramePlan::Compute { fresh_guess: false }
        );
    }

    #[test]
    fn unconfigured_restart_points_never_force_a_guess() {
        let (builder, _) = setup(config());
        let frame = &frames(1, 0)[0];
        assert_eq!(
            builder.plan(frame, false).unwrap(),
            FramePlan::Compute { fresh_guess: false }
        );
    }

    #[test]
    fn configured_restart_points_seed_an_empty_chain() {
        let (builder, _) = setup(config().with_restart_points([2]));
        let all = frames(4, 0);

        assert_eq!(
            builder.plan(&all[0], false).unwrap(),
            FramePlan::Compute { fresh_guess: true }
        );
        assert_eq!(
            builder.plan(&all[1], true).unwrap(),
            FramePlan::Compute { fresh_guess: false }
        );
        assert_eq!(
            builder.plan(&all[2], true).unwrap(),
            FramePlan::Compute { fresh_guess: true }
        );
    }

    #[test]
    fn runtime_restart_points_are_honoured() {
        let (builder, _) = setup(config());
        let frame = &frames(2, 0)[1];
        builder.restart_points().insert(1);
        assert!(builder.restart_points().is_configured());
        assert_eq!(
            builder.plan(frame, true).unwrap(),
            FramePlan::Compute { fresh_guess: true }
        );
    }

    #[test]
    fn restart_points_outside_range_are_rejected() {
        let (builder, _) = setup(config().with_enumerate_from(10).with_restart_points([10, 13]));
        assert!(builder.validate_restart_points(&frames(4, 10)).is_ok());
        assert!(matches!(
            builder.validate_restart_points(&frames(3, 10)),
            Err(PipelineError::Configuration(msg)) if msg.contains("13")
        ));

        let (builder, _) = setup(config().with_enumerate_from(10).with_restart_points([9]));
        assert!(builder.validate_restart_points(&frames(3, 10)).is_err());
    }

    #[test]
    fn overflowing_point_range_is_a_configuration_error() {
        let config = config().with_enumerate_from(usize::MAX).with_restart_points([usize::MAX]);
        assert!(matches!(
            config.validate_restart_points(3),
            Err(PipelineError::Configuration(msg)) if msg.contains("enumerate_from")
        ));

        let config = config.with_enumerate_from(usize::MAX - 3);
        assert!(matches!(
            config.validate_restart_points(3),
            Err(PipelineError::Configuration(msg)) if msg.contains("restart point")
        ));
    }

    #[test]
    fn descriptors_use_role_settings_and_cell_override() {
        let (builder, _) = setup(config());
        let matrix = [[9.0, 0.0, 0.0], [0.0, 9.0, 0.0], [0.0, 0.0, 9.0]];
        let frame = frames(1, 3).remove(0).with_cell(Some(matrix));

        let guess = builder.guess_job(&frame, true);
        assert_eq!(guess.role, JobRole::Guess);
        assert_eq!(guess.settings.basis, "guess");
        assert_eq!(guess.job_name, "guess_point_3");
        assert!(guess.guess.is_none());
        assert!(guess.corrective);
        assert_eq!(guess.settings.cell_parameters, Some(CellParameters::Matrix(matrix)));
        assert!(guess.settings.cell_angles.is_none());

        let handle = GuessHandle {
            point: 2,
            work_dir: PathBuf::from("/w/point_2"),
            wavefunction: None,
        };
        let main = builder.main_job(&frame, Some(handle.clone()), false);
        assert_eq!(main.role, JobRole::Main);
        assert_eq!(main.settings.basis, "main");
        assert_eq!(main.job_name, "point_3");
        assert_eq!(main.guess, Some(handle));
        assert_eq!(main.files.input, PathBuf::from("/w/point_3/point_3.inp"));

        assert_eq!(builder.config().settings_main.cell_parameters, Some(CellParameters::Cubic(20.0)));
    }
}
