//! Workflow input file.
//!
//! A run is described by one YAML document:
//!
//! ```yaml
//! project_name: ethylene
//! package_name: cp2k
//! store_path: ethylene_store
//! workdir: scratch
//! path_traj_xyz: ethylene.xyz
//! enumerate_from: 0
//! calc_new_wf_guess_on_points: [0]
//! compute_orbitals: true
//! solver:
//!   program: ./run_cp2k.sh
//!   timeout_secs: 7200
//! general_settings:
//!   file_cell_parameters: cell.txt
//!   settings_main: {basis: DZVP-MOLOPT-SR-GTH, potential: GTH-PBE}
//!   settings_guess: {basis: DZVP-MOLOPT-SR-GTH, potential: GTH-PBE, eps_scf: 1.0e-4}
//! ```
//!
//! Relative paths are resolved against the directory of the input file.

use crate::errors::PipelineError;
use crate::pipeline::PipelineConfig;
use crate::settings::{CellParameterTable, SolverSettings};
use crate::solver::SolverCommand;
use crate::store::FileStore;
use crate::trajectory::{
    FolderMode, Frame, Geometry, create_point_folders, point_range, read_trajectory,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_max_parallel() -> usize {
    4
}

fn default_true() -> bool {
    true
}

/// Solver settings shared by every frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralSettings {
    /// Per-frame lattice table; row `j` applies to trajectory frame `j`.
    #[serde(default)]
    pub file_cell_parameters: Option<PathBuf>,
    pub settings_main: SolverSettings,
    pub settings_guess: SolverSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    pub project_name: String,
    pub package_name: String,
    pub store_path: PathBuf,
    pub workdir: PathBuf,
    pub path_traj_xyz: PathBuf,
    #[serde(default)]
    pub enumerate_from: usize,
    /// Points that always start from a freshly computed guess.
    #[serde(default)]
    pub calc_new_wf_guess_on_points: Option<Vec<usize>>,
    #[serde(default = "default_true")]
    pub compute_orbitals: bool,
    #[serde(default)]
    pub ignore_warnings: bool,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Clear `point_{k}` folders left by an earlier run instead of reusing them.
    #[serde(default)]
    pub remove_existing_folders: bool,
    pub solver: SolverCommand,
    pub general_settings: GeneralSettings,
}

impl WorkflowConfig {
    /// Load, resolve and validate an input file.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(PipelineError::io(path))?;
        let mut config = Self::parse(&content).map_err(|e| match e {
            PipelineError::Configuration(msg) => {
                PipelineError::Configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document without resolving or validating it.
    pub fn parse(content: &str) -> Result<Self, PipelineError> {
        serde_yaml::from_str(content).map_err(|e| PipelineError::Configuration(e.to_string()))
    }

    /// Make every relative path absolute with respect to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.store_path);
        resolve(&mut self.workdir);
        resolve(&mut self.path_traj_xyz);
        if let Some(cell) = self.general_settings.file_cell_parameters.as_mut() {
            resolve(cell);
        }
        // Bare program names are looked up on PATH.
        let program = PathBuf::from(&self.solver.program);
        if program.components().count() > 1 && program.is_relative() {
            self.solver.program = base.join(program).to_string_lossy().into_owned();
        }
    }

    /// Reject configurations the pipeline cannot run.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for (label, name) in [
            ("project_name", &self.project_name),
            ("package_name", &self.package_name),
        ] {
            if name.trim().is_empty() || name.contains('/') || name == "." || name == ".." {
                return Err(PipelineError::Configuration(format!(
                    "{label} '{name}' must be a non-empty name without '/'"
                )));
            }
        }
        if self.max_parallel == 0 {
            return Err(PipelineError::Configuration(
                "max_parallel must be at least 1".to_string(),
            ));
        }
        if self.solver.program.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "solver.program must not be empty".to_string(),
            ));
        }
        self.general_settings.settings_main.validate("settings_main")?;
        self.general_settings.settings_guess.validate("settings_guess")?;
        Ok(())
    }

    /// Non-fatal remarks about the configuration.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.ignore_warnings {
            warnings.push(
                "ignore_warnings is set: non-converged SCF results will be stored".to_string(),
            );
        }
        if matches!(&self.calc_new_wf_guess_on_points, Some(points) if points.is_empty()) {
            warnings.push(
                "calc_new_wf_guess_on_points is empty: the first computed point will still start from a fresh guess"
                    .to_string(),
            );
        }
        if !self.compute_orbitals {
            warnings.push("compute_orbitals is off: only energies will be stored".to_string());
        }
        warnings
    }

    /// Apply command-line overrides.
    pub fn with_overrides(mut self, max_parallel: Option<usize>, ignore_warnings: bool) -> Self {
        if let Some(n) = max_parallel {
            self.max_parallel = n.max(1);
        }
        self.ignore_warnings |= ignore_warnings;
        self
    }

    pub fn folder_mode(&self) -> FolderMode {
        if self.remove_existing_folders {
            FolderMode::Clear
        } else {
            FolderMode::Reuse
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new(
            &self.project_name,
            &self.package_name,
            self.general_settings.settings_main.clone(),
            self.general_settings.settings_guess.clone(),
        )
        .with_enumerate_from(self.enumerate_from)
        .with_compute_orbitals(self.compute_orbitals)
        .with_ignore_warnings(self.ignore_warnings)
        .with_max_parallel(self.max_parallel);
        if let Some(points) = &self.calc_new_wf_guess_on_points {
            config = config.with_restart_points(points.iter().copied());
        }
        config
    }

    pub fn open_store(&self) -> Result<FileStore, PipelineError> {
        Ok(FileStore::open(&self.store_path)?)
    }

    /// Read the trajectory and the optional cell table, checking that the
    /// table covers every frame. Touches nothing on disk.
    pub fn read_inputs(
        &self,
    ) -> Result<(Vec<Geometry>, Option<CellParameterTable>), PipelineError> {
        let geometries = read_trajectory(&self.path_traj_xyz)?;
        let cells = self
            .general_settings
            .file_cell_parameters
            .as_deref()
            .map(CellParameterTable::read)
            .transpose()?;
        if let Some(table) = &cells
            && table.len() < geometries.len()
        {
            return Err(PipelineError::Configuration(format!(
                "cell parameter table has {} rows but the trajectory has {} frames",
                table.len(),
                geometries.len()
            )));
        }
        point_range(self.enumerate_from, geometries.len())?;
        Ok((geometries, cells))
    }

    /// Read the inputs, provision one folder per frame and attach the
    /// per-frame cell overrides.
    pub fn build_frames(&self) -> Result<Vec<Frame>, PipelineError> {
        let (geometries, cells) = self.read_inputs()?;
        self.pipeline_config()
            .validate_restart_points(geometries.len())?;
        let folders = create_point_folders(
            &self.workdir,
            geometries.len(),
            self.enumerate_from,
            self.folder_mode(),
        )?;

        Ok(geometries
            .into_iter()
            .zip(folders)
            .enumerate()
            .map(|(j, (geometry, folder))| {
                let cell = cells.as_ref().and_then(|t| t.get(j)).copied();
                Frame::new(j, self.enumerate_from, geometry, folder).with_cell(cell)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const INPUT: &str = r#"
project_name: ethylene
package_name: cp2k
store_path: store
workdir: scratch
path_traj_xyz: traj.xyz
enumerate_from: 10
calc_new_wf_guess_on_points: [10]
solver:
  program: ./bin/solver.sh
  args: ["--fast"]
general_settings:
  settings_main: {basis: DZVP, potential: GTH}
  settings_guess: {basis: SZV, potential: GTH, eps_scf: 1.0e-4}
"#;

    const TRAJ: &str = "1\nf0\nH 0 0 0\n1\nf1\nH 0 0 0.1\n";

    #[test]
    fn load_resolves_paths_and_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("input.yaml");
        std::fs::write(&path, INPUT).unwrap();

        let config = WorkflowConfig::load(&path).unwrap();
        assert_eq!(config.store_path, dir.path().join("store"));
        assert_eq!(config.path_traj_xyz, dir.path().join("traj.xyz"));
        assert_eq!(
            PathBuf::from(&config.solver.program),
            dir.path().join("./bin/solver.sh")
        );
        assert!(config.compute_orbitals);
        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.folder_mode(), FolderMode::Reuse);

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.enumerate_from, 10);
        assert_eq!(pipeline.restart_points, Some([10].into_iter().collect()));
        assert_eq!(pipeline.settings_guess.basis, "SZV");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let input = format!("{INPUT}bogus_key: 1\n");
        assert!(matches!(
            WorkflowConfig::parse(&input),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn bare_program_names_stay_on_path() {
        let mut config = WorkflowConfig::parse(&INPUT.replace("./bin/solver.sh", "cp2k.psmp")).unwrap();
        config.resolve_paths(Path::new("/inputs"));
        assert_eq!(config.solver.program, "cp2k.psmp");
    }

    #[test]
    fn invalid_names_fail_validation() {
        let mut config = WorkflowConfig::parse(INPUT).unwrap();
        config.project_name = "a/b".into();
        assert!(config.validate().is_err());

        let mut config = WorkflowConfig::parse(INPUT).unwrap();
        config.max_parallel = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn overrides_apply() {
        let config = WorkflowConfig::parse(INPUT)
            .unwrap()
            .with_overrides(Some(8), true);
        assert_eq!(config.max_parallel, 8);
        assert!(config.ignore_warnings);
        assert!(!config.warnings().is_empty());
    }

    #[test]
    fn build_frames_numbers_points_and_applies_cells() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("traj.xyz"), TRAJ).unwrap();
        std::fs::write(
            dir.path().join("cell.txt"),
            "# step time A B C\n0 0 10 0 0 0 10 0 0 0 10\n1 1 11 0 0 0 11 0 0 0 11\n",
        )
        .unwrap();
        let mut config = WorkflowConfig::parse(INPUT).unwrap();
        config.general_settings.file_cell_parameters = Some(PathBuf::from("cell.txt"));
        config.resolve_paths(dir.path());

        let frames = config.build_frames().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].point, 11);
        assert_eq!(frames[1].work_dir, dir.path().join("scratch/point_11"));
        assert!(frames[1].work_dir.is_dir());
        assert_eq!(frames[1].cell.unwrap()[0][0], 11.0);
    }

    #[test]
    fn out_of_range_restart_point_creates_no_folders() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("traj.xyz"), TRAJ).unwrap();
        let mut config = WorkflowConfig::parse(INPUT).unwrap();
        config.calc_new_wf_guess_on_points = Some(vec![12]);
        config.resolve_paths(dir.path());

        assert!(matches!(
            config.build_frames(),
            Err(PipelineError::Configuration(msg)) if msg.contains("restart point 12")
        ));
        assert!(!dir.path().join("scratch").exists());
    }

    #[test]
    fn overflowing_point_numbers_are_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("traj.xyz"), TRAJ).unwrap();
        let mut config = WorkflowConfig::parse(INPUT).unwrap();
        config.enumerate_from = usize::MAX - 1;
        config.calc_new_wf_guess_on_points = None;
        config.resolve_paths(dir.path());

        assert!(matches!(
            config.read_inputs(),
            Err(PipelineError::Configuration(msg)) if msg.contains("enumerate_from")
        ));
        assert!(config.build_frames().is_err());
        assert!(!dir.path().join("scratch").exists());
    }

    #[test]
    fn short_cell_table_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("traj.xyz"), TRAJ).unwrap();
        std::fs::write(dir.path().join("cell.txt"), "0 0 10 0 0 0 10 0 0 0 10\n").unwrap();
        let mut config = WorkflowConfig::parse(INPUT).unwrap();
        config.general_settings.file_cell_parameters = Some(PathBuf::from("cell.txt"));
        config.resolve_paths(dir.path());

        assert!(matches!(
            config.build_frames(),
            Err(PipelineError::Configuration(msg)) if msg.contains("1 rows")
        ));
    }
}
