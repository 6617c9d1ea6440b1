//! Subprocess-backed solver.
//!
//! The configured program is started in the frame's working directory with:
//! - the job descriptor as JSON on stdin
//! - `TRAJQM_POINT`, `TRAJQM_ROLE` and `TRAJQM_JOB` in its environment
//! - the frame geometry already written to `coordinates_{k}.xyz`
//!
//! It must exit with status 0 and print a JSON report on stdout (other
//! output around the report is tolerated):
//!
//! ```json
//! {"energy": -17.2, "eigenvalues": [...], "coefficients": [[...], ...],
//!  "warnings": ["..."], "wavefunction": "point_0-RESTART.wfn"}
//! ```

use super::{Orbitals, Solver, SolverOutput, SolverWarning};
use crate::errors::SolverError;
use crate::pipeline::JobDescriptor;
use crate::store::NdArray;
use crate::util::extract_json_object;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// How to launch the solver program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SolverCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Wall-clock limit per invocation.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl SolverCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout_secs: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Report printed by the solver program.
#[derive(Debug, Deserialize)]
struct SolverReport {
    energy: f64,
    #[serde(default)]
    eigenvalues: Option<Vec<f64>>,
    #[serde(default)]
    coefficients: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    warnings: Vec<String>,
    #[serde(default)]
    wavefunction: Option<PathBuf>,
}

fn matrix(rows: Vec<Vec<f64>>) -> Result<NdArray, SolverError> {
    let n_rows = rows.len();
    let n_cols = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != n_cols) {
        return Err(SolverError::Report(
            "coefficient rows have different lengths".to_string(),
        ));
    }
    let data = rows.into_iter().flatten().collect();
    NdArray::new(vec![n_rows, n_cols], data).map_err(|e| SolverError::Report(e.to_string()))
}

/// Parse the JSON report from solver stdout.
fn parse_report(stdout: &str, work_dir: &Path) -> Result<SolverOutput, SolverError> {
    let json = extract_json_object(stdout)
        .ok_or_else(|| SolverError::Report("no JSON object on stdout".to_string()))?;
    let report: SolverReport =
        serde_json::from_str(json).map_err(|e| SolverError::Report(e.to_string()))?;

    if !report.energy.is_finite() {
        return Err(SolverError::Report(format!(
            "energy is not finite: {}",
            report.energy
        )));
    }

    let orbitals = match (report.eigenvalues, report.coefficients) {
        (Some(eigenvalues), Some(coefficients)) => Some(Orbitals {
            eigenvalues: NdArray::vector(eigenvalues),
            coefficients: matrix(coefficients)?,
        }),
        (None, None) => None,
        _ => {
            return Err(SolverError::Report(
                "eigenvalues and coefficients must be reported together".to_string(),
            ));
        }
    };

    Ok(SolverOutput {
        energy: report.energy,
        orbitals,
        warnings: report
            .warnings
            .into_iter()
            .map(SolverWarning::classify)
            .collect(),
        work_dir: work_dir.to_path_buf(),
        wavefunction: report.wavefunction.map(|p| work_dir.join(p)),
    })
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SolverError + '_ {
    move |source| SolverError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Runs the configured program once per job.
#[derive(Debug, Clone)]
pub struct CommandSolver {
    command: SolverCommand,
}

impl CommandSolver {
    pub fn new(command: SolverCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Solver for CommandSolver {
    async fn run(&self, job: &JobDescriptor) -> Result<SolverOutput, SolverError> {
        tokio::fs::create_dir_all(&job.work_dir)
            .await
            .map_err(io_err(&job.work_dir))?;
        let xyz = job.geometry.to_xyz(&job.job_name);
        tokio::fs::write(&job.files.geometry, xyz)
            .await
            .map_err(io_err(&job.files.geometry))?;

        let descriptor = serde_json::to_vec(job)
            .map_err(|e| SolverError::Report(format!("failed to encode job: {e}")))?;

        debug!(
            point = job.point,
            role = job.role.as_str(),
            program = %self.command.program,
            "Spawning solver"
        );

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .envs(&self.command.env)
            .env("TRAJQM_POINT", job.point.to_string())
            .env("TRAJQM_ROLE", job.role.as_str())
            .env("TRAJQM_JOB", &job.job_name)
            .current_dir(&job.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SolverError::Spawn {
                program: self.command.program.clone(),
                source,
            })?;

        // The descriptor is fed while stdout is drained, so a solver that
        // prints before (or instead of) reading stdin cannot block on a full
        // pipe. Dropping stdin at the end signals EOF.
        let writer = child.stdin.take().map(|mut stdin| {
            let point = job.point;
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&descriptor).await {
                    debug!(point, error = %e, "Solver did not consume the job descriptor");
                }
            })
        });

        let waited = match self.command.timeout_secs {
            Some(secs) => timeout(Duration::from_secs(secs), child.wait_with_output())
                .await
                .map_err(|_| SolverError::Timeout { secs }),
            None => Ok(child.wait_with_output().await),
        };
        if let Some(writer) = writer {
            writer.abort();
        }
        let output = waited?.map_err(io_err(&job.work_dir))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(SolverError::Exit {
                code: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }
        if !stderr.trim().is_empty() {
            warn!(point = job.point, stderr = %stderr.trim(), "Solver wrote to stderr");
        }

        parse_report(&String::from_utf8_lossy(&output.stdout), &job.work_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{JobDescriptor, JobRole};
    use crate::settings::SolverSettings;
    use crate::trajectory::{Atom, Frame, Geometry, parse_trajectory};
    use tempfile::tempdir;

    fn settings() -> SolverSettings {
        serde_yaml::from_str("basis: DZVP\npotential: GTH\n").unwrap()
    }

    fn job(work_dir: &Path) -> JobDescriptor {
        let geometry = parse_trajectory("1\nh\nH 0.0 0.0 0.0\n")
            .unwrap()
            .remove(0);
        let frame = Frame::new(0, 4, geometry, work_dir.to_path_buf());
        JobDescriptor::new(&frame, JobRole::Main, settings(), None, false)
    }

    fn sh(script: &str) -> SolverCommand {
        SolverCommand::new("sh").with_args(["-c", script])
    }

    #[test]
    fn report_with_orbitals_is_parsed() {
        let stdout = r#"banner line
{"energy": -1.5, "eigenvalues": [-0.5, 0.25],
 "coefficients": [[1.0, 0.0], [0.0, 1.0]],
 "warnings": ["SCF run NOT converged", "basis note"],
 "wavefunction": "wfn.restart"}"#;
        let output = parse_report(stdout, Path::new("/w")).unwrap();
        assert_eq!(output.energy, -1.5);
        let orbitals = output.orbitals.unwrap();
        assert_eq!(orbitals.eigenvalues.shape(), &[2]);
        assert_eq!(orbitals.coefficients.shape(), &[2, 2]);
        assert!(output.warnings[0].is_scf_convergence());
        assert!(!output.warnings[1].is_scf_convergence());
        assert_eq!(output.wavefunction, Some(PathBuf::from("/w/wfn.restart")));
    }

    #[test]
    fn report_without_orbitals_is_energy_only() {
        let output = parse_report(r#"{"energy": -3.0}"#, Path::new("/w")).unwrap();
        assert!(output.orbitals.is_none());
        assert!(output.warnings.is_empty());
    }

    #[test]
    fn half_orbitals_are_rejected() {
        let err = parse_report(r#"{"energy": -3.0, "eigenvalues": [1.0]}"#, Path::new("/w"))
            .unwrap_err();
        assert!(matches!(err, SolverError::Report(_)));
    }

    #[test]
    fn ragged_coefficients_are_rejected() {
        let stdout = r#"{"energy": 0.0, "eigenvalues": [1.0, 2.0], "coefficients": [[1.0], [1.0, 2.0]]}"#;
        assert!(parse_report(stdout, Path::new("/w")).is_err());
    }

    #[test]
    fn missing_report_is_rejected() {
        assert!(matches!(
            parse_report("Segmentation fault", Path::new("/w")),
            Err(SolverError::Report(_))
        ));
    }

    #[tokio::test]
    async fn runs_program_with_environment_and_geometry() {
        let dir = tempdir().unwrap();
        let solver = CommandSolver::new(sh(
            r#"cat > job.json; test -f coordinates_4.xyz || exit 9; echo "{\"energy\": -$TRAJQM_POINT.5, \"warnings\": [\"$TRAJQM_ROLE\"]}""#,
        ));

        let output = solver.run(&job(dir.path())).await.unwrap();
        assert_eq!(output.energy, -4.5);
        assert_eq!(output.warnings, vec![SolverWarning::Other("main".into())]);

        let stdin: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("job.json")).unwrap())
                .unwrap();
        assert_eq!(stdin["point"], 4);
        assert_eq!(stdin["role"], "main");
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let dir = tempdir().unwrap();
        let solver = CommandSolver::new(sh("echo boom >&2; exit 3"));
        match solver.run(&job(dir.path())).await {
            Err(SolverError::Exit { code, stderr }) => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("Expected Exit error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_is_enforced() {
        let dir = tempdir().unwrap();
        let solver = CommandSolver::new(sh("sleep 10").with_timeout(1));
        assert!(matches!(
            solver.run(&job(dir.path())).await,
            Err(SolverError::Timeout { secs: 1 })
        ));
    }

    /// A frame large enough that its descriptor overflows a pipe buffer.
    fn large_job(work_dir: &Path) -> JobDescriptor {
        let geometry = Geometry {
            atoms: (0..3000)
                .map(|i| Atom {
                    symbol: "Cd".to_string(),
                    xyz: [i as f64 * 0.5, 1.25, -3.75],
                })
                .collect(),
        };
        let frame = Frame::new(0, 4, geometry, work_dir.to_path_buf());
        JobDescriptor::new(&frame, JobRole::Main, settings(), None, false)
    }

    #[tokio::test]
    async fn solver_ignoring_stdin_with_large_output_completes() {
        let dir = tempdir().unwrap();
        let job = large_job(dir.path());
        assert!(serde_json::to_vec(&job).unwrap().len() > 100_000);

        let solver = CommandSolver::new(
            sh(r#"head -c 200000 /dev/zero | tr '\0' x; echo; echo '{"energy": -1.0}'"#)
                .with_timeout(20),
        );
        let output = tokio::time::timeout(Duration::from_secs(30), solver.run(&job))
            .await
            .expect("solver run should not hang")
            .unwrap();
        assert_eq!(output.energy, -1.0);
    }

    #[tokio::test]
    async fn timeout_covers_an_unread_descriptor() {
        let dir = tempdir().unwrap();
        let solver = CommandSolver::new(sh("sleep 10").with_timeout(1));
        let result = tokio::time::timeout(Duration::from_secs(5), solver.run(&large_job(dir.path())))
            .await
            .expect("timeout should fire");
        assert!(matches!(result, Err(SolverError::Timeout { secs: 1 })));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempdir().unwrap();
        let solver = CommandSolver::new(SolverCommand::new("/nonexistent/trajqm-solver"));
        assert!(matches!(
            solver.run(&job(dir.path())).await,
            Err(SolverError::Spawn { .. })
        ));
    }
}
