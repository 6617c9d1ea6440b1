//! External quantum-chemistry solver interface.
//!
//! The pipeline never looks inside the solver: it hands over a
//! [`JobDescriptor`] and receives a [`SolverOutput`] with the energy, the
//! optional orbital arrays and whatever warnings the run emitted.
//! [`CommandSolver`] runs a configured program as a subprocess; tests plug
//! in their own implementations.

mod command;

pub use command::{CommandSolver, SolverCommand};

use crate::errors::SolverError;
use crate::pipeline::JobDescriptor;
use crate::store::NdArray;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;

static SCF_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)scf[ _]convergence[ _]warning|scf\s+(run\s+)?(has\s+)?not\s+converged|scf\b.*\bdid\s+not\s+converge")
        .unwrap()
});

/// Warm-start produced by a completed computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuessHandle {
    /// Point number of the computation that produced it.
    pub point: usize,
    pub work_dir: PathBuf,
    /// Wavefunction restart file, if the solver reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wavefunction: Option<PathBuf>,
}

/// A warning emitted by one solver run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum SolverWarning {
    /// The self-consistent-field iterations did not converge.
    ScfConvergence(String),
    Other(String),
}

impl SolverWarning {
    /// Classify a raw warning line.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if SCF_WARNING_REGEX.is_match(&message) {
            Self::ScfConvergence(message)
        } else {
            Self::Other(message)
        }
    }

    pub fn is_scf_convergence(&self) -> bool {
        matches!(self, Self::ScfConvergence(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::ScfConvergence(m) | Self::Other(m) => m,
        }
    }
}

/// Molecular-orbital eigenvalues and coefficients of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Orbitals {
    pub eigenvalues: NdArray,
    pub coefficients: NdArray,
}

/// What one solver invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverOutput {
    pub energy: f64,
    pub orbitals: Option<Orbitals>,
    pub warnings: Vec<SolverWarning>,
    pub work_dir: PathBuf,
    pub wavefunction: Option<PathBuf>,
}

impl SolverOutput {
    /// Messages of the SCF non-convergence warnings, if any.
    pub fn scf_warnings(&self) -> Vec<String> {
        self.warnings
            .iter()
            .filter(|w| w.is_scf_convergence())
            .map(|w| w.message().to_string())
            .collect()
    }

    /// Handle that lets a later frame warm-start from this run.
    pub fn guess_handle(&self, point: usize) -> GuessHandle {
        GuessHandle {
            point,
            work_dir: self.work_dir.clone(),
            wavefunction: self.wavefunction.clone(),
        }
    }
}

/// Runs one job descriptor to completion.
#[async_trait]
pub trait Solver: Send + Sync {
    async fn run(&self, job: &JobDescriptor) -> Result<SolverOutput, SolverError>;
}
