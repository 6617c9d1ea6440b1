//! Typed error hierarchy for the trajectory pipeline.
//!
//! One enum per subsystem:
//! - `StoreError`: artifact store reads, writes and key validation
//! - `SolverError`: failures invoking the external quantum-chemistry solver
//! - `PipelineError`: configuration, convergence and per-frame failures

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the persistent artifact store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Artifact {key} not found in store")]
    NotFound { key: String },

    #[error("Invalid artifact key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode or decode artifact {key}: {source}")]
    Encoding {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Array shape {shape:?} does not match {len} data elements")]
    ShapeMismatch { shape: Vec<usize>, len: usize },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Errors from a single solver invocation.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("Failed to spawn solver '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Solver exited with code {code}: {stderr}")]
    Exit { code: i32, stderr: String },

    #[error("Solver did not finish within {secs}s")]
    Timeout { secs: u64 },

    #[error("Malformed solver report: {0}")]
    Report(String),

    #[error("Solver I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by the pipeline to its caller.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("SCF did not converge for point {point} after {attempts} attempts: {warnings:?}")]
    ConvergenceFailure {
        point: usize,
        attempts: u32,
        warnings: Vec<String>,
    },

    #[error("Solver failed for point {point}: {source}")]
    SolverFailure {
        point: usize,
        #[source]
        source: SolverError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Task for point {point} did not complete: {message}")]
    TaskFailed { point: usize, message: String },
}

impl PipelineError {
    /// Adapter for `map_err` on filesystem calls.
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    /// Point number the error belongs to, if it is a per-frame failure.
    pub fn point(&self) -> Option<usize> {
        match self {
            Self::ConvergenceFailure { point, .. }
            | Self::SolverFailure { point, .. }
            | Self::TaskFailed { point, .. } => Some(*point),
            _ => None,
        }
    }

    /// True when a store read targeted a key that was never written.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(StoreError::NotFound { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convergence_failure_carries_point_and_attempts() {
        let err = PipelineError::ConvergenceFailure {
            point: 7,
            attempts: 2,
            warnings: vec!["SCF run NOT converged".to_string()],
        };
        assert_eq!(err.point(), Some(7));
        let text = err.to_string();
        assert!(text.contains('7'));
        assert!(text.contains("2 attempts"));
    }

    #[test]
    fn store_not_found_converts_and_is_detectable() {
        let inner = StoreError::NotFound {
            key: "proj/point_0/cp2k/mo/energy".to_string(),
        };
        let err: PipelineError = inner.into();
        assert!(err.is_not_found());
        assert_eq!(err.point(), None);
        assert!(err.to_string().contains("point_0"));
    }

    #[test]
    fn solver_failure_keeps_source() {
        let err = PipelineError::SolverFailure {
            point: 3,
            source: SolverError::Exit {
                code: 134,
                stderr: "segfault".to_string(),
            },
        };
        match &err {
            PipelineError::SolverFailure {
                source: SolverError::Exit { code, .. },
                ..
            } => assert_eq!(*code, 134),
            _ => panic!("Expected SolverFailure(Exit)"),
        }
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn configuration_error_is_not_per_frame() {
        let err = PipelineError::Configuration("restart point 12 out of range".into());
        assert!(err.point().is_none());
        assert!(!err.is_not_found());
    }
}
