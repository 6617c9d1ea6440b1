//! Writes accepted results to the artifact store.

use super::state::{ArtifactSource, FrameArtifacts};
use crate::errors::{PipelineError, SolverError};
use crate::solver::SolverOutput;
use crate::store::{ArtifactKey, ArtifactStore, ArtifactValue, FrameKeys, WriteOutcome};
use std::sync::Arc;
use tracing::{debug, info};

/// Persist one accepted frame: orbitals (when requested) first, energy last.
///
/// Keys already present keep their stored value.
pub async fn persist_frame(
    store: Arc<dyn ArtifactStore>,
    keys: FrameKeys,
    point: usize,
    output: &SolverOutput,
    compute_orbitals: bool,
) -> Result<FrameArtifacts, PipelineError> {
    let mut writes: Vec<(ArtifactKey, ArtifactValue)> = Vec::with_capacity(3);

    if compute_orbitals {
        let orbitals = output
            .orbitals
            .as_ref()
            .ok_or_else(|| PipelineError::SolverFailure {
                point,
                source: SolverError::Report("solver returned no orbitals".to_string()),
            })?;
        writes.push((
            keys.orbitals.eigenvalues.clone(),
            ArtifactValue::Array(orbitals.eigenvalues.clone()),
        ));
        writes.push((
            keys.orbitals.coefficients.clone(),
            ArtifactValue::Array(orbitals.coefficients.clone()),
        ));
    }
    writes.push((keys.energy.clone(), ArtifactValue::Scalar(output.energy)));

    tokio::task::spawn_blocking(move || -> Result<(), PipelineError> {
        for (key, value) in &writes {
            if store.write(key, value)? == WriteOutcome::AlreadyPresent {
                debug!(key = %key, "Artifact already stored, keeping existing value");
            }
        }
        Ok(())
    })
    .await
    .map_err(|e| PipelineError::TaskFailed {
        point,
        message: e.to_string(),
    })??;

    info!("Total energy of point {} is: {}", point, output.energy);

    Ok(FrameArtifacts {
        point,
        energy: keys.energy,
        orbitals: compute_orbitals.then_some(keys.orbitals),
        source: ArtifactSource::Computed,
    })
}
