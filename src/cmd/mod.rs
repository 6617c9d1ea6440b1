//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module          | Commands handled |
//! |-----------------|------------------|
//! | `run`           | `Run`            |
//! | `status`        | `Status`         |
//! | `validate`      | `Validate`       |

pub mod run;
pub mod status;
pub mod validate;

pub use run::cmd_run;
pub use status::cmd_status;
pub use validate::cmd_validate;

use anyhow::{Context, Result};
use std::path::Path;
use trajqm::config::WorkflowConfig;

/// Load an input file with a path-bearing error.
pub(crate) fn load_config(input: &Path) -> Result<WorkflowConfig> {
    WorkflowConfig::load(input)
        .with_context(|| format!("Failed to load input file {}", input.display()))
}
