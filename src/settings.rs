//! Typed solver settings and the per-frame cell-parameter table.
//!
//! Main and guess runs each carry a [`SolverSettings`]. When the workflow
//! configures a cell-parameter file, every frame gets its own 3x3 cell
//! matrix through [`SolverSettings::with_cell_override`]; the configured
//! settings themselves are never mutated.

use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Periodicity of the simulated system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Periodic {
    #[default]
    None,
    X,
    Y,
    Z,
    Xy,
    Xz,
    Yz,
    Xyz,
}

/// Unit cell: a cubic edge, three edge lengths, or the full lattice matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellParameters {
    Cubic(f64),
    Lengths([f64; 3]),
    Matrix([[f64; 3]; 3]),
}

/// Settings handed to the solver for one kind of run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SolverSettings {
    pub basis: String,
    pub potential: String,
    #[serde(default = "default_functional")]
    pub functional: String,
    #[serde(default)]
    pub charge: i32,
    #[serde(default = "default_multiplicity")]
    pub multiplicity: u32,
    #[serde(default = "default_max_scf")]
    pub max_scf: u32,
    #[serde(default = "default_eps_scf")]
    pub eps_scf: f64,
    /// Unoccupied orbitals to add on top of the occupied ones.
    #[serde(default)]
    pub added_mos: u32,
    #[serde(default)]
    pub periodic: Periodic,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_parameters: Option<CellParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_angles: Option<[f64; 3]>,
}

fn default_functional() -> String {
    "pbe".to_string()
}

fn default_multiplicity() -> u32 {
    1
}

fn default_max_scf() -> u32 {
    200
}

fn default_eps_scf() -> f64 {
    1e-6
}

impl SolverSettings {
    /// Copy of these settings with the cell replaced by `cell`.
    ///
    /// An explicit lattice matrix makes any configured angles meaningless,
    /// so they are cleared.
    pub fn with_cell_override(&self, cell: Option<&[[f64; 3]; 3]>) -> Self {
        let mut settings = self.clone();
        if let Some(matrix) = cell {
            settings.cell_parameters = Some(CellParameters::Matrix(*matrix));
            settings.cell_angles = None;
        }
        settings
    }

    pub fn validate(&self, label: &str) -> Result<(), PipelineError> {
        if self.basis.trim().is_empty() {
            return Err(PipelineError::Configuration(format!(
                "{label}: basis must not be empty"
            )));
        }
        if self.potential.trim().is_empty() {
            return Err(PipelineError::Configuration(format!(
                "{label}: potential must not be empty"
            )));
        }
        if self.multiplicity == 0 {
            return Err(PipelineError::Configuration(format!(
                "{label}: multiplicity must be at least 1"
            )));
        }
        if self.eps_scf <= 0.0 {
            return Err(PipelineError::Configuration(format!(
                "{label}: eps_scf must be positive"
            )));
        }
        Ok(())
    }
}

/// Number of leading columns in a cell-parameter row (step and time).
const CELL_ROW_PREFIX: usize = 2;
const CELL_ROW_WIDTH: usize = CELL_ROW_PREFIX + 9;

/// Per-frame lattice matrices, one row per frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellParameterTable {
    rows: Vec<[[f64; 3]; 3]>,
}

impl CellParameterTable {
    /// Read a whitespace table with `#` comments.
    ///
    /// Columns 2..11 of each row are the lattice vectors `A B C`, row-major.
    pub fn read(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path).map_err(PipelineError::io(path))?;
        Self::parse(&text).map_err(|e| match e {
            PipelineError::Configuration(msg) => {
                PipelineError::Configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        let mut rows = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let values = line
                .split_whitespace()
                .map(str::parse::<f64>)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    PipelineError::Configuration(format!(
                        "line {}: invalid number in cell table: {e}",
                        lineno + 1
                    ))
                })?;
            if values.len() < CELL_ROW_WIDTH {
                return Err(PipelineError::Configuration(format!(
                    "line {}: expected at least {CELL_ROW_WIDTH} columns, found {}",
                    lineno + 1,
                    values.len()
                )));
            }
            let cell = &values[CELL_ROW_PREFIX..CELL_ROW_WIDTH];
            rows.push([
                [cell[0], cell[1], cell[2]],
                [cell[3], cell[4], cell[5]],
                [cell[6], cell[7], cell[8]],
            ]);
        }
        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Lattice matrix for trajectory position `j`.
    pub fn get(&self, j: usize) -> Option<&[[f64; 3]; 3]> {
        self.rows.get(j)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SolverSettings {
        serde_yaml::from_str(
            r#"
basis: DZVP-MOLOPT-SR-GTH
potential: GTH-PBE
periodic: xyz
cell_parameters: 28.0
cell_angles: [90.0, 90.0, 90.0]
"#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_are_filled_in() {
        let s = settings();
        assert_eq!(s.functional, "pbe");
        assert_eq!(s.multiplicity, 1);
        assert_eq!(s.max_scf, 200);
        assert_eq!(s.periodic, Periodic::Xyz);
        assert_eq!(s.cell_parameters, Some(CellParameters::Cubic(28.0)));
        assert!(s.validate("main").is_ok());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<SolverSettings, _> =
            serde_yaml::from_str("basis: b\npotential: p\nbogus: 1\n");
        assert!(result.is_err());
    }

    #[test]
    fn cell_override_replaces_matrix_and_clears_angles() {
        let s = settings();
        let matrix = [[10.0, 0.0, 0.0], [0.0, 11.0, 0.0], [0.0, 0.0, 12.0]];

        let resolved = s.with_cell_override(Some(&matrix));
        assert_eq!(resolved.cell_parameters, Some(CellParameters::Matrix(matrix)));
        assert!(resolved.cell_angles.is_none());

        assert_eq!(s.cell_parameters, Some(CellParameters::Cubic(28.0)));
        assert_eq!(s.with_cell_override(None), s);
    }

    #[test]
    fn cell_table_parses_rows_and_skips_comments() {
        let text = "\
# Step Time Ax Ay Az Bx By Bz Cx Cy Cz Volume
0 0.0 10 0 0 0 11 0 0 0 12 1320
1 0.5 10.1 0 0 0 11.1 0 0 0 12.1 1356

";
        let table = CellParameterTable::parse(text).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(1).unwrap()[1][1], 11.1);
        assert!(table.get(2).is_none());
    }

    #[test]
    fn short_cell_row_names_the_line() {
        let err = CellParameterTable::parse("# header\n0 0.0 1 2 3\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn validate_rejects_empty_basis() {
        let mut s = settings();
        s.basis = " ".into();
        assert!(matches!(
            s.validate("guess"),
            Err(PipelineError::Configuration(msg)) if msg.contains("guess")
        ));
    }
}
