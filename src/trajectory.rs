//! Trajectory input and per-frame working directories.
//!
//! A trajectory is a multi-frame XYZ file: every record starts with an atom
//! count line, then a free-form comment line, then one line per atom.

use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::ops::Range;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub symbol: String,
    pub xyz: [f64; 3],
}

/// Atomic coordinates of one frame, in Angstrom.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Geometry {
    pub atoms: Vec<Atom>,
}

impl Geometry {
    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Render as a single-frame XYZ document.
    pub fn to_xyz(&self, comment: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.atoms.len());
        let _ = writeln!(out, "{comment}");
        for atom in &self.atoms {
            let _ = writeln!(
                out,
                "{:<3} {:>16.8} {:>16.8} {:>16.8}",
                atom.symbol, atom.xyz[0], atom.xyz[1], atom.xyz[2]
            );
        }
        out
    }
}

fn malformed(lineno: usize, message: impl std::fmt::Display) -> PipelineError {
    PipelineError::Configuration(format!("trajectory line {lineno}: {message}"))
}

/// Parse a multi-frame XYZ document.
pub fn parse_trajectory(text: &str) -> Result<Vec<Geometry>, PipelineError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut frames = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let header = lines[i].trim();
        if header.is_empty() {
            i += 1;
            continue;
        }
        let count: usize = header
            .parse()
            .map_err(|_| malformed(i + 1, format!("expected atom count, found '{header}'")))?;
        if i + 2 + count > lines.len() {
            return Err(malformed(
                i + 1,
                format!("frame declares {count} atoms but the file ends early"),
            ));
        }

        let mut atoms = Vec::with_capacity(count);
        for (lineno, line) in lines.iter().enumerate().skip(i + 2).take(count) {
            let mut fields = line.split_whitespace();
            let symbol = fields
                .next()
                .ok_or_else(|| malformed(lineno + 1, "empty atom line"))?;
            let mut xyz = [0.0; 3];
            for coord in &mut xyz {
                let field = fields
                    .next()
                    .ok_or_else(|| malformed(lineno + 1, "expected three coordinates"))?;
                *coord = field
                    .parse()
                    .map_err(|_| malformed(lineno + 1, format!("invalid coordinate '{field}'")))?;
            }
            atoms.push(Atom {
                symbol: symbol.to_string(),
                xyz,
            });
        }

        frames.push(Geometry { atoms });
        i += count + 2;
    }

    Ok(frames)
}

/// Read every frame of the trajectory at `path`.
pub fn read_trajectory(path: &Path) -> Result<Vec<Geometry>, PipelineError> {
    let text = std::fs::read_to_string(path).map_err(PipelineError::io(path))?;
    let frames = parse_trajectory(&text)?;
    if frames.is_empty() {
        return Err(PipelineError::Configuration(format!(
            "trajectory {} contains no frames",
            path.display()
        )));
    }
    Ok(frames)
}

/// The four canonical file names of one point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFiles {
    pub geometry: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
    pub orbitals: PathBuf,
}

impl JobFiles {
    pub fn for_point(work_dir: &Path, k: usize) -> Self {
        Self {
            geometry: work_dir.join(format!("coordinates_{k}.xyz")),
            input: work_dir.join(format!("point_{k}.inp")),
            output: work_dir.join(format!("point_{k}.out")),
            orbitals: work_dir.join(format!("mo_coeff_{k}.out")),
        }
    }
}

/// One trajectory point. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Position in the trajectory file.
    pub index: usize,
    /// Point number: `index + enumerate_from`.
    pub point: usize,
    pub geometry: Geometry,
    /// Lattice matrix overriding the configured cell for this frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell: Option<[[f64; 3]; 3]>,
    pub work_dir: PathBuf,
    pub files: JobFiles,
}

impl Frame {
    pub fn new(index: usize, enumerate_from: usize, geometry: Geometry, work_dir: PathBuf) -> Self {
        let point = index + enumerate_from;
        let files = JobFiles::for_point(&work_dir, point);
        Self {
            index,
            point,
            geometry,
            cell: None,
            work_dir,
            files,
        }
    }

    pub fn with_cell(mut self, cell: Option<[[f64; 3]; 3]>) -> Self {
        self.cell = cell;
        self
    }
}

/// What to do with a `point_{k}` folder left over from an earlier run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderMode {
    #[default]
    Reuse,
    Clear,
}

/// Point numbers `[enumerate_from, enumerate_from + n)` of an `n`-frame
/// trajectory.
pub fn point_range(enumerate_from: usize, n: usize) -> Result<Range<usize>, PipelineError> {
    let end = enumerate_from.checked_add(n).ok_or_else(|| {
        PipelineError::Configuration(format!(
            "enumerate_from {enumerate_from} is too large for a trajectory of {n} frames"
        ))
    })?;
    Ok(enumerate_from..end)
}

/// Create (or reuse) one `point_{k}` folder per frame under `workdir`.
pub fn create_point_folders(
    workdir: &Path,
    n: usize,
    enumerate_from: usize,
    mode: FolderMode,
) -> Result<Vec<PathBuf>, PipelineError> {
    let mut folders = Vec::with_capacity(n);
    for k in point_range(enumerate_from, n)? {
        let folder = workdir.join(format!("point_{k}"));
        if mode == FolderMode::Clear && folder.exists() {
            std::fs::remove_dir_all(&folder).map_err(PipelineError::io(&folder))?;
        }
        std::fs::create_dir_all(&folder).map_err(PipelineError::io(&folder))?;
        folders.push(folder);
    }
    Ok(folders)
}
