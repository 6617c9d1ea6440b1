//! Persistent artifact store.
//!
//! Results are addressed by hierarchical keys of the form
//! `{project}/point_{k}/{package}/mo/{eigenvalues|coefficients|energy}`.
//! The presence of a key is the pipeline's only skip signal. Store contract:
//!
//! - `exists` answers for a whole key set under one consistency view
//! - `write` is create-once and never replaces a stored value
//! - `read` fails with [`StoreError::NotFound`] for absent keys
//!
//! Two implementations are provided: [`FileStore`] for durable runs shared
//! between processes and [`MemoryStore`] for tests and dry runs.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::errors::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hierarchical path identifying one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactKey(String);

impl ArtifactKey {
    /// Parse and validate a key.
    pub fn new(path: impl Into<String>) -> Result<Self, StoreError> {
        let path = path.into();
        let invalid = |reason: &str| StoreError::InvalidKey {
            key: path.clone(),
            reason: reason.to_string(),
        };

        if path.is_empty() {
            return Err(invalid("key is empty"));
        }
        if path.starts_with('/') {
            return Err(invalid("key must be relative"));
        }
        for segment in path.split('/') {
            match segment {
                "" => return Err(invalid("empty path segment")),
                "." | ".." => return Err(invalid("relative path segment")),
                s if s.contains('\\') => return Err(invalid("backslash in segment")),
                _ => {}
            }
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments of the key.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// True when this key lies under `prefix` (segment-wise).
    pub fn starts_with(&self, prefix: &str) -> bool {
        let prefix = prefix.trim_end_matches('/');
        prefix.is_empty()
            || self.0 == prefix
            || (self.0.starts_with(prefix) && self.0[prefix.len()..].starts_with('/'))
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ArtifactKey {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ArtifactKey> for String {
    fn from(key: ArtifactKey) -> Self {
        key.0
    }
}

/// Keys of the molecular-orbital arrays of one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoKeys {
    pub eigenvalues: ArtifactKey,
    pub coefficients: ArtifactKey,
}

impl MoKeys {
    pub fn to_vec(&self) -> Vec<ArtifactKey> {
        vec![self.eigenvalues.clone(), self.coefficients.clone()]
    }
}

/// Full key set of one trajectory point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameKeys {
    pub orbitals: MoKeys,
    pub energy: ArtifactKey,
}

impl FrameKeys {
    /// Keys for point `k` of `project` computed with `package`.
    pub fn for_point(project: &str, package: &str, k: usize) -> Result<Self, StoreError> {
        let root = format!("{}/point_{}/{}/mo", project, k, package);
        Ok(Self {
            orbitals: MoKeys {
                eigenvalues: ArtifactKey::new(format!("{root}/eigenvalues"))?,
                coefficients: ArtifactKey::new(format!("{root}/coefficients"))?,
            },
            energy: ArtifactKey::new(format!("{root}/energy"))?,
        })
    }

    /// The keys whose joint presence means the frame is already done.
    ///
    /// The energy key is always part of the set, so a frame whose writes
    /// stopped after the orbitals is recomputed.
    pub fn skip_predicate(&self, compute_orbitals: bool) -> Vec<ArtifactKey> {
        let mut keys = Vec::with_capacity(3);
        if compute_orbitals {
            keys.extend(self.orbitals.to_vec());
        }
        keys.push(self.energy.clone());
        keys
    }
}

/// Dense row-major array of `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawArray")]
pub struct NdArray {
    shape: Vec<usize>,
    data: Vec<f64>,
}

#[derive(Deserialize)]
struct RawArray {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl TryFrom<RawArray> for NdArray {
    type Error = StoreError;

    fn try_from(raw: RawArray) -> Result<Self, Self::Error> {
        NdArray::new(raw.shape, raw.data)
    }
}

impl NdArray {
    /// Build an array, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, StoreError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(StoreError::ShapeMismatch {
                shape,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn vector(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }
}

/// A stored value: a scalar (energies) or an array (orbitals).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArtifactValue {
    Scalar(f64),
    Array(NdArray),
}

impl ArtifactValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Array(_) => None,
        }
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Self::Array(a) => Some(a),
            Self::Scalar(_) => None,
        }
    }
}

/// What a write actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    /// The key was already present; the stored value was left untouched.
    AlreadyPresent,
}

/// Durable key/value store for per-frame artifacts.
pub trait ArtifactStore: Send + Sync {
    /// True iff every key in `keys` is present, under one consistent view.
    fn exists(&self, keys: &[ArtifactKey]) -> Result<bool, StoreError>;

    /// Create-once write.
    fn write(&self, key: &ArtifactKey, value: &ArtifactValue) -> Result<WriteOutcome, StoreError>;

    fn read(&self, key: &ArtifactKey) -> Result<ArtifactValue, StoreError>;

    /// All stored keys under `prefix`, sorted.
    fn keys(&self, prefix: &str) -> Result<Vec<ArtifactKey>, StoreError>;
}
