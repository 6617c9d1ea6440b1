use super::{ArtifactKey, ArtifactStore, ArtifactValue, WriteOutcome};
use crate::errors::StoreError;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const LOCK_FILE: &str = ".lock";
const EXTENSION: &str = "json";

/// On-disk document for one key.
#[derive(Debug, Serialize, Deserialize)]
struct StoredArtifact {
    key: ArtifactKey,
    created_at: DateTime<Utc>,
    value: ArtifactValue,
}

/// Directory-backed artifact store.
///
/// Each key maps to `<root>/<key>.json`. Writes land in a temporary sibling
/// and are renamed into place, so readers only ever see complete documents.
/// An advisory lock on `<root>/.lock` is held shared for reads and
/// composite existence checks and exclusive for writes, which makes the
/// store safe to share between concurrent `trajqm` processes.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

/// Releases the advisory lock on drop.
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err(&root))?;
        let store = Self { root };
        store.lock_file()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_file(&self) -> Result<File, StoreError> {
        let path = self.root.join(LOCK_FILE);
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(io_err(&path))
    }

    fn lock_shared(&self) -> Result<LockGuard, StoreError> {
        let file = self.lock_file()?;
        FileExt::lock_shared(&file).map_err(io_err(&self.root))?;
        Ok(LockGuard { file })
    }

    fn lock_exclusive(&self) -> Result<LockGuard, StoreError> {
        let file = self.lock_file()?;
        FileExt::lock_exclusive(&file).map_err(io_err(&self.root))?;
        Ok(LockGuard { file })
    }

    fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.segments() {
            path.push(segment);
        }
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{EXTENSION}"));
        path.set_file_name(name);
        path
    }

    fn key_for(&self, path: &Path) -> Option<ArtifactKey> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let joined = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let stem = joined.strip_suffix(&format!(".{EXTENSION}"))?;
        ArtifactKey::new(stem).ok()
    }
}

impl ArtifactStore for FileStore {
    fn exists(&self, keys: &[ArtifactKey]) -> Result<bool, StoreError> {
        let _guard = self.lock_shared()?;
        Ok(keys.iter().all(|k| self.path_for(k).is_file()))
    }

    fn write(&self, key: &ArtifactKey, value: &ArtifactValue) -> Result<WriteOutcome, StoreError> {
        let path = self.path_for(key);
        let _guard = self.lock_exclusive()?;

        if path.is_file() {
            return Ok(WriteOutcome::AlreadyPresent);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let document = StoredArtifact {
            key: key.clone(),
            created_at: Utc::now(),
            value: value.clone(),
        };
        let bytes = serde_json::to_vec(&document).map_err(|source| StoreError::Encoding {
            key: key.to_string(),
            source,
        })?;

        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        {
            let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
            file.write_all(&bytes).map_err(io_err(&tmp))?;
            file.sync_all().map_err(io_err(&tmp))?;
        }
        fs::rename(&tmp, &path).map_err(io_err(&path))?;

        Ok(WriteOutcome::Created)
    }

    fn read(&self, key: &ArtifactKey) -> Result<ArtifactValue, StoreError> {
        let path = self.path_for(key);
        let _guard = self.lock_shared()?;

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    key: key.to_string(),
                });
            }
            Err(e) => return Err(io_err(&path)(e)),
        };
        let document: StoredArtifact =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Encoding {
                key: key.to_string(),
                source,
            })?;
        Ok(document.value)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<ArtifactKey>, StoreError> {
        let _guard = self.lock_shared()?;
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| StoreError::Io {
                path: self.root.clone(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(key) = self.key_for(entry.path())
                && key.starts_with(prefix)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
