use chrono::Local;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to move temporary file into `{path}`: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },
    #[error("failed to decode `{path}`: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode `{path}`: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> StoreError {
        let path = path.to_path_buf();
        move |source| StoreError::Io { path, source }
    }
}

/// Persistence seam for unit artifacts and pipeline state. The core only ever
/// talks to this trait with a path and content.
pub trait ArtifactStore: Send + Sync {
    /// Returns `None` when nothing is stored at `path`.
    fn load(&self, path: &Path) -> Result<Option<String>, StoreError>;

    /// Replaces `path` atomically; readers see either the old or new content.
    fn save(&self, path: &Path, content: &str) -> Result<(), StoreError>;

    /// Copies the current content of `path` into `history_dir` under a
    /// timestamped name. Returns `None` when there is nothing to back up.
    fn backup(&self, path: &Path, history_dir: &Path) -> Result<Option<PathBuf>, StoreError>;

    fn exists(&self, path: &Path) -> bool;
}

/// Filesystem store: write-to-temp-then-rename under a store-wide write lock.
#[derive(Debug, Default)]
pub struct FsArtifactStore {
    write_lock: Mutex<()>,
}

impl FsArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for FsArtifactStore {
    fn load(&self, path: &Path) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn save(&self, path: &Path, content: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(StoreError::io(parent))?;

        let mut temp = NamedTempFile::new_in(parent).map_err(StoreError::io(parent))?;
        temp.write_all(content.as_bytes())
            .map_err(StoreError::io(temp.path()))?;
        temp.as_file()
            .sync_all()
            .map_err(StoreError::io(temp.path()))?;
        temp.persist(path).map_err(|source| StoreError::Persist {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    fn backup(&self, path: &Path, history_dir: &Path) -> Result<Option<PathBuf>, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if !path.is_file() {
            return Ok(None);
        }
        fs::create_dir_all(history_dir).map_err(StoreError::io(history_dir))?;

        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("artifact");
        let extension = path.extension().and_then(|ext| ext.to_str());
        let stamp = Local::now().format("%Y%m%d_%H%M%S_%6f").to_string();

        let mut target = history_dir.join(backup_name(stem, &stamp, None, extension));
        let mut suffix = 1;
        while target.exists() {
            target = history_dir.join(backup_name(stem, &stamp, Some(suffix), extension));
            suffix += 1;
        }

        fs::copy(path, &target).map_err(StoreError::io(&target))?;
        Ok(Some(target))
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

fn backup_name(stem: &str, stamp: &str, suffix: Option<u32>, extension: Option<&str>) -> String {
    let mut name = format!("{stem}_{stamp}");
    if let Some(suffix) = suffix {
        name.push_str(&format!("_{suffix}"));
    }
    if let Some(extension) = extension {
        name.push('.');
        name.push_str(extension);
    }
    name
}

pub fn load_json<T: DeserializeOwned>(
    store: &dyn ArtifactStore,
    path: &Path,
) -> Result<Option<T>, StoreError> {
    let Some(contents) = store.load(path)? else {
        return Ok(None);
    };
    if contents.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|source| StoreError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

pub fn save_json<T: Serialize>(
    store: &dyn ArtifactStore,
    path: &Path,
    value: &T,
) -> Result<(), StoreError> {
    let contents = serde_json::to_string_pretty(value).map_err(|source| StoreError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    store.save(path, &contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn save_creates_parents_and_replaces_content() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new();
        let path = dir.path().join("03_draft").join("chapter_01.md");

        store.save(&path, "first").unwrap();
        store.save(&path, "second").unwrap();

        assert_eq!(store.load(&path).unwrap().as_deref(), Some("second"));
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1, "temporary files must not linger");
    }

    #[test]
    fn load_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new();
        assert!(store.load(&dir.path().join("nope.yaml")).unwrap().is_none());
        assert!(!store.exists(&dir.path().join("nope.yaml")));
    }

    #[test]
    fn backup_copies_previous_content_with_timestamped_name() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new();
        let path = dir.path().join("chapter_05.yaml");
        let history = dir.path().join("outline_history");

        assert!(store.backup(&path, &history).unwrap().is_none());

        store.save(&path, "v1").unwrap();
        let first = store.backup(&path, &history).unwrap().unwrap();
        let second = store.backup(&path, &history).unwrap().unwrap();

        assert_ne!(first, second);
        let name = first.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("chapter_05_"));
        assert!(name.ends_with(".yaml"));
        assert_eq!(fs::read_to_string(&first).unwrap(), "v1");
        assert_eq!(fs::read_dir(&history).unwrap().count(), 2);
    }

    #[test]
    fn json_helpers_round_trip_through_store() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new();
        let path = dir.path().join("state").join("summaries.json");

        let missing: Option<BTreeMap<u32, String>> = load_json(&store, &path).unwrap();
        assert!(missing.is_none());

        let value = BTreeMap::from([(1u32, "a".to_string())]);
        save_json(&store, &path, &value).unwrap();
        let loaded: BTreeMap<u32, String> = load_json(&store, &path).unwrap().unwrap();
        assert_eq!(loaded, value);

        fs::write(&path, "{ broken").unwrap();
        let err = load_json::<BTreeMap<u32, String>>(&store, &path).unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
    }
}
