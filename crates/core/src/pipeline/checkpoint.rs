use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::PathSettings;
use crate::store::{self, ArtifactStore, StoreError};
use crate::unit::Stage;

/// Durable progress marker of one stage. Every unit at or below
/// `last_completed_unit_index` has either an artifact or a ledger entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stage: Stage,
    pub last_completed_unit_index: u32,
    pub total_units: u32,
    pub run_id: String,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(stage: Stage, total_units: u32, run_id: impl Into<String>) -> Self {
        Self {
            stage,
            last_completed_unit_index: 0,
            total_units,
            run_id: run_id.into(),
            updated_at: Utc::now(),
        }
    }

    pub fn next_unit(&self) -> u32 {
        self.last_completed_unit_index + 1
    }

    pub fn is_finished(&self) -> bool {
        self.last_completed_unit_index >= self.total_units
    }

    pub(crate) fn advance_to(&mut self, index: u32, run_id: &str) {
        self.last_completed_unit_index = index;
        self.run_id = run_id.to_string();
        self.updated_at = Utc::now();
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub reason: String,
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Units that failed and were skipped past. Retried first on the next run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureLedger {
    #[serde(default)]
    entries: BTreeMap<u32, FailureEntry>,
}

impl FailureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, index: u32, reason: impl Into<String>) -> &FailureEntry {
        let reason = reason.into();
        let now = Utc::now();
        let entry = self.entries.entry(index).or_insert_with(|| FailureEntry {
            reason: String::new(),
            attempts: 0,
            recorded_at: now,
        });
        entry.reason = reason;
        entry.attempts += 1;
        entry.recorded_at = now;
        entry
    }

    pub fn resolve(&mut self, index: u32) -> Option<FailureEntry> {
        self.entries.remove(&index)
    }

    pub fn get(&self, index: u32) -> Option<&FailureEntry> {
        self.entries.get(&index)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.entries.contains_key(&index)
    }

    pub fn indices(&self) -> Vec<u32> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &FailureEntry)> {
        self.entries.iter().map(|(index, entry)| (*index, entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where one stage keeps its artifacts, backups and state files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageLayout {
    pub stage: Stage,
    pub artifact_dir: PathBuf,
    pub history_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl StageLayout {
    pub fn new(
        stage: Stage,
        artifact_dir: impl Into<PathBuf>,
        history_dir: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            stage,
            artifact_dir: artifact_dir.into(),
            history_dir: history_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    pub fn from_paths(stage: Stage, paths: &PathSettings) -> Self {
        let (artifacts, history) = match stage {
            Stage::Outline => (&paths.outline_dir, &paths.outline_history_dir),
            Stage::Expansion => (&paths.draft_dir, &paths.draft_history_dir),
        };
        Self::new(
            stage,
            paths.resolve(artifacts),
            paths.resolve(history),
            paths.resolve(&paths.state_dir),
        )
    }

    pub fn artifact(&self, index: u32) -> PathBuf {
        self.artifact_dir.join(self.stage.artifact_name(index))
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.state_file("checkpoint")
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.state_file("failed")
    }

    pub fn summaries_file(&self) -> PathBuf {
        self.state_file("summaries")
    }

    fn state_file(&self, kind: &str) -> PathBuf {
        self.state_dir.join(format!("{}_{kind}.json", self.stage.key()))
    }
}

pub fn load_checkpoint(
    store: &dyn ArtifactStore,
    path: &Path,
) -> Result<Option<Checkpoint>, StoreError> {
    store::load_json(store, path)
}

pub fn save_checkpoint(
    store: &dyn ArtifactStore,
    path: &Path,
    checkpoint: &Checkpoint,
) -> Result<(), StoreError> {
    store::save_json(store, path, checkpoint)
}

pub fn load_ledger(store: &dyn ArtifactStore, path: &Path) -> Result<FailureLedger, StoreError> {
    Ok(store::load_json(store, path)?.unwrap_or_default())
}

pub fn save_ledger(
    store: &dyn ArtifactStore,
    path: &Path,
    ledger: &FailureLedger,
) -> Result<(), StoreError> {
    store::save_json(store, path, ledger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsArtifactStore;
    use tempfile::tempdir;

    #[test]
    fn ledger_counts_repeated_failures() {
        let mut ledger = FailureLedger::new();
        ledger.record(7, "timeout");
        let entry = ledger.record(7, "empty output");
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.reason, "empty output");
        assert_eq!(ledger.indices(), [7]);
        assert!(ledger.resolve(7).is_some());
        assert!(ledger.is_empty());
    }

    #[test]
    fn layout_names_state_files_by_stage() {
        let paths = PathSettings::rooted_at("/novel");
        let layout = StageLayout::from_paths(Stage::Expansion, &paths);
        assert_eq!(layout.artifact(3), Path::new("/novel/03_draft/chapter_03.md"));
        assert_eq!(
            layout.checkpoint_file(),
            Path::new("/novel/05_state/expansion_checkpoint.json")
        );
        assert_eq!(
            layout.ledger_file(),
            Path::new("/novel/05_state/expansion_failed.json")
        );
    }

    #[test]
    fn checkpoint_and_ledger_persist() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new();
        let path = dir.path().join("outline_checkpoint.json");

        assert!(load_checkpoint(&store, &path).unwrap().is_none());
        let mut checkpoint = Checkpoint::new(Stage::Outline, 12, "run-a");
        checkpoint.advance_to(4, "run-b");
        save_checkpoint(&store, &path, &checkpoint).unwrap();
        let loaded = load_checkpoint(&store, &path).unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
        assert_eq!(loaded.next_unit(), 5);

        let ledger_path = dir.path().join("outline_failed.json");
        let mut ledger = FailureLedger::new();
        ledger.record(2, "fatal: quota");
        save_ledger(&store, &ledger_path, &ledger).unwrap();
        assert_eq!(load_ledger(&store, &ledger_path).unwrap(), ledger);
    }
}
