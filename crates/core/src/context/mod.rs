use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::config::GenerationSettings;
use crate::store::{self, ArtifactStore, StoreError};
use crate::unit::UnitSummary;

pub const EMPTY_WINDOW_MARKER: &str = "（无前文：本章为开篇章节）";

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("invalid context range: target unit {target}, window size {window}")]
    InvalidRange { target: i64, window: i64 },
}

/// Ordered summaries of finalized units, keyed by unit index. Entries are
/// appended once and never rewritten.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SummaryStore {
    entries: BTreeMap<u32, UnitSummary>,
}

impl SummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_summaries<I: IntoIterator<Item = UnitSummary>>(summaries: I) -> Self {
        let mut store = Self::new();
        for summary in summaries {
            store.append(summary);
        }
        store
    }

    pub fn load(store: &dyn ArtifactStore, path: &Path) -> Result<Self, StoreError> {
        let entries: Option<BTreeMap<u32, UnitSummary>> = store::load_json(store, path)?;
        Ok(Self {
            entries: entries.unwrap_or_default(),
        })
    }

    pub fn save(&self, store: &dyn ArtifactStore, path: &Path) -> Result<(), StoreError> {
        store::save_json(store, path, &self.entries)
    }

    /// Records `summary` unless its index is already present. Returns whether
    /// the store changed.
    pub fn append(&mut self, summary: UnitSummary) -> bool {
        if self.entries.contains_key(&summary.index) {
            return false;
        }
        self.entries.insert(summary.index, summary);
        true
    }

    pub fn get(&self, index: u32) -> Option<&UnitSummary> {
        self.entries.get(&index)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.entries.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnitSummary> {
        self.entries.values()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WindowEntry {
    Summary(UnitSummary),
    /// A prior unit inside the window that has no summary.
    Gap { index: u32 },
}

impl WindowEntry {
    pub fn index(&self) -> u32 {
        match self {
            Self::Summary(summary) => summary.index,
            Self::Gap { index } => *index,
        }
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, Self::Gap { .. })
    }
}

/// How much of a summary survives rendering under the character budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Detail {
    Full,
    Compact,
    Headline,
    Omitted,
}

/// Bounded continuity payload for one target unit.
#[derive(Clone, Debug, PartialEq)]
pub struct ContextWindow {
    target: u32,
    entries: Vec<WindowEntry>,
    budget: Option<usize>,
}

impl ContextWindow {
    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn entries(&self) -> &[WindowEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn gaps(&self) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|entry| entry.is_gap())
            .map(WindowEntry::index)
            .collect()
    }

    pub fn indices(&self) -> Vec<u32> {
        self.entries.iter().map(WindowEntry::index).collect()
    }

    /// Caps the rendered text at `chars` characters.
    pub fn with_budget(mut self, chars: usize) -> Self {
        self.budget = Some(chars);
        self
    }

    pub fn budget(&self) -> Option<usize> {
        self.budget
    }

    /// Prompt text. Each gap carries an explicit instruction to bridge it.
    ///
    /// Over budget, older summaries lose detail first: the closing excerpt,
    /// then everything but the title, then the whole entry. Gap markers and
    /// the most recent entry are always kept in full.
    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return EMPTY_WINDOW_MARKER.to_string();
        }

        let mut detail = vec![Detail::Full; self.entries.len()];
        if let Some(budget) = self.budget {
            let trimmable: Vec<usize> = (0..self.entries.len() - 1)
                .filter(|&position| !self.entries[position].is_gap())
                .collect();
            'levels: for level in [Detail::Compact, Detail::Headline, Detail::Omitted] {
                for &position in &trimmable {
                    if self.render_with(&detail).chars().count() <= budget {
                        break 'levels;
                    }
                    detail[position] = level;
                }
            }
        }
        self.render_with(&detail)
    }

    fn render_with(&self, detail: &[Detail]) -> String {
        self.entries
            .iter()
            .zip(detail)
            .filter_map(|(entry, detail)| match (entry, detail) {
                (WindowEntry::Gap { index }, _) => Some(format!(
                    "第{index}章：【内容缺失】该章尚未完成，请根据前后情节自然衔接，不要编造与大纲冲突的细节。"
                )),
                (WindowEntry::Summary(summary), Detail::Full) => Some(summary.render()),
                (WindowEntry::Summary(summary), Detail::Compact) => Some(summary.render_compact()),
                (WindowEntry::Summary(summary), Detail::Headline) => Some(summary.render_headline()),
                (WindowEntry::Summary(_), Detail::Omitted) => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Summaries for `[max(1, target - k), target - 1]` in ascending order, with
/// missing indices emitted as gaps. Pure and read-only.
pub fn build_window(
    target_index: u32,
    store: &SummaryStore,
    k: usize,
) -> Result<ContextWindow, ContextError> {
    if target_index < 1 {
        return Err(ContextError::InvalidRange {
            target: i64::from(target_index),
            window: k as i64,
        });
    }

    let span = (target_index - 1).min(u32::try_from(k).unwrap_or(u32::MAX));
    let start = target_index - span;
    let entries = (start..target_index)
        .map(|index| match store.get(index) {
            Some(summary) => WindowEntry::Summary(summary.clone()),
            None => WindowEntry::Gap { index },
        })
        .collect();

    Ok(ContextWindow {
        target: target_index,
        entries,
        budget: None,
    })
}

/// Window size validated once at construction, plus an optional character
/// budget applied to every window it builds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextWindowBuilder {
    k: usize,
    budget: Option<usize>,
}

impl ContextWindowBuilder {
    pub fn new(k: i64) -> Result<Self, ContextError> {
        let k = usize::try_from(k).map_err(|_| ContextError::InvalidRange { target: 1, window: k })?;
        Ok(Self { k, budget: None })
    }

    pub fn from_settings(settings: &GenerationSettings) -> Result<Self, ContextError> {
        Ok(Self::new(settings.context_chapters)?.with_budget(settings.context_budget()))
    }

    pub fn with_budget(mut self, chars: usize) -> Self {
        self.budget = Some(chars);
        self
    }

    pub fn window_size(&self) -> usize {
        self.k
    }

    pub fn build(&self, target_index: u32, store: &SummaryStore) -> Result<ContextWindow, ContextError> {
        let window = build_window(target_index, store, self.k)?;
        Ok(match self.budget {
            Some(chars) => window.with_budget(chars),
            None => window,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsArtifactStore;
    use tempfile::tempdir;

    fn summary(index: u32) -> UnitSummary {
        UnitSummary {
            index,
            title: format!("标题{index}"),
            key_events: format!("事件{index}"),
            ..UnitSummary::default()
        }
    }

    fn full_store(upto: u32) -> SummaryStore {
        SummaryStore::from_summaries((1..=upto).map(summary))
    }

    #[test]
    fn window_size_is_min_of_k_and_prior_units() {
        let store = full_store(20);
        for target in 1..=12u32 {
            for k in 0..=6usize {
                let window = build_window(target, &store, k).unwrap();
                let expected = k.min(target as usize - 1);
                assert_eq!(window.len(), expected, "target {target}, k {k}");
                let indices = window.indices();
                assert!(indices.windows(2).all(|pair| pair[0] < pair[1]));
                assert!(indices.iter().all(|index| *index < target));
            }
        }
    }

    #[test]
    fn first_unit_gets_empty_window() {
        let window = build_window(1, &full_store(5), 3).unwrap();
        assert!(window.is_empty());
        assert_eq!(window.render(), EMPTY_WINDOW_MARKER);
    }

    #[test]
    fn unit_six_with_k_three_sees_three_to_five() {
        let window = build_window(6, &full_store(10), 3).unwrap();
        assert_eq!(window.indices(), [3, 4, 5]);
        assert!(window.gaps().is_empty());
    }

    #[test]
    fn missing_summaries_become_gaps() {
        let store = SummaryStore::from_summaries([summary(1), summary(2), summary(4)]);
        let window = build_window(5, &store, 4).unwrap();
        assert_eq!(window.indices(), [1, 2, 3, 4]);
        assert_eq!(window.gaps(), [3]);
        let rendered = window.render();
        assert!(rendered.contains("第3章：【内容缺失】"));
        assert!(rendered.contains("第4章《标题4》"));
    }

    fn long_summary(index: u32) -> UnitSummary {
        UnitSummary {
            participant_deltas: format!("角色{index}受伤"),
            closing: Some(format!("{index}号结尾{}", "。".repeat(300))),
            ..summary(index)
        }
    }

    #[test]
    fn budget_trims_oldest_detail_and_keeps_gaps() {
        let store = SummaryStore::from_summaries([1, 2, 4, 5].map(long_summary));
        let window = build_window(6, &store, 5).unwrap();
        let full = window.render();
        assert!(full.contains("1号结尾"));

        let trimmed = window.clone().with_budget(full.chars().count() - 1).render();
        assert!(!trimmed.contains("1号结尾"));
        assert!(trimmed.contains("角色1受伤"));
        assert!(trimmed.contains("2号结尾"));

        let tight = window.with_budget(200).render();
        assert!(tight.contains("第3章：【内容缺失】"));
        assert!(tight.contains(&long_summary(5).render()));
        for index in [1, 2, 4] {
            assert!(!tight.contains(&format!("标题{index}")), "unit {index}");
        }
    }

    #[test]
    fn builder_applies_budget_from_settings() {
        let settings = GenerationSettings {
            context_chapters: 3,
            max_context_chars: Some(120),
            ..GenerationSettings::default()
        };
        let builder = ContextWindowBuilder::from_settings(&settings).unwrap();
        let store = SummaryStore::from_summaries((1..=4).map(long_summary));
        let window = builder.build(5, &store).unwrap();
        assert_eq!(window.budget(), Some(120));
        let rendered = window.render();
        assert!(rendered.contains("4号结尾"));
        assert!(!rendered.contains("2号结尾"));
        assert!(!rendered.contains("3号结尾"));
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(matches!(
            build_window(0, &SummaryStore::new(), 3),
            Err(ContextError::InvalidRange { target: 0, .. })
        ));
        assert!(ContextWindowBuilder::new(-1).is_err());
        assert_eq!(ContextWindowBuilder::new(0).unwrap().window_size(), 0);
    }

    #[test]
    fn append_never_overwrites() {
        let mut store = SummaryStore::new();
        assert!(store.append(summary(1)));
        let mut replacement = summary(1);
        replacement.title = "改写".into();
        assert!(!store.append(replacement));
        assert_eq!(store.get(1).unwrap().title, "标题1");
    }

    #[test]
    fn summaries_persist_through_store() {
        let dir = tempdir().unwrap();
        let files = FsArtifactStore::new();
        let path = dir.path().join("summaries.json");

        assert!(SummaryStore::load(&files, &path).unwrap().is_empty());
        let store = full_store(3);
        store.save(&files, &path).unwrap();
        assert_eq!(SummaryStore::load(&files, &path).unwrap(), store);
    }
}
