use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use thiserror::Error;
use uuid::Uuid;

use crate::config::GenerationSettings;
use crate::context::{ContextError, ContextWindowBuilder, SummaryStore};
use crate::generator::{UnitProduct, UnitWorker};
use crate::logging::{GenerationEvent, LogLevel, LogRecord, LogSink};
use crate::store::{ArtifactStore, StoreError};
use crate::unit::Stage;

mod checkpoint;

pub use checkpoint::{
    load_checkpoint, load_ledger, save_checkpoint, save_ledger, Checkpoint, FailureEntry,
    FailureLedger, StageLayout,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("unit count changed from {previous} to {current}; confirm the change to continue")]
    UnitCountChanged { previous: u32, current: u32 },
    #[error("unit range {start}-{end} is outside 1-{total}")]
    InvalidRange { start: u32, end: u32, total: u32 },
    #[error("stage {0} has no checkpoint yet")]
    NoCheckpoint(Stage),
    #[error("unit {index} cannot be regenerated: {reason}")]
    NotRegenerable { index: u32, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Init,
    LoadingCheckpoint,
    Paging,
    Done,
    Aborted,
}

impl RunState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Init => "初始化",
            Self::LoadingCheckpoint => "加载检查点",
            Self::Paging => "分批生成",
            Self::Done => "完成",
            Self::Aborted => "中止",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Cooperative stop flag, checked between units.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOptions {
    pub batch_size: u32,
    pub fail_fast: bool,
    pub accept_unit_count_change: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_settings(&GenerationSettings::default())
    }
}

impl RunOptions {
    pub fn from_settings(settings: &GenerationSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            fail_fast: settings.fail_fast,
            accept_unit_count_change: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitFailure {
    pub index: u32,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct RunReport {
    pub run_id: String,
    pub stage: Stage,
    pub state: RunState,
    pub total_units: u32,
    pub checkpoint: u32,
    pub succeeded: Vec<u32>,
    /// Units whose artifact already existed and was adopted as-is.
    pub skipped: Vec<u32>,
    /// Units recovered while repairing a stale checkpoint.
    pub healed: Vec<u32>,
    pub failed: Vec<UnitFailure>,
    pub pages: Vec<RangeInclusive<u32>>,
    /// Ledger contents once the run ended.
    pub pending_failures: Vec<u32>,
    pub cancelled: bool,
}

impl RunReport {
    fn new(run_id: &str, stage: Stage, total_units: u32) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage,
            state: RunState::Init,
            total_units,
            checkpoint: 0,
            succeeded: Vec::new(),
            skipped: Vec::new(),
            healed: Vec::new(),
            failed: Vec::new(),
            pages: Vec::new(),
            pending_failures: Vec::new(),
            cancelled: false,
        }
    }

    /// The requested work finished without failures or interruption.
    pub fn is_complete(&self) -> bool {
        self.state == RunState::Done && !self.cancelled && self.failed.is_empty()
    }

    /// Every unit of the stage has an artifact and nothing is pending.
    pub fn stage_finished(&self) -> bool {
        self.checkpoint >= self.total_units && self.pending_failures.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct StageStatus {
    pub stage: Stage,
    pub checkpoint: Option<Checkpoint>,
    pub ledger: FailureLedger,
    pub summaries: usize,
}

/// Persisted progress of one stage, readable without a worker.
pub fn stage_status(
    layout: &StageLayout,
    store: &dyn ArtifactStore,
) -> Result<StageStatus, PipelineError> {
    Ok(StageStatus {
        stage: layout.stage,
        checkpoint: load_checkpoint(store, &layout.checkpoint_file())?,
        ledger: load_ledger(store, &layout.ledger_file())?,
        summaries: SummaryStore::load(store, &layout.summaries_file())?.len(),
    })
}

/// Splits `range` into pages aligned on absolute unit numbers, so a resumed
/// run keeps the same page boundaries as a fresh one.
pub fn paginate(range: RangeInclusive<u32>, batch_size: u32) -> Vec<RangeInclusive<u32>> {
    let batch_size = batch_size.max(1);
    let (mut start, end) = range.into_inner();
    let mut pages = Vec::new();
    if start == 0 {
        start = 1;
    }
    while start <= end {
        let boundary = ((start - 1) / batch_size + 1).saturating_mul(batch_size);
        let stop = boundary.min(end);
        pages.push(start..=stop);
        match stop.checked_add(1) {
            Some(next) => start = next,
            None => break,
        }
    }
    pages
}

struct Progress {
    run_id: String,
    checkpoint: Checkpoint,
    summaries: SummaryStore,
    ledger: FailureLedger,
    report: RunReport,
}

enum Flow {
    Continue,
    Stop,
}

/// Drives one stage across its units: resumes from the checkpoint, retries
/// ledger entries, then walks the remaining units page by page.
pub struct BatchPipeline<'a> {
    layout: StageLayout,
    worker: &'a dyn UnitWorker,
    store: &'a dyn ArtifactStore,
    window: ContextWindowBuilder,
    sink: &'a dyn LogSink,
    options: RunOptions,
    cancel: CancellationToken,
}

impl<'a> BatchPipeline<'a> {
    pub fn new(
        layout: StageLayout,
        worker: &'a dyn UnitWorker,
        store: &'a dyn ArtifactStore,
        window: ContextWindowBuilder,
        sink: &'a dyn LogSink,
    ) -> Self {
        Self {
            layout,
            worker,
            store,
            window,
            sink,
            options: RunOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn layout(&self) -> &StageLayout {
        &self.layout
    }

    fn stage(&self) -> Stage {
        self.layout.stage
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message));
    }

    fn enter(&self, state: &mut RunState, next: RunState) {
        self.log(
            LogLevel::Debug,
            format!("[{}] {} -> {}", self.stage().label(), state, next),
        );
        *state = next;
    }

    pub fn status(&self) -> Result<StageStatus, PipelineError> {
        stage_status(&self.layout, self.store)
    }

    pub fn run(&self, total_units: u32) -> Result<RunReport, PipelineError> {
        self.run_range(total_units, 1..=total_units)
    }

    pub fn run_range(
        &self,
        total_units: u32,
        range: RangeInclusive<u32>,
    ) -> Result<RunReport, PipelineError> {
        let (start, end) = (*range.start(), *range.end());
        if start < 1 || start > end || end > total_units {
            return Err(PipelineError::InvalidRange {
                start,
                end,
                total: total_units,
            });
        }

        let run_id = Uuid::new_v4().to_string();
        let mut state = RunState::Init;
        self.enter(&mut state, RunState::LoadingCheckpoint);

        let checkpoint = self.load_or_init(total_units, &run_id)?;
        let mut progress = Progress {
            report: RunReport::new(&run_id, self.stage(), total_units),
            summaries: SummaryStore::load(self.store, &self.layout.summaries_file())?,
            ledger: load_ledger(self.store, &self.layout.ledger_file())?,
            checkpoint,
            run_id,
        };
        self.heal(&mut progress)?;

        self.enter(&mut state, RunState::Paging);
        let outcome = self.process_range(&mut progress, start, end)?;
        match outcome {
            Flow::Continue => self.enter(&mut state, RunState::Done),
            Flow::Stop => self.enter(&mut state, RunState::Aborted),
        }

        let mut report = progress.report;
        report.state = state;
        report.checkpoint = progress.checkpoint.last_completed_unit_index;
        report.pending_failures = progress.ledger.indices();
        self.log(
            LogLevel::Info,
            format!(
                "[{}] 运行结束：成功 {} 章，跳过 {} 章，失败 {} 章，检查点 {}/{}",
                self.stage().label(),
                report.succeeded.len(),
                report.skipped.len(),
                report.failed.len(),
                report.checkpoint,
                report.total_units
            ),
        );
        Ok(report)
    }

    fn load_or_init(&self, total_units: u32, run_id: &str) -> Result<Checkpoint, PipelineError> {
        let path = self.layout.checkpoint_file();
        let Some(mut checkpoint) = load_checkpoint(self.store, &path)? else {
            let checkpoint = Checkpoint::new(self.stage(), total_units, run_id);
            save_checkpoint(self.store, &path, &checkpoint)?;
            return Ok(checkpoint);
        };

        if checkpoint.total_units != total_units {
            if !self.options.accept_unit_count_change {
                return Err(PipelineError::UnitCountChanged {
                    previous: checkpoint.total_units,
                    current: total_units,
                });
            }
            self.log(
                LogLevel::Warn,
                format!(
                    "[{}] 总章节数由 {} 调整为 {}",
                    self.stage().label(),
                    checkpoint.total_units,
                    total_units
                ),
            );
            checkpoint.total_units = total_units;
            if checkpoint.last_completed_unit_index > total_units {
                checkpoint.last_completed_unit_index = total_units;
            }
            save_checkpoint(self.store, &path, &checkpoint)?;
        }
        Ok(checkpoint)
    }

    /// Advances a stale checkpoint over artifacts that were written before a
    /// crash, deriving any missing summaries from the artifacts themselves.
    fn heal(&self, progress: &mut Progress) -> Result<(), PipelineError> {
        while !progress.checkpoint.is_finished() {
            let index = progress.checkpoint.next_unit();
            let path = self.layout.artifact(index);
            if !self.store.exists(&path) {
                break;
            }
            if !progress.summaries.contains(index) && !self.adopt_summary(progress, index)? {
                break;
            }
            if progress.ledger.resolve(index).is_some() {
                save_ledger(self.store, &self.layout.ledger_file(), &progress.ledger)?;
            }
            self.log(
                LogLevel::Warn,
                format!("[{}] 第{index}章已存在，修复检查点", self.stage().label()),
            );
            self.advance(progress, index)?;
            progress.report.healed.push(index);
        }
        Ok(())
    }

    fn adopt_summary(&self, progress: &mut Progress, index: u32) -> Result<bool, PipelineError> {
        let path = self.layout.artifact(index);
        let Some(text) = self.store.load(&path)? else {
            return Ok(false);
        };
        match self.worker.summarize(index, &text) {
            Ok(summary) => {
                progress.summaries.append(summary);
                progress
                    .summaries
                    .save(self.store, &self.layout.summaries_file())?;
                Ok(true)
            }
            Err(err) => {
                self.log(
                    LogLevel::Warn,
                    format!("[{}] 第{index}章已有产物无法读取摘要：{err}", self.stage().label()),
                );
                Ok(false)
            }
        }
    }

    fn process_range(
        &self,
        progress: &mut Progress,
        start: u32,
        end: u32,
    ) -> Result<Flow, PipelineError> {
        let retries: Vec<u32> = progress
            .ledger
            .indices()
            .into_iter()
            .filter(|index| {
                (start..=end).contains(index)
                    && *index <= progress.checkpoint.last_completed_unit_index
            })
            .collect();
        if !retries.is_empty() {
            self.log(
                LogLevel::Info,
                format!("[{}] 优先重试失败章节：{:?}", self.stage().label(), retries),
            );
        }
        for index in retries {
            if let Flow::Stop = self.step(progress, index)? {
                return Ok(Flow::Stop);
            }
        }

        let forward_start = start.max(progress.checkpoint.next_unit());
        if forward_start > end {
            return Ok(Flow::Continue);
        }
        for page in paginate(forward_start..=end, self.options.batch_size) {
            self.log(
                LogLevel::Info,
                format!(
                    "[{}] 处理第 {}-{} 章",
                    self.stage().label(),
                    page.start(),
                    page.end()
                ),
            );
            progress.report.pages.push(page.clone());
            for index in page {
                if let Flow::Stop = self.step(progress, index)? {
                    return Ok(Flow::Stop);
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn step(&self, progress: &mut Progress, index: u32) -> Result<Flow, PipelineError> {
        if self.cancel.is_cancelled() {
            self.log(
                LogLevel::Warn,
                format!("[{}] 收到取消信号，停止于第{index}章之前", self.stage().label()),
            );
            progress.report.cancelled = true;
            return Ok(Flow::Stop);
        }

        let succeeded = if self.adopt_existing(progress, index)? {
            progress.report.skipped.push(index);
            true
        } else {
            self.produce(progress, index)?
        };

        if index == progress.checkpoint.next_unit() && (succeeded || !self.options.fail_fast) {
            self.advance(progress, index)?;
        }
        if !succeeded && self.options.fail_fast {
            self.log(
                LogLevel::Error,
                format!("[{}] 第{index}章失败，按 fail-fast 停止", self.stage().label()),
            );
            return Ok(Flow::Stop);
        }
        Ok(Flow::Continue)
    }

    /// An artifact already on disk is kept as-is, whether it was written by an
    /// earlier range run, by hand, or just before a crash. A ledger entry for
    /// it is resolved.
    fn adopt_existing(&self, progress: &mut Progress, index: u32) -> Result<bool, PipelineError> {
        if !self.store.exists(&self.layout.artifact(index)) {
            return Ok(false);
        }
        if !progress.summaries.contains(index) && !self.adopt_summary(progress, index)? {
            return Ok(false);
        }
        if progress.ledger.resolve(index).is_some() {
            save_ledger(self.store, &self.layout.ledger_file(), &progress.ledger)?;
            self.log(
                LogLevel::Info,
                format!("[{}] 第{index}章已有产物，移出失败列表", self.stage().label()),
            );
        }
        Ok(true)
    }

    fn produce(&self, progress: &mut Progress, index: u32) -> Result<bool, PipelineError> {
        let window = self.window.build(index, &progress.summaries)?;
        match self.worker.produce(index, &window) {
            Ok(product) => {
                let summary = product.summary.clone();
                self.write_artifact(index, &product)?;
                if progress.summaries.append(summary) {
                    progress
                        .summaries
                        .save(self.store, &self.layout.summaries_file())?;
                }
                if progress.ledger.resolve(index).is_some() {
                    save_ledger(self.store, &self.layout.ledger_file(), &progress.ledger)?;
                }
                progress.report.succeeded.push(index);
                Ok(true)
            }
            Err(err) => {
                let reason = err.to_string();
                self.record_failure(&mut progress.ledger, index, &reason)?;
                progress.report.failed.push(UnitFailure { index, reason });
                Ok(false)
            }
        }
    }

    fn write_artifact(&self, index: u32, product: &UnitProduct) -> Result<(), PipelineError> {
        let path = self.layout.artifact(index);
        if let Some(backup) = self.store.backup(&path, &self.layout.history_dir)? {
            self.sink.event(GenerationEvent::BackupWritten {
                path: backup.display().to_string(),
            });
        }
        self.store.save(&path, &product.content)?;
        self.sink.event(GenerationEvent::UnitCompleted {
            stage: self.stage().key().to_string(),
            index,
        });
        Ok(())
    }

    fn record_failure(
        &self,
        ledger: &mut FailureLedger,
        index: u32,
        reason: &str,
    ) -> Result<(), PipelineError> {
        ledger.record(index, reason);
        save_ledger(self.store, &self.layout.ledger_file(), ledger)?;
        self.sink.event(GenerationEvent::UnitFailure {
            stage: self.stage().key().to_string(),
            index,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn advance(&self, progress: &mut Progress, index: u32) -> Result<(), PipelineError> {
        progress.checkpoint.advance_to(index, &progress.run_id);
        save_checkpoint(self.store, &self.layout.checkpoint_file(), &progress.checkpoint)?;
        self.sink.event(GenerationEvent::CheckpointAdvance {
            stage: self.stage().key().to_string(),
            index,
        });
        Ok(())
    }

    /// Re-runs completed units in parallel. Their context windows only read
    /// summaries that are already final, so neither the summaries nor the
    /// checkpoint change.
    pub fn regenerate(&self, indices: &[u32], workers: usize) -> Result<RunReport, PipelineError> {
        let checkpoint = load_checkpoint(self.store, &self.layout.checkpoint_file())?
            .ok_or(PipelineError::NoCheckpoint(self.stage()))?;
        let summaries = SummaryStore::load(self.store, &self.layout.summaries_file())?;

        let unique: BTreeSet<u32> = indices.iter().copied().collect();
        for &index in &unique {
            if index < 1 || index > checkpoint.last_completed_unit_index {
                return Err(PipelineError::NotRegenerable {
                    index,
                    reason: format!(
                        "beyond checkpoint {}",
                        checkpoint.last_completed_unit_index
                    ),
                });
            }
            if !summaries.contains(index) {
                return Err(PipelineError::NotRegenerable {
                    index,
                    reason: "unit has no finalized summary".to_string(),
                });
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let queue = Mutex::new(unique.iter().copied().collect::<VecDeque<u32>>());
        let ledger = Mutex::new(load_ledger(self.store, &self.layout.ledger_file())?);
        let report = Mutex::new(RunReport::new(&run_id, self.stage(), checkpoint.total_units));
        let first_error: Mutex<Option<PipelineError>> = Mutex::new(None);
        let workers = workers.clamp(1, unique.len().max(1));

        self.log(
            LogLevel::Info,
            format!(
                "[{}] 并行重写 {} 章（{} 个工作线程）",
                self.stage().label(),
                unique.len(),
                workers
            ),
        );

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if self.cancel.is_cancelled() {
                        lock(&report).cancelled = true;
                        break;
                    }
                    if lock(&first_error).is_some() {
                        break;
                    }
                    let Some(index) = lock(&queue).pop_front() else {
                        break;
                    };
                    if let Err(err) = self.regenerate_one(index, &summaries, &ledger, &report) {
                        lock(&first_error).get_or_insert(err);
                    }
                });
            }
        });

        if let Some(err) = lock(&first_error).take() {
            return Err(err);
        }
        let mut report = lock(&report).clone();
        report.succeeded.sort_unstable();
        report.failed.sort_by_key(|failure| failure.index);
        report.state = if report.cancelled {
            RunState::Aborted
        } else {
            RunState::Done
        };
        report.checkpoint = checkpoint.last_completed_unit_index;
        report.pending_failures = lock(&ledger).indices();
        Ok(report)
    }

    fn regenerate_one(
        &self,
        index: u32,
        summaries: &SummaryStore,
        ledger: &Mutex<FailureLedger>,
        report: &Mutex<RunReport>,
    ) -> Result<(), PipelineError> {
        let window = self.window.build(index, summaries)?;
        match self.worker.produce(index, &window) {
            Ok(product) => {
                self.write_artifact(index, &product)?;
                let mut ledger = lock(ledger);
                if ledger.resolve(index).is_some() {
                    save_ledger(self.store, &self.layout.ledger_file(), &ledger)?;
                }
                lock(report).succeeded.push(index);
            }
            Err(err) => {
                let reason = err.to_string();
                self.record_failure(&mut lock(ledger), index, &reason)?;
                lock(report).failed.push(UnitFailure { index, reason });
            }
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextWindow;
    use crate::generator::UnitError;
    use crate::logging::VecLogSink;
    use crate::store::FsArtifactStore;
    use crate::unit::UnitSummary;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    #[derive(Default)]
    struct ScriptedWorker {
        /// Remaining scripted failures per unit.
        failures: Mutex<HashMap<u32, usize>>,
        produced: Mutex<Vec<u32>>,
        windows: Mutex<HashMap<u32, Vec<u32>>>,
        cancel_after: Option<(u32, CancellationToken)>,
    }

    impl ScriptedWorker {
        fn failing(index: u32, times: usize) -> Self {
            let worker = Self::default();
            worker.failures.lock().unwrap().insert(index, times);
            worker
        }

        fn produced(&self) -> Vec<u32> {
            self.produced.lock().unwrap().clone()
        }

        fn window_of(&self, index: u32) -> Vec<u32> {
            self.windows.lock().unwrap()[&index].clone()
        }
    }

    fn summary(index: u32) -> UnitSummary {
        UnitSummary {
            index,
            title: format!("第{index}章标题"),
            key_events: format!("事件{index}"),
            ..UnitSummary::default()
        }
    }

    impl UnitWorker for ScriptedWorker {
        fn produce(&self, index: u32, window: &ContextWindow) -> Result<UnitProduct, UnitError> {
            let version = {
                let mut produced = self.produced.lock().unwrap();
                produced.push(index);
                produced.iter().filter(|seen| **seen == index).count()
            };
            self.windows
                .lock()
                .unwrap()
                .insert(index, window.indices());
            if let Some((after, token)) = &self.cancel_after {
                if *after == index {
                    token.cancel();
                }
            }

            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&index) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(UnitError::Validation {
                        index,
                        attempts: 1,
                        reason: "scripted failure".into(),
                    });
                }
            }
            Ok(UnitProduct {
                content: format!("unit {index} v{version}\n"),
                summary: summary(index),
            })
        }

        fn summarize(&self, index: u32, artifact: &str) -> Result<UnitSummary, UnitError> {
            if artifact.trim().is_empty() {
                return Err(UnitError::Input {
                    index,
                    reason: "empty artifact".into(),
                });
            }
            Ok(summary(index))
        }
    }

    fn layout(root: &Path) -> StageLayout {
        StageLayout::new(
            Stage::Outline,
            root.join("02_outline"),
            root.join("02_outline/outline_history"),
            root.join("05_state"),
        )
    }

    fn pipeline<'a>(
        root: &Path,
        worker: &'a ScriptedWorker,
        store: &'a FsArtifactStore,
        sink: &'a VecLogSink,
        options: RunOptions,
    ) -> BatchPipeline<'a> {
        BatchPipeline::new(
            layout(root),
            worker,
            store,
            ContextWindowBuilder::new(3).unwrap(),
            sink,
        )
        .with_options(options)
    }

    fn options(batch_size: u32) -> RunOptions {
        RunOptions {
            batch_size,
            ..RunOptions::default()
        }
    }

    fn history_count(root: &Path) -> usize {
        fs::read_dir(root.join("02_outline/outline_history"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[test]
    fn pages_align_on_absolute_unit_numbers() {
        assert_eq!(paginate(1..=10, 4), vec![1..=4, 5..=8, 9..=10]);
        assert_eq!(paginate(6..=10, 4), vec![6..=8, 9..=10]);
        assert_eq!(paginate(3..=3, 30), vec![3..=3]);
        assert_eq!(paginate(1..=2, 0), vec![1..=1, 2..=2]);
        assert!(paginate(5..=4, 4).is_empty());
    }

    #[test]
    fn fresh_run_completes_every_unit() {
        let dir = tempdir().unwrap();
        let (worker, store, sink) = (ScriptedWorker::default(), FsArtifactStore::new(), VecLogSink::new());
        let report = pipeline(dir.path(), &worker, &store, &sink, options(4))
            .run(10)
            .unwrap();

        assert!(report.is_complete());
        assert!(report.stage_finished());
        assert_eq!(report.pages, vec![1..=4, 5..=8, 9..=10]);
        assert_eq!(report.succeeded, (1..=10).collect::<Vec<_>>());
        assert_eq!(report.checkpoint, 10);
        assert!(dir.path().join("02_outline/chapter_10.yaml").exists());
        assert_eq!(worker.window_of(6), vec![3, 4, 5]);
        assert_eq!(worker.window_of(1), Vec::<u32>::new());
        assert_eq!(sink.events("checkpoint_advance").len(), 10);

        let status = pipeline(dir.path(), &worker, &store, &sink, options(4))
            .status()
            .unwrap();
        assert_eq!(status.summaries, 10);
        assert_eq!(status.checkpoint.unwrap().last_completed_unit_index, 10);
    }

    #[test]
    fn failed_unit_is_skipped_then_retried_first() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new();
        let sink = VecLogSink::new();

        let worker = ScriptedWorker::failing(7, 1);
        let report = pipeline(dir.path(), &worker, &store, &sink, options(30))
            .run(10)
            .unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.checkpoint, 10);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].index, 7);
        assert_eq!(report.pending_failures, vec![7]);
        assert!(!dir.path().join("02_outline/chapter_07.yaml").exists());
        assert_eq!(worker.window_of(8), vec![5, 6, 7]);
        assert_eq!(sink.events("unit_failure").len(), 1);

        let report = pipeline(dir.path(), &worker, &store, &sink, options(30))
            .run(10)
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.succeeded, vec![7]);
        assert!(report.pending_failures.is_empty());
        assert_eq!(worker.produced().iter().filter(|index| **index == 7).count(), 2);
        assert!(dir.path().join("02_outline/chapter_07.yaml").exists());
    }

    #[test]
    fn failed_unit_with_artifact_on_disk_is_adopted() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new();
        let sink = VecLogSink::new();

        let worker = ScriptedWorker::failing(7, 1);
        let report = pipeline(dir.path(), &worker, &store, &sink, options(30))
            .run(10)
            .unwrap();
        assert_eq!(report.pending_failures, vec![7]);

        // Fixed by hand, or written just before a crash left the ledger stale.
        let unit7 = dir.path().join("02_outline/chapter_07.yaml");
        store.save(&unit7, "hand edited 7\n").unwrap();

        let report = pipeline(dir.path(), &worker, &store, &sink, options(30))
            .run(10)
            .unwrap();
        assert!(report.is_complete());
        assert!(report.succeeded.is_empty());
        assert_eq!(report.skipped, vec![7]);
        assert!(report.pending_failures.is_empty());
        assert_eq!(worker.produced().iter().filter(|index| **index == 7).count(), 1);
        assert_eq!(fs::read_to_string(&unit7).unwrap(), "hand edited 7\n");
        assert_eq!(history_count(dir.path()), 0);

        let status = pipeline(dir.path(), &worker, &store, &sink, options(30))
            .status()
            .unwrap();
        assert!(status.ledger.is_empty());
        assert_eq!(status.summaries, 10);
    }

    #[test]
    fn fail_fast_stops_at_last_success() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new();
        let sink = VecLogSink::new();
        let worker = ScriptedWorker::failing(7, 1);
        let fail_fast = RunOptions {
            fail_fast: true,
            ..options(30)
        };

        let report = pipeline(dir.path(), &worker, &store, &sink, fail_fast.clone())
            .run(10)
            .unwrap();
        assert_eq!(report.state, RunState::Aborted);
        assert_eq!(report.checkpoint, 6);
        assert_eq!(worker.produced(), (1..=7).collect::<Vec<_>>());

        let report = pipeline(dir.path(), &worker, &store, &sink, fail_fast)
            .run(10)
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.succeeded, (7..=10).collect::<Vec<_>>());
        assert_eq!(report.checkpoint, 10);
    }

    #[test]
    fn stale_checkpoint_heals_from_existing_artifact() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new();
        let sink = VecLogSink::new();
        let worker = ScriptedWorker::default();

        let report = pipeline(dir.path(), &worker, &store, &sink, options(30))
            .run_range(10, 1..=4)
            .unwrap();
        assert_eq!(report.checkpoint, 4);

        // Unit 5 was written but the process died before the checkpoint moved.
        store
            .save(&dir.path().join("02_outline/chapter_05.yaml"), "unit 5 crashed\n")
            .unwrap();

        let report = pipeline(dir.path(), &worker, &store, &sink, options(30))
            .run(10)
            .unwrap();
        assert_eq!(report.healed, vec![5]);
        assert_eq!(report.succeeded, (6..=10).collect::<Vec<_>>());
        assert!(!worker.produced().contains(&5));
        assert_eq!(worker.window_of(6), vec![3, 4, 5]);
        assert_eq!(
            fs::read_to_string(dir.path().join("02_outline/chapter_05.yaml")).unwrap(),
            "unit 5 crashed\n"
        );
    }

    #[test]
    fn rerun_after_completion_is_a_no_op() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new();
        let sink = VecLogSink::new();
        let worker = ScriptedWorker::default();

        pipeline(dir.path(), &worker, &store, &sink, options(4))
            .run(6)
            .unwrap();
        let summaries_before =
            fs::read_to_string(dir.path().join("05_state/outline_summaries.json")).unwrap();

        let report = pipeline(dir.path(), &worker, &store, &sink, options(4))
            .run(6)
            .unwrap();
        assert!(report.is_complete());
        assert!(report.succeeded.is_empty());
        assert!(report.pages.is_empty());
        assert_eq!(worker.produced().len(), 6);
        assert_eq!(history_count(dir.path()), 0);
        assert_eq!(
            fs::read_to_string(dir.path().join("05_state/outline_summaries.json")).unwrap(),
            summaries_before
        );
    }

    #[test]
    fn range_run_leaves_checkpoint_until_contiguous() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new();
        let sink = VecLogSink::new();
        let worker = ScriptedWorker::default();

        let report = pipeline(dir.path(), &worker, &store, &sink, options(30))
            .run_range(8, 5..=6)
            .unwrap();
        assert_eq!(report.succeeded, vec![5, 6]);
        assert_eq!(report.checkpoint, 0);

        let report = pipeline(dir.path(), &worker, &store, &sink, options(30))
            .run(8)
            .unwrap();
        assert_eq!(report.succeeded, vec![1, 2, 3, 4, 7, 8]);
        assert_eq!(report.skipped, vec![5, 6]);
        assert_eq!(report.checkpoint, 8);
    }

    #[test]
    fn cancellation_stops_between_units() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new();
        let sink = VecLogSink::new();
        let token = CancellationToken::new();
        let worker = ScriptedWorker {
            cancel_after: Some((3, token.clone())),
            ..ScriptedWorker::default()
        };

        let report = pipeline(dir.path(), &worker, &store, &sink, options(30))
            .with_cancellation(token)
            .run(10)
            .unwrap();
        assert!(report.cancelled);
        assert!(!report.is_complete());
        assert_eq!(report.state, RunState::Aborted);
        assert_eq!(report.checkpoint, 3);

        let report = pipeline(dir.path(), &worker, &store, &sink, options(30))
            .run(10)
            .unwrap();
        assert_eq!(report.succeeded.first(), Some(&4));
        assert_eq!(report.checkpoint, 10);
    }

    #[test]
    fn unit_count_change_needs_confirmation() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new();
        let sink = VecLogSink::new();
        let worker = ScriptedWorker::default();

        pipeline(dir.path(), &worker, &store, &sink, options(30))
            .run(4)
            .unwrap();
        let err = pipeline(dir.path(), &worker, &store, &sink, options(30))
            .run(6)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::UnitCountChanged {
                previous: 4,
                current: 6
            }
        ));

        let accepted = RunOptions {
            accept_unit_count_change: true,
            ..options(30)
        };
        let report = pipeline(dir.path(), &worker, &store, &sink, accepted)
            .run(6)
            .unwrap();
        assert_eq!(report.succeeded, vec![5, 6]);
        assert_eq!(report.checkpoint, 6);
    }

    #[test]
    fn regenerate_backs_up_and_keeps_state() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new();
        let sink = VecLogSink::new();
        let worker = ScriptedWorker::default();

        pipeline(dir.path(), &worker, &store, &sink, options(30))
            .run(5)
            .unwrap();
        let checkpoint_before =
            fs::read_to_string(dir.path().join("05_state/outline_checkpoint.json")).unwrap();
        let summaries_before =
            fs::read_to_string(dir.path().join("05_state/outline_summaries.json")).unwrap();

        let report = pipeline(dir.path(), &worker, &store, &sink, options(30))
            .regenerate(&[3, 2, 3], 2)
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.succeeded, vec![2, 3]);
        assert_eq!(history_count(dir.path()), 2);
        assert_eq!(sink.events("backup_written").len(), 2);
        assert_eq!(
            fs::read_to_string(dir.path().join("02_outline/chapter_03.yaml")).unwrap(),
            "unit 3 v2\n"
        );
        assert_eq!(worker.window_of(3), vec![1, 2]);
        assert_eq!(
            fs::read_to_string(dir.path().join("05_state/outline_checkpoint.json")).unwrap(),
            checkpoint_before
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("05_state/outline_summaries.json")).unwrap(),
            summaries_before
        );

        let err = pipeline(dir.path(), &worker, &store, &sink, options(30))
            .regenerate(&[6], 2)
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotRegenerable { index: 6, .. }));
    }

    #[test]
    fn invalid_range_is_rejected() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new();
        let sink = VecLogSink::new();
        let worker = ScriptedWorker::default();
        let pipeline = pipeline(dir.path(), &worker, &store, &sink, options(30));

        assert!(matches!(
            pipeline.run_range(5, 0..=2),
            Err(PipelineError::InvalidRange { .. })
        ));
        assert!(matches!(
            pipeline.run_range(5, 4..=6),
            Err(PipelineError::InvalidRange { .. })
        ));
    }
}
