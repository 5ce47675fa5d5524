use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use longform_core::client::CircuitState;
use longform_core::{
    BatchPipeline, Config, ContextWindowBuilder, DraftExpander, ExpansionWorker,
    FsArtifactStore, GenerationClient, GenerationClientBuilder, GenerationRequest, ManualClock,
    ModelClass, OutlineGenerator, PathSettings, Project, PromptRegistry, ProviderAdapter,
    ProviderConfig, ProviderError, RunOptions, Stage, StageLayout, VecLogSink,
};
use tempfile::tempdir;

#[derive(Default)]
struct StoryAdapter {
    planning: AtomicUsize,
    drafting: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl StoryAdapter {
    fn drafting_prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .expect("mock mutex poisoned")
            .iter()
            .filter(|request| request.model_class == ModelClass::Drafting)
            .map(GenerationRequest::user_text)
            .collect()
    }
}

impl ProviderAdapter for StoryAdapter {
    fn model(&self, class: ModelClass) -> String {
        format!("story-{class}")
    }

    fn invoke(&self, request: &GenerationRequest, _timeout: Duration) -> Result<String, ProviderError> {
        self.requests
            .lock()
            .expect("mock mutex poisoned")
            .push(request.clone());
        match request.model_class {
            ModelClass::Planning => {
                let n = self.planning.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(format!(
                    "```yaml\n标题: 标题{n}\n核心事件: 事件{n}\n人物行动: 林舟行动{n}\n```"
                ))
            }
            ModelClass::Drafting => {
                let n = self.drafting.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(format!("雾城的夜色里，林舟追查第{n}条线索。").repeat(4))
            }
        }
    }
}

#[derive(Default)]
struct UnavailableAdapter {
    calls: AtomicUsize,
}

impl ProviderAdapter for UnavailableAdapter {
    fn model(&self, _class: ModelClass) -> String {
        "down".into()
    }

    fn invoke(&self, _request: &GenerationRequest, _timeout: Duration) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::retryable("503 service unavailable"))
    }
}

fn write_sources(root: &Path) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(root.join("01_source"))?;
    fs::write(
        root.join("01_source/core_setting.yaml"),
        "世界观: 雾城\n主角: 林舟\n",
    )?;
    fs::write(
        root.join("01_source/overall_outline.yaml"),
        "第一幕: 第1-3章 雾城初现\n第二幕: 第4-5章 真相浮出\n",
    )?;
    Ok(())
}

fn config(root: &Path) -> Config {
    let mut config = Config::new();
    config.paths = PathSettings::rooted_at(root);
    for name in ["primary", "backup"] {
        config.upsert_provider(
            name,
            ProviderConfig {
                model_name: format!("{name}-model"),
                ..ProviderConfig::default()
            },
        );
    }
    for class in ModelClass::ALL {
        config
            .routing
            .insert(class, vec!["primary".to_string(), "backup".to_string()]);
    }
    config.retry.max_retries = 1;
    config.retry.retry_delay = 1;
    config.circuit.failure_threshold = 1;
    config.generation.batch_size = 2;
    config.generation.context_chapters = 2;
    config.generation.default_word_count = 40;
    config
}

fn client(
    config: &Config,
    primary: Arc<UnavailableAdapter>,
    backup: Arc<StoryAdapter>,
    sink: Arc<VecLogSink>,
) -> Result<GenerationClient, Box<dyn std::error::Error>> {
    Ok(GenerationClientBuilder::from_config(config)
        .clock(Arc::new(ManualClock::new()))
        .sink(sink)
        .provider("primary", primary)
        .provider("backup", backup)
        .build()?)
}

#[test]
fn outline_then_expansion_with_failover() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempdir()?;
    write_sources(root.path())?;
    let config = config(root.path());
    config.validate()?;

    let primary = Arc::new(UnavailableAdapter::default());
    let backup = Arc::new(StoryAdapter::default());
    let sink = Arc::new(VecLogSink::new());
    let client = client(&config, primary.clone(), backup.clone(), sink.clone())?;
    let prompts = PromptRegistry::from_prompt_config(&config.prompts)?;
    let project = Project::load(&config.paths)?;
    let store = FsArtifactStore::new();
    let total = project.outline.total_units()?;
    assert_eq!(total, 5);

    let generator = OutlineGenerator::new(&client, &prompts, &project, sink.as_ref())
        .with_settings(&config.generation);
    let report = BatchPipeline::new(
        StageLayout::from_paths(Stage::Outline, &config.paths),
        &generator,
        &store,
        ContextWindowBuilder::from_settings(&config.generation)?,
        sink.as_ref(),
    )
    .with_options(RunOptions::from_settings(&config.generation))
    .run(total)?;

    assert!(report.is_complete());
    assert_eq!(report.pages, vec![1..=2, 3..=4, 5..=5]);
    let outline = fs::read_to_string(root.path().join("02_outline/chapter_03.yaml"))?;
    assert!(outline.contains("第3章"));
    assert!(outline.contains("事件3"));

    // One exhausted request opens the primary circuit; later units skip it.
    assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
    let state = client.provider_state("primary").expect("primary registered");
    assert_eq!(state.circuit, CircuitState::Open);
    assert!(!sink.events("provider_skipped").is_empty());
    assert!(!sink.events("circuit_state_change").is_empty());

    let expander = DraftExpander::new(&client, &prompts, &project, sink.as_ref())
        .with_settings(&config.generation);
    let worker = ExpansionWorker::new(
        expander,
        &store,
        config.paths.resolve(&config.paths.outline_dir),
    );
    let report = BatchPipeline::new(
        StageLayout::from_paths(Stage::Expansion, &config.paths),
        &worker,
        &store,
        ContextWindowBuilder::from_settings(&config.generation)?,
        sink.as_ref(),
    )
    .with_options(RunOptions::from_settings(&config.generation))
    .run(total)?;

    assert!(report.is_complete());
    assert!(root.path().join("03_draft/chapter_05.md").exists());
    assert!(root.path().join("05_state/expansion_checkpoint.json").exists());

    let prompts = backup.drafting_prompts();
    assert_eq!(prompts.len(), 5);
    assert!(prompts[2].contains("事件3"));
    assert!(prompts[2].contains("第2章《标题2》"));
    assert!(prompts[2].contains("结尾："));
    Ok(())
}

#[test]
fn interrupted_outline_run_resumes_where_it_stopped() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempdir()?;
    write_sources(root.path())?;
    let config = config(root.path());

    let primary = Arc::new(UnavailableAdapter::default());
    let backup = Arc::new(StoryAdapter::default());
    let sink = Arc::new(VecLogSink::new());
    let client = client(&config, primary, backup.clone(), sink.clone())?;
    let prompts = PromptRegistry::new()?;
    let project = Project::load(&config.paths)?;
    let store = FsArtifactStore::new();
    let generator = OutlineGenerator::new(&client, &prompts, &project, sink.as_ref())
        .with_settings(&config.generation);
    let pipeline = BatchPipeline::new(
        StageLayout::from_paths(Stage::Outline, &config.paths),
        &generator,
        &store,
        ContextWindowBuilder::new(2)?,
        sink.as_ref(),
    );

    let first = pipeline.run_range(5, 1..=2)?;
    assert_eq!(first.checkpoint, 2);
    assert!(!first.stage_finished());

    let second = pipeline.run(5)?;
    assert_eq!(second.succeeded, vec![3, 4, 5]);
    assert!(second.stage_finished());
    assert_eq!(backup.planning.load(Ordering::SeqCst), 5);
    Ok(())
}
